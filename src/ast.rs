//! AST produced by the equation parser.

use crate::error::Span;
use crate::units::UnitMap;

/// Identifies an AST node for keying stateful delay primitives. Assigned
/// sequentially by the parser; stable for the lifetime of a compiled
/// equation (nodes are never renumbered after parsing).
pub type NodeId = usize;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnaryOp {
    Neg,
    Pos,
    Not,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    Pow,
    Eq,
    Neq,
    Lt,
    Lte,
    Gt,
    Gte,
    And,
    Or,
    Xor,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DelayKind {
    Delay1,
    Delay3,
    Smooth,
    Smooth3,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeKeyword {
    Time,
    TimeStep,
    InitialTime,
    FinalTime,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ExprKind {
    QuantityLiteral {
        value: f64,
        units: Option<UnitMap>,
    },
    BooleanLiteral(bool),
    Ref(String),
    Unary {
        op: UnaryOp,
        expr: Box<Expr>,
    },
    Binary {
        op: BinaryOp,
        left: Box<Expr>,
        right: Box<Expr>,
    },
    IfChain {
        branches: Vec<(Expr, Expr)>,
        else_branch: Box<Expr>,
    },
    Call {
        name: String,
        args: Vec<Expr>,
    },
    Lookup1D {
        x: Box<Expr>,
        points: Vec<(f64, f64)>,
        x_unit: Option<UnitMap>,
        y_unit: Option<UnitMap>,
    },
    Delay {
        kind: DelayKind,
        input: Box<Expr>,
        delay_time: Box<Expr>,
        initial: Option<Box<Expr>>,
    },
    Time(TimeKeyword),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Expr {
    pub id: NodeId,
    pub span: Span,
    pub kind: ExprKind,
}

#[derive(Debug, Clone, PartialEq)]
pub struct FunctionDef {
    pub name: String,
    pub params: Vec<String>,
    pub body: Expr,
}

/// The top-level parse result: zero or more macro definitions followed by a
/// single expression.
#[derive(Debug, Clone, PartialEq)]
pub struct EquationNode {
    pub defs: Vec<FunctionDef>,
    pub expr: Expr,
}
