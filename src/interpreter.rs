//! AST evaluator: interprets an equation's parsed expression tree
//! against a scope of named quantities, threading a delay-state store for
//! the stateful `DELAY1/3`, `SMOOTH/3` primitives.

use std::collections::HashMap;

use crate::ast::{BinaryOp, DelayKind, Expr, ExprKind, FunctionDef, NodeId, TimeKeyword, UnaryOp};
use crate::error::{EvalError, EvalErrorKind, Span};
use crate::units::{self, Quantity, UnitMap};

pub const TIME: &str = "TIME";
pub const TIME_STEP: &str = "TIME_STEP";
pub const INITIAL_TIME: &str = "INITIAL_TIME";
pub const FINAL_TIME: &str = "FINAL_TIME";

/// Maximum macro call nesting depth before a recursion guard trips.
pub const MAX_MACRO_DEPTH: usize = 64;

pub type Scope = HashMap<String, Quantity>;

/// Per-simulation, stateful store for delay/smooth primitives, keyed by the
/// owning equation's name plus the AST node id of the primitive's call
/// site within that equation — `NodeId`s are assigned independently per
/// parsed equation, so the name half of the key is what keeps two
/// different flows/variables with a delay as their first node from
/// colliding. Cloning produces an independent copy so RK4's
/// non-committing sub-stages can evaluate against a snapshot without
/// mutating the committed state.
#[derive(Debug, Clone, Default)]
pub struct DelayStateStore {
    stages: HashMap<(String, NodeId), Vec<f64>>,
    units: HashMap<(String, NodeId), UnitMap>,
}

impl DelayStateStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn get(&self, equation: &str, id: NodeId) -> Option<(&[f64], &UnitMap)> {
        let key = (equation.to_string(), id);
        match (self.stages.get(&key), self.units.get(&key)) {
            (Some(s), Some(u)) => Some((s, u)),
            _ => None,
        }
    }

    fn set(&mut self, equation: &str, id: NodeId, stages: Vec<f64>, units: UnitMap) {
        self.stages.insert((equation.to_string(), id), stages);
        self.units.insert((equation.to_string(), id), units);
    }
}

/// Everything the evaluator needs besides the expression itself.
pub struct EvalContext<'a> {
    pub scope: &'a Scope,
    pub defs: &'a HashMap<String, &'a FunctionDef>,
    pub delay_state: &'a mut DelayStateStore,
    pub commit: bool,
    /// Name of the flow or variable whose equation is being evaluated.
    /// Namespaces delay/smooth state so two equations' AST node ids don't
    /// collide in the shared [`DelayStateStore`].
    pub equation_name: &'a str,
    pub source: &'a str,
}

fn unit_mismatch(span: Span, left: &UnitMap, right: &UnitMap, op: &str) -> EvalError {
    EvalError::with_span(
        EvalErrorKind::UnitMismatch {
            left: units::format_units(left),
            right: units::format_units(right),
            operation: op.to_string(),
        },
        span,
    )
}

fn require_unitless(span: Span, q: &Quantity, op: &str) -> Result<(), EvalError> {
    if q.is_unitless() {
        Ok(())
    } else {
        Err(unit_mismatch(span, &q.units, &units::unitless(), op))
    }
}

pub fn evaluate(expr: &Expr, ctx: &mut EvalContext) -> Result<Quantity, EvalError> {
    evaluate_depth(expr, ctx, 0)
}

fn evaluate_depth(expr: &Expr, ctx: &mut EvalContext, depth: usize) -> Result<Quantity, EvalError> {
    match &expr.kind {
        ExprKind::QuantityLiteral { value, units } => {
            Ok(Quantity::new(*value, units.clone().unwrap_or_default()))
        }
        ExprKind::BooleanLiteral(b) => Ok(Quantity::scalar(if *b { 1.0 } else { 0.0 })),
        ExprKind::Ref(name) => ctx
            .scope
            .get(name)
            .cloned()
            .ok_or_else(|| EvalError::with_span(EvalErrorKind::IdentifierNotFound { name: name.clone() }, expr.span)),
        ExprKind::Time(kw) => {
            let name = match kw {
                TimeKeyword::Time => TIME,
                TimeKeyword::TimeStep => TIME_STEP,
                TimeKeyword::InitialTime => INITIAL_TIME,
                TimeKeyword::FinalTime => FINAL_TIME,
            };
            ctx.scope
                .get(name)
                .cloned()
                .ok_or_else(|| EvalError::with_span(EvalErrorKind::IdentifierNotFound { name: name.to_string() }, expr.span))
        }
        ExprKind::Unary { op, expr: inner } => {
            let v = evaluate_depth(inner, ctx, depth)?;
            match op {
                UnaryOp::Pos => Ok(v),
                UnaryOp::Neg => Ok(v.neg()),
                UnaryOp::Not => {
                    require_unitless(expr.span, &v, "not")?;
                    Ok(Quantity::scalar(if v.is_truthy() { 0.0 } else { 1.0 }))
                }
            }
        }
        ExprKind::Binary { op, left, right } => {
            let l = evaluate_depth(left, ctx, depth)?;
            let r = evaluate_depth(right, ctx, depth)?;
            evaluate_binary(*op, &l, &r, expr.span)
        }
        ExprKind::IfChain { branches, else_branch } => {
            for (cond, then_expr) in branches {
                let c = evaluate_depth(cond, ctx, depth)?;
                if c.is_truthy() {
                    return evaluate_depth(then_expr, ctx, depth);
                }
            }
            evaluate_depth(else_branch, ctx, depth)
        }
        ExprKind::Call { name, args } => evaluate_call(expr, name, args, ctx, depth),
        ExprKind::Lookup1D { x, points, x_unit, y_unit } => evaluate_lookup(expr, x, points, x_unit, y_unit, ctx, depth),
        ExprKind::Delay { kind, input, delay_time, initial } => {
            evaluate_delay(expr, *kind, input, delay_time, initial.as_deref(), ctx, depth)
        }
    }
}

fn evaluate_binary(op: BinaryOp, l: &Quantity, r: &Quantity, span: Span) -> Result<Quantity, EvalError> {
    match op {
        BinaryOp::Add => l.add(r).map_err(|e| with_span(e, span)),
        BinaryOp::Sub => l.sub(r).map_err(|e| with_span(e, span)),
        BinaryOp::Mul => Ok(l.mul(r)),
        BinaryOp::Div => Ok(l.div(r)),
        BinaryOp::Mod => {
            if !units::units_equal(&l.units, &r.units) {
                return Err(unit_mismatch(span, &l.units, &r.units, "mod"));
            }
            Ok(Quantity::new(l.value % r.value, l.units.clone()))
        }
        BinaryOp::Pow => l.pow(r).map_err(|e| with_span(e, span)),
        BinaryOp::Eq | BinaryOp::Neq | BinaryOp::Lt | BinaryOp::Lte | BinaryOp::Gt | BinaryOp::Gte => {
            if !units::units_equal(&l.units, &r.units) {
                return Err(unit_mismatch(span, &l.units, &r.units, "compare"));
            }
            let result = match op {
                BinaryOp::Eq => l.value == r.value,
                BinaryOp::Neq => l.value != r.value,
                BinaryOp::Lt => l.value < r.value,
                BinaryOp::Lte => l.value <= r.value,
                BinaryOp::Gt => l.value > r.value,
                BinaryOp::Gte => l.value >= r.value,
                _ => unreachable!(),
            };
            Ok(Quantity::scalar(if result { 1.0 } else { 0.0 }))
        }
        BinaryOp::And | BinaryOp::Or | BinaryOp::Xor => {
            require_unitless(span, l, "logical")?;
            require_unitless(span, r, "logical")?;
            let result = match op {
                BinaryOp::And => l.is_truthy() && r.is_truthy(),
                BinaryOp::Or => l.is_truthy() || r.is_truthy(),
                BinaryOp::Xor => l.is_truthy() != r.is_truthy(),
                _ => unreachable!(),
            };
            Ok(Quantity::scalar(if result { 1.0 } else { 0.0 }))
        }
    }
}

fn with_span(mut err: EvalError, span: Span) -> EvalError {
    if err.span.is_none() {
        err.span = Some(span);
    }
    err
}

fn evaluate_call(expr: &Expr, name: &str, args: &[Expr], ctx: &mut EvalContext, depth: usize) -> Result<Quantity, EvalError> {
    if depth >= MAX_MACRO_DEPTH {
        return Err(EvalError::with_span(
            EvalErrorKind::MacroRecursion { name: name.to_string(), depth },
            expr.span,
        ));
    }
    let def = *ctx
        .defs
        .get(name)
        .ok_or_else(|| EvalError::with_span(EvalErrorKind::IdentifierNotFound { name: name.to_string() }, expr.span))?;
    if def.params.len() != args.len() {
        return Err(EvalError::with_span(
            EvalErrorKind::MacroArityMismatch {
                name: name.to_string(),
                expected: def.params.len(),
                found: args.len(),
            },
            expr.span,
        ));
    }
    let mut call_scope = ctx.scope.clone();
    for (param, arg) in def.params.iter().zip(args) {
        let value = evaluate_depth(arg, ctx, depth)?;
        call_scope.insert(param.clone(), value);
    }
    let mut inner_ctx = EvalContext {
        scope: &call_scope,
        defs: ctx.defs,
        delay_state: &mut *ctx.delay_state,
        commit: ctx.commit,
        equation_name: ctx.equation_name,
        source: ctx.source,
    };
    evaluate_depth(&def.body, &mut inner_ctx, depth + 1)
}

fn evaluate_lookup(
    expr: &Expr,
    x_expr: &Expr,
    points: &[(f64, f64)],
    x_unit: &Option<UnitMap>,
    y_unit: &Option<UnitMap>,
    ctx: &mut EvalContext,
    depth: usize,
) -> Result<Quantity, EvalError> {
    if points.is_empty() {
        return Err(EvalError::with_span(EvalErrorKind::LookupEmpty, expr.span));
    }
    for w in points.windows(2) {
        if w[1].0 <= w[0].0 {
            return Err(EvalError::with_span(EvalErrorKind::LookupNonMonotonic, expr.span));
        }
    }
    let x = evaluate_depth(x_expr, ctx, depth)?;
    let expected_x_units = x_unit.clone().unwrap_or_default();
    if !units::units_equal(&x.units, &expected_x_units) {
        return Err(unit_mismatch(expr.span, &x.units, &expected_x_units, "lookup"));
    }
    let xv = x.value;
    let y = if xv <= points[0].0 {
        points[0].1
    } else if xv >= points[points.len() - 1].0 {
        points[points.len() - 1].1
    } else {
        let mut result = points[points.len() - 1].1;
        for w in points.windows(2) {
            let (x0, y0) = w[0];
            let (x1, y1) = w[1];
            if xv >= x0 && xv <= x1 {
                let alpha = (xv - x0) / (x1 - x0);
                result = y0 + alpha * (y1 - y0);
                break;
            }
        }
        result
    };
    Ok(Quantity::new(y, y_unit.clone().unwrap_or_default()))
}

fn delay_order(kind: DelayKind) -> usize {
    match kind {
        DelayKind::Delay1 | DelayKind::Smooth => 1,
        DelayKind::Delay3 | DelayKind::Smooth3 => 3,
    }
}

fn evaluate_delay(
    expr: &Expr,
    kind: DelayKind,
    input_expr: &Expr,
    delay_time_expr: &Expr,
    initial_expr: Option<&Expr>,
    ctx: &mut EvalContext,
    depth: usize,
) -> Result<Quantity, EvalError> {
    let input = evaluate_depth(input_expr, ctx, depth)?;
    let tau = evaluate_depth(delay_time_expr, ctx, depth)?;
    let dt = ctx
        .scope
        .get(TIME_STEP)
        .cloned()
        .ok_or_else(|| EvalError::with_span(EvalErrorKind::IdentifierNotFound { name: TIME_STEP.to_string() }, expr.span))?
        .value;

    let n = delay_order(kind);
    let existing = ctx.delay_state.get(ctx.equation_name, expr.id).map(|(s, u)| (s.to_vec(), u.clone()));
    let stages = match existing {
        Some((stages, _)) => stages,
        None => {
            let seed = match initial_expr {
                Some(e) => evaluate_depth(e, ctx, depth)?.value,
                None => input.value,
            };
            vec![seed; n]
        }
    };

    let output = stages[n - 1];
    let per_stage_tau = tau.value / n as f64;
    let mut new_stages = Vec::with_capacity(n);
    let mut prev_input = input.value;
    for &stage in &stages {
        let updated = stage + dt * (prev_input - stage) / per_stage_tau;
        new_stages.push(updated);
        prev_input = stage;
    }

    if ctx.commit {
        ctx.delay_state.set(ctx.equation_name, expr.id, new_stages, input.units.clone());
    }

    Ok(Quantity::new(output, input.units.clone()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::parse_equation;

    fn eval_str(source: &str, scope: &Scope) -> Quantity {
        let eq = parse_equation(source).unwrap();
        let defs: HashMap<String, &FunctionDef> = eq.defs.iter().map(|d| (d.name.clone(), d)).collect();
        let mut delay_state = DelayStateStore::new();
        let mut ctx = EvalContext {
            scope,
            defs: &defs,
            delay_state: &mut delay_state,
            commit: true,
            equation_name: "test",
            source,
        };
        evaluate(&eq.expr, &mut ctx).unwrap()
    }

    #[test]
    fn arithmetic() {
        let scope = Scope::new();
        assert_eq!(eval_str("1 + 2 * 3", &scope).value, 7.0);
    }

    #[test]
    fn boolean_truthiness() {
        let scope = Scope::new();
        assert_eq!(eval_str("NOT 0", &scope).value, 1.0);
        assert_eq!(eval_str("NOT 1", &scope).value, 0.0);
        assert_eq!(eval_str("IF 5 THEN 1 ELSE 2 END IF", &scope).value, 1.0);
        assert_eq!(eval_str("IF 0 THEN 1 ELSE 2 END IF", &scope).value, 2.0);
    }

    #[test]
    fn macro_call() {
        let scope = Scope::new();
        assert_eq!(eval_str("FUNCTION sq(x) x * x END FUNCTION sq(4)", &scope).value, 16.0);
    }

    #[test]
    fn lookup_interpolates_and_clamps() {
        let scope = Scope::new();
        assert_eq!(eval_str("LOOKUP(0.5, (0,0)(1,2)(2,4))", &scope).value, 1.0);
        assert_eq!(eval_str("LOOKUP(-5, (0,0)(1,2)(2,4))", &scope).value, 0.0);
        assert_eq!(eval_str("LOOKUP(50, (0,0)(1,2)(2,4))", &scope).value, 4.0);
    }

    #[test]
    fn delay1_starts_at_steady_state_and_tracks_input() {
        let mut scope = Scope::new();
        scope.insert(TIME_STEP.to_string(), Quantity::scalar(1.0));
        // On the first call with no prior state, DELAY1's output equals the
        // input itself (steady-state seed).
        assert_eq!(eval_str("DELAY1(10, 5)", &scope).value, 10.0);
    }

    #[test]
    fn delay1_commits_state_across_calls() {
        let mut scope = Scope::new();
        scope.insert(TIME_STEP.to_string(), Quantity::scalar(1.0));
        let eq = parse_equation("DELAY1(10, 5)").unwrap();
        let defs: HashMap<String, &FunctionDef> = HashMap::new();
        let mut delay_state = DelayStateStore::new();

        let first = {
            let mut ctx = EvalContext {
                scope: &scope,
                defs: &defs,
                delay_state: &mut delay_state,
                commit: true,
                equation_name: "growth",
                source: "",
            };
            evaluate(&eq.expr, &mut ctx).unwrap()
        };
        let second = {
            let mut ctx = EvalContext {
                scope: &scope,
                defs: &defs,
                delay_state: &mut delay_state,
                commit: true,
                equation_name: "growth",
                source: "",
            };
            evaluate(&eq.expr, &mut ctx).unwrap()
        };
        assert_eq!(first.value, 10.0);
        // Output was already at steady state, so it stays there.
        assert!((second.value - 10.0).abs() < 1e-9);
    }

    #[test]
    fn non_committing_clone_does_not_mutate_store() {
        let mut scope = Scope::new();
        scope.insert(TIME_STEP.to_string(), Quantity::scalar(1.0));
        let eq = parse_equation("DELAY1(20, 5)").unwrap();
        let defs: HashMap<String, &FunctionDef> = HashMap::new();
        let mut committed_state = DelayStateStore::new();
        committed_state.set("growth", eq.expr.id, vec![10.0], units::unitless());

        let mut probe_state = committed_state.clone();
        {
            let mut ctx = EvalContext {
                scope: &scope,
                defs: &defs,
                delay_state: &mut probe_state,
                commit: false,
                equation_name: "growth",
                source: "",
            };
            evaluate(&eq.expr, &mut ctx).unwrap();
        }
        // The committed store must be untouched by the non-committing probe.
        assert_eq!(committed_state.get("growth", eq.expr.id).unwrap().0, &[10.0]);
    }

    #[test]
    fn unit_mismatch_in_addition() {
        let mut scope = Scope::new();
        scope.insert("A".to_string(), Quantity::new(1.0, UnitMap::from([("kg".to_string(), 1)])));
        scope.insert("B".to_string(), Quantity::new(1.0, UnitMap::from([("people".to_string(), 1)])));
        let eq = parse_equation("[A] + [B]").unwrap();
        let defs: HashMap<String, &FunctionDef> = HashMap::new();
        let mut delay_state = DelayStateStore::new();
        let mut ctx = EvalContext {
            scope: &scope,
            defs: &defs,
            delay_state: &mut delay_state,
            commit: true,
            equation_name: "test",
            source: "",
        };
        assert!(evaluate(&eq.expr, &mut ctx).is_err());
    }
}
