//! Crate-wide error taxonomy.
//!
//! Three layers, innermost first:
//! - [`ParseError`] / [`EvalError`] are the raw failures produced while
//!   lexing, parsing, or evaluating a single equation.
//! - [`EquationDiagnostic`] lifts either of those into a structured,
//!   span-and-snippet-carrying record suitable for CLI/editor display.
//! - [`Error`] is the crate's public `std::error::Error` surface, covering
//!   every tier from model construction through batch execution.

use std::fmt;

/// A byte/line/column span into an equation's source text.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, serde::Serialize, serde::Deserialize)]
pub struct Span {
    pub start: usize,
    pub end: usize,
    pub line: usize,
    pub column: usize,
}

impl Span {
    pub fn new(start: usize, end: usize, line: usize, column: usize) -> Self {
        Self { start, end, line, column }
    }
}

/// Which phase of equation processing produced a diagnostic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Phase {
    Parse,
    Compile,
    Evaluate,
}

/// Failures raised while tokenizing or parsing an equation or unit string.
#[derive(Debug, Clone, PartialEq)]
pub enum ParseErrorKind {
    UnexpectedToken { found: String, expected: String },
    UnclosedBlock { what: String },
    TrailingInput { remainder: String },
    UnterminatedString,
    InvalidUnitToken { token: String },
    InvalidUnitExponent { text: String },
    DuplicateMacroName { name: String },
    InvalidElseIfChain,
    MacroImpureBody { name: String },
}

impl fmt::Display for ParseErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ParseErrorKind::UnexpectedToken { found, expected } => {
                write!(f, "unexpected token {found:?}, expected {expected}")
            }
            ParseErrorKind::UnclosedBlock { what } => write!(f, "unclosed {what}"),
            ParseErrorKind::TrailingInput { remainder } => {
                write!(f, "trailing input: {remainder:?}")
            }
            ParseErrorKind::UnterminatedString => write!(f, "unterminated string literal"),
            ParseErrorKind::InvalidUnitToken { token } => write!(f, "invalid unit token {token:?}"),
            ParseErrorKind::InvalidUnitExponent { text } => {
                write!(f, "invalid unit exponent {text:?}")
            }
            ParseErrorKind::DuplicateMacroName { name } => {
                write!(f, "duplicate macro name {name:?}")
            }
            ParseErrorKind::InvalidElseIfChain => write!(f, "malformed if/elseif/else chain"),
            ParseErrorKind::MacroImpureBody { name } => {
                write!(f, "macro {name:?} body must not declare nested functions")
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ParseError {
    pub kind: ParseErrorKind,
    pub span: Span,
}

impl ParseError {
    pub fn new(kind: ParseErrorKind, span: Span) -> Self {
        Self { kind, span }
    }
}

impl fmt::Display for ParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (line {}, column {})", self.kind, self.span.line, self.span.column)
    }
}

impl std::error::Error for ParseError {}

/// Failures raised while evaluating a parsed equation against a scope.
#[derive(Debug, Clone, PartialEq)]
pub enum EvalErrorKind {
    UnitMismatch { left: String, right: String, operation: String },
    NonIntegerExponent { exponent: f64 },
    IdentifierNotFound { name: String },
    MacroRecursion { name: String, depth: usize },
    MacroArityMismatch { name: String, expected: usize, found: usize },
    LookupNonMonotonic,
    LookupEmpty,
    ConstantMissingValue { name: String },
}

impl fmt::Display for EvalErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EvalErrorKind::UnitMismatch { left, right, operation } => {
                write!(f, "unit mismatch in {operation}: {left} vs {right}")
            }
            EvalErrorKind::NonIntegerExponent { exponent } => {
                write!(f, "exponent {exponent} is not an integer and the base is dimensioned")
            }
            EvalErrorKind::IdentifierNotFound { name } => write!(f, "identifier {name:?} not found"),
            EvalErrorKind::MacroRecursion { name, depth } => {
                write!(f, "macro {name:?} recursed past depth {depth}")
            }
            EvalErrorKind::MacroArityMismatch { name, expected, found } => {
                write!(f, "macro {name:?} expects {expected} argument(s), got {found}")
            }
            EvalErrorKind::LookupNonMonotonic => write!(f, "lookup table x values are not strictly increasing"),
            EvalErrorKind::LookupEmpty => write!(f, "lookup table has no points"),
            EvalErrorKind::ConstantMissingValue { name } => {
                write!(f, "constant {name:?} has no value")
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct EvalError {
    pub kind: EvalErrorKind,
    pub span: Option<Span>,
}

impl EvalError {
    pub fn new(kind: EvalErrorKind) -> Self {
        Self { kind, span: None }
    }

    pub fn with_span(kind: EvalErrorKind, span: Span) -> Self {
        Self { kind, span: Some(span) }
    }
}

impl fmt::Display for EvalError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.kind)
    }
}

impl std::error::Error for EvalError {}

/// A structured, span-and-snippet-carrying record describing a failure
/// anywhere in equation processing.
#[derive(Debug, Clone, PartialEq)]
pub struct EquationDiagnostic {
    pub phase: Phase,
    pub code: String,
    pub message: String,
    pub span: Span,
    pub snippet: String,
    pub hints: Vec<String>,
}

fn caret_snippet(source: &str, span: Span) -> String {
    let line = source.lines().nth(span.line.saturating_sub(1)).unwrap_or("");
    let caret_col = span.column.saturating_sub(1);
    let mut caret = " ".repeat(caret_col);
    caret.push('^');
    format!("{line}\n{caret}")
}

impl EquationDiagnostic {
    pub fn from_parse_error(source: &str, err: &ParseError) -> Self {
        let code = match &err.kind {
            ParseErrorKind::UnexpectedToken { .. } => "UnexpectedToken",
            ParseErrorKind::UnclosedBlock { .. } => "UnclosedBlock",
            ParseErrorKind::TrailingInput { .. } => "TrailingInput",
            ParseErrorKind::UnterminatedString => "UnterminatedString",
            ParseErrorKind::InvalidUnitToken { .. } => "InvalidUnitToken",
            ParseErrorKind::InvalidUnitExponent { .. } => "InvalidUnitExponent",
            ParseErrorKind::DuplicateMacroName { .. } => "DuplicateMacroName",
            ParseErrorKind::InvalidElseIfChain => "InvalidElseIfChain",
            ParseErrorKind::MacroImpureBody { .. } => "MacroImpureBody",
        };
        let diagnostic = EquationDiagnostic {
            phase: Phase::Parse,
            code: code.to_string(),
            message: err.kind.to_string(),
            span: err.span,
            snippet: caret_snippet(source, err.span),
            hints: Vec::new(),
        };
        tracing::debug!(code = %diagnostic.code, line = diagnostic.span.line, column = diagnostic.span.column, "equation parse diagnostic");
        diagnostic
    }

    pub fn from_eval_error(source: &str, err: &EvalError) -> Self {
        let code = match &err.kind {
            EvalErrorKind::UnitMismatch { .. } => "UnitMismatch",
            EvalErrorKind::NonIntegerExponent { .. } => "NonIntegerExponent",
            EvalErrorKind::IdentifierNotFound { .. } => "IdentifierNotFound",
            EvalErrorKind::MacroRecursion { .. } => "MacroRecursion",
            EvalErrorKind::MacroArityMismatch { .. } => "MacroArityMismatch",
            EvalErrorKind::LookupNonMonotonic => "LookupNonMonotonic",
            EvalErrorKind::LookupEmpty => "LookupEmpty",
            EvalErrorKind::ConstantMissingValue { .. } => "ConstantMissingValue",
        };
        let span = err.span.unwrap_or_default();
        let diagnostic = EquationDiagnostic {
            phase: Phase::Evaluate,
            code: code.to_string(),
            message: err.kind.to_string(),
            span,
            snippet: caret_snippet(source, span),
            hints: Vec::new(),
        };
        tracing::debug!(code = %diagnostic.code, line = diagnostic.span.line, column = diagnostic.span.column, "equation evaluation diagnostic");
        diagnostic
    }
}

impl fmt::Display for EquationDiagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "{:?} {}: {}", self.phase, self.code, self.message)?;
        write!(f, "{}", self.snippet)
    }
}

/// The crate's public error type, covering every failure tier: model
/// construction, per-step evaluation, and batch (scenario/Monte Carlo/
/// optimization) execution.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("equation parse error: {diagnostic}")]
    EquationParseError { diagnostic: EquationDiagnostic },

    #[error("equation evaluation error in `{expression}`: {problem}")]
    EquationEvaluationError {
        expression: String,
        problem: EquationDiagnostic,
    },

    #[error("adaptive solver failed to converge for model {model} at step {time_step}: error norm {error}")]
    ConvergenceError {
        model: String,
        time_step: f64,
        error: f64,
    },

    #[error("invalid time step {step}: must be in [1e-9, horizon]")]
    InvalidTimeStepError { step: f64 },

    #[error("scenario override target(s) not found: {targets:?}")]
    ScenarioOverrideNotFoundError { targets: Vec<String> },

    #[error("scenario override target `{name}` is not overridable (only stock initial values and constants are)")]
    ScenarioUnsupportedOverrideError { name: String },

    #[error("metric `{name}` not found among stocks or variables")]
    ScenarioMetricNotFoundError { name: String },

    #[error("scenario `{scenario}` targets model `{expected}` but was compared against `{found}`")]
    ScenarioModelMismatchError {
        scenario: String,
        expected: String,
        found: String,
    },

    #[error("invalid Monte Carlo configuration: {message}")]
    MonteCarloConfigurationError { message: String },

    #[error("failed to build dependency graph: {message}")]
    EquationGraphBuildError { message: String },

    #[error("dependency graph has a cycle involving: {nodes:?}")]
    EquationGraphCycleError { nodes: Vec<String> },

    #[error("model is invalid: {message}")]
    ModelBuildError { message: String },
}

impl From<ParseError> for Error {
    fn from(err: ParseError) -> Self {
        Error::EquationParseError {
            diagnostic: EquationDiagnostic {
                phase: Phase::Parse,
                code: "ParseError".to_string(),
                message: err.to_string(),
                span: err.span,
                snippet: String::new(),
                hints: Vec::new(),
            },
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
