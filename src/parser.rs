//! Pratt-precedence recursive-descent parser for the equation DSL.

use crate::ast::{BinaryOp, DelayKind, Expr, ExprKind, FunctionDef, EquationNode, NodeId, TimeKeyword, UnaryOp};
use crate::error::{ParseError, ParseErrorKind, Span};
use crate::token::{Lexer, Spanned, Token};
use crate::unit_parser;
use crate::units::UnitMap;

/// Splits a `{ value unit_expr }` block's inner text into its leading
/// numeric literal and the remaining unit expression.
fn parse_quantity_block(text: &str, span: Span) -> Result<(f64, UnitMap), ParseError> {
    let trimmed = text.trim_start();
    let mut chars = trimmed.char_indices().peekable();
    let mut end = 0;
    if let Some(&(_, '-' | '+')) = chars.peek() {
        chars.next();
    }
    while let Some(&(i, c)) = chars.peek() {
        if c.is_ascii_digit() {
            end = i + 1;
            chars.next();
        } else {
            break;
        }
    }
    if let Some(&(_, '.')) = chars.peek() {
        chars.next();
        while let Some(&(i, c)) = chars.peek() {
            if c.is_ascii_digit() {
                end = i + 1;
                chars.next();
            } else {
                break;
            }
        }
    }
    if let Some(&(_, 'e' | 'E')) = chars.peek() {
        let mark = chars.clone().next().map(|(i, _)| i).unwrap_or(end);
        chars.next();
        if let Some(&(_, '+' | '-')) = chars.peek() {
            chars.next();
        }
        let mut had_digit = false;
        while let Some(&(i, c)) = chars.peek() {
            if c.is_ascii_digit() {
                end = i + 1;
                had_digit = true;
                chars.next();
            } else {
                break;
            }
        }
        if !had_digit {
            end = mark;
        }
    }
    if end == 0 {
        return Err(ParseError::new(
            ParseErrorKind::UnexpectedToken {
                found: trimmed.to_string(),
                expected: "a numeric value followed by a unit expression".to_string(),
            },
            span,
        ));
    }
    let value: f64 = trimmed[..end].parse().map_err(|_| {
        ParseError::new(
            ParseErrorKind::UnexpectedToken { found: trimmed[..end].to_string(), expected: "number".to_string() },
            span,
        )
    })?;
    let units = unit_parser::parse_unit_expr(&trimmed[end..])?;
    Ok((value, units))
}

struct Parser {
    tokens: Vec<Spanned<Token>>,
    pos: usize,
    next_id: NodeId,
    /// Name of the `FUNCTION` macro whose body is currently being parsed, if
    /// any. Lets `primary()` report a nested `FUNCTION` as the specific
    /// `MacroImpureBody` error instead of a generic `UnexpectedToken`.
    current_macro: Option<String>,
}

impl Parser {
    fn peek(&self) -> &Token {
        &self.tokens[self.pos].value
    }

    fn span(&self) -> Span {
        self.tokens[self.pos].span
    }

    fn advance(&mut self) -> Spanned<Token> {
        let tok = self.tokens[self.pos].clone();
        if self.pos + 1 < self.tokens.len() {
            self.pos += 1;
        }
        tok
    }

    fn expect(&mut self, expected: &Token, what: &str) -> Result<Spanned<Token>, ParseError> {
        if self.peek() == expected {
            Ok(self.advance())
        } else {
            Err(ParseError::new(
                ParseErrorKind::UnexpectedToken {
                    found: format!("{:?}", self.peek()),
                    expected: what.to_string(),
                },
                self.span(),
            ))
        }
    }

    fn expect_ident(&mut self) -> Result<String, ParseError> {
        match self.peek().clone() {
            Token::Ident(name) => {
                self.advance();
                Ok(name)
            }
            other => Err(ParseError::new(
                ParseErrorKind::UnexpectedToken {
                    found: format!("{:?}", other),
                    expected: "identifier".to_string(),
                },
                self.span(),
            )),
        }
    }

    fn node(&mut self, span: Span, kind: ExprKind) -> Expr {
        let id = self.next_id;
        self.next_id += 1;
        Expr { id, span, kind }
    }

    // unit_expr := or_expr
    fn parse_or(&mut self) -> Result<Expr, ParseError> {
        let mut left = self.parse_and()?;
        loop {
            let op = match self.peek() {
                Token::Or => BinaryOp::Or,
                Token::Xor => BinaryOp::Xor,
                _ => break,
            };
            let start = left.span;
            self.advance();
            let right = self.parse_and()?;
            let span = Span::new(start.start, right.span.end, start.line, start.column);
            left = self.node(span, ExprKind::Binary { op, left: Box::new(left), right: Box::new(right) });
        }
        Ok(left)
    }

    fn parse_and(&mut self) -> Result<Expr, ParseError> {
        let mut left = self.parse_not()?;
        while matches!(self.peek(), Token::And) {
            let start = left.span;
            self.advance();
            let right = self.parse_not()?;
            let span = Span::new(start.start, right.span.end, start.line, start.column);
            left = self.node(span, ExprKind::Binary { op: BinaryOp::And, left: Box::new(left), right: Box::new(right) });
        }
        Ok(left)
    }

    fn parse_not(&mut self) -> Result<Expr, ParseError> {
        if matches!(self.peek(), Token::Not) {
            let start = self.span();
            self.advance();
            let operand = self.parse_not()?;
            let span = Span::new(start.start, operand.span.end, start.line, start.column);
            return Ok(self.node(span, ExprKind::Unary { op: UnaryOp::Not, expr: Box::new(operand) }));
        }
        self.parse_comparison()
    }

    fn parse_comparison(&mut self) -> Result<Expr, ParseError> {
        let mut left = self.parse_additive()?;
        loop {
            let op = match self.peek() {
                Token::EqEq => BinaryOp::Eq,
                Token::Neq => BinaryOp::Neq,
                Token::Lt => BinaryOp::Lt,
                Token::Lte => BinaryOp::Lte,
                Token::Gt => BinaryOp::Gt,
                Token::Gte => BinaryOp::Gte,
                _ => break,
            };
            let start = left.span;
            self.advance();
            let right = self.parse_additive()?;
            let span = Span::new(start.start, right.span.end, start.line, start.column);
            left = self.node(span, ExprKind::Binary { op, left: Box::new(left), right: Box::new(right) });
        }
        Ok(left)
    }

    fn parse_additive(&mut self) -> Result<Expr, ParseError> {
        let mut left = self.parse_multiplicative()?;
        loop {
            let op = match self.peek() {
                Token::Plus => BinaryOp::Add,
                Token::Minus => BinaryOp::Sub,
                _ => break,
            };
            let start = left.span;
            self.advance();
            let right = self.parse_multiplicative()?;
            let span = Span::new(start.start, right.span.end, start.line, start.column);
            left = self.node(span, ExprKind::Binary { op, left: Box::new(left), right: Box::new(right) });
        }
        Ok(left)
    }

    fn parse_multiplicative(&mut self) -> Result<Expr, ParseError> {
        let mut left = self.parse_power()?;
        loop {
            let op = match self.peek() {
                Token::Star => BinaryOp::Mul,
                Token::Slash => BinaryOp::Div,
                Token::Percent => BinaryOp::Mod,
                _ => break,
            };
            let start = left.span;
            self.advance();
            let right = self.parse_power()?;
            let span = Span::new(start.start, right.span.end, start.line, start.column);
            left = self.node(span, ExprKind::Binary { op, left: Box::new(left), right: Box::new(right) });
        }
        Ok(left)
    }

    // Right-associative.
    fn parse_power(&mut self) -> Result<Expr, ParseError> {
        let left = self.parse_unary()?;
        if matches!(self.peek(), Token::Caret) {
            let start = left.span;
            self.advance();
            let right = self.parse_power()?;
            let span = Span::new(start.start, right.span.end, start.line, start.column);
            return Ok(self.node(span, ExprKind::Binary { op: BinaryOp::Pow, left: Box::new(left), right: Box::new(right) }));
        }
        Ok(left)
    }

    fn parse_unary(&mut self) -> Result<Expr, ParseError> {
        match self.peek() {
            Token::Plus => {
                let start = self.span();
                self.advance();
                let operand = self.parse_unary()?;
                let span = Span::new(start.start, operand.span.end, start.line, start.column);
                Ok(self.node(span, ExprKind::Unary { op: UnaryOp::Pos, expr: Box::new(operand) }))
            }
            Token::Minus => {
                let start = self.span();
                self.advance();
                let operand = self.parse_unary()?;
                let span = Span::new(start.start, operand.span.end, start.line, start.column);
                Ok(self.node(span, ExprKind::Unary { op: UnaryOp::Neg, expr: Box::new(operand) }))
            }
            _ => self.parse_primary(),
        }
    }

    fn parse_number_literal(&mut self) -> Result<f64, ParseError> {
        // Accepts an optional leading unary minus, used inside lookup table points.
        let neg = if matches!(self.peek(), Token::Minus) {
            self.advance();
            true
        } else {
            false
        };
        match self.advance().value {
            Token::Num(text) => {
                let v: f64 = text.parse().map_err(|_| {
                    ParseError::new(
                        ParseErrorKind::UnexpectedToken { found: text.clone(), expected: "number".to_string() },
                        self.span(),
                    )
                })?;
                Ok(if neg { -v } else { v })
            }
            other => Err(ParseError::new(
                ParseErrorKind::UnexpectedToken { found: format!("{:?}", other), expected: "number".to_string() },
                self.span(),
            )),
        }
    }

    fn maybe_unit_block(&mut self) -> Result<Option<UnitMap>, ParseError> {
        if let Token::UnitBlock(text) = self.peek().clone() {
            self.advance();
            Ok(Some(unit_parser::parse_unit_expr(&text)?))
        } else {
            Ok(None)
        }
    }

    fn parse_primary(&mut self) -> Result<Expr, ParseError> {
        let start = self.span();
        match self.peek().clone() {
            Token::Num(text) => {
                self.advance();
                let value: f64 = text.parse().map_err(|_| {
                    ParseError::new(
                        ParseErrorKind::UnexpectedToken { found: text.clone(), expected: "number".to_string() },
                        start,
                    )
                })?;
                let units = self.maybe_unit_block()?;
                let end = self.tokens[self.pos.saturating_sub(1)].span.end;
                Ok(self.node(Span::new(start.start, end, start.line, start.column), ExprKind::QuantityLiteral { value, units }))
            }
            Token::UnitBlock(text) => {
                self.advance();
                let (value, units) = parse_quantity_block(&text, start)?;
                Ok(self.node(start, ExprKind::QuantityLiteral { value, units: Some(units) }))
            }
            Token::True => {
                self.advance();
                Ok(self.node(start, ExprKind::BooleanLiteral(true)))
            }
            Token::False => {
                self.advance();
                Ok(self.node(start, ExprKind::BooleanLiteral(false)))
            }
            Token::Ref(name) => {
                self.advance();
                Ok(self.node(start, ExprKind::Ref(name)))
            }
            Token::Time => {
                self.advance();
                Ok(self.node(start, ExprKind::Time(TimeKeyword::Time)))
            }
            Token::TimeStep => {
                self.advance();
                Ok(self.node(start, ExprKind::Time(TimeKeyword::TimeStep)))
            }
            Token::InitialTime => {
                self.advance();
                Ok(self.node(start, ExprKind::Time(TimeKeyword::InitialTime)))
            }
            Token::FinalTime => {
                self.advance();
                Ok(self.node(start, ExprKind::Time(TimeKeyword::FinalTime)))
            }
            Token::LParen => {
                self.advance();
                let inner = self.parse_or()?;
                self.expect(&Token::RParen, ")")?;
                Ok(inner)
            }
            Token::If => self.parse_if_chain(),
            Token::Lookup => self.parse_lookup(),
            Token::Delay1 => self.parse_delay(DelayKind::Delay1),
            Token::Delay3 => self.parse_delay(DelayKind::Delay3),
            Token::Smooth => self.parse_delay(DelayKind::Smooth),
            Token::Smooth3 => self.parse_delay(DelayKind::Smooth3),
            Token::Ident(name) => {
                self.advance();
                if matches!(self.peek(), Token::LParen) {
                    self.advance();
                    let mut args = Vec::new();
                    if !matches!(self.peek(), Token::RParen) {
                        loop {
                            args.push(self.parse_or()?);
                            if matches!(self.peek(), Token::Comma) {
                                self.advance();
                            } else {
                                break;
                            }
                        }
                    }
                    let close = self.expect(&Token::RParen, ")")?;
                    Ok(self.node(Span::new(start.start, close.span.end, start.line, start.column), ExprKind::Call { name, args }))
                } else {
                    Ok(self.node(start, ExprKind::Ref(name)))
                }
            }
            Token::Function if self.current_macro.is_some() => Err(ParseError::new(
                ParseErrorKind::MacroImpureBody {
                    name: self.current_macro.clone().expect("checked by guard above"),
                },
                start,
            )),
            other => Err(ParseError::new(
                ParseErrorKind::UnexpectedToken { found: format!("{:?}", other), expected: "an expression".to_string() },
                start,
            )),
        }
    }

    fn parse_if_chain(&mut self) -> Result<Expr, ParseError> {
        let start = self.span();
        self.expect(&Token::If, "IF")?;
        let mut branches = Vec::new();
        let cond = self.parse_or()?;
        self.expect(&Token::Then, "THEN")?;
        let then_expr = self.parse_or()?;
        branches.push((cond, then_expr));
        loop {
            match self.peek() {
                Token::ElseIf => {
                    self.advance();
                    let cond = self.parse_or()?;
                    self.expect(&Token::Then, "THEN")?;
                    let then_expr = self.parse_or()?;
                    branches.push((cond, then_expr));
                }
                _ => break,
            }
        }
        let else_branch = if matches!(self.peek(), Token::Else) {
            self.advance();
            self.parse_or()?
        } else {
            return Err(ParseError::new(ParseErrorKind::InvalidElseIfChain, self.span()));
        };
        self.expect(&Token::End, "END")?;
        let end_tok = self.expect(&Token::If, "IF")?;
        Ok(self.node(
            Span::new(start.start, end_tok.span.end, start.line, start.column),
            ExprKind::IfChain { branches, else_branch: Box::new(else_branch) },
        ))
    }

    fn parse_lookup(&mut self) -> Result<Expr, ParseError> {
        let start = self.span();
        self.expect(&Token::Lookup, "LOOKUP")?;
        self.expect(&Token::LParen, "(")?;
        let x = self.parse_or()?;
        self.expect(&Token::Comma, ",")?;
        let mut points = Vec::new();
        let mut x_unit = None;
        let mut y_unit = None;
        while matches!(self.peek(), Token::LParen) {
            self.advance();
            let px = self.parse_number_literal()?;
            if x_unit.is_none() {
                x_unit = self.maybe_unit_block()?;
            } else {
                self.maybe_unit_block()?;
            }
            self.expect(&Token::Comma, ",")?;
            let py = self.parse_number_literal()?;
            if y_unit.is_none() {
                y_unit = self.maybe_unit_block()?;
            } else {
                self.maybe_unit_block()?;
            }
            self.expect(&Token::RParen, ")")?;
            points.push((px, py));
        }
        let close = self.expect(&Token::RParen, ")")?;
        Ok(self.node(
            Span::new(start.start, close.span.end, start.line, start.column),
            ExprKind::Lookup1D { x: Box::new(x), points, x_unit, y_unit },
        ))
    }

    fn parse_delay(&mut self, kind: DelayKind) -> Result<Expr, ParseError> {
        let start = self.span();
        self.advance();
        self.expect(&Token::LParen, "(")?;
        let input = self.parse_or()?;
        self.expect(&Token::Comma, ",")?;
        let delay_time = self.parse_or()?;
        let initial = if matches!(self.peek(), Token::Comma) {
            self.advance();
            Some(Box::new(self.parse_or()?))
        } else {
            None
        };
        let close = self.expect(&Token::RParen, ")")?;
        Ok(self.node(
            Span::new(start.start, close.span.end, start.line, start.column),
            ExprKind::Delay { kind, input: Box::new(input), delay_time: Box::new(delay_time), initial },
        ))
    }

    fn parse_function_def(&mut self) -> Result<FunctionDef, ParseError> {
        self.expect(&Token::Function, "FUNCTION")?;
        let name = self.expect_ident()?;
        self.expect(&Token::LParen, "(")?;
        let mut params = Vec::new();
        if !matches!(self.peek(), Token::RParen) {
            loop {
                params.push(self.expect_ident()?);
                if matches!(self.peek(), Token::Comma) {
                    self.advance();
                } else {
                    break;
                }
            }
        }
        self.expect(&Token::RParen, ")")?;
        let previous_macro = self.current_macro.replace(name.clone());
        let body = self.parse_or();
        self.current_macro = previous_macro;
        let body = body?;
        self.expect(&Token::End, "END")?;
        self.expect(&Token::Function, "FUNCTION")?;
        Ok(FunctionDef { name, params, body })
    }
}

/// Parses a full equation: zero or more `FUNCTION ... END FUNCTION` macro
/// definitions followed by a single top-level expression.
pub fn parse_equation(source: &str) -> Result<EquationNode, ParseError> {
    let tokens = Lexer::new(source).tokenize()?;
    let mut parser = Parser { tokens, pos: 0, next_id: 0, current_macro: None };

    let mut defs = Vec::new();
    let mut seen = std::collections::HashSet::new();
    while matches!(parser.peek(), Token::Function) {
        let def = parser.parse_function_def()?;
        if !seen.insert(def.name.clone()) {
            return Err(ParseError::new(
                ParseErrorKind::DuplicateMacroName { name: def.name.clone() },
                parser.span(),
            ));
        }
        defs.push(def);
    }

    let expr = parser.parse_or()?;

    if !matches!(parser.peek(), Token::Eof) {
        return Err(ParseError::new(
            ParseErrorKind::TrailingInput { remainder: format!("{:?}", parser.peek()) },
            parser.span(),
        ));
    }

    Ok(EquationNode { defs, expr })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_arithmetic_with_precedence() {
        let eq = parse_equation("1 + 2 * 3 ^ 2").unwrap();
        match eq.expr.kind {
            ExprKind::Binary { op: BinaryOp::Add, .. } => {}
            other => panic!("expected top-level Add, got {other:?}"),
        }
    }

    #[test]
    fn power_is_right_associative() {
        // 2 ^ 3 ^ 2 == 2 ^ (3 ^ 2) == 512, not (2^3)^2 == 64.
        let eq = parse_equation("2 ^ 3 ^ 2").unwrap();
        if let ExprKind::Binary { op: BinaryOp::Pow, right, .. } = eq.expr.kind {
            assert!(matches!(right.kind, ExprKind::Binary { op: BinaryOp::Pow, .. }));
        } else {
            panic!("expected Pow");
        }
    }

    #[test]
    fn parses_if_chain() {
        let eq = parse_equation("IF [A] > 0 THEN 1 ELSEIF [A] < 0 THEN -1 ELSE 0 END IF").unwrap();
        assert!(matches!(eq.expr.kind, ExprKind::IfChain { .. }));
    }

    #[test]
    fn parses_function_defs() {
        let eq = parse_equation("FUNCTION double(x) x * 2 END FUNCTION double([A])").unwrap();
        assert_eq!(eq.defs.len(), 1);
        assert_eq!(eq.defs[0].name, "double");
        assert!(matches!(eq.expr.kind, ExprKind::Call { .. }));
    }

    #[test]
    fn duplicate_macro_name_errors() {
        let err = parse_equation("FUNCTION f(x) x END FUNCTION FUNCTION f(x) x END FUNCTION f(1)");
        assert!(err.is_err());
    }

    #[test]
    fn nested_function_in_macro_body_is_rejected_as_impure() {
        let err = parse_equation("FUNCTION outer(x) FUNCTION inner(y) y END FUNCTION END FUNCTION outer(1)");
        match err {
            Err(ParseError { kind: ParseErrorKind::MacroImpureBody { name }, .. }) => assert_eq!(name, "outer"),
            other => panic!("expected MacroImpureBody, got {other:?}"),
        }
    }

    #[test]
    fn parses_lookup_and_delay() {
        let eq = parse_equation("LOOKUP([A], (0,0)(1,2)(2,4))").unwrap();
        assert!(matches!(eq.expr.kind, ExprKind::Lookup1D { .. }));

        let eq = parse_equation("DELAY1([A], { 3 tick })").unwrap();
        assert!(matches!(eq.expr.kind, ExprKind::Delay { .. }));
    }

    #[test]
    fn quantity_literal_with_units() {
        let eq = parse_equation("{ 9.81 m/s^2 }").unwrap();
        if let ExprKind::QuantityLiteral { value, units } = eq.expr.kind {
            assert_eq!(value, 9.81);
            assert_eq!(units.unwrap().get("m"), Some(&1));
        } else {
            panic!("expected quantity literal");
        }
    }
}
