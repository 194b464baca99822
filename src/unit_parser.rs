//! Parses composite unit strings (`"kg per s^2"`, `"people"`) into unit
//! exponent maps.
//!
//! Grammar:
//! ```text
//! unit_expr := term (("per" | "/") term)*
//! term      := factor (("*" | "·" | " ")? factor)*
//! factor    := IDENT ("^" INT)? | INT
//! ```
//! An empty string yields an empty (unitless) map. Bare integer literals are
//! constant multipliers and contribute no exponent.

use crate::error::{ParseError, ParseErrorKind, Span};
use crate::units::UnitMap;

#[derive(Debug, Clone, PartialEq)]
enum Tok {
    Ident(String),
    Int(i32),
    Caret,
    Slash,
    Star,
    Dot,
    Per,
}

struct Lexer<'a> {
    chars: std::iter::Peekable<std::str::CharIndices<'a>>,
    source: &'a str,
}

impl<'a> Lexer<'a> {
    fn new(source: &'a str) -> Self {
        Self {
            chars: source.char_indices().peekable(),
            source,
        }
    }

    fn tokens(mut self) -> Result<Vec<(Tok, usize)>, ParseError> {
        let mut out = Vec::new();
        while let Some(&(pos, ch)) = self.chars.peek() {
            if ch.is_whitespace() {
                self.chars.next();
                continue;
            }
            match ch {
                '^' => {
                    self.chars.next();
                    out.push((Tok::Caret, pos));
                }
                '/' => {
                    self.chars.next();
                    out.push((Tok::Slash, pos));
                }
                '*' => {
                    self.chars.next();
                    out.push((Tok::Star, pos));
                }
                '\u{b7}' => {
                    self.chars.next();
                    out.push((Tok::Dot, pos));
                }
                '-' | '0'..='9' => {
                    let start = pos;
                    let mut text = String::new();
                    if ch == '-' {
                        text.push(ch);
                        self.chars.next();
                    }
                    while let Some(&(_, c)) = self.chars.peek() {
                        if c.is_ascii_digit() {
                            text.push(c);
                            self.chars.next();
                        } else {
                            break;
                        }
                    }
                    let value: i32 = text.parse().map_err(|_| {
                        ParseError::new(
                            ParseErrorKind::InvalidUnitExponent { text: text.clone() },
                            span_at(self.source, start),
                        )
                    })?;
                    out.push((Tok::Int(value), start));
                }
                c if c.is_alphabetic() || c == '_' => {
                    let start = pos;
                    let mut text = String::new();
                    while let Some(&(_, c)) = self.chars.peek() {
                        if c.is_alphanumeric() || c == '_' {
                            text.push(c);
                            self.chars.next();
                        } else {
                            break;
                        }
                    }
                    if text == "per" {
                        out.push((Tok::Per, start));
                    } else {
                        out.push((Tok::Ident(text), start));
                    }
                }
                _ => {
                    return Err(ParseError::new(
                        ParseErrorKind::InvalidUnitToken { token: ch.to_string() },
                        span_at(self.source, pos),
                    ));
                }
            }
        }
        Ok(out)
    }
}

fn span_at(source: &str, byte_pos: usize) -> Span {
    let mut line = 1;
    let mut col = 1;
    for (i, c) in source.char_indices() {
        if i >= byte_pos {
            break;
        }
        if c == '\n' {
            line += 1;
            col = 1;
        } else {
            col += 1;
        }
    }
    Span::new(byte_pos, byte_pos, line, col)
}

struct Parser<'a> {
    tokens: Vec<(Tok, usize)>,
    pos: usize,
    source: &'a str,
}

impl<'a> Parser<'a> {
    fn peek(&self) -> Option<&Tok> {
        self.tokens.get(self.pos).map(|(t, _)| t)
    }

    fn advance(&mut self) -> Option<(Tok, usize)> {
        let tok = self.tokens.get(self.pos).cloned();
        self.pos += 1;
        tok
    }

    fn parse_unit_expr(&mut self) -> Result<UnitMap, ParseError> {
        let mut units = self.parse_term()?;
        loop {
            match self.peek() {
                Some(Tok::Per) | Some(Tok::Slash) => {
                    self.advance();
                    let rhs = self.parse_term()?;
                    for (k, v) in rhs {
                        *units.entry(k).or_insert(0) -= v;
                    }
                }
                _ => break,
            }
        }
        units.retain(|_, v| *v != 0);
        Ok(units)
    }

    fn parse_term(&mut self) -> Result<UnitMap, ParseError> {
        let mut units = self.parse_factor()?;
        loop {
            match self.peek() {
                Some(Tok::Star) | Some(Tok::Dot) => {
                    self.advance();
                    let rhs = self.parse_factor()?;
                    for (k, v) in rhs {
                        *units.entry(k).or_insert(0) += v;
                    }
                }
                Some(Tok::Ident(_)) | Some(Tok::Int(_)) => {
                    let rhs = self.parse_factor()?;
                    for (k, v) in rhs {
                        *units.entry(k).or_insert(0) += v;
                    }
                }
                _ => break,
            }
        }
        Ok(units)
    }

    fn parse_factor(&mut self) -> Result<UnitMap, ParseError> {
        match self.advance() {
            Some((Tok::Ident(name), _)) => {
                let mut exponent = 1;
                if let Some(Tok::Caret) = self.peek() {
                    self.advance();
                    match self.advance() {
                        Some((Tok::Int(n), _)) => exponent = n,
                        Some((_, pos)) | None => {
                            return Err(ParseError::new(
                                ParseErrorKind::InvalidUnitExponent {
                                    text: "missing integer after ^".to_string(),
                                },
                                span_at(self.source, self.tokens.get(self.pos.saturating_sub(1)).map(|(_, p)| *p).unwrap_or(0)),
                            ));
                        }
                    }
                }
                let mut map = UnitMap::new();
                map.insert(name, exponent);
                Ok(map)
            }
            Some((Tok::Int(_), _)) => Ok(UnitMap::new()),
            Some((_, pos)) => Err(ParseError::new(
                ParseErrorKind::UnexpectedToken {
                    found: "token".to_string(),
                    expected: "identifier or integer literal".to_string(),
                },
                span_at(self.source, pos),
            )),
            None => Err(ParseError::new(
                ParseErrorKind::UnexpectedToken {
                    found: "end of input".to_string(),
                    expected: "identifier or integer literal".to_string(),
                },
                span_at(self.source, self.source.len()),
            )),
        }
    }
}

/// Parses a unit expression string into a unit exponent map.
pub fn parse_unit_expr(source: &str) -> Result<UnitMap, ParseError> {
    let trimmed = source.trim();
    if trimmed.is_empty() {
        return Ok(UnitMap::new());
    }
    let tokens = Lexer::new(trimmed).tokens()?;
    let mut parser = Parser {
        tokens,
        pos: 0,
        source: trimmed,
    };
    let units = parser.parse_unit_expr()?;
    if parser.pos < parser.tokens.len() {
        let pos = parser.tokens[parser.pos].1;
        return Err(ParseError::new(
            ParseErrorKind::TrailingInput {
                remainder: trimmed[pos..].to_string(),
            },
            span_at(trimmed, pos),
        ));
    }
    Ok(units)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_string_is_unitless() {
        assert!(parse_unit_expr("").unwrap().is_empty());
        assert!(parse_unit_expr("   ").unwrap().is_empty());
    }

    #[test]
    fn bare_identifier() {
        let units = parse_unit_expr("people").unwrap();
        assert_eq!(units.get("people"), Some(&1));
    }

    #[test]
    fn exponent_and_division() {
        let units = parse_unit_expr("m^2/s").unwrap();
        assert_eq!(units.get("m"), Some(&2));
        assert_eq!(units.get("s"), Some(&-1));
    }

    #[test]
    fn per_keyword_divides() {
        let units = parse_unit_expr("kg per s^2").unwrap();
        assert_eq!(units.get("kg"), Some(&1));
        assert_eq!(units.get("s"), Some(&-2));
    }

    #[test]
    fn implicit_multiplication_by_space() {
        let units = parse_unit_expr("kg m").unwrap();
        assert_eq!(units.get("kg"), Some(&1));
        assert_eq!(units.get("m"), Some(&1));
    }

    #[test]
    fn dot_multiplication() {
        let units = parse_unit_expr("kg\u{b7}m/s^2").unwrap();
        assert_eq!(units.get("kg"), Some(&1));
        assert_eq!(units.get("m"), Some(&1));
        assert_eq!(units.get("s"), Some(&-2));
    }

    #[test]
    fn integer_literal_is_ignored_in_exponent_map() {
        let units = parse_unit_expr("1/time").unwrap();
        assert_eq!(units.get("time"), Some(&-1));
        assert_eq!(units.len(), 1);
    }
}
