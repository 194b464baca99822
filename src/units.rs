//! Quantity arithmetic: values carrying a unit-exponent map.

use std::collections::BTreeMap;
use std::fmt;

use crate::error::{EvalError, EvalErrorKind};

/// Exponents within this distance of an integer are treated as that integer.
pub const EPSILON: f64 = 1e-12;

/// A unit-exponent map, e.g. `{ "m": 1, "s": -2 }` for an acceleration.
///
/// Only nonzero exponents are stored; `normalize` prunes near-zero entries
/// produced by combining maps.
pub type UnitMap = BTreeMap<String, i32>;

pub fn unitless() -> UnitMap {
    UnitMap::new()
}

pub fn is_unitless(units: &UnitMap) -> bool {
    units.values().all(|&e| e == 0)
}

fn normalize(mut units: UnitMap) -> UnitMap {
    units.retain(|_, exp| *exp != 0);
    units
}

fn merge(a: &UnitMap, b: &UnitMap, sign: i32) -> UnitMap {
    let mut out = a.clone();
    for (k, v) in b {
        *out.entry(k.clone()).or_insert(0) += sign * v;
    }
    normalize(out)
}

/// Compares two unit maps for dimensional equality (same keys, equal exponents).
pub fn units_equal(a: &UnitMap, b: &UnitMap) -> bool {
    let a = normalize(a.clone());
    let b = normalize(b.clone());
    a == b
}

pub fn format_units(units: &UnitMap) -> String {
    if units.is_empty() {
        return "1".to_string();
    }
    units
        .iter()
        .map(|(name, exp)| {
            if *exp == 1 {
                name.clone()
            } else {
                format!("{}^{}", name, exp)
            }
        })
        .collect::<Vec<_>>()
        .join("*")
}

/// A dimensioned value: an `f64` paired with a unit-exponent map.
#[derive(Debug, Clone, PartialEq)]
pub struct Quantity {
    pub value: f64,
    pub units: UnitMap,
}

impl Quantity {
    pub fn new(value: f64, units: UnitMap) -> Self {
        Self {
            value,
            units: normalize(units),
        }
    }

    pub fn scalar(value: f64) -> Self {
        Self {
            value,
            units: unitless(),
        }
    }

    pub fn is_unitless(&self) -> bool {
        is_unitless(&self.units)
    }

    /// Truthiness per the DSL's boolean convention: nonzero is true.
    pub fn is_truthy(&self) -> bool {
        self.value != 0.0
    }

    pub fn add(&self, other: &Quantity) -> Result<Quantity, EvalError> {
        if !units_equal(&self.units, &other.units) {
            return Err(EvalError::new(EvalErrorKind::UnitMismatch {
                left: format_units(&self.units),
                right: format_units(&other.units),
                operation: "add".into(),
            }));
        }
        Ok(Quantity::new(self.value + other.value, self.units.clone()))
    }

    pub fn sub(&self, other: &Quantity) -> Result<Quantity, EvalError> {
        if !units_equal(&self.units, &other.units) {
            return Err(EvalError::new(EvalErrorKind::UnitMismatch {
                left: format_units(&self.units),
                right: format_units(&other.units),
                operation: "sub".into(),
            }));
        }
        Ok(Quantity::new(self.value - other.value, self.units.clone()))
    }

    pub fn mul(&self, other: &Quantity) -> Quantity {
        Quantity::new(self.value * other.value, merge(&self.units, &other.units, 1))
    }

    pub fn div(&self, other: &Quantity) -> Quantity {
        Quantity::new(self.value / other.value, merge(&self.units, &other.units, -1))
    }

    pub fn neg(&self) -> Quantity {
        Quantity::new(-self.value, self.units.clone())
    }

    pub fn pow(&self, exponent: &Quantity) -> Result<Quantity, EvalError> {
        if !exponent.value.is_finite() {
            return Err(EvalError::new(EvalErrorKind::NonIntegerExponent {
                exponent: exponent.value,
            }));
        }
        let rounded = exponent.value.round();
        let is_integer = (exponent.value - rounded).abs() <= EPSILON;
        if !self.is_unitless() && !is_integer {
            return Err(EvalError::new(EvalErrorKind::NonIntegerExponent {
                exponent: exponent.value,
            }));
        }
        let value = self.value.powf(exponent.value);
        let units = if self.is_unitless() {
            unitless()
        } else {
            let n = rounded as i32;
            normalize(self.units.iter().map(|(k, e)| (k.clone(), e * n)).collect())
        };
        Ok(Quantity::new(value, units))
    }
}

impl fmt::Display for Quantity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_unitless() {
            write!(f, "{}", self.value)
        } else {
            write!(f, "{} {}", self.value, format_units(&self.units))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn m() -> UnitMap {
        BTreeMap::from([("m".to_string(), 1)])
    }

    fn s() -> UnitMap {
        BTreeMap::from([("s".to_string(), 1)])
    }

    #[test]
    fn add_requires_equal_units() {
        let a = Quantity::new(1.0, m());
        let b = Quantity::new(2.0, s());
        assert!(a.add(&b).is_err());
        let c = Quantity::new(2.0, m());
        assert_eq!(a.add(&c).unwrap().value, 3.0);
    }

    #[test]
    fn mul_combines_and_div_cancels() {
        let speed = Quantity::new(2.0, m()).div(&Quantity::new(1.0, s()));
        assert_eq!(speed.units.get("m"), Some(&1));
        assert_eq!(speed.units.get("s"), Some(&-1));

        let back = speed.mul(&Quantity::new(1.0, s()));
        assert!(units_equal(&back.units, &m()));
    }

    #[test]
    fn pow_requires_integer_exponent_when_dimensioned() {
        let q = Quantity::new(4.0, m());
        assert!(q.pow(&Quantity::scalar(2.0)).is_ok());
        assert!(q.pow(&Quantity::scalar(1.5)).is_err());
        // Unitless quantities may use any exponent.
        assert!(Quantity::scalar(4.0).pow(&Quantity::scalar(0.5)).is_ok());
    }

    #[test]
    fn normalization_prunes_zero_exponents() {
        let speed = Quantity::new(2.0, m()).div(&Quantity::new(1.0, m()));
        assert!(speed.is_unitless());
    }
}
