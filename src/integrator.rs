//! Pluggable numerical integrators.
//!
//! Each integrator only needs a way to evaluate stock derivatives at a given
//! time and stock vector — it has no knowledge of equations, units, or
//! delay state. The `commit` flag passed to the derivative closure tells
//! the caller whether this evaluation should be allowed to mutate stateful
//! primitives (delays/smooths); RK-style methods probe several
//! non-committing sub-stages before a single committing call at the step
//! they actually keep.

use std::collections::HashMap;

use crate::error::{Error, Result};

pub type StockVector = HashMap<String, f64>;

/// Evaluates d(stock)/dt for every stock at `time` given `stocks`.
pub trait Derivative {
    fn eval(&mut self, time: f64, stocks: &StockVector, commit: bool) -> Result<StockVector>;
}

impl<F> Derivative for F
where
    F: FnMut(f64, &StockVector, bool) -> Result<StockVector>,
{
    fn eval(&mut self, time: f64, stocks: &StockVector, commit: bool) -> Result<StockVector> {
        self(time, stocks, commit)
    }
}

fn combine(base: &StockVector, stages: &[(&StockVector, f64)]) -> StockVector {
    let mut out = base.clone();
    for (name, value) in out.iter_mut() {
        for (deriv, weight) in stages {
            if let Some(d) = deriv.get(name) {
                *value += d * weight;
            }
        }
    }
    out
}

pub trait Integrator: Send + Sync {
    /// Advances `stocks` from `time` to `time + dt`, returning the new
    /// stock vector.
    fn step(&self, time: f64, dt: f64, stocks: &StockVector, derivative: &mut dyn Derivative) -> Result<StockVector>;
}

/// Forward (explicit) Euler: `y(t+dt) = y(t) + dt * f(t, y(t))`.
pub struct Euler;

impl Integrator for Euler {
    fn step(&self, time: f64, dt: f64, stocks: &StockVector, derivative: &mut dyn Derivative) -> Result<StockVector> {
        let k1 = derivative.eval(time, stocks, true)?;
        Ok(combine(stocks, &[(&k1, dt)]))
    }
}

/// Classical 4th-order Runge-Kutta. The three probing stages (k1..k3) run
/// with `commit = false`; only the final derivative evaluation at the
/// accepted state is allowed to commit delay/smooth state.
pub struct Rk4;

impl Integrator for Rk4 {
    fn step(&self, time: f64, dt: f64, stocks: &StockVector, derivative: &mut dyn Derivative) -> Result<StockVector> {
        let k1 = derivative.eval(time, stocks, false)?;
        let y2 = combine(stocks, &[(&k1, dt / 2.0)]);
        let k2 = derivative.eval(time + dt / 2.0, &y2, false)?;
        let y3 = combine(stocks, &[(&k2, dt / 2.0)]);
        let k3 = derivative.eval(time + dt / 2.0, &y3, false)?;
        let y4 = combine(stocks, &[(&k3, dt)]);
        let k4 = derivative.eval(time + dt, &y4, false)?;

        let result = combine(stocks, &[(&k1, dt / 6.0), (&k2, dt / 3.0), (&k3, dt / 3.0), (&k4, dt / 6.0)]);
        // Re-evaluate once more at the accepted state so the committing
        // call sees the state the integrator actually kept.
        derivative.eval(time + dt, &result, true)?;
        Ok(result)
    }
}

/// Adaptive embedded Runge-Kutta using the Bogacki-Shampine 3(2) pair: a
/// third-order solution with a second-order embedded estimate, whose
/// difference gives a local error estimate used to grow or shrink the
/// sub-step. One call to [`Integrator::step`] may take several internal
/// sub-steps (shrinking on rejection, growing on acceptance) but always
/// covers the full requested `dt` — the returned state is always the state
/// at `time + dt`, never at some intermediate sub-step short of it.
pub struct AdaptiveRk {
    /// Relative tolerance: see `error_norm`.
    pub rtol: f64,
    /// Absolute tolerance: see `error_norm`.
    pub atol: f64,
    pub min_step: f64,
    pub max_step: f64,
    pub model_name: String,
}

/// `safety * err^(-1/p)` is clamped to `[fac_min, fac_max]` before scaling
/// the next sub-step, per spec.
const SAFETY: f64 = 0.9;
const FAC_MIN: f64 = 0.2;
const FAC_MAX: f64 = 5.0;
/// Order of the embedded pair's error estimate (Bogacki-Shampine 3(2)).
const ERROR_ORDER: f64 = 3.0;

impl AdaptiveRk {
    pub fn new(rtol: f64, atol: f64, min_step: f64, max_step: f64, model_name: impl Into<String>) -> Self {
        Self { rtol, atol, min_step, max_step, model_name: model_name.into() }
    }

    /// `max_i |high_i - low_i| / (atol + rtol * max(|y_i|, |y'_i|))`. Accept
    /// the sub-step when this is `<= 1`.
    fn error_norm(&self, y0: &StockVector, high: &StockVector, low: &StockVector) -> f64 {
        let mut worst = 0.0_f64;
        for (name, hv) in high {
            let lv = low.get(name).copied().unwrap_or(0.0);
            let y0v = y0.get(name).copied().unwrap_or(0.0);
            let scale = self.atol + self.rtol * y0v.abs().max(hv.abs());
            let e = if scale > 0.0 { (hv - lv).abs() / scale } else { (hv - lv).abs() };
            worst = worst.max(e);
        }
        worst
    }
}

impl Integrator for AdaptiveRk {
    fn step(&self, time: f64, dt: f64, stocks: &StockVector, derivative: &mut dyn Derivative) -> Result<StockVector> {
        if dt < 1e-9 {
            return Err(Error::InvalidTimeStepError { step: dt });
        }

        let mut t = time;
        let mut y = stocks.clone();
        let mut remaining = dt;
        let mut h = dt.min(self.max_step).max(self.min_step);

        while remaining > 1e-12 {
            // Clamp to what's left so the final sub-step lands exactly on
            // `dt`; only floor to `min_step` when there's enough left that
            // doing so wouldn't overshoot it.
            h = h.min(remaining);
            if remaining > self.min_step {
                h = h.max(self.min_step);
            }

            let k1 = derivative.eval(t, &y, false)?;
            let y2 = combine(&y, &[(&k1, h / 2.0)]);
            let k2 = derivative.eval(t + h / 2.0, &y2, false)?;
            let y3 = combine(&y, &[(&k2, 3.0 * h / 4.0)]);
            let k3 = derivative.eval(t + 3.0 * h / 4.0, &y3, false)?;

            // Third-order solution.
            let high = combine(&y, &[(&k1, 2.0 * h / 9.0), (&k2, h / 3.0), (&k3, 4.0 * h / 9.0)]);
            let k4 = derivative.eval(t + h, &high, false)?;
            // Second-order embedded estimate.
            let low = combine(&y, &[(&k1, 7.0 * h / 24.0), (&k2, h / 4.0), (&k3, h / 3.0), (&k4, h / 8.0)]);

            let err = self.error_norm(&y, &high, &low);

            if err <= 1.0 {
                derivative.eval(t + h, &high, true)?;
                t += h;
                remaining -= h;
                y = high;

                let multiplier = if err > 0.0 {
                    (SAFETY * err.powf(-1.0 / ERROR_ORDER)).clamp(FAC_MIN, FAC_MAX)
                } else {
                    FAC_MAX
                };
                h = (h * multiplier).clamp(self.min_step, self.max_step);
            } else if h <= self.min_step {
                return Err(Error::ConvergenceError { model: self.model_name.clone(), time_step: h, error: err });
            } else {
                h = (h / 2.0).max(self.min_step);
            }
        }

        Ok(y)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn exponential_growth(k: f64) -> impl FnMut(f64, &StockVector, bool) -> Result<StockVector> {
        move |_t, stocks, _commit| {
            let mut out = StockVector::new();
            for (name, value) in stocks {
                out.insert(name.clone(), value * k);
            }
            Ok(out)
        }
    }

    #[test]
    fn euler_matches_hand_computed_step() {
        let mut stocks = StockVector::new();
        stocks.insert("x".to_string(), 100.0);
        let mut deriv = exponential_growth(0.1);
        let result = Euler.step(0.0, 1.0, &stocks, &mut deriv).unwrap();
        assert_eq!(result["x"], 110.0);
    }

    #[test]
    fn rk4_is_more_accurate_than_euler_for_exponential_growth() {
        let mut stocks = StockVector::new();
        stocks.insert("x".to_string(), 1.0);
        let exact = 1.0_f64.exp();

        let mut deriv_euler = exponential_growth(1.0);
        let euler_result = Euler.step(0.0, 1.0, &stocks, &mut deriv_euler).unwrap()["x"];

        let mut deriv_rk4 = exponential_growth(1.0);
        let rk4_result = Rk4.step(0.0, 1.0, &stocks, &mut deriv_rk4).unwrap()["x"];

        assert!((rk4_result - exact).abs() < (euler_result - exact).abs());
    }

    #[test]
    fn adaptive_rk_respects_tolerance() {
        let mut stocks = StockVector::new();
        stocks.insert("x".to_string(), 1.0);
        let integrator = AdaptiveRk::new(1e-6, 1e-9, 1e-6, 1.0, "test");
        let mut deriv = exponential_growth(1.0);
        let result = integrator.step(0.0, 1.0, &stocks, &mut deriv).unwrap();
        let exact = 1.0_f64.exp();
        assert!((result["x"] - exact).abs() < 1e-3);
    }

    #[test]
    fn adaptive_rk_reaches_full_dt_even_after_shrinking() {
        // A derivative that is deliberately hard to resolve in one sub-step
        // forces at least one rejection/shrink; the final state must still
        // land exactly on time + dt, not on some intermediate sub-step.
        let mut stocks = StockVector::new();
        stocks.insert("x".to_string(), 1.0);
        let integrator = AdaptiveRk::new(1e-9, 1e-12, 1e-6, 0.05, "test");
        let mut deriv = exponential_growth(5.0);
        let result = integrator.step(0.0, 1.0, &stocks, &mut deriv).unwrap();
        let exact = 5.0_f64.exp();
        assert!((result["x"] - exact).abs() / exact < 1e-3);
    }

    #[test]
    fn adaptive_rk_rejects_dt_below_minimum() {
        let mut stocks = StockVector::new();
        stocks.insert("x".to_string(), 1.0);
        let integrator = AdaptiveRk::new(1e-6, 1e-9, 1e-6, 1.0, "test");
        let mut deriv = exponential_growth(1.0);
        let err = integrator.step(0.0, 1e-12, &stocks, &mut deriv).unwrap_err();
        assert!(matches!(err, Error::InvalidTimeStepError { .. }));
    }
}
