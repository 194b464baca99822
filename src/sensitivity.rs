//! Sensitivity analysis and parameter optimization.
//!
//! Sensitivity perturbs one target at a time by a percentage and reports
//! the resulting change in a chosen metric. The optimizers search a
//! parameter box (grid or random sampling) for the point that best scores
//! an arbitrary objective function of the final frame.

use std::collections::HashMap;
use std::str::FromStr;

use rayon::prelude::*;

use crate::engine::{CompiledModel, Frame};
use crate::error::{Error, Result};
use crate::ids::{StockId, VariableId};
use crate::integrator::Integrator;
use crate::model::{Model, VariableKind};
use crate::rng::Mulberry32;
use crate::scenario::{apply_overrides, ScenarioOverride};

/// Reads a metric off a frame: stocks by name then by id, then variables the
/// same way, then flows by name (a crate-local extension past the
/// stocks/variables the metric lookup contract names).
fn extract_metric(frame: &Frame, name: &str) -> Result<f64> {
    if let Some(&v) = frame.stocks.get(name) {
        return Ok(v);
    }
    if let Some(&v) = StockId::from_str(name).ok().and_then(|id| frame.stocks_by_id.get(&id)) {
        return Ok(v);
    }
    if let Some(&v) = frame.variables.get(name) {
        return Ok(v);
    }
    if let Some(&v) = VariableId::from_str(name).ok().and_then(|id| frame.variables_by_id.get(&id)) {
        return Ok(v);
    }
    if let Some(&v) = frame.flows.get(name) {
        return Ok(v);
    }
    Err(Error::ScenarioMetricNotFoundError { name: name.to_string() })
}

fn current_value(model: &Model, target: &str) -> Result<f64> {
    if let Some(stock) = model.stock_by_name(target) {
        return Ok(stock.initial_value);
    }
    if let Some(var) = model.variable_by_name(target) {
        if var.kind == VariableKind::Constant {
            return Ok(var.value.unwrap_or(0.0));
        }
    }
    Err(Error::ScenarioOverrideNotFoundError { targets: vec![target.to_string()] })
}

/// The sign of a parameter's marginal effect on the target metric.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImpactDirection {
    Positive,
    Negative,
    Neutral,
}

#[derive(Debug, Clone)]
pub struct SensitivityResult {
    pub target: String,
    pub baseline_metric: f64,
    pub perturbed_metric: f64,
    /// `100 * (perturbed - baseline) / baseline` (or the raw difference when
    /// `baseline_metric` is zero).
    pub impact: f64,
    pub direction: ImpactDirection,
    /// Always `1.0` — a single one-at-a-time perturbation is a point
    /// estimate, not a statistically sampled one.
    pub confidence: f64,
}

/// Perturbs each of `targets` by `percent` (e.g. `0.1` for +10%), reports the
/// resulting change in `metric_name` read off the final frame, and returns
/// results sorted by `|impact|` descending (largest marginal effect first).
pub fn analyze(
    model: &Model,
    integrator: &dyn Integrator,
    targets: &[String],
    percent: f64,
    metric_name: &str,
) -> Result<Vec<SensitivityResult>> {
    let baseline_compiled = CompiledModel::compile(model.clone())?;
    let baseline_final = baseline_compiled.simulate_final(integrator)?;
    let baseline_metric = extract_metric(&baseline_final, metric_name)?;

    let mut results: Vec<SensitivityResult> = targets
        .par_iter()
        .map(|target| -> Result<SensitivityResult> {
            let current = current_value(model, target)?;
            let perturbed_value = current * (1.0 + percent);
            let overridden = apply_overrides(model, &[ScenarioOverride::new(target.clone(), perturbed_value)])?;
            let compiled = CompiledModel::compile(overridden)?;
            let final_frame = compiled.simulate_final(integrator)?;
            let perturbed_metric = extract_metric(&final_frame, metric_name)?;
            let impact = if baseline_metric != 0.0 {
                100.0 * (perturbed_metric - baseline_metric) / baseline_metric
            } else {
                perturbed_metric - baseline_metric
            };
            let direction = if impact > 0.0 {
                ImpactDirection::Positive
            } else if impact < 0.0 {
                ImpactDirection::Negative
            } else {
                ImpactDirection::Neutral
            };
            Ok(SensitivityResult {
                target: target.clone(),
                baseline_metric,
                perturbed_metric,
                impact,
                direction,
                confidence: 1.0,
            })
        })
        .collect::<Result<Vec<_>>>()?;

    results.sort_by(|a, b| b.impact.abs().partial_cmp(&a.impact.abs()).expect("impact is always finite"));
    Ok(results)
}

#[derive(Debug, Clone)]
pub struct ParameterSpec {
    pub name: String,
    pub min: f64,
    pub max: f64,
}

impl ParameterSpec {
    pub fn new(name: impl Into<String>, min: f64, max: f64) -> Self {
        Self { name: name.into(), min, max }
    }
}

/// Which way the optimizer should push the target metric.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Maximize,
    Minimize,
}

/// A metric to optimize, read from the first snapshot at or after `at_time`
/// (or the last snapshot, if none reaches it).
#[derive(Debug, Clone)]
pub struct Objective {
    pub target: String,
    pub direction: Direction,
    pub at_time: f64,
}

impl Objective {
    pub fn new(target: impl Into<String>, direction: Direction, at_time: f64) -> Self {
        Self { target: target.into(), direction, at_time }
    }

    /// Finds the first frame with `time >= at_time` (the last frame if none
    /// qualifies) and reads `target` off it — stocks by name then by id,
    /// then variables the same way.
    fn evaluate(&self, frames: &[Frame]) -> Result<f64> {
        let frame = frames
            .iter()
            .find(|f| f.time >= self.at_time)
            .or_else(|| frames.last())
            .ok_or_else(|| Error::ScenarioMetricNotFoundError { name: self.target.clone() })?;
        extract_metric(frame, &self.target)
    }
}

#[derive(Debug, Clone)]
pub struct OptimizationResult {
    pub objective: String,
    pub best_values: HashMap<String, f64>,
    pub best_score: f64,
    pub evaluations: usize,
    pub strategy: String,
}

fn linspace(min: f64, max: f64, steps: usize) -> Vec<f64> {
    if steps <= 1 {
        return vec![min];
    }
    (0..steps).map(|i| min + (max - min) * (i as f64) / ((steps - 1) as f64)).collect()
}

fn cartesian_grid(params: &[ParameterSpec], steps_per_dim: usize) -> Vec<HashMap<String, f64>> {
    let mut combos = vec![HashMap::new()];
    for param in params {
        let axis = linspace(param.min, param.max, steps_per_dim);
        let mut next = Vec::with_capacity(combos.len() * axis.len());
        for combo in &combos {
            for &v in &axis {
                let mut c = combo.clone();
                c.insert(param.name.clone(), v);
                next.push(c);
            }
        }
        combos = next;
    }
    combos
}

fn best_of(
    model: &Model,
    integrator: &dyn Integrator,
    candidates: &[HashMap<String, f64>],
    objective: &Objective,
    strategy: &str,
    include_baseline: bool,
) -> Result<OptimizationResult> {
    // Random search always counts the unmodified baseline alongside its
    // samples, per spec; the grid search's evaluation count is exactly the
    // Cartesian product size, so it does not get an extra baseline point.
    let mut all_candidates = Vec::with_capacity(candidates.len() + 1);
    if include_baseline {
        all_candidates.push(HashMap::new());
    }
    all_candidates.extend(candidates.iter().cloned());

    let scored: Result<Vec<(HashMap<String, f64>, f64)>> = all_candidates
        .par_iter()
        .map(|combo| -> Result<(HashMap<String, f64>, f64)> {
            let overrides: Vec<ScenarioOverride> = combo.iter().map(|(k, &v)| ScenarioOverride::new(k.clone(), v)).collect();
            let overridden = apply_overrides(model, &overrides)?;
            let compiled = CompiledModel::compile(overridden)?;
            let frames = compiled.simulate(integrator)?;
            Ok((combo.clone(), objective.evaluate(&frames)?))
        })
        .collect();
    let scored = scored?;
    let minimize = objective.direction == Direction::Minimize;

    let best = scored
        .into_iter()
        .reduce(|a, b| {
            let a_better = if minimize { a.1 <= b.1 } else { a.1 >= b.1 };
            if a_better {
                a
            } else {
                b
            }
        })
        .ok_or_else(|| Error::MonteCarloConfigurationError { message: "optimizer received no candidates".to_string() })?;

    Ok(OptimizationResult {
        objective: objective.target.clone(),
        best_values: best.0,
        best_score: best.1,
        evaluations: all_candidates.len(),
        strategy: strategy.to_string(),
    })
}

/// Evaluates `objective` over every point of an evenly spaced grid across
/// `params` (`max(2, steps_per_dim)` points per dimension) and keeps the
/// best. `evaluations` in the result is exactly the Cartesian product size.
pub fn grid_optimize(
    model: &Model,
    integrator: &dyn Integrator,
    params: &[ParameterSpec],
    steps_per_dim: usize,
    objective: &Objective,
) -> Result<OptimizationResult> {
    let steps = steps_per_dim.max(2);
    let candidates = cartesian_grid(params, steps);
    best_of(model, integrator, &candidates, objective, "grid", false)
}

/// Evaluates `objective` over `n_samples` points drawn uniformly from the
/// parameter box using the crate's deterministic PRNG, plus the unmodified
/// baseline, and keeps the best. The same seed always explores the same
/// candidates.
pub fn random_optimize(
    model: &Model,
    integrator: &dyn Integrator,
    params: &[ParameterSpec],
    n_samples: usize,
    seed: u32,
    objective: &Objective,
) -> Result<OptimizationResult> {
    let mut rng = Mulberry32::new(seed);
    let candidates: Vec<HashMap<String, f64>> = (0..n_samples)
        .map(|_| {
            params.iter().map(|p| (p.name.clone(), p.min + (p.max - p.min) * rng.next_f64())).collect()
        })
        .collect();
    best_of(model, integrator, &candidates, objective, "random", true)
}
