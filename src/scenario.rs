//! Scenario comparison: overrides a model's stock initial values or
//! constants, runs each variant alongside an implicit, unmodified
//! "Baseline" scenario, and reports per-metric deltas against it.

use std::collections::HashMap;

use rayon::prelude::*;

use crate::engine::{CompiledModel, Frame};
use crate::error::{Error, Result};
use crate::ids::ScenarioId;
use crate::integrator::Integrator;
use crate::model::{Model, VariableKind};

#[derive(Debug, Clone)]
pub struct ScenarioOverride {
    pub target: String,
    pub value: f64,
}

impl ScenarioOverride {
    pub fn new(target: impl Into<String>, value: f64) -> Self {
        Self { target: target.into(), value }
    }
}

#[derive(Debug, Clone)]
pub struct Scenario {
    pub id: ScenarioId,
    pub name: String,
    pub overrides: Vec<ScenarioOverride>,
    /// The model this scenario was defined against. `None` means "any
    /// model" — a scenario built ad hoc (e.g. from the CLI's shorthand)
    /// rather than loaded as a `ScenarioDefinition` tied to a stored model.
    pub base_model_id: Option<crate::ids::ModelId>,
}

impl Scenario {
    pub fn new(name: impl Into<String>, overrides: Vec<ScenarioOverride>) -> Self {
        Self { id: ScenarioId::new(), name: name.into(), overrides, base_model_id: None }
    }

    /// Ties this scenario to a specific model, so [`compare`] rejects it if
    /// run against a different one.
    pub fn for_model(mut self, model_id: crate::ids::ModelId) -> Self {
        self.base_model_id = Some(model_id);
        self
    }
}

#[derive(Debug, Clone)]
pub struct ScenarioResult {
    pub scenario_name: String,
    pub frames: Vec<Frame>,
    /// The final frame's time.
    pub final_time: f64,
    /// Stock values at the final frame, by name.
    pub final_stocks: HashMap<String, f64>,
    /// Variable values at the final frame, by name.
    pub final_variables: HashMap<String, f64>,
    /// `final_stocks - baseline.final_stocks`, by name. A name present on
    /// only one side is treated as `0` on the other.
    pub delta_stocks: HashMap<String, f64>,
    /// `final_variables - baseline.final_variables`, by name, with the same
    /// missing-is-zero rule as `delta_stocks`.
    pub delta_variables: HashMap<String, f64>,
}

#[derive(Debug, Clone)]
pub struct ScenarioComparison {
    pub baseline: ScenarioResult,
    pub scenarios: Vec<ScenarioResult>,
}

/// Only a stock's initial value or a constant's value may be overridden —
/// flows and auxiliaries are derived, and overriding them would silently
/// disconnect them from their own equation.
pub(crate) fn apply_overrides(model: &Model, overrides: &[ScenarioOverride]) -> Result<Model> {
    let mut missing = Vec::new();
    for o in overrides {
        let is_stock = model.stocks.iter().any(|s| s.name == o.target);
        let is_constant = model.variables.iter().any(|v| v.name == o.target && v.kind == VariableKind::Constant);
        if is_stock || is_constant {
            continue;
        }
        let is_unsupported = model.flows.iter().any(|f| f.name == o.target)
            || model.variables.iter().any(|v| v.name == o.target && v.kind == VariableKind::Auxiliary);
        if is_unsupported {
            return Err(Error::ScenarioUnsupportedOverrideError { name: o.target.clone() });
        }
        missing.push(o.target.clone());
    }
    if !missing.is_empty() {
        return Err(Error::ScenarioOverrideNotFoundError { targets: missing });
    }

    let mut model = model.clone();
    for o in overrides {
        if let Some(stock) = model.stocks.iter_mut().find(|s| s.name == o.target) {
            stock.initial_value = o.value;
        } else if let Some(var) = model.variables.iter_mut().find(|v| v.name == o.target) {
            var.value = Some(o.value);
        }
    }
    Ok(model)
}

/// Merges the keys of both maps and takes `scenario - baseline` for each,
/// treating a name absent from either side as `0` rather than omitting it.
fn delta_map(baseline: &HashMap<String, f64>, scenario: &HashMap<String, f64>) -> HashMap<String, f64> {
    let mut names: std::collections::HashSet<&str> = baseline.keys().map(|s| s.as_str()).collect();
    names.extend(scenario.keys().map(|s| s.as_str()));
    names
        .into_iter()
        .map(|name| {
            let base = baseline.get(name).copied().unwrap_or(0.0);
            let value = scenario.get(name).copied().unwrap_or(0.0);
            (name.to_string(), value - base)
        })
        .collect()
}

fn build_result(
    scenario_name: String,
    frames: Vec<Frame>,
    baseline_final_stocks: &HashMap<String, f64>,
    baseline_final_variables: &HashMap<String, f64>,
) -> ScenarioResult {
    let final_frame = frames.last().expect("simulate always yields at least one frame").clone();
    let delta_stocks = delta_map(baseline_final_stocks, &final_frame.stocks);
    let delta_variables = delta_map(baseline_final_variables, &final_frame.variables);
    ScenarioResult {
        scenario_name,
        final_time: final_frame.time,
        final_stocks: final_frame.stocks,
        final_variables: final_frame.variables,
        delta_stocks,
        delta_variables,
        frames,
    }
}

/// Runs `model` unmodified as "Baseline", each of `scenarios` in parallel
/// with its overrides applied, and returns every trajectory plus the final-
/// value delta of each scenario against the baseline.
pub fn compare(model: &Model, integrator: &dyn Integrator, scenarios: &[Scenario]) -> Result<ScenarioComparison> {
    for scenario in scenarios {
        if let Some(expected) = scenario.base_model_id {
            if expected != model.id {
                return Err(Error::ScenarioModelMismatchError {
                    scenario: scenario.name.clone(),
                    expected: expected.to_string(),
                    found: model.id.to_string(),
                });
            }
        }
    }

    let baseline_compiled = CompiledModel::compile(model.clone())?;
    let baseline_frames = baseline_compiled.simulate(integrator)?;
    let baseline_final = baseline_frames.last().expect("simulate always yields at least one frame").clone();
    let baseline_final_stocks = baseline_final.stocks;
    let baseline_final_variables = baseline_final.variables;
    let baseline = build_result("Baseline".to_string(), baseline_frames, &baseline_final_stocks, &baseline_final_variables);

    let results: Result<Vec<ScenarioResult>> = scenarios
        .par_iter()
        .map(|scenario| -> Result<ScenarioResult> {
            let overridden = apply_overrides(model, &scenario.overrides)?;
            let compiled = CompiledModel::compile(overridden)?;
            let frames = compiled.simulate(integrator)?;
            Ok(build_result(scenario.name.clone(), frames, &baseline_final_stocks, &baseline_final_variables))
        })
        .collect();
    let scenarios_out = results?;

    Ok(ScenarioComparison { baseline, scenarios: scenarios_out })
}
