//! Simulation driver: compiles a [`Model`] into an evaluation order and
//! runs it forward through time with a chosen [`Integrator`].

use std::collections::{HashMap, HashSet};

use rayon::prelude::*;

use crate::ast::FunctionDef;
use crate::error::{Error, EquationDiagnostic, EvalError, EvalErrorKind, Result};
use crate::graph::DependencyGraph;
use crate::ids::{FlowId, StockId, VariableId};
use crate::integrator::{Derivative, Integrator, StockVector};
use crate::interpreter::{self, DelayStateStore, EvalContext, Scope};
use crate::model::{Model, VariableKind};
use crate::parser::parse_equation;
use crate::unit_parser;
use crate::units::{self, Quantity, UnitMap};

/// A single time-stamped snapshot of every stock, flow, and variable value.
///
/// Every value is carried both by name and by id: equations and CLI output
/// address stocks/flows/variables by name, but callers holding onto a
/// `StockId`/`FlowId`/`VariableId` from the `Model` (e.g. after a scenario
/// rename) need to resolve the same value without a name round-trip.
#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    pub time: f64,
    pub stocks: HashMap<String, f64>,
    pub flows: HashMap<String, f64>,
    pub variables: HashMap<String, f64>,
    pub stocks_by_id: HashMap<StockId, f64>,
    pub flows_by_id: HashMap<FlowId, f64>,
    pub variables_by_id: HashMap<VariableId, f64>,
}

/// A model that has been validated, topologically ordered, and had every
/// flow/variable equation parsed once up front.
pub struct CompiledModel {
    model: Model,
    order: Vec<String>,
    units: HashMap<String, UnitMap>,
    equations: HashMap<String, (String, Vec<FunctionDef>, crate::ast::Expr)>,
    flow_names: HashSet<String>,
}

impl CompiledModel {
    #[tracing::instrument(level = "debug", skip(model), fields(model = %model.name))]
    pub fn compile(model: Model) -> Result<CompiledModel> {
        model.validate()?;
        let order = DependencyGraph::build(&model)?;

        let mut units = HashMap::new();
        for stock in &model.stocks {
            units.insert(stock.name.clone(), parse_units(stock.units.as_deref())?);
        }
        for flow in &model.flows {
            units.insert(flow.name.clone(), parse_units(flow.units.as_deref())?);
        }

        let mut equations = HashMap::new();
        for flow in &model.flows {
            let parsed = parse_equation(&flow.rate_equation).map_err(|err| Error::EquationParseError {
                diagnostic: EquationDiagnostic::from_parse_error(&flow.rate_equation, &err),
            })?;
            equations.insert(flow.name.clone(), (flow.rate_equation.clone(), parsed.defs, parsed.expr));
        }
        for variable in &model.variables {
            if !variable.equation.trim().is_empty() {
                let parsed = parse_equation(&variable.equation).map_err(|err| Error::EquationParseError {
                    diagnostic: EquationDiagnostic::from_parse_error(&variable.equation, &err),
                })?;
                equations.insert(variable.name.clone(), (variable.equation.clone(), parsed.defs, parsed.expr));
            }
        }

        let flow_names: HashSet<String> = model.flows.iter().map(|f| f.name.clone()).collect();

        Ok(CompiledModel { model, order, units, equations, flow_names })
    }

    pub fn model(&self) -> &Model {
        &self.model
    }

    fn initial_stocks(&self) -> StockVector {
        self.model.stocks.iter().map(|s| (s.name.clone(), s.initial_value)).collect()
    }

    /// Checks that a flow's computed rate units are dimensionally consistent
    /// with the stock it feeds: a flow rate must equal its stock's units
    /// divided by a time unit. The stock-shaped part of the
    /// rate units must match the stock exactly; whatever remains is assumed
    /// to be the time unit and is cached on the first step, then required to
    /// stay identical on every later step.
    fn check_flow_units(
        &self,
        flow_name: &str,
        rate_units: &UnitMap,
        time_unit_cache: &mut HashMap<String, UnitMap>,
    ) -> Result<()> {
        let flow = match self.model.flows.iter().find(|f| f.name == flow_name) {
            Some(flow) => flow,
            None => return Ok(()),
        };
        let stock_id = flow.target.or(flow.source);
        let stock_id = match stock_id {
            Some(id) => id,
            None => return Ok(()),
        };
        let stock = self.model.stocks.iter().find(|s| s.id == stock_id).expect("flow references a known stock");
        let stock_units = self.units.get(&stock.name).cloned().unwrap_or_default();

        for (symbol, exponent) in &stock_units {
            if rate_units.get(symbol) != Some(exponent) {
                return Err(Error::EquationEvaluationError {
                    expression: flow_name.to_string(),
                    problem: EquationDiagnostic::from_eval_error(
                        &self.equations[flow_name].0,
                        &EvalError::new(EvalErrorKind::UnitMismatch {
                            left: units::format_units(rate_units),
                            right: format!("{}/time", units::format_units(&stock_units)),
                            operation: format!("flow `{flow_name}` into stock `{}`", stock.name),
                        }),
                    ),
                });
            }
        }

        let mut residual: UnitMap = UnitMap::new();
        for (symbol, exponent) in rate_units {
            let stock_exponent = stock_units.get(symbol).copied().unwrap_or(0);
            let diff = exponent - stock_exponent;
            if diff != 0 {
                residual.insert(symbol.clone(), diff);
            }
        }

        match time_unit_cache.get(flow_name) {
            Some(cached) if cached != &residual => {
                return Err(Error::EquationEvaluationError {
                    expression: flow_name.to_string(),
                    problem: EquationDiagnostic::from_eval_error(
                        &self.equations[flow_name].0,
                        &EvalError::new(EvalErrorKind::UnitMismatch {
                            left: units::format_units(&residual),
                            right: units::format_units(cached),
                            operation: format!("flow `{flow_name}` implicit time unit changed between steps"),
                        }),
                    ),
                });
            }
            Some(_) => {}
            None => {
                time_unit_cache.insert(flow_name.to_string(), residual);
            }
        }
        Ok(())
    }

    /// Evaluates every flow and variable, in dependency order, at `time`
    /// against `stocks`. Returns `(flow_values, variable_values)`.
    fn evaluate_order(
        &self,
        time: f64,
        stocks: &StockVector,
        delay_state: &mut DelayStateStore,
        commit: bool,
        time_unit_cache: &mut HashMap<String, UnitMap>,
    ) -> Result<(HashMap<String, f64>, HashMap<String, f64>)> {
        let mut scope: Scope = Scope::new();
        scope.insert(interpreter::TIME.to_string(), Quantity::scalar(time));
        scope.insert(interpreter::TIME_STEP.to_string(), Quantity::scalar(self.model.time_config.step));
        scope.insert(interpreter::INITIAL_TIME.to_string(), Quantity::scalar(self.model.time_config.start));
        scope.insert(interpreter::FINAL_TIME.to_string(), Quantity::scalar(self.model.time_config.end));

        for stock in &self.model.stocks {
            let units = self.units.get(&stock.name).cloned().unwrap_or_default();
            let value = stocks.get(&stock.name).copied().unwrap_or(stock.initial_value);
            scope.insert(stock.name.clone(), Quantity::new(value, units));
        }
        for variable in &self.model.variables {
            if variable.kind == VariableKind::Constant {
                scope.insert(variable.name.clone(), Quantity::scalar(variable.value.unwrap_or(0.0)));
            }
        }

        let mut flows = HashMap::new();
        let mut vars = HashMap::new();

        for name in &self.order {
            let (source, defs, expr) = &self.equations[name];
            let defs_map: HashMap<String, &FunctionDef> = defs.iter().map(|d| (d.name.clone(), d)).collect();
            let mut ctx = EvalContext { scope: &scope, defs: &defs_map, delay_state, commit, equation_name: name, source };
            let result = interpreter::evaluate(expr, &mut ctx).map_err(|e| Error::EquationEvaluationError {
                expression: name.clone(),
                problem: EquationDiagnostic::from_eval_error(source, &e),
            })?;
            if self.flow_names.contains(name) {
                self.check_flow_units(name, &result.units, time_unit_cache)?;
                flows.insert(name.clone(), result.value);
            } else {
                vars.insert(name.clone(), result.value);
            }
            scope.insert(name.clone(), result);
        }

        Ok((flows, vars))
    }

    /// Re-keys a name-keyed snapshot by id, using the model's own name/id
    /// pairing for each stock, flow, and variable.
    fn frame(&self, time: f64, stocks: &StockVector, flows: HashMap<String, f64>, variables: HashMap<String, f64>) -> Frame {
        let stocks_by_id = self
            .model
            .stocks
            .iter()
            .filter_map(|s| stocks.get(&s.name).map(|&v| (s.id, v)))
            .collect();
        let flows_by_id = self.model.flows.iter().filter_map(|f| flows.get(&f.name).map(|&v| (f.id, v))).collect();
        let variables_by_id = self
            .model
            .variables
            .iter()
            .filter_map(|v| variables.get(&v.name).map(|&val| (v.id, val)))
            .collect();
        Frame {
            time,
            stocks: stocks.clone(),
            flows,
            variables,
            stocks_by_id,
            flows_by_id,
            variables_by_id,
        }
    }

    fn net_derivative(&self, flows: &HashMap<String, f64>) -> StockVector {
        let mut deriv = StockVector::new();
        for stock in &self.model.stocks {
            let mut d = 0.0;
            for flow in &self.model.flows {
                let value = flows.get(&flow.name).copied().unwrap_or(0.0);
                if flow.source == Some(stock.id) {
                    d -= value;
                }
                if flow.target == Some(stock.id) {
                    d += value;
                }
            }
            deriv.insert(stock.name.clone(), d);
        }
        deriv
    }

    fn derivative_fn<'a>(
        &'a self,
        delay_state: &'a mut DelayStateStore,
        time_unit_cache: &'a mut HashMap<String, UnitMap>,
    ) -> impl Derivative + 'a {
        move |time: f64, stocks: &StockVector, commit: bool| -> Result<StockVector> {
            let (flows, _vars) = self.evaluate_order(time, stocks, delay_state, commit, time_unit_cache)?;
            Ok(self.net_derivative(&flows))
        }
    }

    /// Runs the full time range and returns every frame, in order.
    #[tracing::instrument(level = "debug", skip(self, integrator), fields(model = %self.model.name))]
    pub fn simulate(&self, integrator: &dyn Integrator) -> Result<Vec<Frame>> {
        let mut stocks = self.initial_stocks();
        let mut delay_state = DelayStateStore::new();
        let mut time_unit_cache: HashMap<String, UnitMap> = HashMap::new();
        let dt = self.model.time_config.step;
        let end = self.model.time_config.end;
        let mut t = self.model.time_config.start;
        let mut frames = Vec::new();

        loop {
            // Read-only: the authoritative commit for this instant happens
            // inside the integrator's own derivative evaluation below. If
            // this snapshot also committed, delay/smooth state would advance
            // twice per timestep instead of once.
            let (flows, vars) = self.evaluate_order(t, &stocks, &mut delay_state, false, &mut time_unit_cache)?;
            frames.push(self.frame(t, &stocks, flows, vars));
            if t >= end - dt * 1e-9 {
                break;
            }
            {
                let mut deriv = self.derivative_fn(&mut delay_state, &mut time_unit_cache);
                stocks = integrator.step(t, dt, &stocks, &mut deriv)?;
            }
            t += dt;
        }
        Ok(frames)
    }

    /// Runs the full time range but only keeps the final frame, avoiding
    /// the O(steps) memory of [`CompiledModel::simulate`].
    #[tracing::instrument(level = "debug", skip(self, integrator), fields(model = %self.model.name))]
    pub fn simulate_final(&self, integrator: &dyn Integrator) -> Result<Frame> {
        let mut stocks = self.initial_stocks();
        let mut delay_state = DelayStateStore::new();
        let mut time_unit_cache: HashMap<String, UnitMap> = HashMap::new();
        let dt = self.model.time_config.step;
        let end = self.model.time_config.end;
        let mut t = self.model.time_config.start;
        let mut last = None;

        loop {
            // See the matching comment in `simulate`: commit happens inside
            // the integrator's derivative evaluation, not here.
            let (flows, vars) = self.evaluate_order(t, &stocks, &mut delay_state, false, &mut time_unit_cache)?;
            last = Some(self.frame(t, &stocks, flows, vars));
            if t >= end - dt * 1e-9 {
                break;
            }
            {
                let mut deriv = self.derivative_fn(&mut delay_state, &mut time_unit_cache);
                stocks = integrator.step(t, dt, &stocks, &mut deriv)?;
            }
            t += dt;
        }
        Ok(last.expect("time range always yields at least one frame"))
    }

    /// Runs several targets' simulations independently, in parallel, each
    /// with its own failure domain: one target's error does not stop the
    /// others, and results come back in the same order as `targets`.
    #[tracing::instrument(level = "debug", skip(targets), fields(count = targets.len()))]
    pub fn simulate_parallel(
        targets: &[(&CompiledModel, &dyn Integrator)],
        parallelism: Option<usize>,
    ) -> Vec<Result<Frame>> {
        let run_all = || targets.par_iter().map(|(model, integrator)| model.simulate_final(*integrator)).collect();
        match parallelism {
            Some(threads) => rayon::ThreadPoolBuilder::new()
                .num_threads(threads)
                .build()
                .expect("thread pool with a bounded size can always be built")
                .install(run_all),
            None => run_all(),
        }
    }
}

fn parse_units(source: Option<&str>) -> Result<UnitMap> {
    match source {
        Some(text) if !text.trim().is_empty() => unit_parser::parse_unit_expr(text).map_err(Error::from),
        _ => Ok(UnitMap::new()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::integrator::Euler;
    use crate::model::{Flow, Stock};

    #[test]
    fn pure_growth_matches_euler_formula() {
        let mut model = Model::new("growth");
        model.time_config.step = 1.0;
        model.time_config.end = 2.0;
        let stock = Stock::new("Population", 100.0);
        let id = stock.id;
        model.add_stock(stock);
        model.add_flow(Flow::new("growth", "[Population] * 0.1").with_target(id));

        let compiled = CompiledModel::compile(model).unwrap();
        let frames = compiled.simulate(&Euler).unwrap();
        assert_eq!(frames[0].stocks["Population"], 100.0);
        assert_eq!(frames[1].stocks["Population"], 110.0);
        assert_eq!(frames[2].stocks["Population"], 121.0);
    }

    #[test]
    fn mass_conservation_between_two_stocks() {
        let mut model = Model::new("transfer");
        model.time_config.step = 1.0;
        model.time_config.end = 5.0;
        let a = Stock::new("A", 100.0);
        let b = Stock::new("B", 0.0);
        let a_id = a.id;
        let b_id = b.id;
        model.add_stock(a);
        model.add_stock(b);
        model.add_flow(Flow::new("transfer", "[A] * 0.1").with_source(a_id).with_target(b_id));

        let compiled = CompiledModel::compile(model).unwrap();
        let frames = compiled.simulate(&Euler).unwrap();
        for frame in &frames {
            let total = frame.stocks["A"] + frame.stocks["B"];
            assert!((total - 100.0).abs() < 1e-9);
        }
    }

    #[test]
    fn flow_rate_unit_mismatched_with_stock_is_rejected() {
        let mut model = Model::new("dimensional");
        model.time_config.step = 1.0;
        model.time_config.end = 2.0;
        let stock = Stock::new("Population", 100.0).with_units("people");
        let id = stock.id;
        model.add_stock(stock);
        model.add_flow(Flow::new("growth", "{5 kg per year}").with_target(id));

        let compiled = CompiledModel::compile(model).unwrap();
        assert!(compiled.simulate(&Euler).is_err());
    }

    #[test]
    fn matching_flow_rate_units_are_accepted() {
        let mut model = Model::new("dimensional");
        model.time_config.step = 1.0;
        model.time_config.end = 2.0;
        let stock = Stock::new("Population", 100.0).with_units("people");
        let id = stock.id;
        model.add_stock(stock);
        model.add_flow(Flow::new("growth", "{10 people per year}").with_target(id));

        let compiled = CompiledModel::compile(model).unwrap();
        assert!(compiled.simulate(&Euler).is_ok());
    }

    #[test]
    fn two_flows_each_using_delay1_as_their_first_node_do_not_share_state() {
        // Both equations below parse to a DELAY1 call as AST node 0 (each
        // equation's NodeId counter starts at zero independently), so this
        // would corrupt one flow's delay state with the other's if
        // DelayStateStore were keyed by NodeId alone instead of
        // (equation_name, NodeId).
        let mut model = Model::new("delay_isolation");
        model.time_config.step = 1.0;
        model.time_config.end = 5.0;
        let a = Stock::new("A", 0.0);
        let b = Stock::new("B", 0.0);
        let a_id = a.id;
        let b_id = b.id;
        model.add_stock(a);
        model.add_stock(b);
        model.add_flow(Flow::new("fill_a", "DELAY1(10, 2)").with_target(a_id));
        model.add_flow(Flow::new("fill_b", "DELAY1(100, 2)").with_target(b_id));

        let compiled = CompiledModel::compile(model).unwrap();
        let frames = compiled.simulate(&Euler).unwrap();
        let last = frames.last().unwrap();
        // Each delay should converge toward its own steady-state input
        // scaled by the time step, not toward the other flow's input.
        assert!(last.stocks["A"] < last.stocks["B"] / 2.0);
    }

    #[test]
    fn delay1_advances_once_per_step_not_twice() {
        // A flow's rate is evaluated once for the frame snapshot and again
        // inside the integrator's derivative call; only the second
        // (integrator-driven) evaluation may commit delay/smooth state. If
        // the frame snapshot also committed, DELAY1's stage would advance
        // twice per actual `dt`, reaching its input twice as fast as the
        // stage-update formula in the DSL primitive's spec prescribes.
        let mut model = Model::new("delay_timing");
        model.time_config.step = 1.0;
        model.time_config.end = 2.0;
        let a = Stock::new("A", 0.0);
        let a_id = a.id;
        model.add_stock(a);
        model.add_flow(Flow::new("fill_a", "DELAY1(10, 2, 0)").with_target(a_id));

        let compiled = CompiledModel::compile(model).unwrap();
        let frames = compiled.simulate(&Euler).unwrap();
        // Step 0->1: stage starts at the explicit initial (0), so the first
        // step's rate is 0 and stock A does not move yet.
        assert_relative_eq(frames[1].stocks["A"], 0.0);
        // Step 1->2: stage advanced once (0 -> 0 + 1*(10-0)/2 = 5) during
        // step 0->1, so this step's rate is 5, and A(2) = 0 + 1*5 = 5 — not
        // 12.5, which is what a double commit per step would produce.
        assert_relative_eq(frames[2].stocks["A"], 5.0);
    }

    fn assert_relative_eq(actual: f64, expected: f64) {
        assert!((actual - expected).abs() < 1e-9, "expected {expected}, got {actual}");
    }

    #[test]
    fn unit_mismatch_surfaces_as_evaluation_error() {
        let mut model = Model::new("bad_units");
        let a = Stock::new("Mass", 1.0).with_units("kg");
        let b = Stock::new("People", 1.0).with_units("people");
        let a_id = a.id;
        model.add_stock(a);
        model.add_stock(b);
        model.add_flow(Flow::new("bogus", "[Mass] + [People]").with_target(a_id));

        let compiled = CompiledModel::compile(model).unwrap();
        assert!(compiled.simulate(&Euler).is_err());
    }
}
