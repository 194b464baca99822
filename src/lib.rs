//! flowsim — a continuous-time system dynamics simulation engine.
//!
//! A typed equation DSL (lexer/parser/evaluator), a dependency-graph
//! compiler, pluggable numerical integrators, and a scenario/sensitivity/
//! Monte Carlo/optimisation layer built on top of a single-simulation
//! pipeline.

pub mod ast;
pub mod engine;
pub mod error;
pub mod graph;
pub mod ids;
pub mod integrator;
pub mod interpreter;
pub mod model;
pub mod monte_carlo;
pub mod parser;
pub mod rng;
pub mod scenario;
pub mod sensitivity;
pub mod token;
pub mod unit_parser;
pub mod units;

pub use engine::{CompiledModel, Frame};
pub use error::{Error, Result};
pub use ids::{FlowId, ModelId, ScenarioId, StockId, VariableId};
pub use integrator::{AdaptiveRk, Euler, Integrator, Rk4};
pub use model::{Flow, Model, Stock, TimeConfig, Variable, VariableKind};
pub use monte_carlo::{MetricSummary, MonteCarloResults, Parameter as MonteCarloParameter, PercentilePoint, SampleContext};
pub use scenario::{Scenario, ScenarioComparison, ScenarioOverride, ScenarioResult};
pub use sensitivity::{
    Direction, ImpactDirection, Objective, OptimizationResult, ParameterSpec, SensitivityResult,
};
pub use units::{Quantity, UnitMap};
