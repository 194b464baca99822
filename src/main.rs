//! flowsim — CLI front-end over the simulation engine library.
//!
//! A thin caller for manual exploration and smoke-testing: it is not a
//! supported embedding surface, and carries no server or persistence code.

use std::fs;
use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};

use flowsim::{
    AdaptiveRk, CompiledModel, Direction, Euler, Frame, Integrator, Model, MonteCarloParameter,
    Objective, ParameterSpec, Rk4, Scenario, ScenarioOverride, SampleContext as MonteCarloSampleContext,
};

#[derive(Parser)]
#[command(name = "flowsim")]
#[command(about = "Continuous-time system dynamics simulation engine", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Copy, Clone, ValueEnum)]
enum Solver {
    Euler,
    Rk4,
    Adaptive,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a simulation and print a snapshot table.
    Run {
        model: PathBuf,
        #[arg(long, value_enum, default_value = "euler")]
        solver: Solver,
        /// Only print the final snapshot instead of every step.
        #[arg(long)]
        final_only: bool,
    },
    /// Check that a model file builds a valid, compilable model.
    Validate { model: PathBuf },
    /// Compare named scenario overrides against an implicit baseline.
    Compare {
        model: PathBuf,
        /// "name:param=value,param=value;name2:param=value"
        scenarios: String,
        #[arg(long, value_enum, default_value = "euler")]
        solver: Solver,
    },
    /// Perturb one or more parameters by a percentage and report the effect on a metric.
    Sensitivity {
        model: PathBuf,
        #[arg(long)]
        target: String,
        #[arg(long, value_delimiter = ',')]
        params: Vec<String>,
        #[arg(long, default_value_t = 10.0)]
        variation: f64,
        #[arg(long, value_enum, default_value = "euler")]
        solver: Solver,
    },
    /// Sample parameters uniformly around their baseline and summarize a metric.
    MonteCarlo {
        model: PathBuf,
        /// "name:lo:hi,name2:lo:hi" — draws `baseline * (lo + r * (hi - lo))`.
        #[arg(long)]
        params: String,
        #[arg(long, value_delimiter = ',')]
        metrics: Vec<String>,
        #[arg(long, default_value_t = 100)]
        iterations: usize,
        #[arg(long, default_value_t = 20251031)]
        seed: u32,
        #[arg(long, value_delimiter = ',', default_values_t = vec![0.5, 0.9, 0.95])]
        percentiles: Vec<f64>,
        #[arg(long, value_enum, default_value = "euler")]
        solver: Solver,
    },
    /// Search parameter combinations for the value of `target` that best satisfies an objective.
    Optimize {
        model: PathBuf,
        #[arg(long)]
        target: String,
        #[arg(long, value_enum, default_value = "maximize")]
        direction: OptimizeDirection,
        /// Evaluate the objective at the frame whose time is >= this (default: end of horizon).
        #[arg(long)]
        at_time: Option<f64>,
        /// "name:min:max,name2:min:max"
        #[arg(long)]
        params: String,
        #[arg(long, value_enum, default_value = "grid")]
        strategy: OptimizeStrategy,
        /// Grid: points per dimension. Random: ignored.
        #[arg(long, default_value_t = 5)]
        steps: usize,
        /// Random: number of samples drawn. Grid: ignored.
        #[arg(long, default_value_t = 100)]
        samples: usize,
        #[arg(long, default_value_t = 20251031)]
        seed: u32,
        #[arg(long, value_enum, default_value = "euler")]
        solver: Solver,
    },
}

#[derive(Copy, Clone, ValueEnum)]
enum OptimizeDirection {
    Maximize,
    Minimize,
}

#[derive(Copy, Clone, ValueEnum)]
enum OptimizeStrategy {
    Grid,
    Random,
}

/// Parses "name:lo:hi,name2:lo:hi" into `(name, lo, hi)` triples.
fn parse_ranges(text: &str) -> Result<Vec<(String, f64, f64)>> {
    text.split(',')
        .filter(|s| !s.trim().is_empty())
        .map(|chunk| {
            let mut parts = chunk.splitn(3, ':');
            let name = parts.next().with_context(|| format!("range `{chunk}` missing name"))?;
            let lo: f64 = parts
                .next()
                .with_context(|| format!("range `{chunk}` missing lower bound"))?
                .trim()
                .parse()
                .with_context(|| format!("range `{chunk}` has a non-numeric lower bound"))?;
            let hi: f64 = parts
                .next()
                .with_context(|| format!("range `{chunk}` missing upper bound"))?
                .trim()
                .parse()
                .with_context(|| format!("range `{chunk}` has a non-numeric upper bound"))?;
            Ok((name.trim().to_string(), lo, hi))
        })
        .collect()
}

fn build_solver(solver: Solver, model: &Model) -> Box<dyn Integrator> {
    match solver {
        Solver::Euler => Box::new(Euler),
        Solver::Rk4 => Box::new(Rk4),
        Solver::Adaptive => Box::new(AdaptiveRk::new(
            1e-6,
            1e-9,
            model.time_config.step * 1e-6,
            (model.time_config.end - model.time_config.start).max(model.time_config.step),
            model.name.clone(),
        )),
    }
}

fn load_model(path: &PathBuf) -> Result<Model> {
    let contents = fs::read_to_string(path).with_context(|| format!("reading model file {}", path.display()))?;
    serde_json::from_str(&contents).with_context(|| format!("parsing model file {}", path.display()))
}

fn print_frame(frame: &Frame) {
    println!("t={:.4}", frame.time);
    let mut stocks: Vec<_> = frame.stocks.iter().collect();
    stocks.sort_by(|a, b| a.0.cmp(b.0));
    for (name, value) in stocks {
        println!("  stock  {name} = {value}");
    }
    let mut flows: Vec<_> = frame.flows.iter().collect();
    flows.sort_by(|a, b| a.0.cmp(b.0));
    for (name, value) in flows {
        println!("  flow   {name} = {value}");
    }
    let mut vars: Vec<_> = frame.variables.iter().collect();
    vars.sort_by(|a, b| a.0.cmp(b.0));
    for (name, value) in vars {
        println!("  var    {name} = {value}");
    }
}

/// Parses the CLI's compact scenario shorthand: `name:p=v,p=v;name2:p=v`.
fn parse_scenarios(text: &str) -> Result<Vec<Scenario>> {
    let mut out = Vec::new();
    for chunk in text.split(';').filter(|s| !s.trim().is_empty()) {
        let (name, rest) = chunk.split_once(':').with_context(|| format!("scenario `{chunk}` missing `name:` prefix"))?;
        let mut overrides = Vec::new();
        for pair in rest.split(',').filter(|s| !s.trim().is_empty()) {
            let (param, value) = pair.split_once('=').with_context(|| format!("override `{pair}` missing `=`"))?;
            let value: f64 = value.trim().parse().with_context(|| format!("override value `{value}` is not a number"))?;
            overrides.push(ScenarioOverride::new(param.trim(), value));
        }
        out.push(Scenario::new(name.trim(), overrides));
    }
    Ok(out)
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Run { model, solver, final_only } => {
            let model = load_model(&model)?;
            let integrator = build_solver(solver, &model);
            let compiled = CompiledModel::compile(model)?;
            if final_only {
                print_frame(&compiled.simulate_final(integrator.as_ref())?);
            } else {
                for frame in compiled.simulate(integrator.as_ref())? {
                    print_frame(&frame);
                }
            }
        }
        Commands::Validate { model } => {
            let model = load_model(&model)?;
            model.validate()?;
            CompiledModel::compile(model)?;
            println!("model is valid");
        }
        Commands::Compare { model, scenarios, solver } => {
            let model = load_model(&model)?;
            let integrator = build_solver(solver, &model);
            let scenarios = parse_scenarios(&scenarios)?;
            let comparison = flowsim::scenario::compare(&model, integrator.as_ref(), &scenarios)?;
            for scenario in &comparison.scenarios {
                println!("scenario `{}` (t={:.4}):", scenario.scenario_name, scenario.final_time);
                let mut stock_deltas: Vec<_> = scenario.delta_stocks.iter().collect();
                stock_deltas.sort_by(|a, b| a.0.cmp(b.0));
                for (name, delta) in stock_deltas {
                    println!("  delta stock    {name} = {delta:+.6}");
                }
                let mut variable_deltas: Vec<_> = scenario.delta_variables.iter().collect();
                variable_deltas.sort_by(|a, b| a.0.cmp(b.0));
                for (name, delta) in variable_deltas {
                    println!("  delta variable {name} = {delta:+.6}");
                }
            }
        }
        Commands::Sensitivity { model, target, params, variation, solver } => {
            if params.is_empty() {
                bail!("--params must name at least one parameter");
            }
            let model = load_model(&model)?;
            let integrator = build_solver(solver, &model);
            let results = flowsim::sensitivity::analyze(&model, integrator.as_ref(), &params, variation / 100.0, &target)?;
            for r in results {
                println!(
                    "{:<20} baseline={:<12.6} perturbed={:<12.6} impact={:+.3}% ({:?})",
                    r.target, r.baseline_metric, r.perturbed_metric, r.impact, r.direction
                );
            }
        }
        Commands::MonteCarlo { model, params, metrics, iterations, seed, percentiles, solver } => {
            if metrics.is_empty() {
                bail!("--metrics must name at least one metric");
            }
            let model = load_model(&model)?;
            let integrator = build_solver(solver, &model);
            let ranges = parse_ranges(&params)?;
            let parameters: Vec<MonteCarloParameter> = ranges
                .into_iter()
                .map(|(name, lo, hi)| {
                    MonteCarloParameter::new(name, move |ctx: &mut MonteCarloSampleContext| {
                        ctx.baseline * (lo + ctx.random.next_f64() * (hi - lo))
                    })
                })
                .collect();
            let results = flowsim::monte_carlo::run(&model, integrator.as_ref(), &parameters, iterations, seed, &metrics, &percentiles)?;
            println!("{} iterations", results.iterations);
            for summary in &results.metrics {
                println!(
                    "{:<20} mean={:<12.6} var={:<12.6} min={:<12.6} max={:<12.6}",
                    summary.name, summary.mean, summary.variance, summary.min, summary.max
                );
                for point in &summary.percentiles {
                    println!("  p{:<5.1} = {:.6}", point.percentile * 100.0, point.value);
                }
            }
        }
        Commands::Optimize { model, target, direction, at_time, params, strategy, steps, samples, seed, solver } => {
            let model = load_model(&model)?;
            let integrator = build_solver(solver, &model);
            let ranges = parse_ranges(&params)?;
            if ranges.is_empty() {
                bail!("--params must name at least one parameter");
            }
            let param_specs: Vec<ParameterSpec> = ranges.iter().map(|(name, lo, hi)| ParameterSpec::new(name.clone(), *lo, *hi)).collect();
            let direction = match direction {
                OptimizeDirection::Maximize => Direction::Maximize,
                OptimizeDirection::Minimize => Direction::Minimize,
            };
            let at_time = at_time.unwrap_or(model.time_config.end);
            let objective = Objective::new(target, direction, at_time);
            let result = match strategy {
                OptimizeStrategy::Grid => flowsim::sensitivity::grid_optimize(&model, integrator.as_ref(), &param_specs, steps, &objective)?,
                OptimizeStrategy::Random => {
                    flowsim::sensitivity::random_optimize(&model, integrator.as_ref(), &param_specs, samples, seed, &objective)?
                }
            };
            println!("objective `{}` ({} via {})", result.objective, result.strategy, result.evaluations);
            println!("best score = {:.6}", result.best_score);
            let mut values: Vec<_> = result.best_values.iter().collect();
            values.sort_by(|a, b| a.0.cmp(b.0));
            for (name, value) in values {
                println!("  {name} = {value:.6}");
            }
        }
    }

    Ok(())
}
