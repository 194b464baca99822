use std::time::Duration;

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion};
use flowsim::{CompiledModel, Euler, Flow, Model, Rk4, Stock, TimeConfig, Variable};

fn population_model(end: f64) -> Model {
    let mut model = Model::new("bench_population");
    model.time_config = TimeConfig { start: 0.0, end, step: 1.0 };
    let stock = Stock::new("population", 1000.0);
    let id = stock.id;
    model.add_stock(stock);
    model.add_variable(Variable::constant("birth_rate", 0.1));
    model.add_variable(Variable::constant("lifespan", 80.0));
    model.add_flow(Flow::new("births", "[population] * [birth_rate]").with_target(id));
    model.add_flow(Flow::new("deaths", "[population] / [lifespan]").with_source(id));
    model
}

fn bench_compile(c: &mut Criterion) {
    let model = population_model(1000.0);
    c.bench_function("compile", |b| {
        b.iter(|| CompiledModel::compile(model.clone()).unwrap())
    });
}

fn bench_euler_run(c: &mut Criterion) {
    let mut group = c.benchmark_group("euler_run");
    group.measurement_time(Duration::from_secs(5));
    for &steps in &[1_000, 10_000, 100_000] {
        let compiled = CompiledModel::compile(population_model(steps as f64)).unwrap();
        group.bench_with_input(BenchmarkId::from_parameter(steps), &compiled, |b, compiled| {
            b.iter(|| compiled.simulate(&Euler).unwrap())
        });
    }
    group.finish();
}

fn bench_rk4_run(c: &mut Criterion) {
    let mut group = c.benchmark_group("rk4_run");
    group.measurement_time(Duration::from_secs(5));
    for &steps in &[1_000, 10_000, 100_000] {
        let compiled = CompiledModel::compile(population_model(steps as f64)).unwrap();
        group.bench_with_input(BenchmarkId::from_parameter(steps), &compiled, |b, compiled| {
            b.iter(|| compiled.simulate(&Rk4).unwrap())
        });
    }
    group.finish();
}

criterion_group!(benches, bench_compile, bench_euler_run, bench_rk4_run);
criterion_main!(benches);
