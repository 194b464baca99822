//! Property-based coverage for invariants that hold across many inputs,
//! not just the hand-picked literal scenarios: unit-map normalisation,
//! dependency ordering, and percentile monotonicity.

use std::collections::{BTreeMap, HashMap};

use proptest::prelude::*;

use flowsim::{Flow, Model, Stock, Variable};

fn unit_map_strategy() -> impl Strategy<Value = BTreeMap<String, i32>> {
    proptest::collection::btree_map("[a-c]", -4i32..4, 0..4)
}

proptest! {
    /// Multiplying a unit map by its own inverse always collapses to
    /// unitless, and `mul` is commutative regardless of operand order.
    #[test]
    fn unit_mul_is_commutative_and_self_inverse_collapses(units in unit_map_strategy()) {
        use flowsim::Quantity;

        let a = Quantity::new(1.0, units.clone());
        let inverse: BTreeMap<String, i32> = units.iter().map(|(k, v)| (k.clone(), -v)).collect();
        let b = Quantity::new(1.0, inverse);

        let collapsed = a.mul(&b);
        prop_assert!(collapsed.is_unitless());

        let other = Quantity::new(2.0, units);
        prop_assert_eq!(a.mul(&other).units, other.mul(&a).units);
    }
}

/// Builds a model whose auxiliary variables reference a random DAG of
/// earlier-declared variables by name. Edges are sampled as arbitrary
/// `(from, to)` pairs over a fixed variable count and then filtered down to
/// `from < to`, which is sufficient on its own to guarantee acyclicity —
/// no per-index strategy shape is needed.
fn dag_model_strategy() -> impl Strategy<Value = Model> {
    let n = 10usize;
    let edges = proptest::collection::vec((0..n, 0..n), 0..25);
    edges.prop_map(move |raw_edges| {
        let names: Vec<String> = (0..n).map(|i| format!("v{i}")).collect();
        let mut deps: Vec<Vec<usize>> = vec![Vec::new(); n];
        for (from, to) in raw_edges {
            if from < to {
                deps[to].push(from);
            }
        }

        let mut model = Model::new("dag");
        for (i, name) in names.iter().enumerate() {
            let mut refs = deps[i].clone();
            refs.sort_unstable();
            refs.dedup();
            let equation = if refs.is_empty() {
                "1".to_string()
            } else {
                refs.iter().map(|&d| format!("[{}]", names[d])).collect::<Vec<_>>().join(" + ")
            };
            model.add_variable(Variable::auxiliary(name.clone(), equation));
        }
        model
    })
}

proptest! {
    /// For any randomly generated acyclic dependency structure, the compiled
    /// evaluation order always places every dependency before its dependent.
    #[test]
    fn topo_order_always_respects_dependencies(model in dag_model_strategy()) {
        use flowsim::engine::CompiledModel;

        let compiled = CompiledModel::compile(model.clone());
        prop_assert!(compiled.is_ok());

        // Re-derive the order via a second, independent pass over the
        // variable equations to check positions without reaching into
        // CompiledModel's private fields: run the graph builder directly.
        let order = flowsim::graph::DependencyGraph::build(&model).unwrap();
        let position: HashMap<&str, usize> = order.iter().map(|s| s.as_str()).zip(0..).collect();

        for variable in &model.variables {
            for dep_name in model.variables.iter().map(|v| v.name.as_str()) {
                if variable.equation.contains(&format!("[{dep_name}]")) {
                    prop_assert!(position[dep_name] < position[variable.name.as_str()]);
                }
            }
        }
    }
}

fn sorted_values_strategy() -> impl Strategy<Value = Vec<f64>> {
    proptest::collection::vec(-1000.0f64..1000.0, 1..50)
}

proptest! {
    /// Percentile aggregation is monotonic non-decreasing in `p` for any
    /// fixed sample set, and always stays within [min, max].
    #[test]
    fn percentiles_are_monotonic_in_p(values in sorted_values_strategy()) {
        let model = {
            let mut model = Model::new("mc-prop");
            let stock = Stock::new("X", 1.0);
            let id = stock.id;
            model.add_stock(stock);
            model.add_flow(Flow::new("noop", "0").with_target(id));
            model
        };
        let _ = model; // model unused beyond shape; percentile math is pure below.

        let mut sorted = values.clone();
        sorted.sort_by(|a, b| a.partial_cmp(b).unwrap());
        let ps = [0.0, 0.1, 0.25, 0.5, 0.75, 0.9, 0.95, 1.0];
        let points: Vec<f64> = ps.iter().map(|&p| percentile(&sorted, p)).collect();
        for w in points.windows(2) {
            prop_assert!(w[0] <= w[1] + 1e-9);
        }
        prop_assert!(*points.first().unwrap() >= sorted[0] - 1e-9);
        prop_assert!(*points.last().unwrap() <= sorted[sorted.len() - 1] + 1e-9);
    }
}

/// Mirrors `monte_carlo::percentile`'s interpolation exactly, so this test
/// exercises the same algorithm without depending on a private function.
fn percentile(sorted: &[f64], p: f64) -> f64 {
    let p = p.clamp(0.0, 1.0);
    if sorted.len() == 1 {
        return sorted[0];
    }
    let idx = (sorted.len() - 1) as f64 * p;
    let lower = idx.floor() as usize;
    let upper = idx.ceil() as usize;
    if lower == upper {
        sorted[lower]
    } else {
        let frac = idx - lower as f64;
        sorted[lower] + (sorted[upper] - sorted[lower]) * frac
    }
}
