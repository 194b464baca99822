//! Dependency graph compiler: orders flows and auxiliary/constant
//! variables so that each is evaluated only after everything it references.
//!
//! Stocks are not given equations here — their values are always the
//! previous integration step's state, so they never create an ordering
//! dependency of their own, only destinations for other nodes' references.

use std::collections::{HashMap, HashSet};

use petgraph::algo::{tarjan_scc, toposort};
use petgraph::graph::{DiGraph, NodeIndex};

use crate::ast::{Expr, ExprKind};
use crate::error::{Error, EquationDiagnostic, Result};
use crate::model::Model;
use crate::parser::parse_equation;

fn collect_refs(expr: &Expr, out: &mut HashSet<String>) {
    match &expr.kind {
        ExprKind::Ref(name) => {
            out.insert(name.clone());
        }
        ExprKind::QuantityLiteral { .. } | ExprKind::BooleanLiteral(_) | ExprKind::Time(_) => {}
        ExprKind::Unary { expr, .. } => collect_refs(expr, out),
        ExprKind::Binary { left, right, .. } => {
            collect_refs(left, out);
            collect_refs(right, out);
        }
        ExprKind::IfChain { branches, else_branch } => {
            for (cond, then_expr) in branches {
                collect_refs(cond, out);
                collect_refs(then_expr, out);
            }
            collect_refs(else_branch, out);
        }
        ExprKind::Call { args, .. } => {
            for arg in args {
                collect_refs(arg, out);
            }
        }
        ExprKind::Lookup1D { x, .. } => collect_refs(x, out),
        ExprKind::Delay { input, delay_time, initial, .. } => {
            collect_refs(input, out);
            collect_refs(delay_time, out);
            if let Some(initial) = initial {
                collect_refs(initial, out);
            }
        }
    }
}

/// Builds evaluation orders for a model's flows and variables.
pub struct DependencyGraph;

impl DependencyGraph {
    /// Parses every flow's rate equation and every variable's equation,
    /// builds a dependency edge for each identifier reference that names
    /// another flow or variable in the model, and returns the names in an
    /// order where each one follows everything it depends on.
    #[tracing::instrument(level = "debug", skip(model), fields(model = %model.name))]
    pub fn build(model: &Model) -> Result<Vec<String>> {
        let mut graph = DiGraph::<String, ()>::new();
        let mut index = HashMap::new();

        let stock_names: HashSet<&str> = model.stocks.iter().map(|s| s.name.as_str()).collect();
        let mut equations: HashMap<String, String> = HashMap::new();

        for flow in &model.flows {
            equations.insert(flow.name.clone(), flow.rate_equation.clone());
        }
        for variable in &model.variables {
            if !variable.equation.trim().is_empty() {
                equations.insert(variable.name.clone(), variable.equation.clone());
            }
        }

        for name in equations.keys() {
            let idx = graph.add_node(name.clone());
            index.insert(name.clone(), idx);
        }

        for (name, equation) in &equations {
            let parsed = parse_equation(equation)
                .map_err(|err| Error::EquationParseError { diagnostic: EquationDiagnostic::from_parse_error(equation, &err) })?;
            let mut refs = HashSet::new();
            collect_refs(&parsed.expr, &mut refs);
            for def in &parsed.defs {
                collect_refs(&def.body, &mut refs);
            }
            let dependent = index[name];
            for reference in refs {
                if stock_names.contains(reference.as_str()) {
                    continue;
                }
                if let Some(&dependency) = index.get(&reference) {
                    graph.add_edge(dependency, dependent, ());
                }
            }
        }

        let order = toposort(&graph, None).map_err(|cycle| {
            // toposort only points at one node on the cycle; walk strongly
            // connected components to report every node actually involved.
            let offender = cycle.node_id();
            let members = tarjan_scc(&graph)
                .into_iter()
                .find(|scc| scc.contains(&offender))
                .unwrap_or_else(|| vec![offender]);
            let mut nodes: Vec<String> = members.into_iter().map(|idx| graph[idx].clone()).collect();
            nodes.sort();
            Error::EquationGraphCycleError { nodes }
        })?;

        Ok(order.into_iter().map(|idx| graph[idx].clone()).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Flow, Stock, Variable};

    #[test]
    fn orders_variables_before_dependents() {
        let mut model = Model::new("m");
        model.add_variable(Variable::auxiliary("b", "[a] + 1"));
        model.add_variable(Variable::auxiliary("a", "1"));
        let order = DependencyGraph::build(&model).unwrap();
        let pos_a = order.iter().position(|n| n == "a").unwrap();
        let pos_b = order.iter().position(|n| n == "b").unwrap();
        assert!(pos_a < pos_b);
    }

    #[test]
    fn detects_cycles() {
        let mut model = Model::new("m");
        model.add_variable(Variable::auxiliary("a", "[b] + 1"));
        model.add_variable(Variable::auxiliary("b", "[a] + 1"));
        assert!(DependencyGraph::build(&model).is_err());
    }

    #[test]
    fn cycle_error_lists_every_member() {
        let mut model = Model::new("m");
        model.add_variable(Variable::auxiliary("a", "[b] + 1"));
        model.add_variable(Variable::auxiliary("b", "[c] + 1"));
        model.add_variable(Variable::auxiliary("c", "[a] + 1"));
        match DependencyGraph::build(&model) {
            Err(Error::EquationGraphCycleError { mut nodes }) => {
                nodes.sort();
                assert_eq!(nodes, vec!["a".to_string(), "b".to_string(), "c".to_string()]);
            }
            other => panic!("expected EquationGraphCycleError, got {other:?}"),
        }
    }

    #[test]
    fn stocks_do_not_create_ordering_edges() {
        let mut model = Model::new("m");
        let stock = Stock::new("S", 10.0);
        let id = stock.id;
        model.add_stock(stock);
        model.add_flow(Flow::new("outflow", "[S] * 0.1").with_source(id));
        let order = DependencyGraph::build(&model).unwrap();
        assert_eq!(order, vec!["outflow".to_string()]);
    }
}
