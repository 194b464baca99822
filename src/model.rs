//! The core data model: stocks, flows, variables, time range, plus construction/validation.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;

use crate::error::{Error, Result};
use crate::ids::{FlowId, ModelId, StockId, VariableId};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimeConfig {
    pub start: f64,
    pub end: f64,
    pub step: f64,
}

impl Default for TimeConfig {
    fn default() -> Self {
        Self { start: 0.0, end: 10.0, step: 1.0 }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Stock {
    #[serde(default)]
    pub id: StockId,
    pub name: String,
    pub initial_value: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub units: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

impl Stock {
    pub fn new(name: impl Into<String>, initial_value: f64) -> Self {
        Self {
            id: StockId::new(),
            name: name.into(),
            initial_value,
            units: None,
            description: None,
        }
    }

    pub fn with_units(mut self, units: impl Into<String>) -> Self {
        self.units = Some(units.into());
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Flow {
    #[serde(default)]
    pub id: FlowId,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<StockId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target: Option<StockId>,
    pub rate_equation: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub units: Option<String>,
}

impl Flow {
    pub fn new(name: impl Into<String>, rate_equation: impl Into<String>) -> Self {
        Self {
            id: FlowId::new(),
            name: name.into(),
            source: None,
            target: None,
            rate_equation: rate_equation.into(),
            units: None,
        }
    }

    pub fn with_source(mut self, source: StockId) -> Self {
        self.source = Some(source);
        self
    }

    pub fn with_target(mut self, target: StockId) -> Self {
        self.target = Some(target);
        self
    }

    pub fn with_units(mut self, units: impl Into<String>) -> Self {
        self.units = Some(units.into());
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VariableKind {
    Constant,
    Auxiliary,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Variable {
    #[serde(default)]
    pub id: VariableId,
    pub name: String,
    #[serde(default)]
    pub equation: String,
    #[serde(rename = "type")]
    pub kind: VariableKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<f64>,
}

impl Variable {
    pub fn constant(name: impl Into<String>, value: f64) -> Self {
        Self {
            id: VariableId::new(),
            name: name.into(),
            equation: String::new(),
            kind: VariableKind::Constant,
            value: Some(value),
        }
    }

    pub fn auxiliary(name: impl Into<String>, equation: impl Into<String>) -> Self {
        Self {
            id: VariableId::new(),
            name: name.into(),
            equation: equation.into(),
            kind: VariableKind::Auxiliary,
            value: None,
        }
    }
}

/// A complete model: stocks, flows, variables, and the simulated time range.
///
/// Also doubles as the deserializable configuration document — every field
/// here derives `serde`, so a model can be built in memory via the
/// constructors/builders above or loaded verbatim from JSON. Loading is
/// model *construction*, not trace persistence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Model {
    #[serde(default)]
    pub id: ModelId,
    pub name: String,
    #[serde(default)]
    pub stocks: Vec<Stock>,
    #[serde(default)]
    pub flows: Vec<Flow>,
    #[serde(default)]
    pub variables: Vec<Variable>,
    #[serde(default)]
    pub time_config: TimeConfig,
}

impl Model {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            id: ModelId::new(),
            name: name.into(),
            stocks: Vec::new(),
            flows: Vec::new(),
            variables: Vec::new(),
            time_config: TimeConfig::default(),
        }
    }

    pub fn add_stock(&mut self, stock: Stock) -> &mut Self {
        self.stocks.push(stock);
        self
    }

    pub fn add_flow(&mut self, flow: Flow) -> &mut Self {
        self.flows.push(flow);
        self
    }

    pub fn add_variable(&mut self, variable: Variable) -> &mut Self {
        self.variables.push(variable);
        self
    }

    pub fn stock_by_name(&self, name: &str) -> Option<&Stock> {
        self.stocks.iter().find(|s| s.name == name)
    }

    pub fn variable_by_name(&self, name: &str) -> Option<&Variable> {
        self.variables.iter().find(|v| v.name == name)
    }

    /// Checks the invariants required before a model may be compiled:
    /// nonempty names, globally unique ids and names, a positive
    /// strictly-ordered time range, and constants carrying a concrete value.
    pub fn validate(&self) -> Result<()> {
        let mut ids = HashSet::new();
        let mut names = HashSet::new();

        for stock in &self.stocks {
            if stock.name.trim().is_empty() {
                return Err(Error::ModelBuildError { message: "stock name must not be empty".into() });
            }
            if !ids.insert(stock.id.to_string()) {
                return Err(Error::ModelBuildError { message: format!("duplicate stock id {}", stock.id) });
            }
            if !names.insert(stock.name.clone()) {
                return Err(Error::ModelBuildError { message: format!("duplicate name `{}`", stock.name) });
            }
        }
        for flow in &self.flows {
            if flow.name.trim().is_empty() {
                return Err(Error::ModelBuildError { message: "flow name must not be empty".into() });
            }
            if !ids.insert(flow.id.to_string()) {
                return Err(Error::ModelBuildError { message: format!("duplicate flow id {}", flow.id) });
            }
            if !names.insert(flow.name.clone()) {
                return Err(Error::ModelBuildError { message: format!("duplicate name `{}`", flow.name) });
            }
            if let Some(src) = flow.source {
                if !self.stocks.iter().any(|s| s.id == src) {
                    return Err(Error::ModelBuildError { message: format!("flow `{}` source stock not found", flow.name) });
                }
            }
            if let Some(tgt) = flow.target {
                if !self.stocks.iter().any(|s| s.id == tgt) {
                    return Err(Error::ModelBuildError { message: format!("flow `{}` target stock not found", flow.name) });
                }
            }
            if let (Some(src), Some(tgt)) = (flow.source, flow.target) {
                let source_stock = self.stocks.iter().find(|s| s.id == src);
                let target_stock = self.stocks.iter().find(|s| s.id == tgt);
                if let (Some(source_stock), Some(target_stock)) = (source_stock, target_stock) {
                    let source_units = crate::unit_parser::parse_unit_expr(source_stock.units.as_deref().unwrap_or(""))
                        .map_err(|e| Error::ModelBuildError {
                            message: format!("flow `{}` source stock `{}` has an unparsable units string: {e}", flow.name, source_stock.name),
                        })?;
                    let target_units = crate::unit_parser::parse_unit_expr(target_stock.units.as_deref().unwrap_or(""))
                        .map_err(|e| Error::ModelBuildError {
                            message: format!("flow `{}` target stock `{}` has an unparsable units string: {e}", flow.name, target_stock.name),
                        })?;
                    if !crate::units::units_equal(&source_units, &target_units) {
                        return Err(Error::ModelBuildError {
                            message: format!(
                                "flow `{}` connects stocks with mismatched units: source `{}` ({}) vs target `{}` ({})",
                                flow.name,
                                source_stock.name,
                                source_stock.units.as_deref().unwrap_or("unitless"),
                                target_stock.name,
                                target_stock.units.as_deref().unwrap_or("unitless"),
                            ),
                        });
                    }
                }
            }
        }
        for variable in &self.variables {
            if variable.name.trim().is_empty() {
                return Err(Error::ModelBuildError { message: "variable name must not be empty".into() });
            }
            if !ids.insert(variable.id.to_string()) {
                return Err(Error::ModelBuildError { message: format!("duplicate variable id {}", variable.id) });
            }
            if !names.insert(variable.name.clone()) {
                return Err(Error::ModelBuildError { message: format!("duplicate name `{}`", variable.name) });
            }
            if variable.kind == VariableKind::Constant && variable.value.is_none() {
                return Err(Error::ModelBuildError { message: format!("constant `{}` has no value", variable.name) });
            }
        }
        if !(self.time_config.step > 0.0) {
            return Err(Error::InvalidTimeStepError { step: self.time_config.step });
        }
        if !(self.time_config.start < self.time_config.end) {
            return Err(Error::ModelBuildError {
                message: format!("time_config.start ({}) must be < end ({})", self.time_config.start, self.time_config.end),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_duplicate_names() {
        let mut model = Model::new("m");
        model.add_stock(Stock::new("A", 0.0));
        model.add_variable(Variable::constant("A", 1.0));
        assert!(model.validate().is_err());
    }

    #[test]
    fn rejects_constant_without_value() {
        let mut model = Model::new("m");
        let mut v = Variable::auxiliary("k", "1");
        v.kind = VariableKind::Constant;
        v.value = None;
        model.add_variable(v);
        assert!(model.validate().is_err());
    }

    #[test]
    fn rejects_nonpositive_step() {
        let mut model = Model::new("m");
        model.time_config.step = 0.0;
        assert!(model.validate().is_err());
    }

    #[test]
    fn rejects_flow_between_stocks_with_mismatched_units() {
        let mut model = Model::new("m");
        let mass = Stock::new("Mass", 0.0).with_units("kg");
        let people = Stock::new("People", 0.0).with_units("people");
        let mass_id = mass.id;
        let people_id = people.id;
        model.add_stock(mass);
        model.add_stock(people);
        model.add_flow(Flow::new("transfer", "1").with_source(mass_id).with_target(people_id));
        assert!(model.validate().is_err());
    }

    #[test]
    fn accepts_flow_between_stocks_with_matching_units() {
        let mut model = Model::new("m");
        let a = Stock::new("A", 0.0).with_units("widgets");
        let b = Stock::new("B", 0.0).with_units("widgets");
        let a_id = a.id;
        let b_id = b.id;
        model.add_stock(a);
        model.add_stock(b);
        model.add_flow(Flow::new("transfer", "1").with_source(a_id).with_target(b_id));
        assert!(model.validate().is_ok());
    }

    #[test]
    fn accepts_well_formed_model() {
        let mut model = Model::new("m");
        let a = Stock::new("A", 100.0);
        let id = a.id;
        model.add_stock(a);
        model.add_flow(Flow::new("outflow", "1").with_source(id));
        model.add_variable(Variable::constant("k", 0.5));
        assert!(model.validate().is_ok());
    }
}
