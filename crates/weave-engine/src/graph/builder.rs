use std::collections::{BTreeSet, HashMap};

use weave_core::config::{UnitConfig, WorkflowConfig};
use weave_core::error::ValidationError;
use weave_core::types::UnitStatus;

use super::{ExecutionGraph, WorkflowUnit};

/// Collects a unit → dependencies description and turns it into a
/// validated [`ExecutionGraph`].
#[derive(Debug, Default, Clone)]
pub struct GraphBuilder {
    units: Vec<WorkflowUnit>,
    invalid_timeouts: Vec<(String, f64)>,
}

impl GraphBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Units from `[[agents]]`, declaration order preserved.
    pub fn from_config(config: &WorkflowConfig) -> Self {
        let mut builder = Self::new();
        for unit in &config.agents {
            builder.add_config(unit);
        }
        builder
    }

    pub fn add_unit(&mut self, name: &str, depends_on: &[&str], tools: &[&str]) -> &mut Self {
        self.units.push(WorkflowUnit {
            id: name.to_string(),
            depends_on: depends_on.iter().map(|s| s.to_string()).collect(),
            tools: tools.iter().map(|s| s.to_string()).collect(),
            timeout: None,
            status: UnitStatus::Pending,
        });
        self
    }

    pub fn add_config(&mut self, unit: &UnitConfig) -> &mut Self {
        let timeout = unit.timeout_duration();
        if let (Some(value), None) = (unit.timeout, timeout) {
            self.invalid_timeouts.push((unit.name.clone(), value));
        }
        self.units.push(WorkflowUnit {
            id: unit.name.clone(),
            depends_on: unit.depends_on.clone(),
            tools: unit.tools.clone(),
            timeout,
            status: UnitStatus::Pending,
        });
        self
    }

    /// Resolve names to indices, reject duplicates, unknown dependencies
    /// and cycles, then compute levels.
    pub fn build(&self) -> Result<ExecutionGraph, ValidationError> {
        if self.units.is_empty() {
            return Err(ValidationError::EmptyWorkflow);
        }
        if let Some((unit, value)) = self.invalid_timeouts.first() {
            return Err(ValidationError::InvalidTimeout {
                unit: unit.clone(),
                value: value.to_string(),
            });
        }

        let mut index: HashMap<&str, usize> = HashMap::with_capacity(self.units.len());
        for (idx, unit) in self.units.iter().enumerate() {
            if index.insert(unit.id.as_str(), idx).is_some() {
                return Err(ValidationError::DuplicateUnit(unit.id.clone()));
            }
        }

        let mut dependencies = Vec::with_capacity(self.units.len());
        for unit in &self.units {
            let mut deps = BTreeSet::new();
            for dep in &unit.depends_on {
                let &dep_idx = index.get(dep.as_str()).ok_or_else(|| {
                    ValidationError::UnknownDependency {
                        unit: unit.id.clone(),
                        dependency: dep.clone(),
                    }
                })?;
                deps.insert(dep_idx);
            }
            dependencies.push(deps);
        }

        let mut graph = ExecutionGraph::from_parts(self.units.clone(), dependencies);
        graph.validate()?;
        let levels = graph.compute_levels()?;
        graph.set_levels(levels);
        Ok(graph)
    }
}
