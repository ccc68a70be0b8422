//! Arena-backed dependency graph of workflow units.
//!
//! Units live in a `Vec` in declaration order and every edge is an index
//! into it, so validation and level computation are pure functions over
//! indices.

mod builder;

pub use builder::GraphBuilder;

use std::collections::BTreeSet;
use std::time::Duration;

use weave_core::error::ValidationError;
use weave_core::types::UnitStatus;

/// One schedulable node.
#[derive(Debug, Clone, PartialEq)]
pub struct WorkflowUnit {
    pub id: String,
    /// Declared dependency ids, as written.
    pub depends_on: Vec<String>,
    /// Tool names this unit may call.
    pub tools: Vec<String>,
    /// Per-unit timeout override.
    pub timeout: Option<Duration>,
    pub status: UnitStatus,
}

#[derive(Debug, Clone)]
pub struct ExecutionGraph {
    units: Vec<WorkflowUnit>,
    /// `dependencies[i]`: indices unit `i` waits on.
    dependencies: Vec<BTreeSet<usize>>,
    /// `dependents[i]`: indices waiting on unit `i`.
    dependents: Vec<BTreeSet<usize>>,
    levels: Vec<Vec<usize>>,
    level_of: Vec<usize>,
}

impl ExecutionGraph {
    pub(crate) fn from_parts(
        units: Vec<WorkflowUnit>,
        dependencies: Vec<BTreeSet<usize>>,
    ) -> Self {
        let mut dependents = vec![BTreeSet::new(); units.len()];
        for (idx, deps) in dependencies.iter().enumerate() {
            for &dep in deps {
                dependents[dep].insert(idx);
            }
        }
        Self {
            level_of: vec![0; units.len()],
            units,
            dependencies,
            dependents,
            levels: Vec::new(),
        }
    }

    pub(crate) fn set_levels(&mut self, levels: Vec<Vec<usize>>) {
        for (level, members) in levels.iter().enumerate() {
            for &idx in members {
                self.level_of[idx] = level;
            }
        }
        self.levels = levels;
    }

    pub fn len(&self) -> usize {
        self.units.len()
    }

    pub fn is_empty(&self) -> bool {
        self.units.is_empty()
    }

    pub fn units(&self) -> &[WorkflowUnit] {
        &self.units
    }

    pub fn unit(&self, idx: usize) -> &WorkflowUnit {
        &self.units[idx]
    }

    pub fn index_of(&self, id: &str) -> Option<usize> {
        self.units.iter().position(|u| u.id == id)
    }

    pub fn dependencies(&self, idx: usize) -> &BTreeSet<usize> {
        &self.dependencies[idx]
    }

    pub fn dependents(&self, idx: usize) -> &BTreeSet<usize> {
        &self.dependents[idx]
    }

    /// Every unit that depends on `idx`, directly or transitively.
    pub fn transitive_dependents(&self, idx: usize) -> BTreeSet<usize> {
        let mut seen = BTreeSet::new();
        let mut stack: Vec<usize> = self.dependents[idx].iter().copied().collect();
        while let Some(next) = stack.pop() {
            if seen.insert(next) {
                stack.extend(self.dependents[next].iter().copied());
            }
        }
        seen
    }

    /// Levels computed at build time; each inner list is in declaration order.
    pub fn levels(&self) -> &[Vec<usize>] {
        &self.levels
    }

    pub fn level_of(&self, idx: usize) -> usize {
        self.level_of[idx]
    }

    /// Levels as unit ids.
    pub fn level_names(&self) -> Vec<Vec<&str>> {
        self.levels
            .iter()
            .map(|level| level.iter().map(|&i| self.units[i].id.as_str()).collect())
            .collect()
    }

    pub fn set_status(&mut self, idx: usize, status: UnitStatus) {
        self.units[idx].status = status;
    }

    pub fn status(&self, idx: usize) -> UnitStatus {
        self.units[idx].status
    }

    /// Check edge integrity and acyclicity. Never mutates.
    pub fn validate(&self) -> Result<(), ValidationError> {
        for (idx, deps) in self.dependencies.iter().enumerate() {
            if let Some(&bad) = deps.iter().find(|&&d| d >= self.units.len()) {
                return Err(ValidationError::UnknownDependency {
                    unit: self.units[idx].id.clone(),
                    dependency: format!("#{}", bad),
                });
            }
        }
        match self.find_cycle() {
            Some(path) => Err(ValidationError::Cycle { path }),
            None => Ok(()),
        }
    }

    /// Depth-first search for a back edge. Returns the cycle as unit ids,
    /// first id repeated at the end.
    fn find_cycle(&self) -> Option<Vec<String>> {
        #[derive(Clone, Copy, PartialEq)]
        enum Mark {
            New,
            Active,
            Done,
        }

        fn visit(
            graph: &ExecutionGraph,
            idx: usize,
            marks: &mut [Mark],
            stack: &mut Vec<usize>,
        ) -> Option<Vec<String>> {
            marks[idx] = Mark::Active;
            stack.push(idx);
            for &dep in &graph.dependencies[idx] {
                match marks[dep] {
                    Mark::Active => {
                        let start = stack.iter().position(|&s| s == dep).unwrap_or(0);
                        let mut path: Vec<String> = stack[start..]
                            .iter()
                            .map(|&i| graph.units[i].id.clone())
                            .collect();
                        path.push(graph.units[dep].id.clone());
                        return Some(path);
                    }
                    Mark::New => {
                        if let Some(path) = visit(graph, dep, marks, stack) {
                            return Some(path);
                        }
                    }
                    Mark::Done => {}
                }
            }
            stack.pop();
            marks[idx] = Mark::Done;
            None
        }

        let mut marks = vec![Mark::New; self.units.len()];
        let mut stack = Vec::new();
        for idx in 0..self.units.len() {
            if marks[idx] == Mark::New {
                if let Some(path) = visit(self, idx, &mut marks, &mut stack) {
                    return Some(path);
                }
            }
        }
        None
    }

    /// Kahn-style generations. Within a level, declaration order.
    pub fn compute_levels(&self) -> Result<Vec<Vec<usize>>, ValidationError> {
        let mut remaining: Vec<usize> = self.dependencies.iter().map(|d| d.len()).collect();
        let mut placed = vec![false; self.units.len()];
        let mut levels = Vec::new();
        let mut placed_count = 0;

        while placed_count < self.units.len() {
            let level: Vec<usize> = (0..self.units.len())
                .filter(|&i| !placed[i] && remaining[i] == 0)
                .collect();
            if level.is_empty() {
                // Residual counts mean a cycle slipped past validation.
                let path = (0..self.units.len())
                    .filter(|&i| !placed[i])
                    .map(|i| self.units[i].id.clone())
                    .collect();
                return Err(ValidationError::Cycle { path });
            }
            for &idx in &level {
                placed[idx] = true;
                for &dependent in &self.dependents[idx] {
                    remaining[dependent] -= 1;
                }
            }
            placed_count += level.len();
            levels.push(level);
        }
        Ok(levels)
    }
}
