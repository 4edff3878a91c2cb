use std::collections::{BTreeMap, BTreeSet};

use crate::error::ValidationError;
use crate::types::{Step, StepNumber};

#[derive(Debug, Clone, serde::Serialize)]
pub struct PlanningOutcome {
    pub validation: ValidationSummary,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub plan: Option<ExecutionPlan>,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct ValidationSummary {
    pub is_valid: bool,
    pub errors: Vec<String>,
}

impl ValidationSummary {
    pub fn valid() -> Self {
        Self {
            is_valid: true,
            errors: Vec::new(),
        }
    }

    pub fn invalid_from(err: ValidationError) -> Self {
        Self {
            is_valid: false,
            errors: err.messages(),
        }
    }
}

/// A validated plan together with its dependency graph.
#[derive(Debug, Clone, serde::Serialize)]
pub struct ExecutionPlan {
    pub name: String,
    pub steps: Vec<Step>,
    pub graph: DependencyGraph,
}

impl ExecutionPlan {
    pub fn step(&self, number: StepNumber) -> Option<&Step> {
        self.steps.iter().find(|s| s.number == number)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct DependencyGraph {
    /// For each step, which steps it depends on.
    pub depends_on: BTreeMap<StepNumber, Vec<StepNumber>>,
    /// Steps grouped by parallelizable "levels".
    pub levels: Vec<Vec<StepNumber>>,
    /// A deterministic topological order.
    pub topo_order: Vec<StepNumber>,
}

impl DependencyGraph {
    /// Every step that directly or indirectly depends on `step`.
    pub fn transitive_dependents(&self, step: StepNumber) -> BTreeSet<StepNumber> {
        let mut out = BTreeSet::new();
        let mut frontier = vec![step];
        while let Some(current) = frontier.pop() {
            for (node, deps) in &self.depends_on {
                if deps.contains(&current) && out.insert(*node) {
                    frontier.push(*node);
                }
            }
        }
        out
    }

    pub fn dependencies_of(&self, step: StepNumber) -> &[StepNumber] {
        self.depends_on.get(&step).map(|v| v.as_slice()).unwrap_or(&[])
    }

    pub fn to_dot(&self, plan_name: &str) -> String {
        let mut out = String::new();
        out.push_str("digraph mender {\n");
        out.push_str(&format!("  label=\"plan: {plan_name}\";\n"));
        out.push_str("  labelloc=t;\n");
        out.push_str("  rankdir=LR;\n");

        for (step, deps) in &self.depends_on {
            if deps.is_empty() {
                out.push_str(&format!("  \"{step}\";\n"));
            } else {
                for dep in deps {
                    out.push_str(&format!("  \"{dep}\" -> \"{step}\";\n"));
                }
            }
        }

        for level in &self.levels {
            if level.len() > 1 {
                out.push_str("  { rank=same; ");
                for s in level {
                    out.push_str(&format!("\"{s}\"; "));
                }
                out.push_str("}\n");
            }
        }

        out.push_str("}\n");
        out
    }
}
