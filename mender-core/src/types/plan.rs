use crate::types::Step;

#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct PlanDocument {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,

    pub steps: Vec<Step>,
}

impl PlanDocument {
    pub fn from_steps(steps: Vec<Step>) -> Self {
        Self {
            name: None,
            description: None,
            steps,
        }
    }

    pub fn display_name(&self) -> &str {
        self.name.as_deref().unwrap_or("plan")
    }

    pub fn step(&self, number: crate::types::StepNumber) -> Option<&Step> {
        self.steps.iter().find(|s| s.number == number)
    }
}
