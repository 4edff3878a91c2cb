use std::collections::BTreeSet;

use crate::types::PlanDocument;
use crate::validate::rules::step::validate_step;
use crate::validate::validator::Validator;

pub(crate) fn validate_plan(v: &mut Validator, doc: &PlanDocument) {
    if doc.steps.is_empty() {
        v.push("steps", "must contain at least one step");
        return;
    }

    let numbers: BTreeSet<u32> = doc.steps.iter().map(|s| s.number).collect();
    let mut seen = BTreeSet::new();
    let mut previous: Option<u32> = None;

    for (idx, step) in doc.steps.iter().enumerate() {
        let path = format!("steps[{idx}]");

        if step.number == 0 {
            v.push(format!("{path}.number"), "must be >= 1");
        }
        if !seen.insert(step.number) {
            v.push(
                format!("{path}.number"),
                format!("duplicate step number {}", step.number),
            );
        } else if let Some(prev) = previous {
            if step.number <= prev {
                v.push(
                    format!("{path}.number"),
                    format!(
                        "step numbers must be strictly increasing ({} follows {prev})",
                        step.number
                    ),
                );
            }
        }
        previous = Some(step.number);

        validate_step(v, step, &path, &numbers);
    }
}
