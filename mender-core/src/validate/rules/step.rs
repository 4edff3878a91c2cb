use std::collections::{BTreeSet, HashSet};

use crate::types::Step;
use crate::validate::rules::effect::validate_effect;
use crate::validate::validator::Validator;

pub(crate) fn validate_step(v: &mut Validator, step: &Step, path: &str, numbers: &BTreeSet<u32>) {
    if step.description.trim().is_empty() {
        v.push(format!("{path}.description"), "must not be empty");
    }

    let mut seen_deps = HashSet::new();
    for (didx, dep) in step.depends_on.iter().enumerate() {
        let dep_path = format!("{path}.depends_on[{didx}]");
        if *dep >= step.number {
            v.push(
                dep_path,
                format!(
                    "step {} cannot depend on step {dep} (dependencies must refer to earlier steps)",
                    step.number
                ),
            );
            continue;
        }
        if !numbers.contains(dep) {
            v.push(dep_path, format!("unknown step {dep}"));
            continue;
        }
        if !seen_deps.insert(*dep) {
            v.push(dep_path, format!("duplicate dependency {dep}"));
        }
    }

    if step.code.is_some() && step.command.is_some() {
        v.push(path, "at most one of code, command may be provided");
    }
    if let Some(argv) = &step.command {
        if argv.is_empty() || argv[0].trim().is_empty() {
            v.push(format!("{path}.command"), "must start with a program name");
        }
    }
    if step.interpreter.is_some() && step.code.is_none() {
        v.push(format!("{path}.interpreter"), "only applies to code payloads");
    }
    if step.informational && (step.code.is_some() || step.command.is_some()) {
        v.push(path, "informational steps must not carry a payload");
    }

    if step.timeout_seconds == 0 {
        v.push(format!("{path}.timeout_seconds"), "must be greater than 0");
    }

    if let Some(pattern) = &step.expected_output {
        v.validate_regex(&format!("{path}.expected_output"), pattern);
    }

    let mut available: BTreeSet<String> = step.params.keys().cloned().collect();
    if let Some(effect) = &step.effect {
        validate_effect(v, effect, &format!("{path}.effect"), &step.params);
        available.extend(effect.builtin_params().into_keys());
    }

    let mut referenced = Vec::new();
    if let Some(code) = &step.code {
        referenced.extend(
            v.validate_template(&format!("{path}.code"), code)
                .into_iter()
                .map(|p| (format!("{path}.code"), p)),
        );
    }
    if let Some(argv) = &step.command {
        for (aidx, arg) in argv.iter().enumerate() {
            let arg_path = format!("{path}.command[{aidx}]");
            referenced.extend(
                v.validate_template(&arg_path, arg)
                    .into_iter()
                    .map(|p| (arg_path.clone(), p)),
            );
        }
    }
    for (ref_path, name) in referenced {
        if !available.contains(&name) {
            v.push(ref_path, format!("references unknown parameter `{name}`"));
        }
    }
}
