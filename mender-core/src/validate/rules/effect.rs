use crate::types::{Effect, Params};
use crate::validate::validator::Validator;

pub(crate) fn validate_effect(v: &mut Validator, effect: &Effect, path: &str, params: &Params) {
    for (field, value) in effect.template_fields() {
        let field_path = format!("{path}.{field}");
        if field != "content" && value.trim().is_empty() {
            v.push(field_path.clone(), "must not be empty");
        }
        for name in v.validate_template(&field_path, value) {
            if !params.contains_key(&name) {
                v.push(
                    field_path.clone(),
                    format!("references unknown parameter `{name}`"),
                );
            }
        }
    }

    match effect {
        Effect::Output { pattern } if !pattern.contains("{$") => {
            v.validate_regex(&format!("{path}.pattern"), pattern)
        }
        Effect::TypeText { methods, .. } => {
            for (midx, m) in methods.iter().enumerate() {
                if !matches!(m.as_str(), "keyboard" | "clipboard") {
                    v.push(
                        format!("{path}.methods[{midx}]"),
                        "must be one of: keyboard, clipboard",
                    );
                }
            }
        }
        Effect::CreateFile {
            alternative_locations,
            ..
        }
        | Effect::CreateDirectory {
            alternative_locations,
            ..
        } => {
            for (lidx, loc) in alternative_locations.iter().enumerate() {
                if loc.trim().is_empty() {
                    v.push(
                        format!("{path}.alternative_locations[{lidx}]"),
                        "must not be empty",
                    );
                }
            }
        }
        Effect::Output { .. } | Effect::LaunchApplication { .. } | Effect::DeleteFile { .. } => {}
    }
}
