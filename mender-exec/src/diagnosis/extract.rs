use std::sync::LazyLock;

use regex::Regex;
use serde_json::Value;

use crate::attempt::{AttemptFailure, ExecutionAttempt};

static ERROR_TYPE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\b([A-Za-z_][A-Za-z0-9_.]*(?:Error|Exception))\b").expect("valid regex")
});

const CONTEXT_LINES: usize = 5;
const TAIL_LINES: usize = 10;

/// Error type name and a window of surrounding output for a failed attempt.
pub fn parse_error_from_output(attempt: &ExecutionAttempt) -> (String, String) {
    let output = attempt.combined_output();
    let lines: Vec<&str> = output.lines().collect();

    if let Some((idx, name)) = lines
        .iter()
        .enumerate()
        .rev()
        .find_map(|(i, l)| ERROR_TYPE.captures(l).map(|c| (i, c[1].to_string())))
    {
        let start = idx.saturating_sub(CONTEXT_LINES);
        let end = (idx + CONTEXT_LINES + 1).min(lines.len());
        let name = name.rsplit('.').next().unwrap_or(&name).to_string();
        return (name, lines[start..end].join("\n"));
    }

    let kind = match &attempt.failure {
        Some(AttemptFailure::Setup { .. }) => "SetupFailure".to_string(),
        Some(AttemptFailure::Signature { pattern, .. }) => pattern.clone(),
        Some(AttemptFailure::ExitCode { .. }) => "NonZeroExit".to_string(),
        Some(AttemptFailure::TimedOut { .. }) => "Timeout".to_string(),
        Some(AttemptFailure::Cancelled) => "Cancelled".to_string(),
        Some(AttemptFailure::ExpectationNotMet { .. }) => "ExpectationNotMet".to_string(),
        Some(AttemptFailure::PreparationFailed { .. }) => "PreparationFailed".to_string(),
        None => "VerificationFailed".to_string(),
    };
    let tail = lines[lines.len().saturating_sub(TAIL_LINES)..].join("\n");
    let detail = if tail.trim().is_empty() {
        attempt.failure_summary().unwrap_or_default()
    } else {
        tail
    };
    (kind, detail)
}

/// First JSON object in model output, fenced or bare.
pub fn extract_json_object(text: &str) -> Option<Value> {
    if let Ok(v @ Value::Object(_)) = serde_json::from_str::<Value>(text.trim()) {
        return Some(v);
    }
    let fenced = strip_code_fences(text);
    if let Ok(v @ Value::Object(_)) = serde_json::from_str::<Value>(fenced.trim()) {
        return Some(v);
    }
    let start = text.find('{')?;
    let end = text.rfind('}')?;
    if end <= start {
        return None;
    }
    match serde_json::from_str::<Value>(&text[start..=end]) {
        Ok(v @ Value::Object(_)) => Some(v),
        _ => None,
    }
}

/// Body of the first fenced block, or the trimmed text when there is none.
pub fn strip_code_fences(text: &str) -> String {
    let trimmed = text.trim();
    let Some(open) = trimmed.find("```") else {
        return trimmed.to_string();
    };
    let after_open = &trimmed[open + 3..];
    // Skip the info string (```python).
    let body_start = after_open.find('\n').map(|i| i + 1).unwrap_or(after_open.len());
    let body = &after_open[body_start..];
    let body = match body.find("```") {
        Some(close) => &body[..close],
        None => body,
    };
    body.trim_end().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strips_language_fence() {
        let text = "Here you go:\n```python\nprint('hi')\n```\nanything else?";
        assert_eq!(strip_code_fences(text), "print('hi')");
        assert_eq!(strip_code_fences("  echo ok \n"), "echo ok");
    }

    #[test]
    fn finds_json_in_chatter() {
        let v = extract_json_object("Sure!\n{\"fix_strategy\": \"manual\"}\nBye").unwrap();
        assert_eq!(v["fix_strategy"], "manual");
        let v = extract_json_object("```json\n{\"a\": 1}\n```").unwrap();
        assert_eq!(v["a"], 1);
        assert!(extract_json_object("no json here").is_none());
    }
}
