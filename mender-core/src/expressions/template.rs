use std::collections::BTreeSet;

use crate::types::Params;

const PARAMS_PREFIX: &str = "$params.";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Segment {
    Literal(String),
    Param(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Template {
    pub segments: Vec<Segment>,
}

impl Template {
    pub fn param_names(&self) -> BTreeSet<&str> {
        self.segments
            .iter()
            .filter_map(|s| match s {
                Segment::Param(name) => Some(name.as_str()),
                Segment::Literal(_) => None,
            })
            .collect()
    }

    pub fn render(&self, params: &Params) -> Result<String, TemplateError> {
        let mut out = String::new();
        for seg in &self.segments {
            match seg {
                Segment::Literal(s) => out.push_str(s),
                Segment::Param(name) => {
                    let value = params
                        .get(name)
                        .ok_or_else(|| TemplateError::UnknownParam(name.clone()))?;
                    out.push_str(value);
                }
            }
        }
        Ok(out)
    }
}

pub fn parse_template(input: &str) -> Result<Template, TemplateError> {
    let mut segments = Vec::new();
    let mut buf = String::new();
    let mut chars = input.chars().peekable();

    while let Some(ch) = chars.next() {
        if ch != '{' {
            buf.push(ch);
            continue;
        }

        // Only `{ $... }` is an expression; anything else (shell braces, JSON, Python dicts) stays literal.
        let mut lookahead = chars.clone();
        while let Some(ws) = lookahead.peek() {
            if ws.is_whitespace() {
                lookahead.next();
            } else {
                break;
            }
        }
        if !matches!(lookahead.peek(), Some('$')) {
            buf.push('{');
            continue;
        }

        let mut inner = String::new();
        let mut found = false;
        for n in chars.by_ref() {
            if n == '}' {
                found = true;
                break;
            }
            inner.push(n);
        }
        if !found {
            return Err(TemplateError::UnclosedExpression);
        }

        let name = parse_param_expr(inner.trim())?;
        if !buf.is_empty() {
            segments.push(Segment::Literal(std::mem::take(&mut buf)));
        }
        segments.push(Segment::Param(name));
    }

    if !buf.is_empty() {
        segments.push(Segment::Literal(buf));
    }

    Ok(Template { segments })
}

fn parse_param_expr(expr: &str) -> Result<String, TemplateError> {
    let Some(name) = expr.strip_prefix(PARAMS_PREFIX) else {
        return Err(TemplateError::InvalidExpression(expr.to_string()));
    };
    let valid = !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-' || c == '.');
    if !valid {
        return Err(TemplateError::InvalidExpression(expr.to_string()));
    }
    Ok(name.to_string())
}

/// Parse and render in one go.
pub fn render_str(input: &str, params: &Params) -> Result<String, TemplateError> {
    parse_template(input)?.render(params)
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TemplateError {
    #[error("invalid expression `{0}` (expected `$params.<name>`)")]
    InvalidExpression(String),
    #[error("unclosed embedded expression (missing '}}')")]
    UnclosedExpression,
    #[error("unknown parameter `{0}`")]
    UnknownParam(String),
}
