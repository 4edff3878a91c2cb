use crate::error::ParseError;
use crate::types::{PlanDocument, Step};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DocumentFormat {
    Json,
    Yaml,
    Auto,
}

#[derive(Debug, Clone)]
pub struct ParsedPlan {
    pub document: PlanDocument,
    pub format: DocumentFormat,
}

/// Parse a plan given either as a document (`{ name, steps }`) or as a bare list of steps.
pub fn parse_plan_str(input: &str, format: DocumentFormat) -> Result<ParsedPlan, ParseError> {
    match format {
        DocumentFormat::Json => Ok(ParsedPlan {
            document: from_json(input)?,
            format,
        }),
        DocumentFormat::Yaml => Ok(ParsedPlan {
            document: from_yaml(input)?,
            format,
        }),
        DocumentFormat::Auto => parse_plan_auto(input),
    }
}

fn from_json(input: &str) -> Result<PlanDocument, ParseError> {
    let value: serde_json::Value = serde_json::from_str(input)?;
    if value.is_array() {
        let steps: Vec<Step> = serde_json::from_value(value)?;
        return Ok(PlanDocument::from_steps(steps));
    }
    Ok(serde_json::from_value(value)?)
}

fn from_yaml(input: &str) -> Result<PlanDocument, ParseError> {
    let value: serde_yaml::Value = serde_yaml::from_str(input)?;
    if value.is_sequence() {
        let steps: Vec<Step> = serde_yaml::from_value(value)?;
        return Ok(PlanDocument::from_steps(steps));
    }
    Ok(serde_yaml::from_value(value)?)
}

fn parse_plan_auto(input: &str) -> Result<ParsedPlan, ParseError> {
    if input.trim().is_empty() {
        return Err(ParseError::UnknownFormat);
    }

    // JSON always starts with `{` or `[` after trimming.
    let trimmed = input.trim_start();
    if trimmed.starts_with('{') || trimmed.starts_with('[') {
        return match from_json(input) {
            Ok(document) => Ok(ParsedPlan {
                document,
                format: DocumentFormat::Json,
            }),
            Err(json_err) => match from_yaml(input) {
                Ok(document) => Ok(ParsedPlan {
                    document,
                    format: DocumentFormat::Yaml,
                }),
                Err(_) => Err(json_err),
            },
        };
    }

    match from_yaml(input) {
        Ok(document) => Ok(ParsedPlan {
            document,
            format: DocumentFormat::Yaml,
        }),
        Err(yaml_err) => {
            if let Ok(document) = from_json(input) {
                return Ok(ParsedPlan {
                    document,
                    format: DocumentFormat::Json,
                });
            }
            Err(yaml_err)
        }
    }
}
