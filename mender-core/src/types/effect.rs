use crate::expressions::{render_str, TemplateError};
use crate::types::Params;

/// The real-world outcome a step claims to produce.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Effect {
    LaunchApplication {
        application: String,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        alternatives: Vec<String>,
    },
    CreateFile {
        path: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        content: Option<String>,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        alternative_locations: Vec<String>,
    },
    CreateDirectory {
        path: String,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        alternative_locations: Vec<String>,
    },
    DeleteFile {
        path: String,
    },
    TypeText {
        text: String,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        methods: Vec<String>,
    },
    Output {
        pattern: String,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionCategory {
    ApplicationLaunch,
    FileSystem,
    InputDelivery,
    Output,
}

impl ActionCategory {
    pub fn as_str(self) -> &'static str {
        match self {
            ActionCategory::ApplicationLaunch => "application_launch",
            ActionCategory::FileSystem => "file_system",
            ActionCategory::InputDelivery => "input_delivery",
            ActionCategory::Output => "output",
        }
    }
}

impl Effect {
    pub fn kind(&self) -> &'static str {
        match self {
            Effect::LaunchApplication { .. } => "launch_application",
            Effect::CreateFile { .. } => "create_file",
            Effect::CreateDirectory { .. } => "create_directory",
            Effect::DeleteFile { .. } => "delete_file",
            Effect::TypeText { .. } => "type_text",
            Effect::Output { .. } => "output",
        }
    }

    pub fn category(&self) -> ActionCategory {
        match self {
            Effect::LaunchApplication { .. } => ActionCategory::ApplicationLaunch,
            Effect::CreateFile { .. } | Effect::CreateDirectory { .. } | Effect::DeleteFile { .. } => {
                ActionCategory::FileSystem
            }
            Effect::TypeText { .. } => ActionCategory::InputDelivery,
            Effect::Output { .. } => ActionCategory::Output,
        }
    }

    /// Parameters the effect contributes to payload templates before any override.
    pub fn builtin_params(&self) -> Params {
        let mut params = Params::new();
        match self {
            Effect::LaunchApplication { application, .. } => {
                params.insert("application".into(), application.clone());
                params.insert("launch_method".into(), "direct".into());
            }
            Effect::CreateFile { path, .. }
            | Effect::CreateDirectory { path, .. }
            | Effect::DeleteFile { path } => {
                params.insert("target_path".into(), path.clone());
            }
            Effect::TypeText { text, methods } => {
                params.insert("text".into(), text.clone());
                let method = methods.first().cloned().unwrap_or_else(|| "keyboard".into());
                params.insert("input_method".into(), method);
            }
            Effect::Output { .. } => {}
        }
        params
    }

    /// Name of the parameter that carries the effect's primary target, if any.
    pub fn target_param(&self) -> Option<&'static str> {
        match self {
            Effect::LaunchApplication { .. } => Some("application"),
            Effect::CreateFile { .. } | Effect::CreateDirectory { .. } | Effect::DeleteFile { .. } => {
                Some("target_path")
            }
            Effect::TypeText { .. } => Some("input_method"),
            Effect::Output { .. } => None,
        }
    }

    /// String fields that may contain parameter templates.
    pub fn template_fields(&self) -> Vec<(&'static str, &str)> {
        match self {
            Effect::LaunchApplication { application, .. } => vec![("application", application.as_str())],
            Effect::CreateFile { path, content, .. } => {
                let mut out = vec![("path", path.as_str())];
                if let Some(c) = content {
                    out.push(("content", c.as_str()));
                }
                out
            }
            Effect::CreateDirectory { path, .. } | Effect::DeleteFile { path } => {
                vec![("path", path.as_str())]
            }
            Effect::TypeText { text, .. } => vec![("text", text.as_str())],
            Effect::Output { pattern } => vec![("pattern", pattern.as_str())],
        }
    }

    /// Resolve every templated field against `params`.
    pub fn render(&self, params: &Params) -> Result<Effect, TemplateError> {
        let r = |s: &str| render_str(s, params);
        Ok(match self {
            Effect::LaunchApplication {
                application,
                alternatives,
            } => Effect::LaunchApplication {
                application: r(application.as_str())?,
                alternatives: alternatives.clone(),
            },
            Effect::CreateFile {
                path,
                content,
                alternative_locations,
            } => Effect::CreateFile {
                path: r(path.as_str())?,
                content: content.as_deref().map(r).transpose()?,
                alternative_locations: alternative_locations.clone(),
            },
            Effect::CreateDirectory {
                path,
                alternative_locations,
            } => Effect::CreateDirectory {
                path: r(path.as_str())?,
                alternative_locations: alternative_locations.clone(),
            },
            Effect::DeleteFile { path } => Effect::DeleteFile { path: r(path.as_str())? },
            Effect::TypeText { text, methods } => Effect::TypeText {
                text: r(text.as_str())?,
                methods: methods.clone(),
            },
            Effect::Output { pattern } => Effect::Output {
                pattern: r(pattern.as_str())?,
            },
        })
    }
}
