//! Alternative ways to achieve a step's effect, tried in a fixed order.

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::path::{Path, PathBuf};

use mender_core::{Effect, Params, Step};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FallbackConfig {
    /// Keyed by lowercase application name.
    pub application_alternatives: BTreeMap<String, Vec<String>>,
    pub launch_methods: Vec<String>,
    pub input_methods: Vec<String>,
    /// When empty, existing user directories (desktop, documents, home, temp) are used.
    pub alternative_locations: Vec<String>,
}

impl Default for FallbackConfig {
    fn default() -> Self {
        let owned = |v: &[&str]| v.iter().map(|s| s.to_string()).collect::<Vec<_>>();
        let mut application_alternatives = BTreeMap::new();
        application_alternatives.insert("firefox".to_string(), owned(&["chromium", "google-chrome"]));
        application_alternatives.insert("chrome".to_string(), owned(&["chromium", "firefox"]));
        application_alternatives.insert("gedit".to_string(), owned(&["mousepad", "kate", "nano"]));
        application_alternatives.insert("notepad".to_string(), owned(&["wordpad"]));
        application_alternatives.insert("code".to_string(), owned(&["codium", "gedit"]));
        Self {
            application_alternatives,
            launch_methods: owned(&["direct", "shell"]),
            input_methods: owned(&["keyboard", "clipboard"]),
            alternative_locations: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StrategyCandidate {
    pub id: String,
    pub overrides: Params,
}

impl StrategyCandidate {
    pub fn new(id: impl Into<String>, key: &str, value: impl Into<String>) -> Self {
        let mut overrides = Params::new();
        overrides.insert(key.to_string(), value.into());
        Self {
            id: id.into(),
            overrides,
        }
    }
}

/// Hands out each candidate at most once.
#[derive(Debug, Clone, Default)]
pub struct FallbackStrategySelector {
    pending: VecDeque<StrategyCandidate>,
}

impl FallbackStrategySelector {
    /// Candidates for `step`; `params` are the params of the original strategy.
    pub fn for_step(step: &Step, params: &Params, config: &FallbackConfig) -> Self {
        let candidates = match &step.effect {
            Some(Effect::LaunchApplication { alternatives, .. }) => {
                application_candidates(alternatives, params, config)
            }
            Some(Effect::CreateFile {
                alternative_locations,
                ..
            })
            | Some(Effect::CreateDirectory {
                alternative_locations,
                ..
            }) => location_candidates(alternative_locations, params, config),
            Some(Effect::TypeText { methods, .. }) => input_candidates(methods, params, config),
            Some(Effect::DeleteFile { .. }) | Some(Effect::Output { .. }) | None => Vec::new(),
        };
        Self::from_candidates(candidates)
    }

    pub fn from_candidates(candidates: Vec<StrategyCandidate>) -> Self {
        let mut seen = BTreeSet::new();
        let pending = candidates
            .into_iter()
            .map(|mut c| {
                if !seen.insert(c.id.clone()) {
                    let mut n = 2;
                    while !seen.insert(format!("{}_{n}", c.id)) {
                        n += 1;
                    }
                    c.id = format!("{}_{n}", c.id);
                }
                c
            })
            .collect();
        Self { pending }
    }

    pub fn next_candidate(&mut self) -> Option<StrategyCandidate> {
        self.pending.pop_front()
    }

    pub fn remaining(&self) -> usize {
        self.pending.len()
    }

    pub fn remaining_ids(&self) -> Vec<String> {
        self.pending.iter().map(|c| c.id.clone()).collect()
    }

    pub fn is_exhausted(&self) -> bool {
        self.pending.is_empty()
    }
}

fn application_candidates(
    declared: &[String],
    params: &Params,
    config: &FallbackConfig,
) -> Vec<StrategyCandidate> {
    let current = params.get("application").map(String::as_str).unwrap_or("");
    let configured = config
        .application_alternatives
        .get(&current.to_ascii_lowercase())
        .into_iter()
        .flatten();

    let mut seen = BTreeSet::from([current.to_string()]);
    let mut out: Vec<StrategyCandidate> = declared
        .iter()
        .chain(configured)
        .filter(|app| !app.trim().is_empty() && seen.insert(app.to_string()))
        .map(|app| StrategyCandidate::new(format!("alt_app_{}", slug(app)), "application", app.as_str()))
        .collect();

    let method = params.get("launch_method").map(String::as_str).unwrap_or("direct");
    out.extend(
        config
            .launch_methods
            .iter()
            .filter(|m| m.as_str() != method)
            .map(|m| StrategyCandidate::new(format!("alt_method_{}", slug(m)), "launch_method", m.as_str())),
    );
    out
}

fn input_candidates(declared: &[String], params: &Params, config: &FallbackConfig) -> Vec<StrategyCandidate> {
    let current = params.get("input_method").map(String::as_str).unwrap_or("keyboard");
    let mut seen = BTreeSet::from([current.to_string()]);
    declared
        .iter()
        .chain(&config.input_methods)
        .filter(|m| seen.insert(m.to_string()))
        .map(|m| StrategyCandidate::new(format!("alt_input_{}", slug(m)), "input_method", m.as_str()))
        .collect()
}

fn location_candidates(
    declared: &[String],
    params: &Params,
    config: &FallbackConfig,
) -> Vec<StrategyCandidate> {
    let Some(current) = params.get("target_path") else {
        return Vec::new();
    };
    let current = Path::new(current);
    let Some(file_name) = current.file_name() else {
        return Vec::new();
    };

    let mut locations: Vec<PathBuf> = declared.iter().map(PathBuf::from).collect();
    if config.alternative_locations.is_empty() {
        locations.extend(default_locations());
    } else {
        locations.extend(config.alternative_locations.iter().map(PathBuf::from));
    }

    let mut seen = BTreeSet::from([current.to_path_buf()]);
    locations
        .into_iter()
        .map(|dir| {
            let target = dir.join(file_name);
            (dir, target)
        })
        .filter(|(_, target)| seen.insert(target.clone()))
        .map(|(dir, target)| {
            let label = dir
                .file_name()
                .map(|n| n.to_string_lossy().to_string())
                .unwrap_or_else(|| "root".to_string());
            StrategyCandidate::new(
                format!("alt_path_{}", slug(&label)),
                "target_path",
                target.to_string_lossy().to_string(),
            )
        })
        .collect()
}

fn default_locations() -> Vec<PathBuf> {
    let mut dirs = Vec::new();
    if let Some(user) = directories::UserDirs::new() {
        dirs.extend(
            [user.desktop_dir(), user.document_dir(), user.download_dir()]
                .into_iter()
                .flatten()
                .map(Path::to_path_buf),
        );
        dirs.push(user.home_dir().to_path_buf());
    }
    dirs.push(std::env::temp_dir());
    dirs.into_iter().filter(|d| d.is_dir()).collect()
}

fn slug(s: &str) -> String {
    let slug: String = s
        .trim()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c.to_ascii_lowercase() } else { '_' })
        .collect();
    if slug.is_empty() {
        "x".to_string()
    } else {
        slug
    }
}
