use std::sync::Arc;

use regex::Regex;

const DEFAULT_SIGNATURES: &[(&str, &str)] = &[
    ("traceback", r"^\s*Traceback \(most recent call last\)"),
    ("exception", r"\b[A-Za-z_][A-Za-z0-9_.]*(?:Error|Exception):"),
    ("error-prefix", r"^\s*(?:error|Error|ERROR|fatal|Fatal|FATAL)(?:\[[^\]]*\])?:"),
    ("fatal", r"\bFATAL\b"),
    ("panic", r"panicked at"),
    ("segfault", r"Segmentation fault|core dumped"),
    ("command-not-found", r"command not found|: not found$"),
    ("missing-path", r"No such file or directory"),
    ("permission-denied", r"Permission denied|Access is denied"),
];

#[derive(Debug, Clone)]
struct Signature {
    name: String,
    regex: Regex,
}

/// Patterns that mark a running process as failed the moment they appear.
#[derive(Debug, Clone)]
pub struct SignatureSet {
    signatures: Arc<Vec<Signature>>,
}

impl Default for SignatureSet {
    fn default() -> Self {
        Self::builtin()
    }
}

impl SignatureSet {
    pub fn builtin() -> Self {
        let signatures = DEFAULT_SIGNATURES
            .iter()
            .filter_map(|(name, pattern)| {
                Regex::new(pattern).ok().map(|regex| Signature {
                    name: (*name).to_string(),
                    regex,
                })
            })
            .collect();
        Self {
            signatures: Arc::new(signatures),
        }
    }

    pub fn empty() -> Self {
        Self {
            signatures: Arc::new(Vec::new()),
        }
    }

    /// Append custom patterns, each named after its own source text.
    pub fn with_patterns<S: AsRef<str>>(&self, patterns: &[S]) -> Result<Self, regex::Error> {
        let mut signatures = self.signatures.as_ref().clone();
        for pattern in patterns {
            let pattern = pattern.as_ref();
            signatures.push(Signature {
                name: pattern.to_string(),
                regex: Regex::new(pattern)?,
            });
        }
        Ok(Self {
            signatures: Arc::new(signatures),
        })
    }

    /// Name of the first signature matching `line`.
    pub fn find(&self, line: &str) -> Option<&str> {
        self.signatures
            .iter()
            .find(|s| s.regex.is_match(line))
            .map(|s| s.name.as_str())
    }

    pub fn len(&self) -> usize {
        self.signatures.len()
    }

    pub fn is_empty(&self) -> bool {
        self.signatures.is_empty()
    }
}
