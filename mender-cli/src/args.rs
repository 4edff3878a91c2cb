use std::path::PathBuf;

use clap::Args;
use mender_exec::retry::Jitter;

use crate::output::OutputFormat;

#[derive(Debug, Args, Clone)]
pub struct OutputArgs {
    #[arg(long, value_enum, default_value_t = OutputFormat::Text, global = true)]
    pub format: OutputFormat,
    #[arg(long, short, global = true)]
    pub quiet: bool,
}

/// Engine settings; flags override values from the config file.
#[derive(Debug, Args, Clone)]
pub struct EngineArgs {
    /// YAML or JSON engine config. Falls back to `MENDER_CONFIG`.
    #[arg(long)]
    pub config: Option<PathBuf>,
    /// Independent steps allowed to run at once.
    #[arg(long)]
    pub lanes: Option<usize>,
    #[arg(long)]
    pub base_delay_ms: Option<u64>,
    #[arg(long)]
    pub max_delay_ms: Option<u64>,
    #[arg(long, value_enum)]
    pub jitter: Option<JitterArg>,
    /// Fail steps whose effect cannot be verified.
    #[arg(long)]
    pub strict_verification: bool,
}

#[derive(Debug, Args, Clone)]
pub struct GeneratorArgs {
    /// Ollama-compatible server. Falls back to `MENDER_GENERATOR_URL`.
    #[arg(long)]
    pub generator_url: Option<String>,
    #[arg(long)]
    pub generator_model: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum JitterArg {
    None,
    Full,
}

impl From<JitterArg> for Jitter {
    fn from(value: JitterArg) -> Self {
        match value {
            JitterArg::None => Jitter::None,
            JitterArg::Full => Jitter::Full,
        }
    }
}
