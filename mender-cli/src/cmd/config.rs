use std::path::PathBuf;

use mender_exec::generator::GeneratorConfig;
use mender_exec::EngineConfig;
use url::Url;

use crate::{EngineArgs, GeneratorArgs};

pub const CONFIG_ENV: &str = "MENDER_CONFIG";
pub const GENERATOR_URL_ENV: &str = "MENDER_GENERATOR_URL";
pub const DEFAULT_GENERATOR_MODEL: &str = "llama3";
const DEFAULT_GENERATOR_TIMEOUT_MS: u64 = 60_000;

/// Config file (flag, then `MENDER_CONFIG`), then flag overrides.
pub fn build_engine_config(engine: &EngineArgs, generator: &GeneratorArgs) -> Result<EngineConfig, String> {
    let path = engine.config.clone().or_else(|| env_value(CONFIG_ENV).map(PathBuf::from));
    let mut config = match &path {
        Some(path) => EngineConfig::from_path(path).map_err(|e| e.to_string())?,
        None => EngineConfig::default(),
    };

    if let Some(lanes) = engine.lanes {
        config.lanes = lanes;
    }
    if let Some(ms) = engine.base_delay_ms {
        config.retry.base_delay_ms = ms;
    }
    if let Some(ms) = engine.max_delay_ms {
        config.retry.max_delay_ms = ms;
    }
    if let Some(jitter) = engine.jitter {
        config.retry.jitter = jitter.into();
    }
    if engine.strict_verification {
        config.verify.strict = true;
    }

    let url = generator
        .generator_url
        .clone()
        .or_else(|| env_value(GENERATOR_URL_ENV));
    if let Some(raw) = url {
        let url = Url::parse(&raw).map_err(|e| format!("invalid generator url `{raw}`: {e}"))?;
        let existing = config.generator.take();
        let model = generator
            .generator_model
            .clone()
            .or_else(|| existing.as_ref().map(|g| g.model.clone()))
            .unwrap_or_else(|| DEFAULT_GENERATOR_MODEL.to_string());
        config.generator = Some(GeneratorConfig {
            url,
            model,
            timeout_ms: existing.map_or(DEFAULT_GENERATOR_TIMEOUT_MS, |g| g.timeout_ms),
        });
    } else if let (Some(model), Some(existing)) = (&generator.generator_model, config.generator.as_mut()) {
        existing.model = model.clone();
    }

    config.check().map_err(|e| e.to_string())?;
    Ok(config)
}

fn env_value(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.trim().is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn engine() -> EngineArgs {
        EngineArgs {
            config: None,
            lanes: None,
            base_delay_ms: None,
            max_delay_ms: None,
            jitter: None,
            strict_verification: false,
        }
    }

    fn no_generator() -> GeneratorArgs {
        GeneratorArgs {
            generator_url: None,
            generator_model: None,
        }
    }

    #[test]
    fn flags_override_file_values() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("engine.yaml");
        std::fs::write(&path, "lanes: 3\nretry:\n  base_delay_ms: 500\n").unwrap();

        let mut args = engine();
        args.config = Some(path);
        args.base_delay_ms = Some(10);
        args.strict_verification = true;
        let config = build_engine_config(&args, &no_generator()).unwrap();

        assert_eq!(config.lanes, 3);
        assert_eq!(config.retry.base_delay_ms, 10);
        assert!(config.verify.strict);
    }

    #[test]
    fn generator_url_flag_configures_backend() {
        let generator = GeneratorArgs {
            generator_url: Some("http://localhost:11434".to_string()),
            generator_model: None,
        };
        let config = build_engine_config(&engine(), &generator).unwrap();
        let backend = config.generator.expect("generator configured");
        assert_eq!(backend.model, DEFAULT_GENERATOR_MODEL);
        assert_eq!(backend.timeout_ms, DEFAULT_GENERATOR_TIMEOUT_MS);
    }

    #[test]
    fn invalid_overrides_are_rejected() {
        let mut args = engine();
        args.lanes = Some(0);
        assert!(build_engine_config(&args, &no_generator()).is_err());

        let generator = GeneratorArgs {
            generator_url: Some("not a url".to_string()),
            generator_model: None,
        };
        assert!(build_engine_config(&engine(), &generator).is_err());
    }
}
