use std::path::Path;
use std::sync::LazyLock;

use async_trait::async_trait;
use mender_core::Effect;
use regex::Regex;

use crate::attempt::{AttemptFailure, SetupFailureKind};
use crate::diagnosis::{
    AnalyzerError, AnalyzerReport, FailureAnalyzer, FailureClass, FailureContext, FixStrategy,
};

static PY_MODULE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"No module named ['"]?([A-Za-z0-9_.\-]+)['"]?"#).expect("valid regex")
});
static NODE_MODULE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"Cannot find module ['"]([^'"]+)['"]"#).expect("valid regex"));
static COMMAND_NOT_FOUND: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?m)(?:^|[\s:])([A-Za-z0-9_.\-/]+): (?:command )?not found").expect("valid regex")
});
static ZSH_COMMAND_NOT_FOUND: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"command not found: ([A-Za-z0-9_.\-/]+)").expect("valid regex")
});
static PERMISSION: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)permission denied|access is denied|EACCES|operation not permitted|read-only file system")
        .expect("valid regex")
});
static DISK_FULL: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)no space left on device|ENOSPC|disk quota exceeded").expect("valid regex")
});
static SYNTAX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"SyntaxError|IndentationError|TabError|syntax error").expect("valid regex")
});
static TRANSIENT: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)connection (?:refused|reset|timed out|aborted)|temporary failure in name resolution|network is unreachable|resource temporarily unavailable|too many requests|service unavailable|bad gateway|ETIMEDOUT|ECONNRESET|ECONNREFUSED|try again",
    )
    .expect("valid regex")
});
static BUSY: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)being used by another process|resource busy|text file busy|\block(?:ed)?\b")
        .expect("valid regex")
});

/// Pattern-based analyzer used when no model backend is configured.
#[derive(Debug, Clone, Copy, Default)]
pub struct RuleBasedAnalyzer;

#[async_trait]
impl FailureAnalyzer for RuleBasedAnalyzer {
    fn name(&self) -> &str {
        "rules"
    }

    async fn analyze(&self, context: &FailureContext) -> Result<AnalyzerReport, AnalyzerError> {
        Ok(analyze(context))
    }
}

fn analyze(ctx: &FailureContext) -> AnalyzerReport {
    let attempt = &ctx.attempt;
    let output = attempt.combined_output();

    match &attempt.failure {
        Some(AttemptFailure::Setup {
            program, reason, message,
        }) => {
            return match reason {
                SetupFailureKind::NotFound => missing_program(ctx, program),
                SetupFailureKind::PermissionDenied => denied(ctx, &format!("`{program}` is not executable")),
                SetupFailureKind::InvalidPayload => regenerate_or_manual(
                    ctx,
                    format!("payload could not be prepared: {message}"),
                    0.6,
                ),
                SetupFailureKind::Other => AnalyzerReport::new(FixStrategy::Manual, FailureClass::Permanent, 0.6)
                    .cause(format!("could not start `{program}`: {message}"), "check the execution environment"),
            };
        }
        Some(AttemptFailure::PreparationFailed { package, .. }) => {
            return AnalyzerReport::new(FixStrategy::Manual, FailureClass::Permanent, 0.8).cause(
                format!("installing `{package}` failed"),
                format!("install `{package}` manually and re-run"),
            );
        }
        Some(AttemptFailure::TimedOut { .. }) => {
            let doubled = ctx.step.timeout_seconds.saturating_mul(2).max(1);
            return AnalyzerReport::new(FixStrategy::AdjustParameters, FailureClass::Transient, 0.6)
                .cause(
                    format!("step exceeded its {} s timeout", ctx.step.timeout_seconds),
                    format!("allow {doubled} s"),
                )
                .parameter("timeout_seconds", doubled.to_string());
        }
        Some(AttemptFailure::Cancelled) => {
            return AnalyzerReport::new(FixStrategy::Manual, FailureClass::Unknown, 1.0)
                .cause("run was cancelled", "re-run the plan");
        }
        _ => {}
    }

    if let Some(program) = missing_command(&output) {
        return missing_program(ctx, &program);
    }
    if let Some(module) = PY_MODULE
        .captures(&output)
        .or_else(|| NODE_MODULE.captures(&output))
        .and_then(|c| c.get(1))
    {
        let package = package_root(module.as_str());
        return AnalyzerReport::new(FixStrategy::InstallDependency, FailureClass::MissingDependency, 0.85)
            .cause(
                format!("module `{}` is not installed", module.as_str()),
                format!("install `{package}`"),
            )
            .dependency(package);
    }
    if SYNTAX.is_match(&output) {
        return regenerate_or_manual(ctx, "payload contains a syntax error".to_string(), 0.8);
    }
    if DISK_FULL.is_match(&output) {
        return resource(ctx, "the target disk is full", "alt_path_");
    }
    if PERMISSION.is_match(&output) {
        return denied(ctx, "permission was denied");
    }
    if TRANSIENT.is_match(&output) {
        return AnalyzerReport::new(FixStrategy::AddRetryLogic, FailureClass::Transient, 0.7)
            .cause("a remote resource was temporarily unavailable", "retry with backoff");
    }
    if BUSY.is_match(&output) {
        return AnalyzerReport::new(FixStrategy::AddRetryLogic, FailureClass::Transient, 0.5)
            .cause("a resource was busy or locked", "retry after a short wait");
    }

    if ctx.verification_failed() {
        return verification_mismatch(ctx);
    }

    match &attempt.failure {
        Some(AttemptFailure::ExpectationNotMet { pattern }) => AnalyzerReport::new(
            FixStrategy::Regenerate,
            FailureClass::Unknown,
            0.4,
        )
        .cause(
            format!("output never matched `{pattern}`"),
            "regenerate the payload to produce the expected output",
        ),
        Some(failure) => AnalyzerReport::new(FixStrategy::Regenerate, FailureClass::Unknown, 0.3)
            .cause(failure.summary(), "regenerate the payload or try an alternative"),
        None => AnalyzerReport::new(FixStrategy::AdjustParameters, FailureClass::Unknown, 0.2)
            .cause("no failure evidence was captured", "try an alternative strategy"),
    }
}

fn missing_program(ctx: &FailureContext, program: &str) -> AnalyzerReport {
    let name = Path::new(program)
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| program.to_string());

    if ctx.installable.contains(&name) {
        return AnalyzerReport::new(FixStrategy::InstallDependency, FailureClass::MissingDependency, 0.9)
            .cause(format!("`{name}` is not installed"), format!("install `{name}`"))
            .dependency(name);
    }
    let launches = matches!(ctx.step.effect, Some(Effect::LaunchApplication { .. }));
    if launches && ctx.has_candidate("alt_app_") {
        return AnalyzerReport::new(FixStrategy::AdjustParameters, FailureClass::Resource, 0.7).cause(
            format!("application `{name}` is not available"),
            "launch an alternative application",
        );
    }
    AnalyzerReport::new(FixStrategy::Manual, FailureClass::Permanent, 0.9).cause(
        format!("`{name}` is not installed or not on PATH"),
        format!("verify that `{name}` is installed and on PATH"),
    )
}

fn denied(ctx: &FailureContext, cause: &str) -> AnalyzerReport {
    resource(ctx, cause, "alt_")
}

/// Resource problems are recoverable only while fallbacks remain.
fn resource(ctx: &FailureContext, cause: &str, candidate_prefix: &str) -> AnalyzerReport {
    if ctx.has_candidate(candidate_prefix) {
        AnalyzerReport::new(FixStrategy::AdjustParameters, FailureClass::Resource, 0.7)
            .cause(cause, "retry against an alternative target")
    } else {
        AnalyzerReport::new(FixStrategy::Manual, FailureClass::Permanent, 0.8)
            .cause(cause, "fix permissions or free space, then re-run")
    }
}

fn regenerate_or_manual(ctx: &FailureContext, cause: String, confidence: f64) -> AnalyzerReport {
    if ctx.generator_available {
        AnalyzerReport::new(FixStrategy::Regenerate, FailureClass::Unknown, confidence)
            .cause(cause, "regenerate the payload")
    } else {
        AnalyzerReport::new(FixStrategy::Manual, FailureClass::Permanent, confidence)
            .cause(cause, "correct the payload by hand")
    }
}

fn verification_mismatch(ctx: &FailureContext) -> AnalyzerReport {
    let verification = ctx.verification.as_ref();
    let message = verification
        .map(|v| v.message.clone())
        .unwrap_or_else(|| "effect was not observed".to_string());
    let environment = verification.is_some_and(|v| v.diagnostics.indicates_resource_problem());

    if environment {
        return resource(ctx, &format!("{message}; target is not writable or disk is full"), "alt_");
    }
    let report = AnalyzerReport::new(FixStrategy::AdjustParameters, FailureClass::VerificationMismatch, 0.6)
        .cause(
            format!("payload reported success but {message}"),
            "retry with an alternative strategy",
        );
    if ctx.fallback_candidates.is_empty() && ctx.generator_available {
        return AnalyzerReport {
            fix_strategy: FixStrategy::Regenerate.as_str().to_string(),
            suggested_fix: "regenerate the payload".to_string(),
            ..report
        };
    }
    report
}

fn missing_command(output: &str) -> Option<String> {
    ZSH_COMMAND_NOT_FOUND
        .captures(output)
        .or_else(|| COMMAND_NOT_FOUND.captures(output))
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().to_string())
}

/// `google.protobuf` installs as `google`; scoped npm packages keep their scope.
fn package_root(module: &str) -> String {
    if module.starts_with('@') {
        return module.splitn(3, '/').take(2).collect::<Vec<_>>().join("/");
    }
    module
        .split(['.', '/'])
        .next()
        .unwrap_or(module)
        .to_string()
}
