mod config;
mod decision;

pub use config::{Jitter, RetryConfig};
pub use decision::{backoff_delay, wait_backoff, NextStrategy, RetryController, RetryDecision, StopReason, Verdict};
