//! Server configuration, read once from the environment at startup

use crate::llm::LlmConfig;
use crate::state_machine::DEFAULT_MAX_LLM_ATTEMPTS;
use std::path::PathBuf;
use std::time::Duration;

const DEFAULT_PORT: u16 = 8000;

/// How often the expiry sweeper looks for stale approvals
const MAX_SWEEP_INTERVAL: Duration = Duration::from_secs(60);

#[derive(Debug, Clone)]
pub struct Config {
    pub db_path: PathBuf,
    pub port: u16,
    pub max_llm_attempts: u32,
    /// `None` means pending approvals never expire
    pub approval_timeout: Option<Duration>,
    pub llm: LlmConfig,
}

impl Config {
    pub fn from_env() -> Self {
        let db_path = std::env::var("TURNSTILE_DB_PATH").map_or_else(
            |_| {
                let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
                PathBuf::from(home).join(".turnstile").join("turnstile.db")
            },
            PathBuf::from,
        );

        Self {
            db_path,
            port: parse_var("TURNSTILE_PORT").unwrap_or(DEFAULT_PORT),
            max_llm_attempts: parse_var("TURNSTILE_MAX_LLM_ATTEMPTS")
                .filter(|n| *n > 0)
                .unwrap_or(DEFAULT_MAX_LLM_ATTEMPTS),
            approval_timeout: parse_var("TURNSTILE_APPROVAL_TIMEOUT_SECS").map(Duration::from_secs),
            llm: LlmConfig::from_env(),
        }
    }

    /// Sweep period for a given approval timeout
    pub fn sweep_interval(timeout: Duration) -> Duration {
        (timeout / 2).clamp(Duration::from_secs(1), MAX_SWEEP_INTERVAL)
    }
}

fn parse_var<T: std::str::FromStr>(name: &str) -> Option<T> {
    std::env::var(name).ok().and_then(|v| v.trim().parse().ok())
}
