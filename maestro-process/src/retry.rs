//! ABOUTME: Transient-failure classification and capped exponential backoff
//! ABOUTME: Retryable exit codes and message patterns are pinned in config

use rand::Rng;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::types::{ProcessState, ProcessStatus};

/// Retry configuration for managed processes
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Retry attempts after the first failure
    #[serde(rename = "maxRetries")]
    pub max_retries: u32,
    /// First backoff delay
    #[serde(rename = "baseDelayMs")]
    pub base_delay_ms: u64,
    /// Backoff ceiling
    #[serde(rename = "maxDelayMs")]
    pub max_delay_ms: u64,
    /// Exit codes treated as transient
    #[serde(rename = "transientExitCodes")]
    pub transient_exit_codes: Vec<i32>,
    /// Lowercased substrings of stderr/error messages treated as transient
    #[serde(rename = "transientPatterns")]
    pub transient_patterns: Vec<String>,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay_ms: 1_000,
            max_delay_ms: 30_000,
            // generic error, temporary failure, connection refused, timeout
            transient_exit_codes: vec![1, 75, 111, 124],
            transient_patterns: vec![
                "econnrefused".into(),
                "econnreset".into(),
                "etimedout".into(),
                "network".into(),
                "connection".into(),
                "rate limit".into(),
                "too many requests".into(),
                "429".into(),
                "500".into(),
                "502".into(),
                "503".into(),
                "timeout".into(),
                "temporarily unavailable".into(),
            ],
        }
    }
}

impl RetryConfig {
    /// Backoff for a given attempt: `base * 2^attempt + jitter`, capped
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exp = self
            .base_delay_ms
            .saturating_mul(2u64.saturating_pow(attempt));
        let capped = exp.min(self.max_delay_ms);
        let jitter = rand::thread_rng().gen_range(0..=self.base_delay_ms / 2);
        Duration::from_millis(capped.saturating_add(jitter).min(self.max_delay_ms))
    }

    /// Whether a terminal state should be retried
    pub fn is_transient(&self, state: &ProcessState) -> bool {
        match state.status {
            ProcessStatus::Timeout => return true,
            ProcessStatus::Failed => {}
            _ => return false,
        }

        if let Some(code) = state.exit_code {
            if self.transient_exit_codes.contains(&code) {
                return true;
            }
        }

        let haystack = format!(
            "{} {}",
            state.stderr.to_lowercase(),
            state.error.as_deref().unwrap_or("").to_lowercase()
        );
        self.transient_patterns
            .iter()
            .any(|pattern| haystack.contains(pattern))
    }
}
