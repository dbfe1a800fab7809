//! Explorer configuration types
//!
//! Tuning for the fetch pipeline: how many parts the first window covers,
//! how window changes are debounced, and how part fetches are supervised.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Configuration for the fetch pipeline
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExplorerConfig {
    /// Number of parts in the window after a route or DBC is loaded
    #[serde(default = "default_initial_span")]
    pub initial_span: u32,

    /// Trailing debounce applied to window change requests
    #[serde(default = "default_debounce_ms")]
    pub debounce_ms: u64,

    /// Time allowed for one part fetch-decode attempt
    #[serde(default = "default_part_timeout_ms")]
    pub part_timeout_ms: u64,

    /// Retries of the same part before the chain is abandoned
    #[serde(default = "default_max_part_retries")]
    pub max_part_retries: u32,

    /// Backoff between retries, multiplied by the attempt number
    #[serde(default = "default_retry_backoff_ms")]
    pub retry_backoff_ms: u64,

    /// File name of a part's CAN segment under `{base}/{part}/`
    #[serde(default = "default_segment_file")]
    pub segment_file: String,
}

fn default_initial_span() -> u32 {
    3
}

fn default_debounce_ms() -> u64 {
    500
}

fn default_part_timeout_ms() -> u64 {
    30_000
}

fn default_max_part_retries() -> u32 {
    2
}

fn default_retry_backoff_ms() -> u64 {
    250
}

fn default_segment_file() -> String {
    "can.bin".to_string()
}

impl Default for ExplorerConfig {
    fn default() -> Self {
        Self {
            initial_span: default_initial_span(),
            debounce_ms: default_debounce_ms(),
            part_timeout_ms: default_part_timeout_ms(),
            max_part_retries: default_max_part_retries(),
            retry_backoff_ms: default_retry_backoff_ms(),
            segment_file: default_segment_file(),
        }
    }
}

impl ExplorerConfig {
    /// Create a new configuration with default settings
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder method: set the initial window span in parts
    pub fn with_initial_span(mut self, parts: u32) -> Self {
        self.initial_span = parts.max(1);
        self
    }

    /// Builder method: set the window change debounce
    pub fn with_debounce(mut self, debounce: Duration) -> Self {
        self.debounce_ms = debounce.as_millis() as u64;
        self
    }

    /// Builder method: set the per-attempt part timeout
    pub fn with_part_timeout(mut self, timeout: Duration) -> Self {
        self.part_timeout_ms = timeout.as_millis() as u64;
        self
    }

    /// Builder method: set retry count and backoff
    pub fn with_retries(mut self, max_retries: u32, backoff: Duration) -> Self {
        self.max_part_retries = max_retries;
        self.retry_backoff_ms = backoff.as_millis() as u64;
        self
    }

    /// Builder method: set the segment file name
    pub fn with_segment_file(mut self, name: impl Into<String>) -> Self {
        self.segment_file = name.into();
        self
    }

    pub fn debounce(&self) -> Duration {
        Duration::from_millis(self.debounce_ms)
    }

    pub fn part_timeout(&self) -> Duration {
        Duration::from_millis(self.part_timeout_ms)
    }

    /// Backoff before retry number `attempt` (1-based)
    pub fn retry_backoff(&self, attempt: u32) -> Duration {
        Duration::from_millis(self.retry_backoff_ms.saturating_mul(attempt as u64))
    }
}
