//! Part sources
//!
//! A `PartSource` retrieves the raw segment bytes of one part of a route.
//! Sources are blocking and are only called from worker threads.

use crate::types::{ExplorerError, Result};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Mutex;
use std::time::Duration;

/// Retrieves raw segment bytes for a part of a route
pub trait PartSource: Send + Sync {
    /// Fetch the segment of `part` under the route's base location
    fn fetch(&self, base: &str, part: u32) -> Result<Vec<u8>>;
}

/// Reads parts from `{base}/{part}/{segment_file}` on the local filesystem
#[derive(Debug, Clone)]
pub struct FsPartSource {
    segment_file: String,
}

impl FsPartSource {
    pub fn new(segment_file: impl Into<String>) -> Self {
        Self { segment_file: segment_file.into() }
    }

    fn path(&self, base: &str, part: u32) -> PathBuf {
        PathBuf::from(base).join(part.to_string()).join(&self.segment_file)
    }
}

impl PartSource for FsPartSource {
    fn fetch(&self, base: &str, part: u32) -> Result<Vec<u8>> {
        let path = self.path(base, part);
        log::debug!("Reading part {} from {:?}", part, path);
        std::fs::read(&path).map_err(|e| ExplorerError::FetchError {
            base: base.to_string(),
            part,
            reason: format!("{:?}: {}", path, e),
        })
    }
}

/// Fetches parts over HTTP from `{base}/{part}/{segment_file}`
#[derive(Debug, Clone)]
pub struct HttpPartSource {
    segment_file: String,
    timeout: Duration,
}

impl HttpPartSource {
    pub fn new(segment_file: impl Into<String>, timeout: Duration) -> Self {
        Self { segment_file: segment_file.into(), timeout }
    }

    fn url(&self, base: &str, part: u32) -> String {
        format!("{}/{}/{}", base.trim_end_matches('/'), part, self.segment_file)
    }
}

impl PartSource for HttpPartSource {
    fn fetch(&self, base: &str, part: u32) -> Result<Vec<u8>> {
        let url = self.url(base, part);
        let fetch_error = |reason: String| ExplorerError::FetchError {
            base: base.to_string(),
            part,
            reason,
        };

        log::debug!("GET {}", url);

        // The blocking client owns a runtime, so it is built and dropped on
        // the worker thread rather than stored in the source.
        let client = reqwest::blocking::Client::builder()
            .timeout(self.timeout)
            .build()
            .map_err(|e| fetch_error(e.to_string()))?;

        let response = client
            .get(&url)
            .send()
            .and_then(|r| r.error_for_status())
            .map_err(|e| fetch_error(e.to_string()))?;

        let bytes = response.bytes().map_err(|e| fetch_error(e.to_string()))?;
        Ok(bytes.to_vec())
    }
}

/// In-memory parts, with optional injected latency and failures
#[derive(Debug, Default)]
pub struct MemoryPartSource {
    parts: HashMap<u32, Vec<u8>>,
    delays: HashMap<u32, Duration>,
    failures: Mutex<HashMap<u32, u32>>,
    fetches: Mutex<HashMap<u32, u32>>,
}

impl MemoryPartSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_part(mut self, part: u32, bytes: Vec<u8>) -> Self {
        self.parts.insert(part, bytes);
        self
    }

    /// Delay every fetch of `part`
    pub fn with_delay(mut self, part: u32, delay: Duration) -> Self {
        self.delays.insert(part, delay);
        self
    }

    /// Fail the first `times` fetches of `part`
    pub fn failing(self, part: u32, times: u32) -> Self {
        if let Ok(mut failures) = self.failures.lock() {
            failures.insert(part, times);
        }
        self
    }

    /// Number of fetches issued for `part` so far
    pub fn fetch_count(&self, part: u32) -> u32 {
        self.fetches
            .lock()
            .map(|f| f.get(&part).copied().unwrap_or(0))
            .unwrap_or(0)
    }
}

impl PartSource for MemoryPartSource {
    fn fetch(&self, base: &str, part: u32) -> Result<Vec<u8>> {
        if let Ok(mut fetches) = self.fetches.lock() {
            *fetches.entry(part).or_insert(0) += 1;
        }

        if let Some(delay) = self.delays.get(&part) {
            std::thread::sleep(*delay);
        }

        let failing = self
            .failures
            .lock()
            .map(|mut failures| match failures.get_mut(&part) {
                Some(left) if *left > 0 => {
                    *left -= 1;
                    true
                }
                _ => false,
            })
            .unwrap_or(false);

        if failing {
            return Err(ExplorerError::FetchError {
                base: base.to_string(),
                part,
                reason: "injected failure".to_string(),
            });
        }

        self.parts.get(&part).cloned().ok_or_else(|| ExplorerError::FetchError {
            base: base.to_string(),
            part,
            reason: "no such part".to_string(),
        })
    }
}
