//! Progress scraping from external tool output.
//!
//! Progress is advisory: a line that does not parse leaves the job's
//! progress where it was. Batch analysis also reports through a status
//! file in its output directory, read by [`MetaProgress`].

use std::path::Path;
use std::time::Duration;

use regex::Regex;
use serde::Deserialize;
use tracing::*;

/// Status file batch analysis keeps in its output directory.
pub const META_FILE: &str = "meta.json";

pub trait ProgressExtractor: Send + Sync {
    /// Percentage in `0.0..=100.0` found in `line`, if any.
    fn extract(&self, line: &str) -> Option<f32>;
}

/// Takes the last `NN%` / `NN.N%` figure on a line.
pub struct PercentProgress {
    pattern: Regex,
}

impl PercentProgress {
    pub fn new() -> Self {
        PercentProgress {
            pattern: Regex::new(r"(\d{1,3}(?:\.\d+)?)\s*%").expect("valid percent regex"),
        }
    }
}

impl Default for PercentProgress {
    fn default() -> Self {
        Self::new()
    }
}

impl ProgressExtractor for PercentProgress {
    fn extract(&self, line: &str) -> Option<f32> {
        let caps = self.pattern.captures_iter(line).last()?;
        let pct: f32 = caps[1].parse().ok()?;
        (0.0..=100.0).contains(&pct).then_some(pct)
    }
}

/// Only trusts `[download]` status lines of the media fetch tool, so titles
/// or other chatter containing a percent sign are ignored.
pub struct DownloadProgress {
    pattern: Regex,
}

impl DownloadProgress {
    pub fn new() -> Self {
        DownloadProgress {
            pattern: Regex::new(r"^\s*\[download\]\s+(\d{1,3}(?:\.\d+)?)%")
                .expect("valid download regex"),
        }
    }
}

impl Default for DownloadProgress {
    fn default() -> Self {
        Self::new()
    }
}

impl ProgressExtractor for DownloadProgress {
    fn extract(&self, line: &str) -> Option<f32> {
        let caps = self.pattern.captures(line)?;
        let pct: f32 = caps[1].parse().ok()?;
        (0.0..=100.0).contains(&pct).then_some(pct)
    }
}

/// What the tool last wrote about itself.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct MetaSnapshot {
    #[serde(default)]
    pub progress: Option<f32>,
    #[serde(default)]
    pub phase: Option<String>,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub error: Option<String>,
}

/// Polls a JSON status file while the job runs.
#[derive(Debug, Clone, PartialEq)]
pub struct MetaProgress {
    pub file_name: String,
    pub interval: Duration,
}

impl MetaProgress {
    pub fn new(interval: Duration) -> Self {
        MetaProgress {
            file_name: META_FILE.into(),
            interval,
        }
    }

    /// `None` when the file is missing or cannot be parsed yet.
    pub async fn read(&self, dir: &Path) -> Option<MetaSnapshot> {
        let path = dir.join(&self.file_name);
        let bytes = tokio::fs::read(&path).await.ok()?;
        // The tool rewrites the file in place; a read may catch it half written.
        let mut snapshot: MetaSnapshot = match serde_json::from_slice(&bytes) {
            Ok(snapshot) => snapshot,
            Err(err) => {
                trace!(path = %path.display(), error = %err, "Skipping unreadable meta file");
                return None;
            }
        };
        snapshot.progress = snapshot.progress.filter(|pct| (0.0..=100.0).contains(pct));
        snapshot.phase = snapshot.phase.filter(|phase| !phase.is_empty());
        Some(snapshot)
    }
}
