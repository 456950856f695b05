use std::fmt;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub mod api;
pub mod config;
pub mod error;
pub mod flush;
pub mod logbuf;
pub mod profile;
pub mod progress;
pub mod runner;
pub mod store;
pub mod supervisor;
pub mod telemetry;
pub mod worker;

pub use error::{Error, ErrorBody, ErrorKind};

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Which external tool backs a job, and where it writes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum JobKind {
    BatchAnalysis,
    MediaDownload,
}

impl JobKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobKind::BatchAnalysis => "batch-analysis",
            JobKind::MediaDownload => "media-download",
        }
    }
}

impl fmt::Display for JobKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for JobKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "batch-analysis" => Ok(JobKind::BatchAnalysis),
            "media-download" => Ok(JobKind::MediaDownload),
            other => Err(Error::InvalidInput(format!("unknown job kind '{other}'"))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    Queued,
    Running,
    Done,
    Failed,
    Interrupted,
}

impl Status {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Status::Done | Status::Failed | Status::Interrupted)
    }

    /// Whether a live transition from `self` to `next` is allowed.
    /// `Interrupted` is only ever assigned by recovery, never here.
    pub fn can_become(&self, next: Status) -> bool {
        use Status::*;
        matches!(
            (self, next),
            (Queued, Running) | (Queued, Failed) | (Running, Running) | (Running, Done) | (Running, Failed)
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Status::Queued => "queued",
            Status::Running => "running",
            Status::Done => "done",
            Status::Failed => "failed",
            Status::Interrupted => "interrupted",
        }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Descriptive record of one unit of external work. Only these fields are
/// ever persisted; live process handles are kept elsewhere.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Job {
    pub job_id: Uuid,
    pub kind: JobKind,
    pub status: Status,
    pub progress: f32,
    /// Stage name the tool last reported, when it reports one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phase: Option<String>,
    pub slug: String,
    pub input: String,
    pub output_dir: PathBuf,
    pub log_file: PathBuf,
    pub started: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ended: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub artifact: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// A request to create a job, as handed over by the outer request layer.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct JobRequest {
    /// Source path (analysis) or URL (download).
    pub input: Option<String>,
    #[serde(default)]
    pub slug: Option<String>,
    /// Opaque options passed through to the external tool.
    #[serde(default)]
    pub opts: serde_json::Value,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreatedJob {
    pub job_id: Uuid,
    pub slug: String,
}

/// The fields a single transition may touch. `None` leaves a field as is.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct JobUpdate {
    pub status: Option<Status>,
    pub progress: Option<f32>,
    pub phase: Option<String>,
    pub artifact: Option<PathBuf>,
    pub exit_code: Option<i32>,
    pub error: Option<String>,
}

impl JobUpdate {
    pub fn status(status: Status) -> Self {
        JobUpdate {
            status: Some(status),
            ..Default::default()
        }
    }

    pub fn progress(pct: f32) -> Self {
        JobUpdate {
            progress: Some(pct),
            ..Default::default()
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        JobUpdate {
            status: Some(Status::Failed),
            error: Some(error.into()),
            ..Default::default()
        }
    }

    pub fn with_exit_code(mut self, code: Option<i32>) -> Self {
        self.exit_code = code;
        self
    }

    pub fn with_artifact(mut self, artifact: Option<PathBuf>) -> Self {
        self.artifact = artifact;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lifecycle_only_moves_forward() {
        assert!(Status::Queued.can_become(Status::Running));
        assert!(Status::Queued.can_become(Status::Failed));
        assert!(Status::Running.can_become(Status::Done));
        assert!(!Status::Queued.can_become(Status::Done));
        assert!(!Status::Done.can_become(Status::Running));
        assert!(!Status::Failed.can_become(Status::Done));
        assert!(!Status::Running.can_become(Status::Interrupted));
        assert!(!Status::Interrupted.can_become(Status::Running));
    }

    #[test]
    fn kind_and_status_wire_names() {
        assert_eq!(
            serde_json::to_string(&JobKind::BatchAnalysis).unwrap(),
            "\"batch-analysis\""
        );
        assert_eq!(serde_json::to_string(&Status::Interrupted).unwrap(), "\"interrupted\"");
        assert_eq!("media-download".parse::<JobKind>().unwrap(), JobKind::MediaDownload);
        assert!("ffmpeg".parse::<JobKind>().is_err());
    }
}
