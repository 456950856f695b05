//! Per-kind launch profiles.
//!
//! A [`JobProfile`] bundles how a kind's process is built, how its
//! progress is read, where it writes and what counts as its output. The
//! supervisor's state machine is the same for every kind.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use crate::config::ConfigContext;
use crate::progress::{DownloadProgress, MetaProgress, PercentProgress, ProgressExtractor, META_FILE};
use crate::runner::CommandSpec;
use crate::{Job, JobKind};

const SETTLE_ATTEMPTS: u32 = 5;

pub trait CommandTemplate: Send + Sync {
    fn command(&self, job: &Job, opts: &serde_json::Value) -> CommandSpec;
}

/// `python -m analysis.cli --input .. --out .. --opts ..`
pub struct AnalysisCommand {
    pub python: String,
}

impl CommandTemplate for AnalysisCommand {
    fn command(&self, job: &Job, opts: &serde_json::Value) -> CommandSpec {
        let opts = if opts.is_null() {
            "{}".to_string()
        } else {
            opts.to_string()
        };
        CommandSpec::new(&self.python)
            .args(["-m", "analysis.cli", "--input", job.input.as_str(), "--out"])
            .arg(job.output_dir.to_string_lossy())
            .args(["--opts", opts.as_str()])
            .env("PYTHONUNBUFFERED", "1")
    }
}

/// Audio extraction through the media fetch tool, one progress line per
/// update.
pub struct DownloadCommand {
    pub program: String,
    pub extension: String,
}

impl CommandTemplate for DownloadCommand {
    fn command(&self, job: &Job, _opts: &serde_json::Value) -> CommandSpec {
        let template = job.output_dir.join("%(title)s.%(ext)s");
        CommandSpec::new(&self.program)
            .args(["--newline", "-x", "--audio-format", self.extension.as_str(), "-o"])
            .arg(template.to_string_lossy())
            .arg(&job.input)
    }
}

/// What a successful run is expected to leave in its output directory.
#[derive(Debug, Clone, PartialEq)]
pub struct ArtifactRule {
    pub extension: String,
    /// When set, a zero exit without a matching file is a failure.
    pub required: bool,
    /// File names that carry the extension but are never the output.
    pub ignore: Vec<String>,
}

impl ArtifactRule {
    pub fn required(extension: impl Into<String>) -> Self {
        ArtifactRule {
            extension: extension.into(),
            required: true,
            ignore: vec![],
        }
    }

    pub fn optional(extension: impl Into<String>) -> Self {
        ArtifactRule {
            extension: extension.into(),
            required: false,
            ignore: vec![],
        }
    }

    pub fn ignoring(mut self, file_name: impl Into<String>) -> Self {
        self.ignore.push(file_name.into());
        self
    }

    fn matches(&self, path: &Path) -> bool {
        let ignored = path
            .file_name()
            .and_then(|name| name.to_str())
            .is_some_and(|name| self.ignore.iter().any(|i| i.eq_ignore_ascii_case(name)));
        !ignored
            && path
                .extension()
                .and_then(|ext| ext.to_str())
                .is_some_and(|ext| ext.eq_ignore_ascii_case(&self.extension))
    }

    /// First matching regular file in `dir`, by file name.
    pub async fn find(&self, dir: &Path) -> std::io::Result<Option<PathBuf>> {
        let mut entries = tokio::fs::read_dir(dir).await?;
        let mut found = vec![];
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if self.matches(&path) && entry.file_type().await?.is_file() {
                found.push(path);
            }
        }
        found.sort();
        Ok(found.into_iter().next())
    }

    /// Look for a match repeatedly across `window`, so a file that is
    /// still being flushed when the process exits is not missed.
    pub async fn settle(&self, dir: &Path, window: Duration) -> std::io::Result<Option<PathBuf>> {
        let pause = window / (SETTLE_ATTEMPTS - 1);
        for attempt in 0..SETTLE_ATTEMPTS {
            if let Some(found) = self.find(dir).await? {
                return Ok(Some(found));
            }
            if pause.is_zero() {
                break;
            }
            if attempt + 1 < SETTLE_ATTEMPTS {
                tokio::time::sleep(pause).await;
            }
        }
        Ok(None)
    }
}

#[derive(Clone)]
pub struct JobProfile {
    pub template: Arc<dyn CommandTemplate>,
    pub progress: Arc<dyn ProgressExtractor>,
    pub artifact: ArtifactRule,
    /// Status file the tool keeps up to date in its output directory.
    pub meta: Option<MetaProgress>,
    /// Directory under the artifacts root that holds this kind's slugs.
    pub subdir: Option<String>,
}

impl JobProfile {
    pub fn output_dir(&self, artifacts_root: &Path, slug: &str) -> PathBuf {
        match &self.subdir {
            Some(subdir) => artifacts_root.join(subdir).join(slug),
            None => artifacts_root.join(slug),
        }
    }
}

#[derive(Clone)]
pub struct Profiles {
    analysis: JobProfile,
    download: JobProfile,
}

impl Profiles {
    pub fn from_config(config: &ConfigContext) -> Self {
        Profiles {
            analysis: JobProfile {
                template: Arc::new(AnalysisCommand {
                    python: config.python.clone(),
                }),
                progress: Arc::new(PercentProgress::new()),
                artifact: ArtifactRule::optional("json").ignoring(META_FILE),
                meta: Some(MetaProgress::new(config.meta_poll())),
                subdir: None,
            },
            download: JobProfile {
                template: Arc::new(DownloadCommand {
                    program: config.ytdlp.clone(),
                    extension: config.download_ext.clone(),
                }),
                progress: Arc::new(DownloadProgress::new()),
                artifact: ArtifactRule::required(&config.download_ext),
                meta: None,
                subdir: Some("media".into()),
            },
        }
    }

    pub fn get(&self, kind: JobKind) -> &JobProfile {
        match kind {
            JobKind::BatchAnalysis => &self.analysis,
            JobKind::MediaDownload => &self.download,
        }
    }

    pub fn with_template(mut self, kind: JobKind, template: Arc<dyn CommandTemplate>) -> Self {
        match kind {
            JobKind::BatchAnalysis => self.analysis.template = template,
            JobKind::MediaDownload => self.download.template = template,
        }
        self
    }
}
