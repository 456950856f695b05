use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;

#[derive(Parser, Clone, Debug, PartialEq)]
#[command(author, version)]
pub struct ConfigContext {
    #[arg(
        long = "data-dir",
        env = "QUESO_DATA_DIR",
        help = "Directory holding the persisted job tables",
        default_value = "data"
    )]
    pub data_dir: PathBuf,

    #[arg(
        long = "artifacts-root",
        env = "QUESO_ARTIFACTS",
        help = "Root directory for job output directories",
        default_value = "artifacts"
    )]
    pub artifacts_root: PathBuf,

    #[arg(
        long = "python",
        env = "PYTHON",
        help = "Python interpreter used for the analysis CLI and the worker",
        default_value = "python"
    )]
    pub python: String,

    #[arg(
        long = "ytdlp",
        env = "QUESO_YTDLP",
        help = "Media fetch tool used by download jobs",
        default_value = "yt-dlp"
    )]
    pub ytdlp: String,

    #[arg(
        long = "worker-module",
        env = "QUESO_WORKER_MODULE",
        help = "Python module run as the warm worker",
        default_value = "analysis.worker"
    )]
    pub worker_module: String,

    #[arg(
        long = "worker-port",
        env = "QUESO_WORKER_PORT",
        help = "Loopback port the worker listens on",
        default_value = "8765"
    )]
    pub worker_port: u16,

    #[arg(
        short = 'n',
        long = "max-active",
        help = "Number of Active Jobs in Parallel",
        default_value = "3"
    )]
    pub max_active: u16,

    #[arg(
        long = "flush-delay-ms",
        help = "Debounce window for job table writes",
        default_value = "600"
    )]
    pub flush_delay_ms: u64,

    #[arg(
        long = "download-ext",
        help = "Extension a download job must produce to count as done",
        default_value = "wav"
    )]
    pub download_ext: String,

    #[arg(
        long = "artifact-settle-ms",
        help = "How long to keep looking for an expected artifact after exit",
        default_value = "500"
    )]
    pub artifact_settle_ms: u64,

    #[arg(
        long = "meta-poll-ms",
        help = "How often a running analysis job's meta.json is read for progress",
        default_value = "500"
    )]
    pub meta_poll_ms: u64,

    #[arg(
        long = "jaeger-endpoint",
        env = "QUESO_JAEGER_ENDPOINT",
        help = "Jaeger collector endpoint; tracing export is off when unset"
    )]
    pub jaeger_endpoint: Option<String>,
}

impl ConfigContext {
    pub fn flush_delay(&self) -> Duration {
        Duration::from_millis(self.flush_delay_ms)
    }

    pub fn artifact_settle(&self) -> Duration {
        Duration::from_millis(self.artifact_settle_ms)
    }

    pub fn meta_poll(&self) -> Duration {
        Duration::from_millis(self.meta_poll_ms)
    }

    pub fn worker_url(&self) -> String {
        format!("http://127.0.0.1:{}", self.worker_port)
    }

    /// Defaults only, ignoring argv and the environment. Handy for embedding
    /// and tests.
    pub fn defaults() -> Self {
        ConfigContext {
            data_dir: PathBuf::from("data"),
            artifacts_root: PathBuf::from("artifacts"),
            python: "python".into(),
            ytdlp: "yt-dlp".into(),
            worker_module: "analysis.worker".into(),
            worker_port: 8765,
            max_active: 3,
            flush_delay_ms: 600,
            download_ext: "wav".into(),
            artifact_settle_ms: 500,
            meta_poll_ms: 500,
            jaeger_endpoint: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flags_override_defaults() {
        let config = ConfigContext::parse_from([
            "queso-jobs",
            "--data-dir",
            "/tmp/q",
            "--worker-port",
            "9000",
            "-n",
            "5",
        ]);
        assert_eq!(config.data_dir, PathBuf::from("/tmp/q"));
        assert_eq!(config.worker_port, 9000);
        assert_eq!(config.max_active, 5);
        assert_eq!(config.worker_url(), "http://127.0.0.1:9000");
        assert_eq!(config.flush_delay(), Duration::from_millis(600));
        assert_eq!(config.meta_poll(), Duration::from_millis(500));
    }
}
