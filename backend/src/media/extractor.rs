use async_trait::async_trait;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;
use url::Url;

use super::SizeLimit;

const OUTPUT_STEM: &str = "video";

#[derive(Debug, thiserror::Error)]
pub enum ExtractError {
    #[error("extractor binary '{bin}' could not be started: {source}")]
    NotFound {
        bin: String,
        #[source]
        source: std::io::Error,
    },
    #[error("extractor failed (exit code {exit_code:?}): {stderr}")]
    ExecutionFailed {
        exit_code: Option<i32>,
        stderr: String,
    },
    #[error("extractor timed out after {0:?}")]
    Timeout(Duration),
    #[error("failed to parse extractor output: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("video exceeds the size limit of {} MB", .limit / (1024 * 1024))]
    TooLarge { limit: u64, size: Option<u64> },
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result of a platform download.
#[derive(Debug, Clone, PartialEq)]
pub struct ExtractedMedia {
    pub path: PathBuf,
    pub title: Option<String>,
    pub duration_seconds: Option<f64>,
}

#[async_trait]
pub trait PlatformExtractor: Send + Sync {
    /// Downloads the video behind `url` into `dest_dir`.
    async fn extract(
        &self,
        url: &Url,
        dest_dir: &Path,
        limit: SizeLimit,
    ) -> Result<ExtractedMedia, ExtractError>;
}

/// Subset of the `yt-dlp -j` info document.
#[derive(Debug, Deserialize)]
struct YtDlpInfo {
    title: Option<String>,
    duration: Option<f64>,
    filesize: Option<u64>,
    filesize_approx: Option<f64>,
}

impl YtDlpInfo {
    fn reported_size(&self) -> Option<u64> {
        self.filesize
            .or_else(|| self.filesize_approx.map(|size| size as u64))
    }
}

#[derive(Debug, Clone)]
pub struct YtDlpExtractor {
    bin: String,
    format: String,
    timeout: Duration,
    socket_timeout: Option<Duration>,
}

impl YtDlpExtractor {
    pub fn new(bin: impl Into<String>, format: impl Into<String>, timeout: Duration) -> Self {
        Self {
            bin: bin.into(),
            format: format.into(),
            timeout,
            socket_timeout: None,
        }
    }

    /// Passed to yt-dlp as `--socket-timeout` so a stalled stream fails
    /// long before the overall extraction timeout.
    pub fn with_socket_timeout(mut self, socket_timeout: Duration) -> Self {
        self.socket_timeout = Some(socket_timeout);
        self
    }
}

#[async_trait]
impl PlatformExtractor for YtDlpExtractor {
    async fn extract(
        &self,
        url: &Url,
        dest_dir: &Path,
        limit: SizeLimit,
    ) -> Result<ExtractedMedia, ExtractError> {
        let template = dest_dir.join(format!("{}.%(ext)s", OUTPUT_STEM));
        log::debug!("Running {} for {}", self.bin, url);

        let mut command = Command::new(&self.bin);
        command
            .args(["--no-playlist", "--no-warnings", "--quiet", "--no-progress"])
            .args(["-f", self.format.as_str()])
            .args(["--max-filesize", limit.max_bytes().to_string().as_str()]);
        if let Some(socket_timeout) = self.socket_timeout {
            command.args([
                "--socket-timeout",
                socket_timeout.as_secs().max(1).to_string().as_str(),
            ]);
        }

        let child = command
            .args(["-j", "--no-simulate"])
            .arg("-o")
            .arg(&template)
            .arg(url.as_str())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| ExtractError::NotFound {
                bin: self.bin.clone(),
                source,
            })?;

        let output = tokio::time::timeout(self.timeout, child.wait_with_output())
            .await
            .map_err(|_| ExtractError::Timeout(self.timeout))??;

        if !output.status.success() {
            return Err(ExtractError::ExecutionFailed {
                exit_code: output.status.code(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }

        let info = parse_info(&output.stdout)?;
        // yt-dlp exits 0 without writing anything when --max-filesize skips
        // the download.
        let Some(path) = find_output(dest_dir).await? else {
            log::warn!(
                "{} skipped {}: over {} bytes (reported size {:?})",
                self.bin,
                url,
                limit.max_bytes(),
                info.reported_size()
            );
            return Err(ExtractError::TooLarge {
                limit: limit.max_bytes(),
                size: info.reported_size(),
            });
        };

        Ok(ExtractedMedia {
            path,
            title: info.title,
            duration_seconds: info.duration,
        })
    }
}

/// `-j` prints one JSON document per line; the last one describes the
/// downloaded entry.
fn parse_info(stdout: &[u8]) -> Result<YtDlpInfo, ExtractError> {
    let stdout = String::from_utf8_lossy(stdout);
    let line = stdout
        .lines()
        .rev()
        .find(|line| !line.trim().is_empty())
        .unwrap_or("{}");
    Ok(serde_json::from_str(line)?)
}

async fn find_output(dest_dir: &Path) -> Result<Option<PathBuf>, ExtractError> {
    let mut entries = tokio::fs::read_dir(dest_dir).await?;
    while let Some(entry) = entries.next_entry().await? {
        let path = entry.path();
        let is_final = path
            .file_stem()
            .is_some_and(|stem| stem == OUTPUT_STEM)
            && path.extension().is_some_and(|ext| ext != "part" && ext != "ytdl");
        if is_final && entry.file_type().await?.is_file() {
            return Ok(Some(path));
        }
    }
    Ok(None)
}
