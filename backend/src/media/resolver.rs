use futures::StreamExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio::io::AsyncWriteExt;
use url::Url;
use uuid::Uuid;

use super::{
    ExtractError, FetchError, MediaFetcher, MediaReference, PlatformExtractor, ResolveError, ResolvedMedia,
    SizeLimit, SourceKind, display_name_from_url, sanitize_filename, upload_extension,
};

const WORKSPACE_PREFIX: &str = "dfvideo-";
const UNKNOWN_TITLE: &str = "Unknown Video";

#[derive(Debug, Clone)]
pub struct ResolverConfig {
    /// Parent directory for the per-request workspaces.
    pub work_dir: PathBuf,
    pub probe_timeout: Duration,
    /// Longest wait for the response head or for any single body chunk.
    pub fetch_timeout: Duration,
}

/// Turns a `MediaReference` into a local file inside a private workspace.
#[derive(Clone)]
pub struct MediaResolver {
    config: ResolverConfig,
    fetcher: Arc<dyn MediaFetcher>,
    extractor: Arc<dyn PlatformExtractor>,
}

impl MediaResolver {
    pub fn new(
        config: ResolverConfig,
        fetcher: Arc<dyn MediaFetcher>,
        extractor: Arc<dyn PlatformExtractor>,
    ) -> Self {
        Self {
            config,
            fetcher,
            extractor,
        }
    }

    pub async fn resolve(
        &self,
        reference: MediaReference,
        limit: SizeLimit,
    ) -> Result<ResolvedMedia, ResolveError> {
        let resolved = match reference {
            MediaReference::UploadedBytes { name, content } => {
                self.resolve_upload(&name, content, limit).await?
            }
            MediaReference::DirectUrl(url) => self.resolve_direct(&url, limit).await?,
            MediaReference::PlatformUrl(url) => self.resolve_platform(&url, limit).await?,
        };

        log::info!(
            "Resolved {:?} source '{}' ({} bytes) to {}",
            resolved.source_kind(),
            resolved.display_name(),
            resolved.byte_size(),
            resolved.local_path().display()
        );
        Ok(resolved)
    }

    /// Each request gets its own randomly named directory, so concurrent
    /// requests never share a path.
    async fn create_workspace(&self) -> Result<TempDir, ResolveError> {
        tokio::fs::create_dir_all(&self.config.work_dir).await?;
        let workspace = tempfile::Builder::new()
            .prefix(WORKSPACE_PREFIX)
            .tempdir_in(&self.config.work_dir)?;
        Ok(workspace)
    }

    async fn resolve_upload(
        &self,
        name: &str,
        content: Vec<u8>,
        limit: SizeLimit,
    ) -> Result<ResolvedMedia, ResolveError> {
        let ext = upload_extension(name)?;
        if content.is_empty() {
            return Err(ResolveError::SourceUnavailable {
                message: "Uploaded file is empty".to_string(),
                source: None,
            });
        }
        limit.check(content.len() as u64)?;

        let mut display_name = sanitize_filename(name);
        if display_name.is_empty() || upload_extension(&display_name).is_err() {
            display_name = format!("video.{}", ext);
        }

        let byte_size = content.len() as u64;
        let workspace = self.create_workspace().await?;
        let local_path = unique_path(workspace.path(), &display_name);
        tokio::fs::write(&local_path, content).await?;

        Ok(ResolvedMedia::new(
            workspace,
            local_path,
            display_name,
            byte_size,
            SourceKind::FileUpload,
        ))
    }

    async fn resolve_direct(
        &self,
        url: &Url,
        limit: SizeLimit,
    ) -> Result<ResolvedMedia, ResolveError> {
        let display_name = display_name_from_url(url);

        match self.fetcher.probe(url, self.config.probe_timeout).await {
            Ok(info) => {
                log::debug!(
                    "Probe for {}: length={:?} type={:?}",
                    url,
                    info.content_length,
                    info.content_type
                );
                if let Some(length) = info.content_length {
                    limit.check(length)?;
                }
            }
            Err(FetchError::Status(status @ (404 | 410))) => {
                return Err(ResolveError::unavailable(
                    format!("Failed to get video info: HTTP {}", status),
                    FetchError::Status(status),
                ));
            }
            Err(e) => {
                log::warn!("Metadata probe for {} failed, continuing without it: {}", url, e);
            }
        }

        let workspace = self.create_workspace().await?;
        let local_path = unique_path(workspace.path(), &sanitize_filename(&display_name));
        let written = self.download(url, &local_path, limit).await?;

        Ok(ResolvedMedia::new(
            workspace,
            local_path,
            display_name,
            written,
            SourceKind::DirectUrl,
        )
        .with_source_url(url))
    }

    /// Streams the body to `dest` chunk by chunk, enforcing the byte ceiling
    /// and a per-chunk stall timeout.
    async fn download(
        &self,
        url: &Url,
        dest: &Path,
        limit: SizeLimit,
    ) -> Result<u64, ResolveError> {
        let timeout = self.config.fetch_timeout;
        let mut stream = tokio::time::timeout(timeout, self.fetcher.fetch(url))
            .await
            .map_err(|_| {
                ResolveError::unavailable(
                    format!("Download of {} timed out", url),
                    FetchError::Timeout(timeout),
                )
            })?
            .map_err(|e| ResolveError::unavailable(format!("Failed to download video: {}", e), e))?;

        let mut file = tokio::fs::File::create(dest).await?;
        let mut written: u64 = 0;

        loop {
            let chunk = match tokio::time::timeout(timeout, stream.next()).await {
                Ok(Some(chunk)) => chunk.map_err(|e| {
                    ResolveError::unavailable(format!("Download interrupted: {}", e), e)
                })?,
                Ok(None) => break,
                Err(_) => {
                    return Err(ResolveError::unavailable(
                        format!("Download of {} stalled", url),
                        FetchError::Timeout(timeout),
                    ));
                }
            };

            written += chunk.len() as u64;
            limit.check(written).map_err(|_| ResolveError::SourceTooLarge {
                limit: limit.max_bytes(),
                size: None,
            })?;
            file.write_all(&chunk).await?;
        }
        file.flush().await?;

        if written == 0 {
            return Err(ResolveError::SourceUnavailable {
                message: format!("Empty response body from {}", url),
                source: None,
            });
        }
        Ok(written)
    }

    async fn resolve_platform(
        &self,
        url: &Url,
        limit: SizeLimit,
    ) -> Result<ResolvedMedia, ResolveError> {
        let workspace = self.create_workspace().await?;
        let extracted = match self.extractor.extract(url, workspace.path(), limit).await {
            Ok(extracted) => extracted,
            Err(ExtractError::TooLarge { limit, size }) => {
                return Err(ResolveError::SourceTooLarge { limit, size });
            }
            Err(e) => {
                return Err(ResolveError::unavailable(
                    format!("Failed to download video: {}", e),
                    e,
                ));
            }
        };

        let byte_size = match tokio::fs::metadata(&extracted.path).await {
            Ok(meta) if meta.is_file() => meta.len(),
            _ => {
                return Err(ResolveError::SourceUnavailable {
                    message: "Extractor reported success but no file was written".to_string(),
                    source: None,
                });
            }
        };
        if byte_size == 0 {
            return Err(ResolveError::SourceUnavailable {
                message: "Extractor produced an empty file".to_string(),
                source: None,
            });
        }
        limit.check(byte_size)?;

        let title = extracted
            .title
            .filter(|t| !t.trim().is_empty())
            .unwrap_or_else(|| UNKNOWN_TITLE.to_string());

        Ok(ResolvedMedia::new(
            workspace,
            extracted.path,
            title,
            byte_size,
            SourceKind::PlatformUrl,
        )
        .with_duration(extracted.duration_seconds)
        .with_source_url(url))
    }
}

fn unique_path(dir: &Path, name: &str) -> PathBuf {
    dir.join(format!("{}_{}", Uuid::new_v4(), name))
}
