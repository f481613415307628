pub mod extractor;
pub mod fetch;
pub mod resolver;

use lazy_static::lazy_static;
use shared::{FailureCategory, SourceType};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use tempfile::TempDir;
use url::Url;

pub use extractor::{ExtractError, ExtractedMedia, PlatformExtractor, YtDlpExtractor};
pub use fetch::{ByteStream, FetchError, MediaFetcher, ProbeInfo, ReqwestFetcher};
pub use resolver::{MediaResolver, ResolverConfig};

lazy_static! {
    static ref ALLOWED_EXTENSIONS: HashSet<&'static str> =
        ["mp4", "avi", "mov", "mkv", "wmv", "flv", "webm"].into_iter().collect();
}

const FALLBACK_FILENAME: &str = "video.mp4";

pub fn is_allowed_extension(ext: &str) -> bool {
    ALLOWED_EXTENSIONS.contains(ext.to_ascii_lowercase().as_str())
}

fn extension_of(name: &str) -> Option<&str> {
    name.rsplit_once('.').map(|(_, ext)| ext)
}

/// Input accepted by the analyzer, constructed once per request.
#[derive(Debug, Clone, PartialEq)]
pub enum MediaReference {
    UploadedBytes { name: String, content: Vec<u8> },
    DirectUrl(Url),
    PlatformUrl(Url),
}

impl MediaReference {
    /// Parses a user supplied URL and decides between a direct media link and
    /// a platform page. Only http(s) URLs are accepted.
    pub fn from_url(raw: &str) -> Result<Self, ResolveError> {
        let url = Url::parse(raw.trim()).map_err(|e| ResolveError::SourceUnavailable {
            message: format!("Invalid URL '{}': {}", raw, e),
            source: None,
        })?;
        if !matches!(url.scheme(), "http" | "https") {
            return Err(ResolveError::SourceUnavailable {
                message: format!("Unsupported URL scheme '{}'", url.scheme()),
                source: None,
            });
        }

        if is_direct_media_url(&url) {
            Ok(MediaReference::DirectUrl(url))
        } else {
            Ok(MediaReference::PlatformUrl(url))
        }
    }

    pub fn kind(&self) -> SourceKind {
        match self {
            MediaReference::UploadedBytes { .. } => SourceKind::FileUpload,
            MediaReference::DirectUrl(_) => SourceKind::DirectUrl,
            MediaReference::PlatformUrl(_) => SourceKind::PlatformUrl,
        }
    }

    pub fn url(&self) -> Option<&Url> {
        match self {
            MediaReference::UploadedBytes { .. } => None,
            MediaReference::DirectUrl(url) | MediaReference::PlatformUrl(url) => Some(url),
        }
    }
}

pub fn is_direct_media_url(url: &Url) -> bool {
    let path = url.path().to_ascii_lowercase();
    path.rsplit('/')
        .next()
        .and_then(extension_of)
        .is_some_and(is_allowed_extension)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceKind {
    FileUpload,
    DirectUrl,
    PlatformUrl,
}

impl SourceKind {
    pub fn source_type(&self) -> SourceType {
        match self {
            SourceKind::FileUpload => SourceType::FileUpload,
            SourceKind::DirectUrl | SourceKind::PlatformUrl => SourceType::UrlAnalysis,
        }
    }
}

/// Byte ceiling applied to every source.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SizeLimit {
    max_bytes: u64,
}

impl SizeLimit {
    pub fn bytes(max_bytes: u64) -> Self {
        Self { max_bytes }
    }

    pub fn megabytes(mb: u64) -> Self {
        Self::bytes(mb.saturating_mul(1024 * 1024))
    }

    pub fn max_bytes(&self) -> u64 {
        self.max_bytes
    }

    pub fn check(&self, size: u64) -> Result<(), ResolveError> {
        if size > self.max_bytes {
            return Err(ResolveError::SourceTooLarge {
                limit: self.max_bytes,
                size: Some(size),
            });
        }
        Ok(())
    }
}

/// A local, readable copy of the submitted media.
///
/// The file lives inside a private per-request directory that is removed when
/// the value is released or dropped.
#[derive(Debug)]
pub struct ResolvedMedia {
    local_path: PathBuf,
    display_name: String,
    byte_size: u64,
    duration_seconds: Option<f64>,
    source_kind: SourceKind,
    source_url: Option<String>,
    workspace: TempDir,
}

impl ResolvedMedia {
    pub fn new(
        workspace: TempDir,
        local_path: PathBuf,
        display_name: String,
        byte_size: u64,
        source_kind: SourceKind,
    ) -> Self {
        Self {
            local_path,
            display_name,
            byte_size,
            duration_seconds: None,
            source_kind,
            source_url: None,
            workspace,
        }
    }

    pub fn with_duration(mut self, duration_seconds: Option<f64>) -> Self {
        self.duration_seconds = duration_seconds;
        self
    }

    pub fn with_source_url(mut self, url: &Url) -> Self {
        self.source_url = Some(url.to_string());
        self
    }

    pub fn local_path(&self) -> &Path {
        &self.local_path
    }

    pub fn display_name(&self) -> &str {
        &self.display_name
    }

    pub fn byte_size(&self) -> u64 {
        self.byte_size
    }

    pub fn duration_seconds(&self) -> Option<f64> {
        self.duration_seconds
    }

    pub fn source_kind(&self) -> SourceKind {
        self.source_kind
    }

    pub fn source_url(&self) -> Option<&str> {
        self.source_url.as_deref()
    }

    pub fn workspace_path(&self) -> &Path {
        self.workspace.path()
    }

    /// Deletes the media file and its private directory.
    pub fn release(self) -> std::io::Result<()> {
        let dir = self.workspace.path().to_path_buf();
        self.workspace.close()?;
        log::debug!("Removed media workspace {}", dir.display());
        Ok(())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ResolveError {
    #[error("{message}")]
    SourceUnavailable {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },
    #[error("Unsupported file type '{0}'")]
    UnsupportedFormat(String),
    #[error("Source exceeds the size limit of {} MB", .limit / (1024 * 1024))]
    SourceTooLarge { limit: u64, size: Option<u64> },
    #[error("Failed to stage media locally: {0}")]
    Io(#[from] std::io::Error),
}

impl ResolveError {
    pub fn unavailable(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        ResolveError::SourceUnavailable {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    pub fn category(&self) -> FailureCategory {
        match self {
            ResolveError::SourceUnavailable { .. } | ResolveError::Io(_) => {
                FailureCategory::SourceUnavailable
            }
            ResolveError::UnsupportedFormat(_) => FailureCategory::UnsupportedFormat,
            ResolveError::SourceTooLarge { .. } => FailureCategory::SourceTooLarge,
        }
    }
}

/// Reduces an uploaded filename to a safe basename.
pub fn sanitize_filename(name: &str) -> String {
    let base = name.rsplit(['/', '\\']).next().unwrap_or_default();
    let cleaned: String = base
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_') {
                c
            } else {
                '_'
            }
        })
        .collect();
    cleaned.trim_start_matches('.').to_string()
}

/// Validates the extension of an uploaded file and returns it lowercased.
pub fn upload_extension(name: &str) -> Result<String, ResolveError> {
    match extension_of(name) {
        Some(ext) if is_allowed_extension(ext) => Ok(ext.to_ascii_lowercase()),
        Some(ext) => Err(ResolveError::UnsupportedFormat(ext.to_string())),
        None => Err(ResolveError::UnsupportedFormat(name.to_string())),
    }
}

/// Filename shown for a direct media link: the last path segment, decoded,
/// or a synthetic name when the URL does not carry one.
pub fn display_name_from_url(url: &Url) -> String {
    let segment = url
        .path_segments()
        .and_then(|mut segments| segments.next_back())
        .unwrap_or_default();
    let decoded = urlencoding::decode(segment)
        .map(|s| s.into_owned())
        .unwrap_or_else(|_| segment.to_string());

    if decoded.is_empty() || !decoded.contains('.') {
        FALLBACK_FILENAME.to_string()
    } else {
        decoded
    }
}

pub fn format_megabytes(bytes: u64) -> String {
    format!("{:.2} MB", bytes as f64 / (1024.0 * 1024.0))
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    #[test]
    fn direct_links_are_detected_by_path_extension() {
        let reference = MediaReference::from_url("https://cdn.example.com/clips/a.MP4?sig=abc").unwrap();
        assert_eq!(reference.kind(), SourceKind::DirectUrl);

        let reference = MediaReference::from_url("https://www.youtube.com/watch?v=abc.mp4").unwrap();
        assert_eq!(reference.kind(), SourceKind::PlatformUrl);

        let reference = MediaReference::from_url("https://vimeo.com/12345").unwrap();
        assert_eq!(reference.kind(), SourceKind::PlatformUrl);
    }

    #[test]
    fn non_http_urls_are_rejected() {
        assert_matches!(
            MediaReference::from_url("file:///etc/passwd.mp4"),
            Err(ResolveError::SourceUnavailable { .. })
        );
        assert_matches!(
            MediaReference::from_url("not a url"),
            Err(ResolveError::SourceUnavailable { .. })
        );
    }

    #[test]
    fn upload_extensions_follow_allow_list() {
        assert_eq!(upload_extension("clip.WebM").unwrap(), "webm");
        assert_matches!(upload_extension("notes.txt"), Err(ResolveError::UnsupportedFormat(ext)) if ext == "txt");
        assert_matches!(upload_extension("noextension"), Err(ResolveError::UnsupportedFormat(_)));
    }

    #[test]
    fn filenames_are_sanitized() {
        assert_eq!(sanitize_filename("../../etc/evil clip.mp4"), "evil_clip.mp4");
        assert_eq!(sanitize_filename("C:\\Users\\me\\video.mov"), "video.mov");
        assert_eq!(sanitize_filename("..hidden.mkv"), "hidden.mkv");
    }

    #[test]
    fn display_names_come_from_the_last_segment() {
        let url = Url::parse("https://example.com/media/My%20Clip.mp4?token=1").unwrap();
        assert_eq!(display_name_from_url(&url), "My Clip.mp4");

        let url = Url::parse("https://example.com/").unwrap();
        assert_eq!(display_name_from_url(&url), "video.mp4");
    }

    #[test]
    fn size_limit_rejects_oversize() {
        let limit = SizeLimit::megabytes(1);
        assert!(limit.check(1024 * 1024).is_ok());
        assert_matches!(
            limit.check(1024 * 1024 + 1),
            Err(ResolveError::SourceTooLarge { limit: 1_048_576, .. })
        );
    }

    #[test]
    fn huge_megabyte_limits_saturate() {
        assert_eq!(SizeLimit::megabytes(u64::MAX).max_bytes(), u64::MAX);
        assert!(SizeLimit::megabytes(u64::MAX).check(u64::MAX).is_ok());
    }

    #[test]
    fn megabytes_are_formatted_with_two_decimals() {
        assert_eq!(format_megabytes(5 * 1024 * 1024 + 512 * 1024), "5.50 MB");
    }
}
