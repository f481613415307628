use serde::Serialize;
use shared::{AnalysisResponse, ErrorResponse, FailureCategory, SourceType};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::config::AppConfig;
use crate::frames::{DecodeError, FfmpegDecoder, FrameSampler};
use crate::inference::{ClassificationResult, InferenceEngine, InferenceError, ModelHandle};
use crate::media::{
    FetchError, MediaReference, MediaResolver, ReqwestFetcher, ResolveError, ResolvedMedia,
    ResolverConfig, SizeLimit, SourceKind, YtDlpExtractor, format_megabytes,
};

const NO_FRAMES_MESSAGE: &str = "Could not extract frames from video";

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AnalysisFailure {
    pub category: FailureCategory,
    pub message: String,
}

impl AnalysisFailure {
    pub fn new(category: FailureCategory, message: impl Into<String>) -> Self {
        Self {
            category,
            message: message.into(),
        }
    }
}

impl From<ResolveError> for AnalysisFailure {
    fn from(err: ResolveError) -> Self {
        Self::new(err.category(), err.to_string())
    }
}

impl From<DecodeError> for AnalysisFailure {
    fn from(err: DecodeError) -> Self {
        Self::new(err.category(), err.to_string())
    }
}

impl From<InferenceError> for AnalysisFailure {
    fn from(err: InferenceError) -> Self {
        Self::new(err.category(), err.to_string())
    }
}

/// The parts of a resolved source kept for display.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SourceMetadata {
    pub display_name: String,
    pub byte_size: Option<u64>,
    pub duration_seconds: Option<f64>,
    pub source_type: SourceType,
    pub url: Option<String>,
}

impl SourceMetadata {
    fn from_media(media: &ResolvedMedia) -> Self {
        Self {
            display_name: media.display_name().to_string(),
            byte_size: Some(media.byte_size()).filter(|size| *size > 0),
            duration_seconds: media.duration_seconds(),
            source_type: media.source_kind().source_type(),
            url: media.source_url().map(str::to_string),
        }
    }

    /// Best-effort metadata for a request whose source never resolved.
    fn from_reference(reference: &MediaReference) -> Self {
        let display_name = match reference {
            MediaReference::UploadedBytes { name, .. } => name.clone(),
            MediaReference::DirectUrl(url) | MediaReference::PlatformUrl(url) => url.to_string(),
        };
        Self {
            display_name,
            byte_size: None,
            duration_seconds: None,
            source_type: reference.kind().source_type(),
            url: reference.url().map(|u| u.to_string()),
        }
    }

    pub fn formatted_size(&self) -> String {
        self.byte_size
            .map(format_megabytes)
            .unwrap_or_else(|| "Unknown".to_string())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AnalysisReport {
    pub outcome: Result<ClassificationResult, AnalysisFailure>,
    pub source: SourceMetadata,
    pub elapsed: Duration,
}

impl AnalysisReport {
    pub fn elapsed_seconds(&self) -> f64 {
        self.elapsed.as_secs_f64()
    }

    pub fn formatted_elapsed(&self) -> String {
        format!("{:.2} seconds", self.elapsed_seconds())
    }

    pub fn to_response(&self) -> Result<AnalysisResponse, ErrorResponse> {
        match &self.outcome {
            Ok(result) => Ok(AnalysisResponse {
                success: true,
                label: result.label,
                confidence: result.confidence,
                filename: self.source.display_name.clone(),
                url: self.source.url.clone(),
                source_type: self.source.source_type,
                file_size: self.source.formatted_size(),
                duration_seconds: self.source.duration_seconds,
                analysis_time: self.formatted_elapsed(),
            }),
            Err(failure) => Err(ErrorResponse {
                success: false,
                error: failure.message.clone(),
                category: Some(failure.category),
                analysis_time: Some(self.formatted_elapsed()),
            }),
        }
    }
}

/// Runs resolve → sample → classify for one request and always hands back a
/// report. Temporary media is released before returning.
#[derive(Clone)]
pub struct Analyzer {
    resolver: MediaResolver,
    sampler: Arc<FrameSampler>,
    engine: Arc<InferenceEngine>,
    default_limit: SizeLimit,
}

impl Analyzer {
    pub fn new(
        resolver: MediaResolver,
        sampler: FrameSampler,
        engine: InferenceEngine,
        default_limit: SizeLimit,
    ) -> Self {
        Self {
            resolver,
            sampler: Arc::new(sampler),
            engine: Arc::new(engine),
            default_limit,
        }
    }

    /// Wires the production collaborators (reqwest, yt-dlp, ffmpeg) from config.
    pub fn from_config(config: &AppConfig, model: ModelHandle) -> Result<Self, FetchError> {
        let media = &config.media;
        let fetcher = ReqwestFetcher::new(media.probe_timeout())?;
        let extractor = YtDlpExtractor::new(
            media.ytdlp_bin.clone(),
            media.ytdlp_format.clone(),
            media.extract_timeout(),
        )
        .with_socket_timeout(media.fetch_timeout());
        let resolver = MediaResolver::new(
            ResolverConfig {
                work_dir: media.work_dir.clone(),
                probe_timeout: media.probe_timeout(),
                fetch_timeout: media.fetch_timeout(),
            },
            Arc::new(fetcher),
            Arc::new(extractor),
        );

        let decoder = FfmpegDecoder::new(
            config.decoder.ffmpeg_bin.clone(),
            config.decoder.ffprobe_bin.clone(),
        );
        let sampler = FrameSampler::new(
            Arc::new(decoder),
            config.model.frame_count,
            config.model.frame_size,
            config.decoder.channel_order,
        );
        let engine = InferenceEngine::new(model, config.model.apply_softmax);

        Ok(Self::new(resolver, sampler, engine, media.size_limit()))
    }

    pub fn model_loaded(&self) -> bool {
        self.engine.is_available()
    }

    pub fn default_limit(&self) -> SizeLimit {
        self.default_limit
    }

    pub async fn analyze(&self, reference: MediaReference, limit: SizeLimit) -> AnalysisReport {
        let start = Instant::now();
        let kind = reference.kind();

        let (outcome, source) = if let Some(reason) = self.engine.unavailable_reason() {
            let failure = AnalysisFailure::from(InferenceError::ModelUnavailable(reason.to_string()));
            (Err(failure), SourceMetadata::from_reference(&reference))
        } else {
            let fallback = SourceMetadata::from_reference(&reference);
            match self.resolver.resolve(reference, limit).await {
                Ok(media) => {
                    let source = SourceMetadata::from_media(&media);
                    let outcome = self.classify_media(media.local_path().to_path_buf()).await;
                    release(media);
                    (outcome, source)
                }
                Err(err) => (Err(AnalysisFailure::from(err)), fallback),
            }
        };

        let report = AnalysisReport {
            outcome,
            source,
            elapsed: start.elapsed(),
        };
        log_report(kind, &report);
        report
    }

    /// Decoding and inference block, so they run on the blocking pool.
    async fn classify_media(&self, path: PathBuf) -> Result<ClassificationResult, AnalysisFailure> {
        let sampler = self.sampler.clone();
        let engine = self.engine.clone();

        let joined = tokio::task::spawn_blocking(move || {
            let batch = sampler
                .sample(&path)?
                .filter(|batch| !batch.is_empty())
                .ok_or_else(|| AnalysisFailure::new(FailureCategory::NoFramesExtracted, NO_FRAMES_MESSAGE))?;
            Ok::<_, AnalysisFailure>(engine.classify(&batch)?)
        })
        .await;

        match joined {
            Ok(outcome) => outcome,
            Err(e) => Err(AnalysisFailure::new(
                FailureCategory::InferenceFailure,
                format!("Analysis task failed: {}", e),
            )),
        }
    }
}

fn release(media: ResolvedMedia) {
    let dir = media.workspace_path().to_path_buf();
    if let Err(e) = media.release() {
        log::warn!("Failed to remove temporary media at {}: {}", dir.display(), e);
    }
}

fn log_report(kind: SourceKind, report: &AnalysisReport) {
    match &report.outcome {
        Ok(result) => log::info!(
            "Analyzed {:?} source '{}': {} ({:.4}) in {}",
            kind,
            report.source.display_name,
            result.label,
            result.confidence,
            report.formatted_elapsed()
        ),
        Err(failure) => log::error!(
            "Analysis of {:?} source '{}' failed [{}]: {}",
            kind,
            report.source.display_name,
            failure.category,
            failure.message
        ),
    }
}
