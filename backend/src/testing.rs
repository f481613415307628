//! In-memory stand-ins for the external capabilities used in unit tests.

use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use image::{Rgb, RgbImage};
use ndarray::ArrayView5;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use url::Url;

use crate::analysis::Analyzer;
use crate::frames::{ChannelOrder, DecodeError, FrameSampler, MediaDecoder, VideoStream};
use crate::inference::{FrameClassifier, InferenceEngine, InferenceError, ModelHandle};
use crate::media::{
    ByteStream, ExtractError, ExtractedMedia, FetchError, MediaFetcher, MediaResolver,
    PlatformExtractor, ProbeInfo, ResolverConfig, SizeLimit,
};

pub fn dir_is_empty(path: &Path) -> bool {
    std::fs::read_dir(path)
        .map(|mut entries| entries.next().is_none())
        .unwrap_or(true)
}

/// Writes an executable stand-in for yt-dlp. The script sees the `-o`
/// output template in `$out` and any `--socket-timeout` value in `$sock`
/// before `body` runs.
#[cfg(unix)]
pub fn fake_ytdlp(dir: &Path, body: &str) -> String {
    use std::os::unix::fs::PermissionsExt;

    let path = dir.join("yt-dlp");
    let script = format!(
        "#!/bin/sh\nout=\"\"\nsock=\"\"\nwhile [ $# -gt 0 ]; do\n  if [ \"$1\" = \"-o\" ]; then out=\"$2\"; fi\n  if [ \"$1\" = \"--socket-timeout\" ]; then sock=\"$2\"; fi\n  shift\ndone\n{}\n",
        body
    );
    std::fs::write(&path, script).unwrap();
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
    path.to_string_lossy().into_owned()
}

/// Analyzer over a 90-frame fake decoder with a 100 MB ceiling.
pub fn test_analyzer(work_dir: &Path, fetcher: StubFetcher, model: ModelHandle) -> Analyzer {
    test_analyzer_with_limit(work_dir, fetcher, model, SizeLimit::megabytes(100))
}

pub fn test_analyzer_with_limit(
    work_dir: &Path,
    fetcher: StubFetcher,
    model: ModelHandle,
    limit: SizeLimit,
) -> Analyzer {
    let resolver = MediaResolver::new(
        ResolverConfig {
            work_dir: work_dir.to_path_buf(),
            probe_timeout: Duration::from_secs(1),
            fetch_timeout: Duration::from_secs(1),
        },
        Arc::new(fetcher),
        Arc::new(StubExtractor::default()),
    );
    let sampler = FrameSampler::new(
        Arc::new(FakeDecoder::new(90, 64, 48)),
        10,
        32,
        ChannelOrder::Bgr,
    );
    Analyzer::new(
        resolver,
        sampler,
        InferenceEngine::new(model, false),
        limit,
    )
}

/// Decoder whose frame `i` is a solid `(i, 100, 200)` image.
#[derive(Debug, Clone)]
pub struct FakeDecoder {
    frame_count: u64,
    width: u32,
    height: u32,
    unopenable: bool,
    failing: HashSet<u64>,
}

impl FakeDecoder {
    pub fn new(frame_count: u64, width: u32, height: u32) -> Self {
        Self {
            frame_count,
            width,
            height,
            unopenable: false,
            failing: HashSet::new(),
        }
    }

    pub fn unopenable() -> Self {
        Self {
            unopenable: true,
            ..Self::new(0, 1, 1)
        }
    }

    pub fn failing_on(mut self, indices: impl IntoIterator<Item = u64>) -> Self {
        self.failing.extend(indices);
        self
    }
}

impl MediaDecoder for FakeDecoder {
    fn open(&self, path: &Path) -> Result<Box<dyn VideoStream>, DecodeError> {
        if self.unopenable {
            return Err(DecodeError::Open {
                path: path.to_path_buf(),
                reason: "moov atom not found".to_string(),
            });
        }
        Ok(Box::new(self.clone()))
    }
}

impl VideoStream for FakeDecoder {
    fn frame_count(&self) -> u64 {
        self.frame_count
    }

    fn decode_frame(&mut self, index: u64) -> Result<RgbImage, DecodeError> {
        if self.failing.contains(&index) || index >= self.frame_count {
            return Err(DecodeError::Frame {
                index,
                reason: "corrupt packet".to_string(),
            });
        }
        Ok(RgbImage::from_pixel(
            self.width,
            self.height,
            Rgb([index as u8, 100, 200]),
        ))
    }
}

enum ClassifierBehaviour {
    Scores(Vec<f32>),
    Fail(String),
}

pub struct StubClassifier {
    behaviour: ClassifierBehaviour,
    last_shape: Mutex<Option<Vec<usize>>>,
}

impl StubClassifier {
    pub fn returning(scores: Vec<f32>) -> Self {
        Self {
            behaviour: ClassifierBehaviour::Scores(scores),
            last_shape: Mutex::new(None),
        }
    }

    pub fn failing(message: &str) -> Self {
        Self {
            behaviour: ClassifierBehaviour::Fail(message.to_string()),
            last_shape: Mutex::new(None),
        }
    }

    pub fn last_shape(&self) -> Option<Vec<usize>> {
        self.last_shape.lock().unwrap().clone()
    }
}

impl FrameClassifier for StubClassifier {
    fn predict(&self, input: ArrayView5<'_, f32>) -> Result<Vec<f32>, InferenceError> {
        *self.last_shape.lock().unwrap() = Some(input.shape().to_vec());
        match &self.behaviour {
            ClassifierBehaviour::Scores(scores) => Ok(scores.clone()),
            ClassifierBehaviour::Fail(message) => Err(InferenceError::Failure(message.clone())),
        }
    }
}

/// Fetcher serving canned chunks. `probe_status`/`get_status` force an HTTP
/// error status; `stall_after_chunks` leaves the body hanging afterwards.
#[derive(Debug, Clone, Default)]
pub struct StubFetcher {
    pub probe_status: Option<u16>,
    pub get_status: Option<u16>,
    pub content_length: Option<u64>,
    pub chunks: Vec<Vec<u8>>,
    pub stall_after_chunks: bool,
}

impl StubFetcher {
    pub fn with_chunks(chunks: Vec<Vec<u8>>) -> Self {
        Self {
            chunks,
            ..Self::default()
        }
    }

    pub fn with_status(status: u16) -> Self {
        Self {
            probe_status: Some(status),
            get_status: Some(status),
            ..Self::default()
        }
    }
}

#[async_trait]
impl MediaFetcher for StubFetcher {
    async fn probe(&self, _url: &Url, _timeout: Duration) -> Result<ProbeInfo, FetchError> {
        if let Some(status) = self.probe_status {
            return Err(FetchError::Status(status));
        }
        Ok(ProbeInfo {
            content_length: self.content_length,
            content_type: Some("video/mp4".to_string()),
        })
    }

    async fn fetch(&self, _url: &Url) -> Result<ByteStream, FetchError> {
        if let Some(status) = self.get_status {
            return Err(FetchError::Status(status));
        }
        let chunks: Vec<Result<Bytes, FetchError>> = self
            .chunks
            .iter()
            .map(|c| Ok(Bytes::from(c.clone())))
            .collect();
        let body = futures::stream::iter(chunks);
        if self.stall_after_chunks {
            Ok(body.chain(futures::stream::pending()).boxed())
        } else {
            Ok(body.boxed())
        }
    }
}

#[derive(Debug, Clone)]
enum ExtractorBehaviour {
    Succeed {
        content: Vec<u8>,
        title: Option<String>,
        duration: Option<f64>,
    },
    Fail(String),
}

#[derive(Debug, Clone)]
pub struct StubExtractor {
    behaviour: ExtractorBehaviour,
}

impl Default for StubExtractor {
    fn default() -> Self {
        Self::failing("no extractor configured")
    }
}

impl StubExtractor {
    pub fn succeeding(content: &[u8], title: Option<&str>, duration: Option<f64>) -> Self {
        Self {
            behaviour: ExtractorBehaviour::Succeed {
                content: content.to_vec(),
                title: title.map(str::to_string),
                duration,
            },
        }
    }

    pub fn failing(stderr: &str) -> Self {
        Self {
            behaviour: ExtractorBehaviour::Fail(stderr.to_string()),
        }
    }
}

#[async_trait]
impl PlatformExtractor for StubExtractor {
    async fn extract(
        &self,
        _url: &Url,
        dest_dir: &Path,
        _limit: SizeLimit,
    ) -> Result<ExtractedMedia, ExtractError> {
        match &self.behaviour {
            ExtractorBehaviour::Succeed {
                content,
                title,
                duration,
            } => {
                let path: PathBuf = dest_dir.join("video.mp4");
                tokio::fs::write(&path, content).await?;
                Ok(ExtractedMedia {
                    path,
                    title: title.clone(),
                    duration_seconds: *duration,
                })
            }
            ExtractorBehaviour::Fail(stderr) => Err(ExtractError::ExecutionFailed {
                exit_code: Some(1),
                stderr: format!("ERROR: {}", stderr),
            }),
        }
    }
}
