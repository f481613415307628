pub mod ffmpeg;

use image::RgbImage;
use image::imageops::{self, FilterType};
use ndarray::{Array4, Array5, ArrayView4, Axis};
use serde::{Deserialize, Serialize};
use shared::FailureCategory;
use std::path::{Path, PathBuf};
use std::sync::Arc;

pub use ffmpeg::FfmpegDecoder;

/// Resize policy shared by every frame.
const RESIZE_FILTER: FilterType = FilterType::Triangle;

#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    #[error("Could not open video {path}: {reason}")]
    Open { path: PathBuf, reason: String },
    #[error("Decoder binary '{bin}' could not be started: {source}")]
    NotFound {
        bin: String,
        #[source]
        source: std::io::Error,
    },
    #[error("Frame {index} could not be decoded: {reason}")]
    Frame { index: u64, reason: String },
    #[error("Frame image error: {0}")]
    Image(#[from] image::ImageError),
}

impl DecodeError {
    pub fn category(&self) -> FailureCategory {
        FailureCategory::DecodeFailure
    }
}

/// Opens media files for random-access frame decoding.
pub trait MediaDecoder: Send + Sync {
    fn open(&self, path: &Path) -> Result<Box<dyn VideoStream>, DecodeError>;
}

/// An opened media file. Dropping it releases every decoder resource.
pub trait VideoStream {
    fn frame_count(&self) -> u64;
    fn decode_frame(&mut self, index: u64) -> Result<RgbImage, DecodeError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChannelOrder {
    Rgb,
    Bgr,
}

impl ChannelOrder {
    fn source_channel(&self, channel: usize) -> usize {
        match self {
            ChannelOrder::Rgb => channel,
            ChannelOrder::Bgr => 2 - channel,
        }
    }
}

/// N frames of identical size, laid out as `(frame, height, width, channel)`
/// with values in `[0.0, 1.0]`.
#[derive(Debug, Clone, PartialEq)]
pub struct FrameBatch {
    frames: Array4<f32>,
}

impl FrameBatch {
    fn from_images(images: &[RgbImage], size: u32, order: ChannelOrder) -> Self {
        let side = size as usize;
        let mut frames = Array4::<f32>::zeros((images.len(), side, side, 3));

        for (i, image) in images.iter().enumerate() {
            for (x, y, pixel) in image.enumerate_pixels() {
                for c in 0..3 {
                    frames[[i, y as usize, x as usize, c]] =
                        pixel.0[order.source_channel(c)] as f32 / 255.0;
                }
            }
        }
        Self { frames }
    }

    pub fn len(&self) -> usize {
        self.frames.len_of(Axis(0))
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// `(height, width, channels)` of every frame.
    pub fn frame_shape(&self) -> (usize, usize, usize) {
        let shape = self.frames.shape();
        (shape[1], shape[2], shape[3])
    }

    pub fn view(&self) -> ArrayView4<'_, f32> {
        self.frames.view()
    }

    /// Adds the leading batch dimension expected by the model.
    pub fn to_model_input(&self) -> Array5<f32> {
        self.frames.clone().insert_axis(Axis(0))
    }
}

/// Evenly spaced frame indices over `[0, total_frames - 1]`, truncated to
/// integers. Indices repeat when the video is shorter than `count`.
pub fn sample_indices(total_frames: u64, count: usize) -> Vec<u64> {
    if total_frames == 0 || count == 0 {
        return Vec::new();
    }
    if count == 1 {
        return vec![0];
    }

    let last = total_frames - 1;
    let step = last as f64 / (count - 1) as f64;
    (0..count)
        .map(|i| {
            if i == count - 1 {
                last
            } else {
                ((i as f64 * step) as u64).min(last)
            }
        })
        .collect()
}

#[derive(Clone)]
pub struct FrameSampler {
    decoder: Arc<dyn MediaDecoder>,
    frame_count: usize,
    frame_size: u32,
    channel_order: ChannelOrder,
}

impl FrameSampler {
    pub fn new(
        decoder: Arc<dyn MediaDecoder>,
        frame_count: usize,
        frame_size: u32,
        channel_order: ChannelOrder,
    ) -> Self {
        Self {
            decoder,
            frame_count,
            frame_size,
            channel_order,
        }
    }

    /// Returns `Ok(None)` when the file opens but yields no usable frame.
    pub fn sample(&self, path: &Path) -> Result<Option<FrameBatch>, DecodeError> {
        let mut stream = self.decoder.open(path)?;
        let total_frames = stream.frame_count();
        if total_frames == 0 {
            log::warn!("{} reports zero frames", path.display());
            return Ok(None);
        }

        let indices = sample_indices(total_frames, self.frame_count);
        log::debug!(
            "Sampling {} of {} frames from {}: {:?}",
            indices.len(),
            total_frames,
            path.display(),
            indices
        );

        let mut slots: Vec<Option<RgbImage>> = Vec::with_capacity(indices.len());
        for &index in &indices {
            match stream.decode_frame(index) {
                Ok(image) => slots.push(Some(imageops::resize(
                    &image,
                    self.frame_size,
                    self.frame_size,
                    RESIZE_FILTER,
                ))),
                Err(e) => {
                    log::warn!("Skipping frame {} of {}: {}", index, path.display(), e);
                    slots.push(None);
                }
            }
        }
        drop(stream);

        match fill_gaps(slots) {
            Some(images) => Ok(Some(FrameBatch::from_images(
                &images,
                self.frame_size,
                self.channel_order,
            ))),
            None => {
                log::warn!("No frames could be decoded from {}", path.display());
                Ok(None)
            }
        }
    }
}

/// Replaces undecodable slots with the nearest earlier decoded frame, or the
/// nearest later one at the start. `None` when every slot failed.
fn fill_gaps(slots: Vec<Option<RgbImage>>) -> Option<Vec<RgbImage>> {
    let first = slots.iter().flatten().next()?.clone();
    let mut last = first;
    Some(
        slots
            .into_iter()
            .map(|slot| {
                if let Some(image) = slot {
                    last = image;
                }
                last.clone()
            })
            .collect(),
    )
}
