//! Frame access through the `ffprobe`/`ffmpeg` binaries.
//!
//! `ffprobe` supplies the frame count; each sampled frame is pulled out with
//! a `select` filter and piped back as PNG.

use image::{ImageFormat, RgbImage};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

use super::{DecodeError, MediaDecoder, VideoStream};

#[derive(Debug, Clone)]
pub struct FfmpegDecoder {
    ffmpeg_bin: String,
    ffprobe_bin: String,
}

impl FfmpegDecoder {
    pub fn new(ffmpeg_bin: impl Into<String>, ffprobe_bin: impl Into<String>) -> Self {
        Self {
            ffmpeg_bin: ffmpeg_bin.into(),
            ffprobe_bin: ffprobe_bin.into(),
        }
    }

    fn probe(&self, path: &Path) -> Result<FfprobeOutput, DecodeError> {
        log::debug!("Probing {} with {}", path.display(), self.ffprobe_bin);
        let output = Command::new(&self.ffprobe_bin)
            .args(["-v", "error", "-print_format", "json", "-show_format", "-show_streams"])
            .arg(path)
            .stdin(Stdio::null())
            .output()
            .map_err(|source| DecodeError::NotFound {
                bin: self.ffprobe_bin.clone(),
                source,
            })?;

        if !output.status.success() {
            return Err(DecodeError::Open {
                path: path.to_path_buf(),
                reason: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }

        serde_json::from_slice(&output.stdout).map_err(|e| DecodeError::Open {
            path: path.to_path_buf(),
            reason: format!("unreadable ffprobe output: {}", e),
        })
    }
}

impl MediaDecoder for FfmpegDecoder {
    fn open(&self, path: &Path) -> Result<Box<dyn VideoStream>, DecodeError> {
        if !path.is_file() {
            return Err(DecodeError::Open {
                path: path.to_path_buf(),
                reason: "file does not exist".to_string(),
            });
        }

        let probe = self.probe(path)?;
        Ok(Box::new(FfmpegStream {
            path: path.to_path_buf(),
            ffmpeg_bin: self.ffmpeg_bin.clone(),
            total_frames: total_frames(&probe),
        }))
    }
}

struct FfmpegStream {
    path: PathBuf,
    ffmpeg_bin: String,
    total_frames: u64,
}

impl VideoStream for FfmpegStream {
    fn frame_count(&self) -> u64 {
        self.total_frames
    }

    fn decode_frame(&mut self, index: u64) -> Result<RgbImage, DecodeError> {
        let filter = format!("select=eq(n\\,{})", index);
        let output = Command::new(&self.ffmpeg_bin)
            .args(["-hide_banner", "-loglevel", "error", "-nostdin", "-i"])
            .arg(&self.path)
            .args(["-an", "-sn", "-vf", filter.as_str()])
            .args(["-vsync", "0", "-frames:v", "1"])
            .args(["-f", "image2pipe", "-c:v", "png", "-"])
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .map_err(|source| DecodeError::NotFound {
                bin: self.ffmpeg_bin.clone(),
                source,
            })?;

        if !output.status.success() || output.stdout.is_empty() {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            return Err(DecodeError::Frame {
                index,
                reason: if stderr.is_empty() {
                    "no frame at this index".to_string()
                } else {
                    stderr
                },
            });
        }

        let frame = image::load_from_memory_with_format(&output.stdout, ImageFormat::Png)?;
        Ok(frame.to_rgb8())
    }
}

#[derive(Debug, Deserialize)]
struct FfprobeOutput {
    #[serde(default)]
    streams: Vec<FfprobeStream>,
    format: Option<FfprobeFormat>,
}

#[derive(Debug, Deserialize)]
struct FfprobeStream {
    codec_type: Option<String>,
    /// e.g. "30/1" or "24000/1001"
    r_frame_rate: Option<String>,
    avg_frame_rate: Option<String>,
    duration: Option<String>,
    nb_frames: Option<String>,
}

#[derive(Debug, Deserialize)]
struct FfprobeFormat {
    duration: Option<String>,
}

fn first_video_stream(probe: &FfprobeOutput) -> Option<&FfprobeStream> {
    probe
        .streams
        .iter()
        .find(|s| s.codec_type.as_deref() == Some("video"))
}

fn parse_fraction(s: &str) -> f64 {
    match s.split_once('/') {
        Some((num, den)) => {
            let num = num.parse::<f64>().unwrap_or(0.0);
            let den = den.parse::<f64>().unwrap_or(0.0);
            if den > 0.0 { num / den } else { 0.0 }
        }
        None => s.parse::<f64>().unwrap_or(0.0),
    }
}

/// Frame count of the first video stream: the container's `nb_frames` when
/// present, otherwise duration times frame rate. Zero without a video stream.
fn total_frames(probe: &FfprobeOutput) -> u64 {
    let Some(stream) = first_video_stream(probe) else {
        return 0;
    };

    if let Some(n) = stream.nb_frames.as_deref().and_then(|n| n.parse::<u64>().ok()) {
        if n > 0 {
            return n;
        }
    }

    let duration = stream
        .duration
        .as_deref()
        .or_else(|| probe.format.as_ref().and_then(|f| f.duration.as_deref()))
        .and_then(|d| d.parse::<f64>().ok())
        .unwrap_or(0.0);
    let fps = stream
        .avg_frame_rate
        .as_deref()
        .map(parse_fraction)
        .filter(|fps| *fps > 0.0)
        .or_else(|| stream.r_frame_rate.as_deref().map(parse_fraction))
        .unwrap_or(0.0);

    if duration > 0.0 && fps > 0.0 {
        (duration * fps).round() as u64
    } else {
        0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    fn probe(json: &str) -> FfprobeOutput {
        serde_json::from_str(json).unwrap()
    }

    #[test]
    fn fractions_parse() {
        assert!((parse_fraction("30/1") - 30.0).abs() < 1e-9);
        assert!((parse_fraction("24000/1001") - 23.976).abs() < 0.01);
        assert_eq!(parse_fraction("30/0"), 0.0);
        assert_eq!(parse_fraction("25"), 25.0);
    }

    #[test]
    fn frame_count_prefers_nb_frames() {
        let probe = probe(
            r#"{"streams":[{"codec_type":"audio","nb_frames":"500"},
                {"codec_type":"video","r_frame_rate":"30/1","duration":"3.0","nb_frames":"90"}],
                "format":{"duration":"3.0"}}"#,
        );
        assert_eq!(total_frames(&probe), 90);
    }

    #[test]
    fn frame_count_is_estimated_without_nb_frames() {
        let probe = probe(
            r#"{"streams":[{"codec_type":"video","avg_frame_rate":"0/0","r_frame_rate":"25/1"}],
                "format":{"duration":"4.0"}}"#,
        );
        assert_eq!(total_frames(&probe), 100);
    }

    #[test]
    fn no_video_stream_means_no_frames() {
        let probe = probe(r#"{"streams":[{"codec_type":"audio"}],"format":{"duration":"9.0"}}"#);
        assert_eq!(total_frames(&probe), 0);
        assert_eq!(total_frames(&super::FfprobeOutput { streams: vec![], format: None }), 0);
    }

    #[test]
    fn missing_file_cannot_be_opened() {
        let decoder = FfmpegDecoder::new("ffmpeg", "ffprobe");
        assert_matches!(
            decoder.open(Path::new("/nonexistent/clip.mp4")).err(),
            Some(DecodeError::Open { .. })
        );
    }
}
