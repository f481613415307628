use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::frames::ChannelOrder;
use crate::media::SizeLimit;

pub const CONFIG_ENV: &str = "DFVIDEO_CONFIG";
pub const DEFAULT_CONFIG_PATH: &str = "config/dfvideo.yaml";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("Failed to parse config: {0}")]
    Parse(#[from] serde_yaml::Error),
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub model: ModelConfig,
    pub media: MediaConfig,
    pub decoder: DecoderConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub static_dir: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelConfig {
    pub path: PathBuf,
    /// Set when the exported model emits logits instead of probabilities.
    pub apply_softmax: bool,
    pub frame_count: usize,
    pub frame_size: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MediaConfig {
    pub work_dir: PathBuf,
    pub max_megabytes: u64,
    pub probe_timeout_secs: u64,
    pub fetch_timeout_secs: u64,
    pub extract_timeout_secs: u64,
    pub ytdlp_bin: String,
    pub ytdlp_format: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DecoderConfig {
    pub ffmpeg_bin: String,
    pub ffprobe_bin: String,
    pub channel_order: ChannelOrder,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8080,
            static_dir: PathBuf::from("static"),
        }
    }
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("deepfake_detection_model.pt"),
            apply_softmax: false,
            frame_count: 10,
            frame_size: 128,
        }
    }
}

impl Default for MediaConfig {
    fn default() -> Self {
        Self {
            work_dir: std::env::temp_dir().join("dfvideo"),
            max_megabytes: 100,
            probe_timeout_secs: 10,
            fetch_timeout_secs: 30,
            extract_timeout_secs: 300,
            ytdlp_bin: "yt-dlp".to_string(),
            ytdlp_format: "best[ext=mp4]/best".to_string(),
        }
    }
}

impl Default for DecoderConfig {
    fn default() -> Self {
        Self {
            ffmpeg_bin: "ffmpeg".to_string(),
            ffprobe_bin: "ffprobe".to_string(),
            channel_order: ChannelOrder::Bgr,
        }
    }
}

impl MediaConfig {
    pub fn size_limit(&self) -> SizeLimit {
        SizeLimit::megabytes(self.max_megabytes)
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_secs(self.probe_timeout_secs)
    }

    pub fn fetch_timeout(&self) -> Duration {
        Duration::from_secs(self.fetch_timeout_secs)
    }

    pub fn extract_timeout(&self) -> Duration {
        Duration::from_secs(self.extract_timeout_secs)
    }
}

impl AppConfig {
    /// Loads the YAML file named by `DFVIDEO_CONFIG` (or the default path),
    /// falling back to defaults when the file does not exist, then applies
    /// environment overrides.
    pub fn load() -> Result<Self, ConfigError> {
        let path = std::env::var(CONFIG_ENV).unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_string());
        let path = Path::new(&path);

        let mut config = if path.exists() {
            log::info!("Loading configuration from {}", path.display());
            Self::from_file(path)?
        } else {
            log::info!("No config file at {}, using defaults", path.display());
            Self::default()
        };

        config.apply_overrides(|key| std::env::var(key).ok());
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let config_str = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_yaml(&config_str)
    }

    pub fn from_yaml(yaml: &str) -> Result<Self, ConfigError> {
        let config: AppConfig = serde_yaml::from_str(yaml)?;
        Ok(config)
    }

    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(path) = lookup("MODEL_PATH") {
            self.model.path = PathBuf::from(path);
        }
        if let Some(dir) = lookup("WORK_DIR") {
            self.media.work_dir = PathBuf::from(dir);
        }
        if let Some(port) = lookup("PORT") {
            match port.parse() {
                Ok(port) => self.server.port = port,
                Err(_) => log::warn!("Ignoring invalid PORT override: {}", port),
            }
        }
        if let Some(mb) = lookup("MAX_UPLOAD_MB") {
            match mb.parse() {
                Ok(mb) => self.media.max_megabytes = mb,
                Err(_) => log::warn!("Ignoring invalid MAX_UPLOAD_MB override: {}", mb),
            }
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.model.frame_count == 0 {
            return Err(ConfigError::Invalid("model.frame_count must be at least 1".into()));
        }
        if self.model.frame_size == 0 {
            return Err(ConfigError::Invalid("model.frame_size must be at least 1".into()));
        }
        if self.media.max_megabytes == 0 {
            return Err(ConfigError::Invalid("media.max_megabytes must be at least 1".into()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use std::collections::HashMap;

    #[test]
    fn defaults_match_trained_model() {
        let config = AppConfig::default();
        assert_eq!(config.model.frame_count, 10);
        assert_eq!(config.model.frame_size, 128);
        assert_eq!(config.media.size_limit().max_bytes(), 100 * 1024 * 1024);
        assert_eq!(config.decoder.channel_order, ChannelOrder::Bgr);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn partial_yaml_keeps_defaults() {
        let config = AppConfig::from_yaml(
            "model:\n  path: models/final.pt\n  apply_softmax: true\ndecoder:\n  channel_order: rgb\n",
        )
        .unwrap();
        assert_eq!(config.model.path, PathBuf::from("models/final.pt"));
        assert!(config.model.apply_softmax);
        assert_eq!(config.model.frame_count, 10);
        assert_eq!(config.decoder.channel_order, ChannelOrder::Rgb);
        assert_eq!(config.server.port, 8080);
    }

    #[test]
    fn env_overrides_win() {
        let env: HashMap<&str, &str> = [
            ("MODEL_PATH", "/models/m.pt"),
            ("PORT", "9000"),
            ("MAX_UPLOAD_MB", "not-a-number"),
        ]
        .into_iter()
        .collect();

        let mut config = AppConfig::default();
        config.apply_overrides(|key| env.get(key).map(|v| v.to_string()));

        assert_eq!(config.model.path, PathBuf::from("/models/m.pt"));
        assert_eq!(config.server.port, 9000);
        assert_eq!(config.media.max_megabytes, 100);
    }

    #[test]
    fn oversized_upload_override_does_not_overflow() {
        let mut config = AppConfig::default();
        config.apply_overrides(|key| (key == "MAX_UPLOAD_MB").then(|| u64::MAX.to_string()));
        assert!(config.validate().is_ok());
        assert_eq!(config.media.size_limit().max_bytes(), u64::MAX);
    }

    #[test]
    fn zero_frame_count_is_rejected() {
        let config = AppConfig::from_yaml("model:\n  frame_count: 0\n").unwrap();
        assert_matches!(config.validate(), Err(ConfigError::Invalid(_)));
    }

    #[test]
    fn bundled_config_parses() {
        let path = Path::new(env!("CARGO_MANIFEST_DIR")).join("../config/dfvideo.yaml");
        let config = AppConfig::from_file(&path).unwrap();
        assert_eq!(config.media.max_megabytes, 100);
        assert_eq!(config.media.work_dir, PathBuf::from("/tmp/dfvideo"));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn missing_file_is_a_read_error() {
        assert_matches!(
            AppConfig::from_file(Path::new("/nonexistent/dfvideo.yaml")),
            Err(ConfigError::Read { .. })
        );
    }

    #[test]
    fn malformed_yaml_is_a_parse_error() {
        assert_matches!(AppConfig::from_yaml("model: [1, 2"), Err(ConfigError::Parse(_)));
    }
}
