use serde::{Deserialize, Serialize};
use strum_macros::{Display, EnumString};

/// Verdict produced by the classifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, EnumString)]
#[serde(rename_all = "UPPERCASE")]
#[strum(serialize_all = "UPPERCASE")]
pub enum Label {
    Real,
    Fake,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, EnumString)]
pub enum SourceType {
    #[serde(rename = "File Upload")]
    #[strum(serialize = "File Upload")]
    FileUpload,
    #[serde(rename = "URL Analysis")]
    #[strum(serialize = "URL Analysis")]
    UrlAnalysis,
}

/// Category attached to every failed analysis.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, EnumString)]
pub enum FailureCategory {
    SourceUnavailable,
    UnsupportedFormat,
    SourceTooLarge,
    DecodeFailure,
    NoFramesExtracted,
    ModelUnavailable,
    InferenceFailure,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct AnalyzeUrlRequest {
    pub url: String,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct AnalysisResponse {
    pub success: bool,
    pub label: Label,
    pub confidence: f32,
    pub filename: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    pub source_type: SourceType,
    pub file_size: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration_seconds: Option<f64>,
    pub analysis_time: String,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct ErrorResponse {
    pub success: bool,
    pub error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub category: Option<FailureCategory>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub analysis_time: Option<String>,
}

impl ErrorResponse {
    pub fn new(error: impl Into<String>) -> Self {
        Self {
            success: false,
            error: error.into(),
            category: None,
            analysis_time: None,
        }
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct HealthResponse {
    pub status: String,
    pub model_loaded: bool,
}
