pub mod analysis;
pub mod config;
pub mod frames;
pub mod inference;
pub mod media;
pub mod routes;

#[cfg(test)]
mod testing;

pub use analysis::{AnalysisFailure, AnalysisReport, Analyzer, SourceMetadata};
pub use config::AppConfig;
