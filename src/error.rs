use std::path::PathBuf;

use miette::Diagnostic;
use thiserror::Error;

#[derive(Debug, Error, Diagnostic)]
pub enum TrialScopeError {
    #[error("no sources selected for search")]
    NoSourcesSelected,

    #[error("search query is empty")]
    EmptyQuery,

    #[error("max results must be positive, got {0}")]
    InvalidMaxResults(usize),

    #[error("unknown source: {0}")]
    UnknownSource(String),

    #[error("failed to read config file at {}", .0.display())]
    ConfigRead(PathBuf),

    #[error("failed to parse JSON config: {0}")]
    ConfigParse(String),

    #[error("label thresholds must be monotonic: {0}")]
    InvalidThresholds(String),

    #[error("title similarity threshold must be within (0, 1], got {0}")]
    InvalidSimilarity(f64),

    #[error("classifier batch size must be positive")]
    InvalidBatchSize,

    #[error("failed to build HTTP client: {0}")]
    HttpClient(String),

    #[error("filesystem error: {0}")]
    Filesystem(String),
}
