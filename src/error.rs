//! Error taxonomy for the pipeline.
//!
//! Configuration problems are fatal at startup. Synthesis and media errors
//! are downgraded by their callers: a unit that cannot be rendered keeps a
//! zero duration and the run continues.

use std::path::PathBuf;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("missing config file: {0}")]
    Missing(PathBuf),
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("invalid config: {0}")]
    Parse(#[from] serde_json::Error),
}

#[derive(Debug, Error)]
pub enum TtsError {
    #[error("request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("backend returned status {0}")]
    Status(reqwest::StatusCode),
    #[error(transparent)]
    Postprocess(#[from] MediaError),
}

impl TtsError {
    /// Transport and status errors are worth retrying; a post-processing
    /// failure on already-received audio is not.
    pub fn is_retryable(&self) -> bool {
        matches!(self, TtsError::Http(_) | TtsError::Status(_))
    }
}

#[derive(Debug, Error)]
pub enum MediaError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("audio probe failed: {0}")]
    Probe(#[from] symphonia::core::errors::Error),
    #[error("no audio track found")]
    NoTrack,
    #[error("{tool} exited with {status}")]
    Tool {
        tool: &'static str,
        status: std::process::ExitStatus,
    },
    #[error("blocking task failed: {0}")]
    Task(String),
}
