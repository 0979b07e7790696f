use thiserror::Error;

use crate::synthesizer::SynthError;
use crate::vcs::VcsError;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    #[error("generator error: {0}")]
    Generator(#[from] SynthError),

    #[error("version control error: {0}")]
    Vcs(#[from] VcsError),

    #[error("failed to apply {source_name} version: {reason}")]
    Apply { source_name: String, reason: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("invalid ignore pattern: {0}")]
    Pattern(#[from] glob::PatternError),

    #[error("push error: {0}")]
    Push(#[from] anyhow::Error),
}

impl Error {
    /// True when the error is a nonzero exit of the generator itself.
    pub fn is_generator_failure(&self) -> bool {
        matches!(self, Error::Generator(SynthError::GeneratorFailed { .. }))
    }
}
