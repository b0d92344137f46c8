use autoprofile_common::SnapshotError;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, ProfilerError>;

#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ProfilerError {
    #[error("unrecognized profile data: {0}")]
    UnrecognizedProfile(String),
    #[error("no profile returned")]
    NoProfile,
    #[error("invalid snapshot: {0}")]
    InvalidSnapshot(#[from] SnapshotError),
    #[error("failed to symbolize snapshot: {0}")]
    Symbolize(#[from] blazesym::Error),
    #[error("invalid sampler config: {0}")]
    Config(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Serialize(#[from] serde_json::Error),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}
