use std::path::PathBuf;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum StatsError {
    #[error("config error: {0}")]
    Config(String),

    #[error(
        "identity collision for strong_id {strong_id}: {first} conflicts with {second}"
    )]
    IdentityCollision {
        strong_id: String,
        first: String,
        second: String,
    },

    #[error("counts for strong_id {strong_id} overflow when merged")]
    CountOverflow { strong_id: String },

    #[error("malformed record at {}:{line}: {reason}", path.display())]
    MalformedRecord {
        path: PathBuf,
        line: usize,
        reason: String,
    },

    #[error("failed to persist {}: {source}", path.display())]
    Persistence {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to read {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

pub type Result<T> = std::result::Result<T, StatsError>;
