//! Error types for the warden DNS proxy.

use std::io;
use std::path::PathBuf;

use thiserror::Error;

/// Main error type for warden operations.
#[derive(Debug, Error)]
pub enum Error {
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("resolution error: {0}")]
    Resolve(#[from] ResolveError),

    #[error("DNS protocol error: {0}")]
    Protocol(#[from] hickory_proto::error::ProtoError),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

/// Configuration-related errors. All of these are fatal at startup.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    ReadFile(#[source] io::Error),

    #[error("failed to parse config: {0}")]
    Parse(#[source] serde_yaml::Error),

    #[error("validation failed: {0}")]
    Validation(String),

    #[error("group inheritance cycle through '{0}'")]
    GroupCycle(String),

    #[error("unknown {kind} '{name}' referenced by '{referrer}'")]
    UnknownReference {
        kind: &'static str,
        name: String,
        referrer: String,
    },
}

/// Errors from the persistent stores (rule store, query log, metrics).
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("could not create directory {path:?}")]
    CreateDir {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// Errors produced while answering a question from a source.
#[derive(Debug, Error)]
pub enum ResolveError {
    #[error("upstream I/O error: {0}")]
    Upstream(#[source] io::Error),

    #[error("upstream response could not be decoded: {0}")]
    Decode(#[source] hickory_proto::error::ProtoError),

    #[error("request could not be encoded: {0}")]
    Encode(#[source] hickory_proto::error::ProtoError),

    #[error("upstream exchange timed out after {0:?}")]
    Timeout(std::time::Duration),

    #[error("invalid upstream endpoint '{0}'")]
    Endpoint(String),
}

/// Result type alias using our Error.
pub type Result<T> = std::result::Result<T, Error>;
