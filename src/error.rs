use std::sync::Arc;

use thiserror::Error;

use crate::{script::CompileError, Engine};

/// Result type used throughout `featurekit`.
pub type Result<T> = std::result::Result<T, Error>;

/// Enum representing possible errors of stores, buses and aggregators.
///
/// Script faults are reported separately as [`EvaluationError`](crate::script::EvaluationError)
/// because they never fail the evaluating request.
#[derive(Error, Debug, Clone)]
#[non_exhaustive]
pub enum Error {
    /// The key is absent. Recoverable, the caller decides what it means.
    #[error("document not found: {key}")]
    NotFound { key: String },

    /// An optimistic write observed a different version than expected. Recoverable by
    /// refetching and retrying.
    #[error("version conflict on {key} (expected {expected:?}, found {found:?})")]
    ConflictOnWrite {
        key: String,
        expected: Option<u64>,
        found: Option<u64>,
    },

    /// Transient infrastructure failure. Retried with backoff at the store boundary and surfaced
    /// once retries are exhausted.
    #[error("{engine} backend unavailable: {reason}")]
    BackendUnavailable { engine: Engine, reason: String },

    /// Invalid or incomplete configuration. Only produced at startup.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// Key does not belong to the namespace of the store or is malformed.
    #[error("invalid key {key:?}: {reason}")]
    InvalidKey { key: String, reason: String },

    /// Document value does not match the model of its entity kind.
    #[error("invalid document {key:?}: {reason}")]
    InvalidDocument { key: String, reason: String },

    /// Subscriber fell behind and was dropped by the bus.
    #[error(transparent)]
    SlowConsumer(#[from] crate::bus::SlowConsumer),

    /// A script failed to compile.
    #[error(transparent)]
    Compile(#[from] CompileError),

    // serde_json::Error is not clonable, so we're wrapping it in an Arc.
    #[error(transparent)]
    Serialization(Arc<serde_json::Error>),

    #[error(transparent)]
    Io(Arc<std::io::Error>),
}

impl Error {
    /// Return `true` if the operation may succeed when retried as is.
    pub fn is_transient(&self) -> bool {
        matches!(self, Error::BackendUnavailable { .. })
    }

    pub(crate) fn not_found(key: impl Into<String>) -> Error {
        Error::NotFound { key: key.into() }
    }

    pub(crate) fn unavailable(engine: Engine, reason: impl ToString) -> Error {
        Error::BackendUnavailable {
            engine,
            reason: reason.to_string(),
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(value: std::io::Error) -> Self {
        Self::Io(Arc::new(value))
    }
}

impl From<serde_json::Error> for Error {
    fn from(value: serde_json::Error) -> Self {
        Self::Serialization(Arc::new(value))
    }
}

impl From<sled::Error> for Error {
    fn from(value: sled::Error) -> Self {
        match value {
            sled::Error::Io(err) => Error::from(err),
            other => Error::unavailable(Engine::LevelDbLike, other),
        }
    }
}
