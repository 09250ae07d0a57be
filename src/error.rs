//! Error taxonomy for the hierarchical storage engine.
//!
//! Mirrors the recoverable/unrecoverable split the engine relies on to keep
//! partial progress across a batch save: a corrupt stats cache or metadata
//! file is reset and logged, while a corrupt membership pack or neuron bank
//! is surfaced to the caller.

use std::path::PathBuf;

use uuid::Uuid;

/// Errors produced by the storage engine.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum EngineError {
    /// A secondary structure (stats cache, concept capacity file) failed to
    /// parse. The caller is not expected to handle this directly: the engine
    /// resets the structure to empty and logs a warning before continuing.
    #[error("recoverable corruption in {}: {source}", path.display())]
    CorruptStateRecoverable {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    /// A primary structure (membership pack, neuron bank) failed to parse.
    /// The affected partition's operation aborts; other partitions in the
    /// same batch are unaffected.
    #[error("unrecoverable corruption in {}: {source}", path.display())]
    CorruptStateUnrecoverable {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    /// A neuron snapshot could not be serialized: non-finite floats,
    /// excessive nesting, or a reference cycle.
    #[error("serialization failure for neuron {neuron_id}: {reason}")]
    SerializationFailure {
        neuron_id: Uuid,
        field_path: Option<String>,
        reason: String,
    },

    /// Underlying filesystem operation failed.
    #[error("io failure: {0}")]
    IoFailure(#[from] std::io::Error),
}

/// Crate-wide result alias.
pub type Result<T> = std::result::Result<T, EngineError>;

impl EngineError {
    pub fn corrupt_recoverable(path: impl Into<PathBuf>, source: serde_json::Error) -> Self {
        EngineError::CorruptStateRecoverable {
            path: path.into(),
            source,
        }
    }

    pub fn corrupt_unrecoverable(path: impl Into<PathBuf>, source: serde_json::Error) -> Self {
        EngineError::CorruptStateUnrecoverable {
            path: path.into(),
            source,
        }
    }

    pub fn serialization_failure(
        neuron_id: Uuid,
        field_path: Option<String>,
        reason: impl Into<String>,
    ) -> Self {
        let reason = reason.into();
        let reason = match &field_path {
            Some(path) => format!("{reason} at {path}"),
            None => reason,
        };
        EngineError::SerializationFailure {
            neuron_id,
            field_path,
            reason,
        }
    }
}
