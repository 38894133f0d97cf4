//! Codec errors.

use pamr_types::PamrError;
use thiserror::Error;

/// Errors raised while encoding or decoding an object stream.
#[derive(Debug, Error)]
pub enum CodecError {
    /// The class is neither known locally nor obtainable from its origin.
    #[error("Class '{class}' not found at origin {origin}: {reason}")]
    ClassNotFound {
        class: String,
        origin: String,
        reason: String,
    },

    /// The class is unknown locally and the stream names no origin for it.
    #[error("Class '{0}' not found and no origin recorded")]
    ClassAbsent(String),

    /// The encoder met an object whose class was never defined locally.
    #[error("Class '{0}' is not registered in the local catalog")]
    ClassNotRegistered(String),

    /// An object does not match the definition of its class.
    #[error("Object of class '{class}' has undeclared field '{field}'")]
    IncompatibleClass { class: String, field: String },

    /// The resolved class has a different version than the one in the stream.
    #[error("Class '{class}' version mismatch: local={local}, stream={stream}")]
    VersionMismatch { class: String, local: u32, stream: u32 },

    /// The stream is structurally invalid.
    #[error("Malformed object stream: {0}")]
    Malformed(String),

    /// MessagePack encoding failed.
    #[error("Encode error: {0}")]
    Encode(#[from] rmp_serde::encode::Error),

    /// MessagePack decoding failed.
    #[error("Decode error: {0}")]
    Decode(#[from] rmp_serde::decode::Error),
}

/// Alias for Result with CodecError.
pub type CodecResult<T> = Result<T, CodecError>;

impl From<CodecError> for PamrError {
    fn from(err: CodecError) -> Self {
        match err {
            CodecError::ClassNotFound { class, origin, .. } => {
                PamrError::ClassNotFound { class, origin }
            }
            other => PamrError::Codec(other.to_string()),
        }
    }
}
