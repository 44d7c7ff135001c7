use jemima_pack_core::{EnvelopeError, ValidationError};
use thiserror::Error;

/// Why an assignment did not produce a room.
#[derive(Debug, Error)]
pub enum AssignError {
    #[error("no packs available")]
    PoolExhausted,
    #[error("{file}: {source}")]
    Validation {
        file: String,
        #[source]
        source: ValidationError,
    },
    #[error("{file}: malformed sealed envelope: {reason}")]
    CryptoFormat { file: String, reason: String },
    #[error("{file}: envelope authentication failed (wrong password or tampered ciphertext)")]
    Authentication { file: String },
    #[error("{file}: {detail}")]
    IntegrityMismatch { file: String, detail: String },
    #[error("assignment failed: {0}")]
    AssignmentFailed(String),
}

impl AssignError {
    /// Stable machine-readable code printed by the command line.
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            Self::PoolExhausted => "no_packs_available",
            Self::Validation { .. } => "validation_failed",
            Self::CryptoFormat { .. } => "crypto_format",
            Self::Authentication { .. } => "authentication_failed",
            Self::IntegrityMismatch { .. } => "integrity_mismatch",
            Self::AssignmentFailed(_) => "assignment_failed",
        }
    }

    pub(crate) fn envelope(file: &str, err: EnvelopeError) -> Self {
        match err {
            EnvelopeError::Authentication => Self::Authentication { file: file.to_string() },
            EnvelopeError::Format(reason) | EnvelopeError::Encryption(reason) => {
                Self::CryptoFormat { file: file.to_string(), reason }
            }
        }
    }

    pub(crate) fn failed(err: &anyhow::Error) -> Self {
        Self::AssignmentFailed(format!("{err:#}"))
    }
}
