use thiserror::Error;

/// A schema violation, located by a human-readable path into the pack
/// such as `round 3 guestItems[1]` or `maths.events[2]`.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{path}: {message}")]
pub struct ValidationError {
    pub path: String,
    pub message: String,
}

impl ValidationError {
    pub fn new(path: impl Into<String>, message: impl Into<String>) -> Self {
        Self { path: path.into(), message: message.into() }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EnvelopeError {
    /// The envelope is structurally unusable: bad JSON, unknown algorithm,
    /// undecodable base64 or parameters outside accepted bounds.
    #[error("malformed sealed envelope: {0}")]
    Format(String),
    /// The AEAD tag did not verify. Wrong password and tampered ciphertext
    /// are indistinguishable here.
    #[error("sealed envelope failed authentication (wrong password or tampered ciphertext)")]
    Authentication,
    #[error("encryption failed: {0}")]
    Encryption(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("integrity mismatch: stored {stored}, computed {computed}")]
pub struct IntegrityMismatch {
    /// Stored checksum, or `<missing>` when the pack carries no integrity block.
    pub stored: String,
    pub computed: String,
}

#[derive(Debug, Error)]
pub enum PackError {
    #[error("validation error: {0}")]
    Validation(#[from] ValidationError),
    #[error(transparent)]
    Envelope(#[from] EnvelopeError),
    #[error(transparent)]
    Integrity(#[from] IntegrityMismatch),
    #[error("pack payload is not valid JSON: {0}")]
    Payload(String),
}
