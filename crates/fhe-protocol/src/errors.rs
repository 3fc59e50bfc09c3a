//! Error types for the protocol orchestration layer.

use crate::keyring::Generation;

/// The Result type for this library.
pub type Result<T> = std::result::Result<T, Error>;

/// Enum encapsulating all the possible errors from this library.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The HE parameter set cannot support the required operations.
    #[error("Invalid parameters: {0}")]
    InvalidParameter(String),

    /// A ciphertext and an evaluation view disagree on generation, scale or
    /// capacity.
    #[error("Context mismatch: {0}")]
    ContextMismatch(String),

    /// A lazily loaded ciphertext was used before being linked to a view.
    #[error("Ciphertext is not linked to an evaluation context")]
    UnlinkedContext,

    /// Decryption was attempted through an evaluation-only view.
    #[error("The context view does not hold a secret key")]
    NoSecretKey,

    /// Two vectors with different slot lengths were combined.
    #[error("Dimension mismatch: {0} slots against {1} slots")]
    DimensionMismatch(usize, usize),

    /// An out-of-range vote or a malformed feature vector.
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// A session operation was called from the wrong state.
    #[error("Invalid session state: expected {expected}, found {found}")]
    InvalidState {
        /// The state(s) the operation requires.
        expected: &'static str,
        /// The state the session is in.
        found: &'static str,
    },

    /// Secret material was offered to the compute party.
    #[error("Trust boundary violation: {0}")]
    TrustBoundary(String),

    /// A computation was abandoned through its cancellation token.
    #[error("Computation cancelled")]
    Cancelled,

    /// A serialized artifact could not be decoded.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Artifact storage failure.
    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// Error reported by the underlying HE engine.
    #[error(transparent)]
    Engine(#[from] fhe::Error),
}

impl Error {
    /// Create a generation mismatch error.
    pub fn generation_mismatch(expected: Generation, found: Generation) -> Self {
        Self::ContextMismatch(format!(
            "generation {found} does not match context generation {expected}"
        ))
    }

    /// Create a slot capacity error.
    pub fn slot_overflow(length: usize, capacity: usize) -> Self {
        Self::ContextMismatch(format!(
            "{length} values exceed the slot capacity of {capacity}"
        ))
    }

    /// Create an out-of-range vote error.
    pub fn invalid_vote(vote: i64, candidates: usize) -> Self {
        Self::InvalidInput(format!(
            "vote {vote} is outside the candidate range 1..={candidates}"
        ))
    }

    /// Create a decoding error for a named artifact.
    pub fn malformed<S: Into<String>>(what: S) -> Self {
        Self::Serialization(format!("malformed {}", what.into()))
    }

    /// Whether the caller can recover by fixing its input or linking and
    /// retrying.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, Self::InvalidInput(_) | Self::UnlinkedContext)
    }
}
