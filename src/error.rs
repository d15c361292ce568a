//! Error types for the shard lifecycle engine

use thiserror::Error;

/// Result type alias using our Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in the shard lifecycle engine
#[derive(Error, Debug)]
#[allow(clippy::enum_variant_names)]
pub enum Error {
    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Duration parse error
    #[error("Failed to parse duration: {0}")]
    DurationParse(String),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),

    // =========================================================================
    // Secret Sharing Errors
    // =========================================================================
    /// Fewer shares than the threshold were supplied
    #[error("Insufficient shares: have {available}, need {required}")]
    InsufficientShares { available: usize, required: usize },

    /// Too few shares survived integrity validation
    #[error("Insufficient valid shares: {valid} passed validation, need {required}")]
    InsufficientValidShares { valid: usize, required: usize },

    /// A share is malformed or inconsistent with its sharing context
    #[error("Invalid share: {0}")]
    InvalidShare(String),

    /// Invalid threshold/total or coding configuration
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    // =========================================================================
    // Codec Errors
    // =========================================================================
    /// Hash mismatch on a shard or on recovered plaintext
    #[error("Integrity check failed for {target}: {reason}")]
    IntegrityError { target: String, reason: String },

    /// AEAD tag verification failed
    #[error("Decryption failed: authentication tag mismatch")]
    DecryptionFailed,

    /// Encryption failed
    #[error("Encryption failed: {0}")]
    EncryptionFailed(String),

    /// Erasure coding failure
    #[error("Erasure coding failed: {0}")]
    ErasureCoding(String),

    // =========================================================================
    // Redundancy Errors
    // =========================================================================
    /// File is not registered or has no manifest
    #[error("File not found: {0}")]
    FileNotFound(String),

    /// Not enough reachable shards to rebuild redundancy
    #[error("File {file_id} is irrecoverable: {available} shards reachable, {required} required")]
    IrrecoverableFile {
        file_id: String,
        available: usize,
        required: usize,
    },

    /// Repair job exhausted its attempts
    #[error("Repair of file {file_id} failed after {attempts} attempts: {reason}")]
    RepairFailed {
        file_id: String,
        attempts: u32,
        reason: String,
    },

    /// Repair job not found
    #[error("Repair job not found: {0}")]
    JobNotFound(String),

    /// Repair job was cancelled
    #[error("Repair job {0} was cancelled")]
    JobCancelled(String),

    /// Provider collaborator failure
    #[error("Provider {provider_id} error: {reason}")]
    Provider { provider_id: String, reason: String },

    /// Not enough providers for placement
    #[error("Placement failed: {0}")]
    Placement(String),

    /// Persistence failure
    #[error("Store error: {0}")]
    Store(String),

    // =========================================================================
    // Guardian Recovery Errors
    // =========================================================================
    /// User has no guardian configuration
    #[error("No guardian configuration for user: {0}")]
    GuardianConfigNotFound(String),

    /// Guardian already present in the configuration
    #[error("Guardian already configured: {0}")]
    DuplicateGuardian(String),

    /// Guardian is not part of the user's configuration
    #[error("Guardian {guardian_id} is not authorized for this recovery")]
    UnauthorizedGuardian { guardian_id: String },

    /// Approval signature failed verification
    #[error("Invalid signature from guardian {guardian_id}")]
    InvalidSignature { guardian_id: String },

    /// Recovery session not found
    #[error("Recovery session not found: {0}")]
    RecoveryNotFound(String),

    /// Recovery session expired
    #[error("Recovery session {recovery_id} has expired")]
    RecoveryExpired { recovery_id: String },

    /// Recovery session is no longer accepting approvals
    #[error("Recovery session {recovery_id} is {status}")]
    RecoveryNotPending { recovery_id: String, status: String },

    // =========================================================================
    // Guardian Vault Errors
    // =========================================================================
    /// Not enough guardians to place or accept a shard
    #[error("Insufficient guardians: {available} available, {required} required")]
    InsufficientGuardians { available: usize, required: usize },

    /// Vault record not found
    #[error("Vault shard not found: {0}")]
    VaultShardNotFound(String),
}

impl Error {
    /// Whether the error is a transient network or placement failure that
    /// may succeed on retry. Cryptographic and threshold violations never are.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Error::Provider { .. } | Error::Placement(_) | Error::Store(_) | Error::Io(_)
        )
    }

    /// Shorthand for an integrity error on a named target.
    pub fn integrity(target: impl Into<String>, reason: impl Into<String>) -> Self {
        Error::IntegrityError {
            target: target.into(),
            reason: reason.into(),
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}

impl From<bincode::Error> for Error {
    fn from(e: bincode::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}

impl From<serde_yaml::Error> for Error {
    fn from(e: serde_yaml::Error) -> Self {
        Error::Config(e.to_string())
    }
}

impl From<prometheus::Error> for Error {
    fn from(e: prometheus::Error) -> Self {
        Error::Internal(format!("metrics: {}", e))
    }
}
