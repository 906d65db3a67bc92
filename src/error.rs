//! Error types for rsoemcrypto.

use thiserror::Error;

/// Main error type for engine operations.
#[derive(Debug, Error)]
pub enum Error {
    /// The engine has not been initialized (or was terminated).
    #[error("Engine is not initialized")]
    NotInitialized,

    /// No session is open with the specified identifier.
    #[error("Session identifier {0} is invalid")]
    InvalidSession(u32),

    /// A required argument is missing or a span escapes its message.
    #[error("Invalid context: {0}")]
    InvalidContext(String),

    /// The output buffer is too small; retry with `required` bytes.
    #[error("Output buffer too small ({required} bytes required)")]
    ShortBuffer { required: usize },

    /// The input buffer exceeds the platform limit.
    #[error("Input buffer too large")]
    BufferTooLarge,

    /// The destination exceeds the platform output limit.
    #[error("Output buffer too large")]
    OutputTooLarge,

    /// Message authentication failed.
    #[error("Signature failure")]
    SignatureFailure,

    /// Nonce unknown, reused or rate-limited.
    #[error("Invalid nonce")]
    InvalidNonce,

    /// Key duration has elapsed.
    #[error("Key expired")]
    KeyExpired,

    /// No key with the requested id (or no key selected).
    #[error("No content key")]
    NoContentKey,

    /// The entitlement key id is not loaded in this session.
    #[error("Key not entitled")]
    KeyNotEntitled,

    /// The platform output protection does not satisfy the key policy.
    #[error("Insufficient HDCP")]
    InsufficientHdcp,

    /// Analog output is forbidden by the key policy.
    #[error("Analog output forbidden")]
    AnalogOutput,

    /// Decryption could not be performed.
    #[error("Decrypt failed: {0}")]
    DecryptFailed(String),

    /// The RSA key is missing, malformed or not usable for this operation.
    #[error("Invalid RSA key: {0}")]
    InvalidRsaKey(String),

    /// Keybox magic is not `kbox`.
    #[error("Keybox has bad magic")]
    BadMagic,

    /// Keybox CRC does not match its payload.
    #[error("Keybox has bad CRC")]
    BadCrc,

    /// No valid keybox is installed.
    #[error("Keybox is invalid")]
    KeyboxInvalid,

    /// The provider session token does not match the usage entry.
    #[error("Wrong provider session token")]
    WrongPst,

    /// The mac keys do not match the usage entry.
    #[error("Wrong mac keys for usage entry")]
    WrongKeys,

    /// The usage entry was deactivated.
    #[error("License inactive")]
    LicenseInactive,

    /// A report was requested before the entry was updated.
    #[error("Usage entry needs update")]
    EntryNeedsUpdate,

    /// The usage entry slot is bound to another open session.
    #[error("Usage entry in use")]
    EntryInUse,

    /// Persisted usage state is too far behind the in-memory generation.
    #[error("Generation skew")]
    GenerationSkew,

    /// A table (sessions or usage entries) is at capacity.
    #[error("Insufficient resources")]
    InsufficientResources,

    /// Too many sessions are open.
    #[error("Too many sessions open (max {max})")]
    TooManySessions { max: usize },

    /// The feature is not available on this build.
    #[error("Not implemented: {0}")]
    NotImplemented(&'static str),

    /// A decrypt hash did not match for the reported frame.
    #[error("Bad decrypt hash for frame {0}")]
    BadHash(u32),

    /// Generic failure.
    #[error("{0}")]
    UnknownFailure(String),

    /// RSA error.
    #[error("RSA error: {0}")]
    RsaError(#[from] rsa::Error),

    /// PKCS8 error.
    #[error("PKCS8 error: {0}")]
    Pkcs8Error(#[from] rsa::pkcs8::Error),

    /// Base64 decode error.
    #[error("Base64 decode error: {0}")]
    Base64DecodeError(#[from] base64::DecodeError),

    /// IO error.
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    /// YAML configuration error.
    #[error("YAML error: {0}")]
    YamlError(#[from] serde_yaml::Error),
}

impl Error {
    /// Whether the caller should grow its buffer and retry.
    #[must_use]
    pub fn is_short_buffer(&self) -> bool {
        matches!(self, Error::ShortBuffer { .. })
    }

    pub(crate) fn context(msg: impl Into<String>) -> Self {
        Error::InvalidContext(msg.into())
    }
}

/// Result type alias for rsoemcrypto operations.
pub type Result<T> = std::result::Result<T, Error>;
