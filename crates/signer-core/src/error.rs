//! Error types returned by the signing daemon core.
//!
//! Follows the taxonomy in the spec: distinct kinds per failure category so
//! callers (the RPC backend, the authorization engine) can branch on *what*
//! went wrong rather than matching strings.

use std::fmt;

#[derive(Debug)]
#[allow(dead_code)]
pub enum SignerError {
    // Input errors
    InvalidKeyName(String),
    InvalidUri(String),
    InvalidRelay(String),
    TooManyRelays(usize),
    PassphraseTooLong,
    InvalidInput(String),

    // State errors
    NotFound(String),
    AlreadyExists(String),
    AlreadyConnected(String),
    NotEncrypted(String),
    AlreadyEncrypted(String),
    KeyLocked(String),
    AppSuspended(String),

    // Auth errors
    WrongPassphrase,
    RateLimited { retry_after_secs: u64 },

    // Policy errors
    Unauthorized(String),

    // Crypto errors
    MalformedCiphertext(String),
    InvalidSignature,
    InvalidKeyForm(String),

    // Transport errors
    NoRelayReachable,
    PublishTimeout,

    // Token errors
    TokenExpired,
    TokenAlreadyRedeemed,

    // Lifecycle
    ShuttingDown,

    // Escape hatch for persistence/serialization failures that don't need
    // their own variant but must still bubble up as a SignerError.
    Internal(String),
}

impl fmt::Display for SignerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidKeyName(s) => write!(f, "invalid key name: {s}"),
            Self::InvalidUri(s) => write!(f, "invalid URI: {s}"),
            Self::InvalidRelay(s) => write!(f, "invalid relay URL: {s}"),
            Self::TooManyRelays(n) => write!(f, "too many relays: {n} (max 10)"),
            Self::PassphraseTooLong => write!(f, "passphrase exceeds 256 characters"),
            Self::InvalidInput(s) => write!(f, "invalid input: {s}"),
            Self::NotFound(s) => write!(f, "not found: {s}"),
            Self::AlreadyExists(s) => write!(f, "already exists: {s}"),
            Self::AlreadyConnected(s) => write!(f, "already connected: {s}"),
            Self::NotEncrypted(s) => write!(f, "key is not encrypted: {s}"),
            Self::AlreadyEncrypted(s) => write!(f, "key is already encrypted: {s}"),
            Self::KeyLocked(s) => write!(f, "key is locked: {s}"),
            Self::AppSuspended(s) => write!(f, "app is suspended: {s}"),
            Self::WrongPassphrase => write!(f, "wrong passphrase"),
            Self::RateLimited { retry_after_secs } => {
                write!(f, "rate limited, retry after {retry_after_secs}s")
            }
            Self::Unauthorized(s) => write!(f, "unauthorized: {s}"),
            Self::MalformedCiphertext(s) => write!(f, "malformed ciphertext: {s}"),
            Self::InvalidSignature => write!(f, "invalid signature"),
            Self::InvalidKeyForm(s) => write!(f, "invalid key form: {s}"),
            Self::NoRelayReachable => write!(f, "no relay reachable"),
            Self::PublishTimeout => write!(f, "publish timed out"),
            Self::TokenExpired => write!(f, "connection token expired"),
            Self::TokenAlreadyRedeemed => write!(f, "connection token already redeemed"),
            Self::ShuttingDown => write!(f, "shutting down"),
            Self::Internal(s) => write!(f, "internal error: {s}"),
        }
    }
}

impl std::error::Error for SignerError {}

impl From<rusqlite::Error> for SignerError {
    fn from(e: rusqlite::Error) -> Self {
        Self::Internal(format!("sqlite: {e}"))
    }
}

impl From<serde_json::Error> for SignerError {
    fn from(e: serde_json::Error) -> Self {
        Self::Internal(format!("json: {e}"))
    }
}

pub type SignerResult<T> = Result<T, SignerError>;
