use std::time::Duration;

/// Authentication handshake failures.
///
/// Each variant maps to one step of the phone/code/password flow and is
/// recoverable by retrying that step.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum AuthError {
    #[error("invalid phone number")]
    InvalidPhoneNumber,

    #[error("invalid login code")]
    InvalidCode,

    #[error("invalid 2FA password")]
    InvalidPassword,

    #[error("2FA password required")]
    NeedsPassword,
}

/// Failures from the messaging provider, classified so callers can decide
/// retry policy.
#[derive(Debug, thiserror::Error)]
pub enum ProviderError {
    /// Rate limited; the provider tells us how long to back off.
    #[error("flood wait: retry after {retry_after:?}")]
    Flood { retry_after: Duration },

    #[error("invalid target: {0}")]
    InvalidTarget(String),

    /// The handle is no longer usable; a fresh authentication cycle is
    /// required.
    #[error("provider disconnected")]
    Disconnected,

    #[error("provider error: {0}")]
    Unknown(String),
}

/// Core error type.
///
/// Adapter crates map their specific errors into this type so the core can
/// handle failures consistently (operator-facing message vs retryable).
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error(transparent)]
    Auth(#[from] AuthError),

    #[error(transparent)]
    Provider(#[from] ProviderError),

    /// A send job is already active; at most one runs at a time.
    #[error("a send job is already running")]
    AlreadyRunning,

    #[error("not authenticated")]
    NotAuthenticated,

    #[error("no login attempt in progress")]
    NoPendingLogin,

    #[error("config error: {0}")]
    Config(String),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("external error: {0}")]
    External(String),
}

impl Error {
    /// Flood backoff hint, if this error carries one.
    pub fn flood_retry_after(&self) -> Option<Duration> {
        match self {
            Error::Provider(ProviderError::Flood { retry_after }) => Some(*retry_after),
            _ => None,
        }
    }

    pub fn is_disconnected(&self) -> bool {
        matches!(self, Error::Provider(ProviderError::Disconnected))
    }
}

pub type Result<T> = std::result::Result<T, Error>;
