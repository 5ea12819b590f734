//! Error kinds shared across the gateway crates.

/// Errors surfaced by the streaming core and its collaborators.
///
/// Pre-upgrade errors map onto HTTP statuses; post-upgrade errors are
/// delivered as `stream-error` control events before the stream closes.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("unauthenticated: {0}")]
    Unauthenticated(String),
    #[error("forbidden: {0}")]
    Forbidden(String),
    #[error("not_found: {0}")]
    NotFound(String),
    #[error("invalid: {0}")]
    Invalid(String),
    #[error("rate_limited: {0}")]
    RateLimited(String),
    #[error("upstream_unavailable: {0}")]
    UpstreamUnavailable(String),
    #[error("broker_unavailable: {0}")]
    BrokerUnavailable(String),
    /// Subscriber went away. Expected; never logged as an error.
    #[error("client_gone")]
    ClientGone,
    #[error("internal: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Stable machine-readable kind, used in JSON error bodies.
    pub fn kind(&self) -> &'static str {
        match self {
            Error::Unauthenticated(_) => "unauthenticated",
            Error::Forbidden(_) => "forbidden",
            Error::NotFound(_) => "not_found",
            Error::Invalid(_) => "invalid",
            Error::RateLimited(_) => "rate_limited",
            Error::UpstreamUnavailable(_) => "upstream_unavailable",
            Error::BrokerUnavailable(_) => "broker_unavailable",
            Error::ClientGone => "client_gone",
            Error::Internal(_) => "internal",
        }
    }
}

impl From<anyhow::Error> for Error {
    fn from(e: anyhow::Error) -> Self {
        Error::Internal(e.to_string())
    }
}
