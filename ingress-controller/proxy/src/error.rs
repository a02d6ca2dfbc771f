use ingress_controller_core::retry::Outcome;
use std::io;

/// Errors raised while forwarding a request upstream.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("no healthy endpoints for cluster {0}")]
    NoHealthyEndpoints(String),

    #[error("failed to connect to {addr}: {source}")]
    Connect {
        addr: String,
        #[source]
        source: io::Error,
    },

    #[error("TLS handshake with {addr} failed: {source}")]
    UpstreamTls {
        addr: String,
        #[source]
        source: io::Error,
    },

    #[error("invalid upstream TLS configuration: {0}")]
    ClientConfig(#[from] crate::tls::ConfigError),

    #[error("HTTP handshake failed: {0}")]
    Handshake(#[source] hyper::Error),

    #[error("upstream request failed: {0}")]
    Upstream(#[source] hyper::Error),

    #[error("invalid upstream request: {0}")]
    Request(#[from] http::Error),

    #[error("upstream request timed out")]
    Timeout,
}

// === impl Error ===

impl Error {
    /// Classifies the error for retry decisions.
    pub(crate) fn outcome(&self) -> Outcome {
        match self {
            Self::NoHealthyEndpoints(_)
            | Self::Connect { .. }
            | Self::UpstreamTls { .. }
            | Self::ClientConfig(_)
            | Self::Handshake(_)
            | Self::Request(_) => Outcome::ConnectFailure,
            Self::Upstream(_) => Outcome::Reset,
            Self::Timeout => Outcome::Timeout,
        }
    }

    pub(crate) fn status(&self) -> http::StatusCode {
        match self {
            Self::Timeout => http::StatusCode::GATEWAY_TIMEOUT,
            _ => http::StatusCode::SERVICE_UNAVAILABLE,
        }
    }
}
