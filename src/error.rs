use std::io;
use std::time::Duration;

use http::StatusCode;
use hyper::Response;

use crate::response::{self, ProxyBody};

/// Errors raised while authorizing, dialing, tunneling or forwarding a request.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum ProxyError {
    /// Missing or undecodable `Proxy-Authorization`.
    #[error("proxy authentication required")]
    AuthRequired,

    /// The authenticator declined the credentials.
    #[error("proxy credentials rejected")]
    AuthRejected,

    #[error("unsupported proxy scheme: {0}")]
    UpstreamUnsupported(String),

    /// Target or upstream proxy unreachable.
    #[error("failed to connect to {addr}: {source}")]
    Dial {
        addr: String,
        #[source]
        source: io::Error,
    },

    /// Upstream CONNECT answered with a non-200 status, or SOCKS5 negotiation failed.
    #[error("upstream handshake failed: {0}")]
    Handshake(String),

    #[error("connection hijack failed: {0}")]
    Hijack(String),

    /// Mid-stream I/O error after the client connection was taken over.
    #[error("relay failed: {0}")]
    Relay(#[source] io::Error),

    #[error("bad request: {0}")]
    BadRequest(String),

    #[error("round trip failed: {0}")]
    RoundTrip(String),

    #[error("no response within {0:?}")]
    Timeout(Duration),

    #[error("invalid configuration: {0}")]
    Config(String),
}

impl ProxyError {
    /// Status to answer the client with, or `None` once the connection has
    /// been hijacked and no response can be written.
    pub fn status(&self) -> Option<StatusCode> {
        match self {
            ProxyError::AuthRequired => Some(StatusCode::PROXY_AUTHENTICATION_REQUIRED),
            ProxyError::AuthRejected => Some(StatusCode::FORBIDDEN),
            ProxyError::UpstreamUnsupported(_)
            | ProxyError::Dial { .. }
            | ProxyError::Handshake(_)
            | ProxyError::Hijack(_)
            | ProxyError::RoundTrip(_) => Some(StatusCode::BAD_GATEWAY),
            ProxyError::BadRequest(_) => Some(StatusCode::BAD_REQUEST),
            ProxyError::Timeout(_) => Some(StatusCode::GATEWAY_TIMEOUT),
            ProxyError::Config(_) => Some(StatusCode::INTERNAL_SERVER_ERROR),
            ProxyError::Relay(_) => None,
        }
    }

    pub fn into_response(self) -> Response<ProxyBody> {
        match self {
            ProxyError::AuthRequired => response::proxy_auth_required(),
            other => response::status(other.status().unwrap_or(StatusCode::BAD_GATEWAY)),
        }
    }
}
