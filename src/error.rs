//! Crate-wide error type.
//!
//! Every fallible operation inside the proxy core returns a [`ProxyError`].
//! `ConnectionHandler` maps each variant to the status code and log level
//! from the proxy's error handling table.

use thiserror::Error;

pub type Result<T, E = ProxyError> = std::result::Result<T, E>;

#[derive(Debug, Error)]
pub enum ProxyError {
    #[error("malformed request: {0}")]
    ClientProtocolError(String),

    #[error("{0}")]
    Blocked(String),

    #[error("certificate mint failed: {0}")]
    CertMintError(String),

    #[error("upstream connect failed: {0}")]
    UpstreamConnectError(String),

    #[error("malformed upstream response: {0}")]
    UpstreamProtocolError(String),

    #[error("cache error: {0}")]
    CacheError(String),

    #[error("internal error: {0}")]
    InternalError(String),

    #[error("client gone")]
    ClientGone,
}

impl ProxyError {
    /// HTTP status code this error maps to when it can still be reported to
    /// the client (no mapping exists for `ClientGone`, which is abandoned
    /// silently).
    pub fn status_code(&self) -> Option<u16> {
        match self {
            ProxyError::ClientProtocolError(_) => Some(400),
            ProxyError::Blocked(_) => Some(403),
            ProxyError::CertMintError(_) => Some(502),
            ProxyError::UpstreamConnectError(_) => Some(502),
            ProxyError::UpstreamProtocolError(_) => Some(502),
            ProxyError::InternalError(_) => Some(500),
            ProxyError::CacheError(_) => None,
            ProxyError::ClientGone => None,
        }
    }
}

impl From<std::io::Error> for ProxyError {
    fn from(e: std::io::Error) -> Self {
        use std::io::ErrorKind::*;
        match e.kind() {
            ConnectionReset | ConnectionAborted | BrokenPipe | UnexpectedEof => {
                ProxyError::ClientGone
            }
            _ => ProxyError::InternalError(e.to_string()),
        }
    }
}
