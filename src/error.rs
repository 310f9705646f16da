//! Error types for the proxy engine and the discovery client

use std::io;
use thiserror::Error;

/// Errors from the per-port proxy engine.
///
/// Dial failures and mid-stream relay errors are handled inside the
/// engine (the affected connection is dropped); only listener
/// acquisition surfaces to the caller.
#[derive(Debug, Error)]
pub enum ProxyError {
    /// The local listener could not be bound. The reconciler logs this
    /// and retries on the next round as long as the port stays in the
    /// snapshot.
    #[error("failed to bind port {port}: {source}")]
    Bind {
        port: u16,
        #[source]
        source: io::Error,
    },
}

/// Errors from the task topology source.
///
/// All of these are retried on the next polling interval; the previous
/// proxy set is left untouched.
#[derive(Debug, Error)]
pub enum DiscoveryError {
    /// Transport-level failure talking to the API endpoint
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    /// The API returned an error response
    #[error("api error {code}: {message}")]
    Api { code: String, message: String },

    /// The API returned a body we could not interpret
    #[error("malformed response: {0}")]
    Malformed(String),
}
