use std::time::Duration;
use thiserror::Error;

/// Typed errors for the request/lifecycle paths. Anywhere the MCP protocol
/// allows an error-result, these surface as `isError=true` tool results rather
/// than protocol-level failures.
#[derive(Error, Debug)]
pub enum ProxyError {
    /// The qualified name does not resolve to a declared backend.
    #[error("unknown backend '{0}'")]
    UnknownBackend(String),

    /// The tool exists but is disabled or stale in the document.
    #[error("tool '{tool}' on backend '{backend}' is disabled or stale")]
    ToolHidden { backend: String, tool: String },

    /// The backend did not finish opening within the bound.
    #[error("backend '{backend}' did not open within {timeout:?}")]
    OpenTimeout { backend: String, timeout: Duration },

    /// A transport-level failure while opening or forwarding.
    #[error("transport failure on backend '{backend}': {source}")]
    TransportFailed {
        backend: String,
        #[source]
        source: anyhow::Error,
    },

    /// The backend URL resolves into a private, loopback, or link-local range.
    #[error("backend '{backend}' url host '{host}' resolves to a blocked address range")]
    SsrfBlocked { backend: String, host: String },
}
