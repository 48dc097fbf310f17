//! Error types for the host bridge.

use thiserror::Error;

/// Errors that can occur while hosting a VM instance.
///
/// The terminal variants (`RuntimeFault`, `BadFileDescriptor`, `FatalExit`,
/// `Internal`) put the instance into its absorbing `Terminated` state. The
/// error is `Clone` so that the terminal reason can be handed to every
/// observer of a session.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BridgeError {
    /// The startup configuration was rejected before any VM work began.
    #[error("config error: {0}")]
    Config(String),

    /// The VM reported a fault through its fault-report import.
    #[error("runtime fault: {0}")]
    RuntimeFault(String),

    /// The VM wrote to a stream other than stdout or stderr.
    #[error("bad file descriptor: {0}")]
    BadFileDescriptor(u32),

    /// The VM requested a forced process exit.
    #[error("proc_exit called: {0}")]
    FatalExit(u32),

    /// A connection could not be opened. Returned to the VM as a status code.
    #[error("connection error: {0}")]
    Connection(#[from] ConnectionError),

    /// The host/VM protocol was violated.
    #[error("internal error: {0}")]
    Internal(String),

    /// The instance has already terminated.
    #[error("VM instance has terminated")]
    Terminated,

    /// The WASM engine failed to compile, link or instantiate the module.
    #[error("wasm error ({stage}): {message}")]
    Wasm { stage: &'static str, message: String },

    /// The VM bytecode could not be decoded.
    #[error("decode error: {0}")]
    Decode(String),

    /// A database sink failed to apply a payload.
    #[error("persistence error: {0}")]
    Persistence(String),

    /// A channel was closed unexpectedly.
    #[error("channel closed")]
    ChannelClosed,
}

impl BridgeError {
    pub(crate) fn wasm(stage: &'static str, err: impl std::fmt::Display) -> Self {
        Self::Wasm {
            stage,
            message: err.to_string(),
        }
    }

    /// Whether this error leaves the VM instance unusable.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            BridgeError::RuntimeFault(_)
                | BridgeError::BadFileDescriptor(_)
                | BridgeError::FatalExit(_)
                | BridgeError::Internal(_)
                | BridgeError::Terminated
        )
    }
}

/// Reasons a connection-open request is refused.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConnectionError {
    /// The address does not match the supported multiaddress grammar.
    #[error("unsupported address: {0}")]
    UnsupportedAddress(String),

    /// The transport kind is not available in this host environment.
    #[error("transport unavailable: {0}")]
    TransportUnavailable(&'static str),
}

/// Result type alias for bridge operations.
pub type Result<T> = std::result::Result<T, BridgeError>;
