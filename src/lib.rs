//! Client-side runtime for the Jupyter kernel messaging protocol.
//!
//! This crate implements the REST surface for enumerating kernel specs and
//! starting/stopping/interrupting/restarting kernels, plus the websocket
//! session that multiplexes the four Jupyter channels (shell, iopub, stdin,
//! control) for a single running kernel. See the [Jupyter client messaging
//! docs](https://jupyter-client.readthedocs.io/en/stable/messaging.html) and
//! the [`jupyter-server` websocket protocol
//! docs](https://jupyter-server.readthedocs.io/en/latest/developers/websocket-protocols.html)
//! for the wire-level details this crate builds on.

#![warn(missing_docs)]

pub mod comm;
pub mod future;
pub mod manager;
pub mod message;
pub mod registry;
pub mod rest;
pub mod session;
pub mod types;
pub mod wire;

pub use comm::Comm;
pub use future::KernelFuture;
pub use manager::{KernelManager, ManagerOptions};
pub use message::{Channel, KernelHeader, KernelMessageType, Message};
pub use session::{KernelSession, RunCellEvent, SessionEvent, SessionStatus};
pub use types::{KernelInfoReply, KernelModel, KernelSpec};

/// Errors surfaced to callers of this crate's public operations.
///
/// Not every kind in the protocol's error taxonomy appears here: per the
/// propagation rules of the wire protocol, some failures (an unknown
/// `comm_id`, a frame that fails schema validation, a panic inside a user
/// callback) are logged and swallowed inside dispatch rather than returned,
/// so that one bad message or misbehaving callback cannot take down an
/// otherwise-healthy session.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The underlying HTTP transport failed (connection refused, timed out,
    /// TLS failure, etc.), as opposed to the server returning an error
    /// status.
    #[error("network error: {0}")]
    Network(#[from] reqwest::Error),

    /// The server returned a status code other than the one the operation
    /// expects.
    #[error("unexpected HTTP status {status} from {path}")]
    BadStatus {
        /// The HTTP status code actually returned.
        status: u16,
        /// The REST path that was requested.
        path: String,
    },

    /// A response body failed to parse into the expected schema.
    #[error("invalid response: {0}")]
    InvalidResponse(String),

    /// The operation cannot proceed because the kernel's session has
    /// reached the terminal `dead` status.
    #[error("kernel is dead")]
    KernelDead,

    /// A kernel lookup (by id) found no matching kernel.
    #[error("no such kernel: {0}")]
    NoSuchKernel(String),

    /// The websocket connection failed or was lost.
    #[error("websocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    /// A URL could not be constructed.
    #[error("invalid URL: {0}")]
    InvalidUrl(#[from] url::ParseError),
}

/// Result type used throughout this crate's public API.
pub type Result<T> = std::result::Result<T, Error>;
