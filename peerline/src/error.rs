use std::io;

use thiserror::Error;

use crate::bridge::protocol::RemoteError;

/// Errors raised by the local side of a connection.
#[derive(Debug, Error)]
pub enum PeerError {
    /// Reading from or writing to the underlying stream failed.
    #[error("stream error: {0}")]
    Stream(#[from] io::Error),

    #[error("listener already started")]
    AlreadyStarted,

    #[error("listener is not running")]
    NotRunning,

    /// The listener has terminated; no further responses can arrive.
    #[error("connection closed")]
    Closed,

    #[error("no tokio runtime available to run the listener")]
    NoRuntime,

    #[error("invalid operation name template '{0}': expected exactly one '{{}}' slot")]
    InvalidTemplate(String),

    #[error("listener task failed: {0}")]
    Listener(String),
}

/// Errors from awaiting the result of a call.
#[derive(Debug, Error)]
pub enum CallError {
    /// The remote side answered with an error.
    #[error(transparent)]
    Remote(#[from] RemoteError),

    /// The request could not be sent.
    #[error(transparent)]
    Send(#[from] PeerError),

    #[error("call was dropped before a response arrived")]
    Dropped,
}
