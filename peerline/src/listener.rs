//! Background task reading the input stream.
//!
//! Flow per line:
//! 1. Decode (unparseable lines are dropped)
//! 2. Request: dispatch to the local provider, write the response
//! 3. Response: hand it to the pending callback
//! 4. Exit if a stop was requested
//!
//! Requests are handled inline, one at a time. A slow operation delays every
//! later message, including responses other callers are waiting on.

use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::watch;
use tokio_util::codec::{FramedRead, FramedWrite};

use crate::bridge::codec::LineCodec;
use crate::bridge::protocol::{Message, RemoteError};
use crate::correlation::CorrelationTable;
use crate::dispatch::Dispatcher;
use crate::error::PeerError;

pub(crate) type BoxedReader = Pin<Box<dyn AsyncRead + Send>>;
pub(crate) type BoxedWriter = Pin<Box<dyn AsyncWrite + Send>>;

/// Output side, shared by callers and the listener. One `send` per message
/// (write + flush) under the lock keeps lines intact.
pub(crate) type SharedWriter = Arc<tokio::sync::Mutex<FramedWrite<BoxedWriter, LineCodec>>>;

/// Lifecycle of a peer's listener.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ListenerState {
    /// Created but not started.
    Idle,
    Listening,
    /// Exited after a stop request.
    Stopped,
    /// Input reached end of stream.
    Closed,
    /// Reading or writing failed.
    Failed(String),
}

impl ListenerState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Stopped | Self::Closed | Self::Failed(_))
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Listening => "listening",
            Self::Stopped => "stopped",
            Self::Closed => "closed",
            Self::Failed(_) => "failed",
        }
    }
}

enum Exit {
    Stopped,
    EndOfInput,
}

/// State the per-message handling needs. Kept apart from the reader so it
/// can be borrowed while the reader is mutably borrowed.
pub(crate) struct Pipeline {
    pub(crate) writer: SharedWriter,
    pub(crate) dispatcher: Arc<Dispatcher>,
    pub(crate) table: Arc<CorrelationTable>,
}

pub(crate) struct Listener {
    pub(crate) reader: FramedRead<BoxedReader, LineCodec>,
    pub(crate) pipeline: Pipeline,
    pub(crate) listening: Arc<AtomicBool>,
    pub(crate) state: watch::Sender<ListenerState>,
}

impl Listener {
    pub(crate) async fn run(mut self) -> Result<(), PeerError> {
        self.state.send_replace(ListenerState::Listening);
        tracing::debug!("Listener started");

        let outcome = self.event_loop().await;
        let final_state = match &outcome {
            Ok(Exit::Stopped) => ListenerState::Stopped,
            Ok(Exit::EndOfInput) => ListenerState::Closed,
            Err(e) => ListenerState::Failed(e.to_string()),
        };

        let abandoned = self.pipeline.table.close(RemoteError::connection_closed());
        if abandoned > 0 {
            tracing::debug!(abandoned, "Failed pending calls on listener exit");
        }

        tracing::debug!(state = final_state.as_str(), "Listener exiting");
        self.state.send_replace(final_state);
        outcome.map(|_| ())
    }

    async fn event_loop(&mut self) -> Result<Exit, PeerError> {
        loop {
            match self.reader.next().await {
                Some(Ok(Ok(message))) => self.pipeline.handle(message).await?,
                Some(Ok(Err(e))) => {
                    tracing::trace!(error = %e, "Dropping unrecognized line");
                }
                Some(Err(e)) => {
                    tracing::error!(error = %e, "Input stream error");
                    return Err(PeerError::Stream(e));
                }
                None => {
                    tracing::debug!("Input stream closed");
                    return Ok(Exit::EndOfInput);
                }
            }

            // Checked only between messages: a stop never interrupts a read.
            if !self.listening.load(Ordering::Acquire) {
                return Ok(Exit::Stopped);
            }
        }
    }
}

impl Pipeline {
    async fn handle(&self, message: Message) -> Result<(), PeerError> {
        match message {
            Message::Request(request) => {
                tracing::trace!(
                    operation = %request.operation,
                    call_id = %request.call_id,
                    "Request received"
                );
                let Some(response) = self.dispatcher.dispatch(request) else {
                    return Ok(());
                };
                let call_id = response.call_id;
                let mut w = self.writer.lock().await;
                if let Err(e) = w.send(Message::Response(response)).await {
                    tracing::error!(%call_id, error = %e, "Failed to send response");
                    return Err(PeerError::Stream(e));
                }
            }
            Message::Response(response) => {
                let call_id = response.call_id;
                let (error, result) = response.into_outcome();
                if !self.table.resolve(call_id, error, result) {
                    tracing::debug!(%call_id, "Discarding response with no pending call");
                }
            }
        }
        Ok(())
    }
}
