//! Peer - one endpoint of a connection.
//!
//! Owns the output stream, the correlation table and the listener task.
//! Calls go out on the caller's task; responses and incoming requests are
//! handled on the listener task.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex as StdMutex, MutexGuard};

use futures::SinkExt;
use serde_json::Value;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;
use tokio_util::codec::{FramedRead, FramedWrite};

use crate::bridge::codec::{DEFAULT_MAX_LINE_LENGTH, LineCodec};
use crate::bridge::protocol::{CallId, Message, Request};
use crate::correlation::{Callback, CorrelationTable, callback};
use crate::dispatch::{Dispatcher, NameTemplate, Provider};
use crate::error::{CallError, PeerError};
use crate::listener::{
    BoxedReader, BoxedWriter, Listener, ListenerState, Pipeline, SharedWriter,
};
use crate::proxy::RemoteProxy;

#[derive(Debug, Clone)]
pub struct PeerConfig {
    pub template: NameTemplate,
    pub auto_start: bool,
    pub max_line_length: usize,
}

impl Default for PeerConfig {
    fn default() -> Self {
        Self::new()
    }
}

impl PeerConfig {
    pub fn new() -> Self {
        Self {
            template: NameTemplate::identity(),
            auto_start: true,
            max_line_length: DEFAULT_MAX_LINE_LENGTH,
        }
    }

    pub fn with_template(mut self, template: NameTemplate) -> Self {
        self.template = template;
        self
    }

    pub fn with_auto_start(mut self, auto_start: bool) -> Self {
        self.auto_start = auto_start;
        self
    }

    pub fn with_max_line_length(mut self, max: usize) -> Self {
        self.max_line_length = max;
        self
    }
}

struct PeerInner {
    writer: SharedWriter,
    table: Arc<CorrelationTable>,
    listening: Arc<AtomicBool>,
    state: watch::Receiver<ListenerState>,
    /// Taken by the first `start()`.
    listener: StdMutex<Option<Listener>>,
    task: StdMutex<Option<JoinHandle<Result<(), PeerError>>>>,
}

/// Handle to one end of a connection. Cheap to clone.
#[derive(Clone)]
pub struct Peer {
    inner: Arc<PeerInner>,
}

fn lock<T>(mutex: &StdMutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => {
            tracing::error!("Peer mutex poisoned - recovering");
            poisoned.into_inner()
        }
    }
}

impl Peer {
    /// Create a peer over the given streams.
    ///
    /// With `auto_start` (the default) the listener is spawned right away,
    /// which requires a tokio runtime.
    pub fn new<R, W, P>(
        reader: R,
        writer: W,
        provider: P,
        config: PeerConfig,
    ) -> Result<Self, PeerError>
    where
        R: AsyncRead + Send + 'static,
        W: AsyncWrite + Send + 'static,
        P: Provider,
    {
        let reader: BoxedReader = Box::pin(reader);
        let writer: BoxedWriter = Box::pin(writer);

        let writer: SharedWriter = Arc::new(tokio::sync::Mutex::new(FramedWrite::new(
            writer,
            LineCodec::with_max_length(config.max_line_length),
        )));
        let table = Arc::new(CorrelationTable::new());
        let listening = Arc::new(AtomicBool::new(true));
        let (state_tx, state_rx) = watch::channel(ListenerState::Idle);

        let listener = Listener {
            reader: FramedRead::new(reader, LineCodec::with_max_length(config.max_line_length)),
            pipeline: Pipeline {
                writer: Arc::clone(&writer),
                dispatcher: Arc::new(Dispatcher::new(provider, config.template.clone())),
                table: Arc::clone(&table),
            },
            listening: Arc::clone(&listening),
            state: state_tx,
        };

        let peer = Self {
            inner: Arc::new(PeerInner {
                writer,
                table,
                listening,
                state: state_rx,
                listener: StdMutex::new(Some(listener)),
                task: StdMutex::new(None),
            }),
        };

        if config.auto_start {
            peer.start()?;
        }
        Ok(peer)
    }

    /// Peer over this process's stdin/stdout.
    pub fn stdio<P: Provider>(provider: P, config: PeerConfig) -> Result<Self, PeerError> {
        Self::new(tokio::io::stdin(), tokio::io::stdout(), provider, config)
    }

    /// Spawn the listener. Fails if it was started before.
    ///
    /// Clears any stop requested before the start.
    pub fn start(&self) -> Result<(), PeerError> {
        let runtime = tokio::runtime::Handle::try_current().map_err(|_| PeerError::NoRuntime)?;
        let listener = lock(&self.inner.listener)
            .take()
            .ok_or(PeerError::AlreadyStarted)?;
        self.inner.listening.store(true, Ordering::Release);

        let handle = runtime.spawn(listener.run());
        *lock(&self.inner.task) = Some(handle);
        Ok(())
    }

    /// Ask the listener to exit.
    ///
    /// Observed between messages only: a listener blocked in a read handles
    /// the line it receives next, then exits. A stop requested before
    /// [`Peer::start`] is discarded by it.
    pub fn stop(&self) {
        tracing::debug!("Stop requested");
        self.inner.listening.store(false, Ordering::Release);
    }

    pub fn is_listening(&self) -> bool {
        self.inner.listening.load(Ordering::Acquire) && self.state() == ListenerState::Listening
    }

    pub fn state(&self) -> ListenerState {
        self.inner.state.borrow().clone()
    }

    /// Wait until the listener has terminated and return how it ended.
    ///
    /// Never returns for a peer whose listener is not started.
    pub async fn closed(&self) -> ListenerState {
        let mut rx = self.inner.state.clone();
        let state = match rx.wait_for(ListenerState::is_terminal).await {
            Ok(state) => state.clone(),
            Err(_) => ListenerState::Failed("listener task ended unexpectedly".to_string()),
        };
        state
    }

    /// Join the listener task, surfacing a stream failure as an error.
    pub async fn wait(&self) -> Result<(), PeerError> {
        let handle = lock(&self.inner.task).take().ok_or(PeerError::NotRunning)?;
        handle
            .await
            .map_err(|e| PeerError::Listener(e.to_string()))?
    }

    /// Number of calls waiting for a response.
    pub fn pending_calls(&self) -> usize {
        self.inner.table.len()
    }

    /// Send a request. With a callback, the response is delivered to it on
    /// the listener task; without one, no response is requested.
    ///
    /// Returns once the request is written, never waiting for the response.
    pub async fn call(
        &self,
        operation: impl Into<String>,
        args: Vec<Value>,
        callback: Option<Callback>,
    ) -> Result<CallId, PeerError> {
        let operation = operation.into();
        let call_id = self.inner.table.allocate(callback)?;
        tracing::trace!(%operation, %call_id, "Sending request");

        let sent = {
            let mut w = self.inner.writer.lock().await;
            w.send(Message::Request(Request {
                operation,
                args,
                call_id,
            }))
            .await
        };

        if let Err(e) = sent {
            self.inner.table.cancel(call_id);
            tracing::error!(%call_id, error = %e, "Failed to send request");
            return Err(PeerError::Stream(e));
        }
        Ok(call_id)
    }

    /// Fire-and-forget call.
    pub async fn notify(
        &self,
        operation: impl Into<String>,
        args: Vec<Value>,
    ) -> Result<(), PeerError> {
        self.call(operation, args, None).await.map(|_| ())
    }

    /// Call and wait for the result.
    pub async fn request(
        &self,
        operation: impl Into<String>,
        args: Vec<Value>,
    ) -> Result<Value, CallError> {
        let (tx, rx) = oneshot::channel();
        let cb = callback(move |error, result| {
            let outcome = match error {
                Some(error) => Err(error),
                None => Ok(result.unwrap_or(Value::Null)),
            };
            let _ = tx.send(outcome);
        });

        self.call(operation, args, Some(cb)).await?;
        match rx.await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(error)) => Err(CallError::Remote(error)),
            Err(_) => Err(CallError::Dropped),
        }
    }

    /// Expose the named remote operations as local callables.
    pub fn as_proxy<I, S>(&self, names: I) -> RemoteProxy
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        RemoteProxy::new(self.clone(), names)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::HandlerMap;

    #[test]
    fn config_defaults() {
        let config = PeerConfig::default();
        assert!(config.auto_start);
        assert!(config.template.is_identity());
        assert_eq!(config.max_line_length, DEFAULT_MAX_LINE_LENGTH);
    }

    #[test]
    fn config_builder() {
        let config = PeerConfig::new()
            .with_template(NameTemplate::parse("ns_{}").unwrap())
            .with_auto_start(false)
            .with_max_line_length(1024);
        assert!(!config.auto_start);
        assert_eq!(config.template.apply("x"), "ns_x");
        assert_eq!(config.max_line_length, 1024);
    }

    #[test]
    fn auto_start_outside_runtime_fails() {
        let result = Peer::new(
            tokio::io::empty(),
            tokio::io::sink(),
            HandlerMap::new(),
            PeerConfig::new(),
        );
        assert!(matches!(result, Err(PeerError::NoRuntime)));
    }

    #[tokio::test]
    async fn second_start_fails() {
        let peer = Peer::new(
            tokio::io::empty(),
            tokio::io::sink(),
            HandlerMap::new(),
            PeerConfig::new().with_auto_start(false),
        )
        .unwrap();
        assert_eq!(peer.state(), ListenerState::Idle);

        peer.start().unwrap();
        assert!(matches!(peer.start(), Err(PeerError::AlreadyStarted)));
    }

    #[tokio::test]
    async fn end_of_input_closes_listener() {
        let peer = Peer::new(
            tokio::io::empty(),
            tokio::io::sink(),
            HandlerMap::new(),
            PeerConfig::new(),
        )
        .unwrap();
        assert_eq!(peer.closed().await, ListenerState::Closed);
        peer.wait().await.unwrap();
        assert!(matches!(peer.wait().await, Err(PeerError::NotRunning)));
        assert!(!peer.is_listening());
    }

    #[tokio::test]
    async fn fire_and_forget_never_registers() {
        let peer = Peer::new(
            tokio::io::empty(),
            tokio::io::sink(),
            HandlerMap::new(),
            PeerConfig::new().with_auto_start(false),
        )
        .unwrap();

        let id = peer.call("log", vec![], None).await.unwrap();
        assert_eq!(id, CallId::NONE);
        assert_eq!(peer.pending_calls(), 0);
    }
}
