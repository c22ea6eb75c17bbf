//! Dispatch of incoming requests to local operations.
//!
//! A [`Provider`] is anything that can look up an [`Operation`] by name. Two
//! adapters cover the common shapes:
//! - [`HandlerMap`]: a name → closure mapping
//! - [`ObjectProvider`]: methods of a shared object exposed under member names
//!
//! Types with a fixed set of operations can implement [`Provider`] directly.

use std::any::Any;
use std::borrow::Cow;
use std::collections::HashMap;
use std::panic::{self, AssertUnwindSafe};
use std::str::FromStr;
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde_json::{Map, Value};

use crate::bridge::protocol::{RemoteError, Request, Response};
use crate::error::PeerError;

/// Failure raised by a local operation.
///
/// Serialized as `{"message": ..., <fields>...}`. Peers are only guaranteed
/// to see `message`.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("{message}")]
pub struct OperationError {
    message: String,
    fields: Map<String, Value>,
}

impl OperationError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            fields: Map::new(),
        }
    }

    pub fn with_field(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        let key = key.into();
        if key != "message" {
            self.fields.insert(key, value.into());
        }
        self
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn fields(&self) -> &Map<String, Value> {
        &self.fields
    }
}

impl From<serde_json::Error> for OperationError {
    fn from(e: serde_json::Error) -> Self {
        Self::new(e.to_string())
    }
}

impl From<OperationError> for RemoteError {
    fn from(e: OperationError) -> Self {
        RemoteError {
            message: e.message,
            fields: e.fields,
        }
    }
}

/// Why a request produced an error response.
#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error("unknown operation: {0}")]
    UnknownOperation(String),

    #[error(transparent)]
    HandlerFailure(#[from] OperationError),
}

impl DispatchError {
    pub fn into_remote(self) -> RemoteError {
        match self {
            Self::UnknownOperation(_) => RemoteError::new(self.to_string()),
            Self::HandlerFailure(e) => e.into(),
        }
    }
}

pub type OperationResult = Result<Value, OperationError>;

/// A callable exposed to the remote peer.
pub trait Operation: Send + Sync {
    fn invoke(&self, args: Vec<Value>) -> OperationResult;
}

impl<F> Operation for F
where
    F: Fn(Vec<Value>) -> OperationResult + Send + Sync,
{
    fn invoke(&self, args: Vec<Value>) -> OperationResult {
        self(args)
    }
}

/// Source of operations callable by the remote peer.
pub trait Provider: Send + Sync + 'static {
    fn lookup(&self, name: &str) -> Option<&dyn Operation>;
}

impl<P: Provider + ?Sized> Provider for Arc<P> {
    fn lookup(&self, name: &str) -> Option<&dyn Operation> {
        (**self).lookup(name)
    }
}

impl<P: Provider + ?Sized> Provider for Box<P> {
    fn lookup(&self, name: &str) -> Option<&dyn Operation> {
        (**self).lookup(name)
    }
}

/// Map-backed provider.
#[derive(Default)]
pub struct HandlerMap {
    operations: HashMap<String, Box<dyn Operation>>,
}

impl HandlerMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a closure under `name`.
    pub fn with<F>(mut self, name: impl Into<String>, f: F) -> Self
    where
        F: Fn(Vec<Value>) -> OperationResult + Send + Sync + 'static,
    {
        self.insert(name, f);
        self
    }

    pub fn with_operation(
        mut self,
        name: impl Into<String>,
        operation: impl Operation + 'static,
    ) -> Self {
        self.operations.insert(name.into(), Box::new(operation));
        self
    }

    /// Register a closure, returning whatever was previously under `name`.
    pub fn insert<F>(&mut self, name: impl Into<String>, f: F) -> Option<Box<dyn Operation>>
    where
        F: Fn(Vec<Value>) -> OperationResult + Send + Sync + 'static,
    {
        self.operations.insert(name.into(), Box::new(f))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.operations.contains_key(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.operations.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.operations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.operations.is_empty()
    }
}

impl Provider for HandlerMap {
    fn lookup(&self, name: &str) -> Option<&dyn Operation> {
        self.operations.get(name).map(|op| op.as_ref())
    }
}

/// Object-backed provider: exposes methods of a shared `T` as named members.
///
/// ```ignore
/// let provider = ObjectProvider::new(Arc::new(Calculator::default()))
///     .member("add", Calculator::add)
///     .member("reset", Calculator::reset);
/// ```
pub struct ObjectProvider<T> {
    target: Arc<T>,
    members: HashMap<String, Box<dyn Operation>>,
}

impl<T: Send + Sync + 'static> ObjectProvider<T> {
    pub fn new(target: Arc<T>) -> Self {
        Self {
            target,
            members: HashMap::new(),
        }
    }

    pub fn member<F>(mut self, name: impl Into<String>, method: F) -> Self
    where
        F: Fn(&T, Vec<Value>) -> OperationResult + Send + Sync + 'static,
    {
        let target = Arc::clone(&self.target);
        self.members
            .insert(name.into(), Box::new(move |args: Vec<Value>| method(&target, args)));
        self
    }

    pub fn target(&self) -> &Arc<T> {
        &self.target
    }
}

impl<T: Send + Sync + 'static> Provider for ObjectProvider<T> {
    fn lookup(&self, name: &str) -> Option<&dyn Operation> {
        self.members.get(name).map(|op| op.as_ref())
    }
}

/// Deserialize the positional argument at `index`.
pub fn arg<T: DeserializeOwned>(args: &[Value], index: usize) -> Result<T, OperationError> {
    let value = args
        .get(index)
        .ok_or_else(|| OperationError::new(format!("missing argument {index}")))?;
    T::deserialize(value)
        .map_err(|e| OperationError::new(format!("invalid argument {index}: {e}")))
}

/// Template applied to incoming operation names before lookup, e.g. `"api_{}"`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NameTemplate {
    prefix: String,
    suffix: String,
}

impl NameTemplate {
    const SLOT: &'static str = "{}";

    pub fn identity() -> Self {
        Self::default()
    }

    /// Parse a template; it must contain exactly one `{}` slot.
    pub fn parse(template: &str) -> Result<Self, PeerError> {
        if template.matches(Self::SLOT).count() != 1 {
            return Err(PeerError::InvalidTemplate(template.to_string()));
        }
        let (prefix, suffix) = template
            .split_once(Self::SLOT)
            .ok_or_else(|| PeerError::InvalidTemplate(template.to_string()))?;
        Ok(Self {
            prefix: prefix.to_string(),
            suffix: suffix.to_string(),
        })
    }

    pub fn is_identity(&self) -> bool {
        self.prefix.is_empty() && self.suffix.is_empty()
    }

    pub fn apply<'a>(&self, name: &'a str) -> Cow<'a, str> {
        if self.is_identity() {
            Cow::Borrowed(name)
        } else {
            Cow::Owned(format!("{}{}{}", self.prefix, name, self.suffix))
        }
    }
}

impl FromStr for NameTemplate {
    type Err = PeerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl std::fmt::Display for NameTemplate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}{}{}", self.prefix, Self::SLOT, self.suffix)
    }
}

/// Resolves requests against a provider and builds the responses.
pub struct Dispatcher {
    provider: Box<dyn Provider>,
    template: NameTemplate,
}

impl Dispatcher {
    pub fn new(provider: impl Provider, template: NameTemplate) -> Self {
        Self {
            provider: Box::new(provider),
            template,
        }
    }

    /// Look up and run one operation. Panics inside the operation are caught
    /// and reported as handler failures.
    pub fn invoke(&self, operation: &str, args: Vec<Value>) -> Result<Value, DispatchError> {
        let name = self.template.apply(operation);
        let op = self
            .provider
            .lookup(&name)
            .ok_or_else(|| DispatchError::UnknownOperation(operation.to_string()))?;

        match panic::catch_unwind(AssertUnwindSafe(|| op.invoke(args))) {
            Ok(result) => result.map_err(DispatchError::from),
            Err(payload) => Err(DispatchError::HandlerFailure(OperationError::new(
                panic_message(payload.as_ref()),
            ))),
        }
    }

    /// Run a request. Returns the response to send, or `None` for
    /// fire-and-forget requests.
    pub fn dispatch(&self, request: Request) -> Option<Response> {
        let Request {
            operation,
            args,
            call_id,
        } = request;

        let outcome = self.invoke(&operation, args);
        match &outcome {
            Ok(_) => tracing::trace!(%operation, %call_id, "Operation succeeded"),
            Err(e) => tracing::warn!(%operation, %call_id, error = %e, "Operation failed"),
        }

        if !call_id.expects_response() {
            return None;
        }
        Some(match outcome {
            Ok(result) => Response::success(result, call_id),
            Err(e) => Response::failure(e.into_remote(), call_id),
        })
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "operation panicked".to_string()
    }
}
