//! Wire protocol types for peer-to-peer calls.
//!
//! Every message is one compact JSON array on its own line. Requests and
//! responses share the stream and are told apart by their shape:
//! - **Request**: `["name",[args...],callId]`
//! - **Response**: `[[null,result],callId]`, or `[[error],callId]` when the call failed
//!
//! A `callId` of `-1` marks a fire-and-forget request; no response is sent for it.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Message used when an incoming error object carries no `message` field.
const DEFAULT_ERROR_MESSAGE: &str = "ERROR";

/// Identifier correlating a request with its response.
///
/// Plain integer on the wire so that peers written against the array format
/// interoperate. `-1` is reserved for "no response wanted".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CallId(i64);

impl CallId {
    /// Sentinel for fire-and-forget requests.
    pub const NONE: CallId = CallId(-1);

    pub const fn new(id: i64) -> Self {
        Self(id)
    }

    pub const fn get(self) -> i64 {
        self.0
    }

    pub fn expects_response(self) -> bool {
        self != Self::NONE
    }
}

impl std::fmt::Display for CallId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Error value carried across the boundary.
///
/// `message` is the only field every peer understands. Extra fields are kept
/// when the sender provides them, but callers must not rely on their presence.
#[derive(Debug, Clone, PartialEq, thiserror::Error, Serialize, Deserialize)]
#[error("{message}")]
pub struct RemoteError {
    pub message: String,
    #[serde(flatten)]
    pub fields: Map<String, Value>,
}

impl RemoteError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            fields: Map::new(),
        }
    }

    /// Error handed to callbacks that were still pending when the connection ended.
    pub fn connection_closed() -> Self {
        Self::new("connection closed")
    }

    /// Attach an extra named field. `message` cannot be overridden this way.
    pub fn with_field(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        let key = key.into();
        if key != "message" {
            self.fields.insert(key, value.into());
        }
        self
    }

    pub fn field(&self, key: &str) -> Option<&Value> {
        self.fields.get(key)
    }

    /// Materialize whatever the remote side put in the error slot.
    ///
    /// Objects keep their fields, with `message` lifted out (defaulting to
    /// `"ERROR"`). A bare string becomes the message; anything else is
    /// stringified.
    pub fn from_value(value: Value) -> Self {
        match value {
            Value::Object(mut fields) => {
                let message = match fields.remove("message") {
                    Some(Value::String(message)) => message,
                    Some(other) => other.to_string(),
                    None => DEFAULT_ERROR_MESSAGE.to_string(),
                };
                Self { message, fields }
            }
            Value::String(message) => Self::new(message),
            other => Self::new(other.to_string()),
        }
    }
}

/// Call of a named operation on the other peer.
#[derive(Debug, Clone, PartialEq)]
pub struct Request {
    pub operation: String,
    pub args: Vec<Value>,
    pub call_id: CallId,
}

/// Outcome of a call, routed back by `call_id`.
///
/// `result` is only ever set when `error` is not.
#[derive(Debug, Clone, PartialEq)]
pub struct Response {
    pub error: Option<RemoteError>,
    pub result: Option<Value>,
    pub call_id: CallId,
}

impl Response {
    pub fn success(result: Value, call_id: CallId) -> Self {
        Self {
            error: None,
            result: Some(result),
            call_id,
        }
    }

    pub fn failure(error: RemoteError, call_id: CallId) -> Self {
        Self {
            error: Some(error),
            result: None,
            call_id,
        }
    }

    pub fn into_outcome(self) -> (Option<RemoteError>, Option<Value>) {
        (self.error, self.result)
    }
}

/// A decoded line.
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    Request(Request),
    Response(Response),
}

impl Message {
    pub fn call_id(&self) -> CallId {
        match self {
            Self::Request(request) => request.call_id,
            Self::Response(response) => response.call_id,
        }
    }

    /// Serialize to a single line, without the trailing newline.
    pub fn to_line(&self) -> Result<String, serde_json::Error> {
        match self {
            Self::Request(r) => encode_request(&r.operation, &r.args, r.call_id),
            Self::Response(r) => encode_response(r.error.as_ref(), r.result.as_ref(), r.call_id),
        }
    }
}

/// Reasons a line could not be turned into a [`Message`].
#[derive(Debug, thiserror::Error)]
pub enum ParseError {
    #[error("invalid JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("expected a JSON array")]
    NotAnArray,

    #[error("expected 2 or 3 top-level elements, got {0}")]
    Arity(usize),

    #[error("malformed message: {0}")]
    Shape(&'static str),

    #[error("line exceeds {max} bytes")]
    LineTooLong { max: usize },

    #[error("line is not valid UTF-8")]
    InvalidUtf8,
}

pub fn encode_request(
    operation: &str,
    args: &[Value],
    call_id: CallId,
) -> Result<String, serde_json::Error> {
    serde_json::to_string(&(operation, args, call_id))
}

/// Encode a response. On error the result slot is omitted entirely.
pub fn encode_response(
    error: Option<&RemoteError>,
    result: Option<&Value>,
    call_id: CallId,
) -> Result<String, serde_json::Error> {
    match error {
        Some(error) => serde_json::to_string(&((error,), call_id)),
        None => serde_json::to_string(&((Value::Null, result.unwrap_or(&Value::Null)), call_id)),
    }
}

/// Decode one line (without its terminator).
///
/// Three top-level elements make a request, two make a response. Anything
/// else is a [`ParseError`]; callers drop those lines.
pub fn decode(line: &str) -> Result<Message, ParseError> {
    let Value::Array(mut items) = serde_json::from_str::<Value>(line)? else {
        return Err(ParseError::NotAnArray);
    };

    match items.len() {
        3 => {
            let call_id = take_call_id(items.pop())?;
            let Some(Value::Array(args)) = items.pop() else {
                return Err(ParseError::Shape("request arguments must be an array"));
            };
            let Some(Value::String(operation)) = items.pop() else {
                return Err(ParseError::Shape("operation name must be a string"));
            };
            Ok(Message::Request(Request {
                operation,
                args,
                call_id,
            }))
        }
        2 => {
            let call_id = take_call_id(items.pop())?;
            let Some(Value::Array(outcome)) = items.pop() else {
                return Err(ParseError::Shape("response outcome must be an array"));
            };
            let mut outcome = outcome.into_iter();
            let (error, result) = match (outcome.next(), outcome.next(), outcome.next()) {
                (Some(error), result, None) => (error, result),
                _ => {
                    return Err(ParseError::Shape(
                        "response outcome must hold one or two elements",
                    ));
                }
            };
            let response = match error {
                Value::Null => Response {
                    error: None,
                    result,
                    call_id,
                },
                error => Response::failure(RemoteError::from_value(error), call_id),
            };
            Ok(Message::Response(response))
        }
        n => Err(ParseError::Arity(n)),
    }
}

fn take_call_id(value: Option<Value>) -> Result<CallId, ParseError> {
    value
        .as_ref()
        .and_then(Value::as_i64)
        .map(CallId::new)
        .ok_or(ParseError::Shape("call id must be an integer"))
}
