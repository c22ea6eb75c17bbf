//! peerline: symmetric line-delimited JSON calls between two peers.
//!
//! Either side of a duplex byte stream can call operations the other side
//! exposes. Responses are matched to calls by id, so any number of calls may
//! be outstanding at once.

pub mod bridge;
pub mod correlation;
pub mod dispatch;
mod error;
mod listener;
mod peer;
mod proxy;
mod version;

pub use bridge::codec::{DEFAULT_MAX_LINE_LENGTH, LineCodec};
pub use bridge::protocol::{
    CallId, Message, ParseError, RemoteError, Request, Response, decode, encode_request,
    encode_response,
};
pub use correlation::{Callback, CorrelationTable, callback};
pub use dispatch::{
    DispatchError, Dispatcher, HandlerMap, NameTemplate, ObjectProvider, Operation,
    OperationError, OperationResult, Provider, arg,
};
pub use error::{CallError, PeerError};
pub use listener::ListenerState;
pub use peer::{Peer, PeerConfig};
pub use proxy::{RemoteOperation, RemoteProxy};
pub use version::{PEERLINE_VERSION, PROTOCOL_REVISION, VersionInfo};
