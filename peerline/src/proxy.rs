//! Remote operations exposed as local callables.

use std::collections::BTreeSet;

use serde_json::Value;

use crate::bridge::protocol::CallId;
use crate::correlation::Callback;
use crate::error::{CallError, PeerError};
use crate::peer::Peer;

/// A fixed set of remote operation names bound to a [`Peer`].
pub struct RemoteProxy {
    peer: Peer,
    names: BTreeSet<String>,
}

impl RemoteProxy {
    pub fn new<I, S>(peer: Peer, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            peer,
            names: names.into_iter().map(Into::into).collect(),
        }
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.names.iter().map(String::as_str)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.names.contains(name)
    }

    /// The member named `name`, or `None` if the proxy does not expose it.
    pub fn operation<'a>(&'a self, name: &str) -> Option<RemoteOperation<'a>> {
        let name = self.names.get(name)?;
        Some(RemoteOperation {
            peer: &self.peer,
            name,
        })
    }

    pub fn peer(&self) -> &Peer {
        &self.peer
    }
}

/// One remote operation. The callback, when wanted, is passed explicitly.
pub struct RemoteOperation<'a> {
    peer: &'a Peer,
    name: &'a str,
}

impl RemoteOperation<'_> {
    pub fn name(&self) -> &str {
        self.name
    }

    /// Same as [`Peer::call`]: with a callback the response is routed to it,
    /// without one the call is fire-and-forget.
    pub async fn invoke(
        &self,
        args: Vec<Value>,
        callback: Option<Callback>,
    ) -> Result<CallId, PeerError> {
        self.peer.call(self.name, args, callback).await
    }

    pub async fn notify(&self, args: Vec<Value>) -> Result<(), PeerError> {
        self.peer.notify(self.name, args).await
    }

    pub async fn request(&self, args: Vec<Value>) -> Result<Value, CallError> {
        self.peer.request(self.name, args).await
    }
}
