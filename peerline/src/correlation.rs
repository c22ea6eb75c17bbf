//! Correlation of outgoing calls with incoming responses.
//!
//! Written by the calling side (`allocate`) and by the listener (`resolve`,
//! `close`), so all state sits behind one mutex. Callbacks always run after
//! the lock is released, which lets a callback issue further calls.

use std::collections::HashMap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Mutex as StdMutex, MutexGuard};

use serde_json::Value;

use crate::bridge::protocol::{CallId, RemoteError};
use crate::error::PeerError;

/// Receives the outcome of a call: `(error, result)`.
pub type Callback = Box<dyn FnOnce(Option<RemoteError>, Option<Value>) + Send + 'static>;

/// Box a closure as a [`Callback`], letting the compiler infer its argument types.
pub fn callback<F>(f: F) -> Callback
where
    F: FnOnce(Option<RemoteError>, Option<Value>) + Send + 'static,
{
    Box::new(f)
}

struct TableInner {
    next_id: i64,
    pending: HashMap<CallId, Callback>,
    closed: bool,
}

impl TableInner {
    /// Next id not currently outstanding. Wraps to 0 after `i64::MAX`.
    fn next_free_id(&mut self) -> CallId {
        loop {
            let id = CallId::new(self.next_id);
            self.next_id = if self.next_id == i64::MAX {
                0
            } else {
                self.next_id + 1
            };
            if !self.pending.contains_key(&id) {
                return id;
            }
        }
    }
}

pub struct CorrelationTable {
    inner: StdMutex<TableInner>,
}

impl Default for CorrelationTable {
    fn default() -> Self {
        Self::new()
    }
}

impl CorrelationTable {
    pub fn new() -> Self {
        Self::starting_at(1)
    }

    pub(crate) fn starting_at(next_id: i64) -> Self {
        Self {
            inner: StdMutex::new(TableInner {
                next_id,
                pending: HashMap::new(),
                closed: false,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, TableInner> {
        match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => {
                tracing::error!("Correlation table mutex poisoned - recovering");
                poisoned.into_inner()
            }
        }
    }

    /// Register a callback and return the id to put on the wire.
    ///
    /// Without a callback this is a fire-and-forget call: returns
    /// [`CallId::NONE`] and records nothing.
    pub fn allocate(&self, callback: Option<Callback>) -> Result<CallId, PeerError> {
        let Some(callback) = callback else {
            return Ok(CallId::NONE);
        };

        let mut inner = self.lock();
        if inner.closed {
            return Err(PeerError::Closed);
        }
        let id = inner.next_free_id();
        inner.pending.insert(id, callback);
        Ok(id)
    }

    /// Hand a response to the callback registered under `id`.
    ///
    /// Returns `false` (and does nothing) when no call with that id is
    /// outstanding, e.g. for duplicate or spurious responses.
    pub fn resolve(&self, id: CallId, error: Option<RemoteError>, result: Option<Value>) -> bool {
        let Some(callback) = self.lock().pending.remove(&id) else {
            return false;
        };
        tracing::trace!(call_id = %id, is_err = error.is_some(), "Resolving call");
        invoke(id, callback, error, result);
        true
    }

    /// Forget a call without invoking its callback.
    pub fn cancel(&self, id: CallId) -> bool {
        self.lock().pending.remove(&id).is_some()
    }

    /// Refuse new callbacks and fail every pending one with `error`.
    ///
    /// Returns how many callbacks were failed.
    pub fn close(&self, error: RemoteError) -> usize {
        let drained: Vec<(CallId, Callback)> = {
            let mut inner = self.lock();
            inner.closed = true;
            inner.pending.drain().collect()
        };
        let count = drained.len();
        for (id, callback) in drained {
            invoke(id, callback, Some(error.clone()), None);
        }
        count
    }

    pub fn len(&self) -> usize {
        self.lock().pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains(&self, id: CallId) -> bool {
        self.lock().pending.contains_key(&id)
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }
}

/// Run a callback, containing any panic so it cannot take down the listener.
fn invoke(id: CallId, callback: Callback, error: Option<RemoteError>, result: Option<Value>) {
    if panic::catch_unwind(AssertUnwindSafe(move || callback(error, result))).is_err() {
        tracing::error!(call_id = %id, "Callback panicked");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use serde_json::json;

    type Seen = Arc<StdMutex<Vec<(Option<RemoteError>, Option<Value>)>>>;

    fn recording() -> (Seen, Callback) {
        let seen: Seen = Arc::default();
        let sink = Arc::clone(&seen);
        (
            seen,
            callback(move |error, result| sink.lock().unwrap().push((error, result))),
        )
    }

    #[test]
    fn fire_and_forget_records_nothing() {
        let table = CorrelationTable::new();
        assert_eq!(table.allocate(None).unwrap(), CallId::NONE);
        assert!(table.is_empty());
    }

    #[test]
    fn ids_are_distinct_and_increasing() {
        let table = CorrelationTable::new();
        let a = table.allocate(Some(callback(|_, _| {}))).unwrap();
        let b = table.allocate(Some(callback(|_, _| {}))).unwrap();
        assert_eq!(a, CallId::new(1));
        assert_eq!(b, CallId::new(2));
        assert_eq!(table.len(), 2);
    }

    #[test]
    fn counter_wraps_to_zero_after_max() {
        let table = CorrelationTable::starting_at(i64::MAX);
        let last = table.allocate(Some(callback(|_, _| {}))).unwrap();
        let wrapped = table.allocate(Some(callback(|_, _| {}))).unwrap();
        assert_eq!(last, CallId::new(i64::MAX));
        assert_eq!(wrapped, CallId::new(0));
    }

    #[test]
    fn wrapped_counter_skips_outstanding_ids() {
        let table = CorrelationTable::starting_at(0);
        let zero = table.allocate(Some(callback(|_, _| {}))).unwrap();
        assert_eq!(zero, CallId::new(0));

        table.lock().next_id = 0;
        let next = table.allocate(Some(callback(|_, _| {}))).unwrap();
        assert_eq!(next, CallId::new(1));
    }

    #[test]
    fn resolve_invokes_once_and_removes() {
        let table = CorrelationTable::new();
        let (seen, cb) = recording();
        let id = table.allocate(Some(cb)).unwrap();

        assert!(table.resolve(id, None, Some(json!("pong"))));
        assert!(!table.contains(id));
        assert!(!table.resolve(id, None, Some(json!("again"))));

        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 1);
        assert!(seen[0].0.is_none());
        assert_eq!(seen[0].1, Some(json!("pong")));
    }

    #[test]
    fn resolve_unknown_id_is_a_no_op() {
        let table = CorrelationTable::new();
        let (seen, cb) = recording();
        let id = table.allocate(Some(cb)).unwrap();

        assert!(!table.resolve(CallId::new(99), None, Some(json!(1))));
        assert!(table.contains(id));
        assert!(seen.lock().unwrap().is_empty());
    }

    #[test]
    fn out_of_order_responses_reach_their_callers() {
        let table = CorrelationTable::new();
        let (first_seen, first) = recording();
        let (second_seen, second) = recording();
        let a = table.allocate(Some(first)).unwrap();
        let b = table.allocate(Some(second)).unwrap();

        table.resolve(b, None, Some(json!("b")));
        table.resolve(a, Some(RemoteError::new("a failed")), None);

        assert_eq!(second_seen.lock().unwrap()[0].1, Some(json!("b")));
        let first_seen = first_seen.lock().unwrap();
        assert_eq!(first_seen[0].0.as_ref().unwrap().message, "a failed");
        assert_eq!(first_seen[0].1, None);
    }

    #[test]
    fn cancel_drops_without_invoking() {
        let table = CorrelationTable::new();
        let (seen, cb) = recording();
        let id = table.allocate(Some(cb)).unwrap();

        assert!(table.cancel(id));
        assert!(!table.cancel(id));
        assert!(seen.lock().unwrap().is_empty());
    }

    #[test]
    fn close_fails_pending_and_rejects_new_calls() {
        let table = CorrelationTable::new();
        let (seen, cb) = recording();
        table.allocate(Some(cb)).unwrap();

        assert_eq!(table.close(RemoteError::connection_closed()), 1);
        assert!(table.is_empty());
        assert!(table.is_closed());
        assert_eq!(
            seen.lock().unwrap()[0].0.as_ref().unwrap().message,
            "connection closed"
        );

        assert!(matches!(
            table.allocate(Some(callback(|_, _| {}))),
            Err(PeerError::Closed)
        ));
        assert_eq!(table.allocate(None).unwrap(), CallId::NONE);
    }

    #[test]
    fn callback_may_allocate_reentrantly() {
        let table = Arc::new(CorrelationTable::new());
        let inner_table = Arc::clone(&table);
        let id = table
            .allocate(Some(callback(move |_, _| {
                inner_table.allocate(Some(callback(|_, _| {}))).unwrap();
            })))
            .unwrap();

        assert!(table.resolve(id, None, None));
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn panicking_callback_is_contained() {
        let table = CorrelationTable::new();
        let id = table
            .allocate(Some(callback(|_, _| panic!("callback bug"))))
            .unwrap();
        assert!(table.resolve(id, None, None));

        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let id = table
            .allocate(Some(callback(move |_, _| {
                counter.fetch_add(1, Ordering::SeqCst);
            })))
            .unwrap();
        assert!(table.resolve(id, None, None));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn concurrent_allocations_get_unique_ids() {
        let table = Arc::new(CorrelationTable::new());
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let table = Arc::clone(&table);
                std::thread::spawn(move || {
                    (0..100)
                        .map(|_| table.allocate(Some(callback(|_, _| {}))).unwrap())
                        .collect::<Vec<_>>()
                })
            })
            .collect();

        let mut ids: Vec<CallId> = handles
            .into_iter()
            .flat_map(|h| h.join().unwrap())
            .collect();
        ids.sort();
        ids.dedup();
        assert_eq!(ids.len(), 800);
        assert_eq!(table.len(), 800);
    }
}
