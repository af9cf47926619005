//! # Pending Calls
//!
//! Correlation table for transports without a native request/response
//! primitive. Each outbound call registers a slot under its correlation key
//! and waits on it; the read loop resolves slots as responses arrive.
//!
//! ## Invariants
//!
//! - At most one slot per key. Resolving or failing a slot removes it, so no
//!   slot is resolved twice.
//! - After `fail_all`, every new registration fails immediately with the same
//!   cause.
//! - A slot dropped before its response arrives removes itself.

use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use serde_json::Value;
use tokio::sync::oneshot;
use tracing::debug;

use crate::span::random_id;
use crate::transport::Error;
use crate::transport::Result;

struct Waiter {
    id: u64,
    tx: oneshot::Sender<Result<Value>>,
}

#[derive(Default)]
pub struct PendingCalls {
    slots: Arc<DashMap<String, Waiter>>,
    failure: Mutex<Option<Error>>,
    next_id: AtomicU64,
}

impl PendingCalls {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a slot keyed by `hint`, or by `hint` plus a random suffix
    /// if `hint` is already pending.
    pub fn register(&self, hint: &str) -> Result<PendingSlot> {
        if let Some(cause) = self.failure() {
            return Err(cause);
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        let waiter = Waiter { id, tx };
        let mut key = hint.to_string();
        loop {
            match self.slots.entry(key.clone()) {
                Entry::Vacant(slot) => {
                    slot.insert(waiter);
                    break;
                }
                Entry::Occupied(_) => {
                    key = format!("{}-{:x}", hint, random_id());
                }
            }
        }

        // A concurrent fail_all may have drained the table before our insert.
        if let Some(cause) = self.failure() {
            self.slots.remove_if(&key, |_, w| w.id == id);
            return Err(cause);
        }

        Ok(PendingSlot {
            key,
            id,
            rx,
            slots: self.slots.clone(),
        })
    }

    /// Delivers `result` to the slot under `key`. Returns false if no such
    /// slot is pending.
    pub fn resolve(&self, key: &str, result: Result<Value>) -> bool {
        let Some((_, waiter)) = self.slots.remove(key) else {
            return false;
        };
        if waiter.tx.send(result).is_err() {
            debug!(key, "caller stopped waiting before the response arrived");
        }
        true
    }

    /// Fails every pending slot with `cause` and refuses new ones.
    /// Returns the number of slots failed.
    pub fn fail_all(&self, cause: Error) -> usize {
        {
            let mut failure = self.failure.lock().unwrap_or_else(|p| p.into_inner());
            if failure.is_none() {
                *failure = Some(cause.clone());
            }
        }

        let keys: Vec<String> = self.slots.iter().map(|e| e.key().clone()).collect();
        let mut failed = 0;
        for key in keys {
            if let Some((_, waiter)) = self.slots.remove(&key) {
                let _ = waiter.tx.send(Err(cause.clone()));
                failed += 1;
            }
        }
        failed
    }

    pub fn failure(&self) -> Option<Error> {
        self.failure.lock().unwrap_or_else(|p| p.into_inner()).clone()
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }
}

/// One outstanding call.
pub struct PendingSlot {
    key: String,
    id: u64,
    rx: oneshot::Receiver<Result<Value>>,
    slots: Arc<DashMap<String, Waiter>>,
}

impl PendingSlot {
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Waits for the response.
    pub async fn wait(mut self) -> Result<Value> {
        match (&mut self.rx).await {
            Ok(result) => result,
            Err(_) => Err(Error::Closed),
        }
    }
}

impl Drop for PendingSlot {
    fn drop(&mut self) {
        let id = self.id;
        self.slots.remove_if(&self.key, |_, w| w.id == id);
    }
}
