// src/changes.rs
// Change feed types and the live observer fabric. The feed itself is
// served by Database::changes; this module holds the wire shapes and
// the fan-out machinery.

use std::sync::Arc;
use std::time::Duration;

use crossbeam::channel::{unbounded, Receiver, Sender};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::document::Document;

/// Options for one changes request.
#[derive(Debug, Clone, Default)]
pub struct ChangesOptions {
    /// Start after this sequence; `"now"` waits for the next change.
    pub since: String,
    /// Maximum number of rows; 0 means no limit.
    pub limit: i64,
    /// How long a waiting request blocks; `None` blocks indefinitely.
    pub timeout: Option<Duration>,
}

impl ChangesOptions {
    pub fn since_now(&self) -> bool {
        self.since == "now"
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChangeRev {
    pub rev: String,
}

/// One row of the change feed.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChangeRow {
    pub seq: String,
    pub id: String,
    pub changes: Vec<ChangeRev>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub deleted: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub doc: Option<Value>,
}

impl ChangeRow {
    /// Build a feed row from a stored change document.
    pub fn from_document(doc: &Document) -> ChangeRow {
        let seq = match &doc.key {
            Some(Value::String(s)) => s.clone(),
            _ => doc.local_seq.to_string(),
        };
        ChangeRow {
            seq,
            id: doc.id.clone(),
            changes: vec![ChangeRev {
                rev: doc.rev.clone(),
            }],
            deleted: if doc.deleted { Some(true) } else { None },
            doc: None,
        }
    }
}

/// The normal (non-continuous) feed wrapper.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChangesResponse {
    pub results: Vec<ChangeRow>,
    pub last_seq: String,
    pub pending: usize,
}

/// Key of a registered observer.
pub type ObserverKey = [u8; 12];

pub(crate) type ListenerMap = Arc<DashMap<ObserverKey, Sender<Document>>>;

/// A short-lived subscriber waiting for the next document change.
/// Dropping the observer unregisters it.
pub struct DocObserver {
    key: ObserverKey,
    rx: Receiver<Document>,
    listeners: ListenerMap,
}

impl DocObserver {
    /// Register a new observer in the listener map.
    pub(crate) fn register(listeners: &ListenerMap) -> DocObserver {
        let key: ObserverKey = rand::random();
        let (tx, rx) = unbounded();
        listeners.insert(key, tx);
        DocObserver {
            key,
            rx,
            listeners: listeners.clone(),
        }
    }

    /// Block until a document changes or the timeout expires.
    /// `None` timeout blocks until a change arrives.
    pub fn wait_for_doc(&self, timeout: Option<Duration>) -> Option<Document> {
        match timeout {
            Some(timeout) => self.rx.recv_timeout(timeout).ok(),
            None => self.rx.recv().ok(),
        }
    }
}

impl Drop for DocObserver {
    fn drop(&mut self) {
        self.listeners.remove(&self.key);
    }
}

/// Fan a document change out to every listener on a fresh thread.
/// Listeners whose channel is gone are unregistered; the publisher is
/// never blocked or failed by a listener.
pub(crate) fn notify_listeners(listeners: &ListenerMap, doc: Document) {
    let listeners = listeners.clone();
    std::thread::spawn(move || {
        let mut dead = Vec::new();
        for entry in listeners.iter() {
            if entry.value().send(doc.clone()).is_err() {
                dead.push(*entry.key());
            }
        }
        for key in dead {
            listeners.remove(&key);
        }
    });
}
