//! Fan-out router and connection registry
//!
//! In-memory index from topic to open push connections. The registry
//! owns all transport handles; callers route through it and never touch
//! a connection's channel directly. Everything here is non-blocking:
//! deliveries use `try_send`, so a stalled client can never stall the
//! bridge — its channel fills up and the connection is closed instead.
//!
//! Per-connection state machine: Open -> Closing -> Closed, or straight
//! to Closed on write failure / heartbeat timeout. No transition out of
//! Closed. This registry is local to one process instance; scaling the
//! bridge horizontally needs a shared backplane between instances.

use chrono::{DateTime, Duration, Utc};
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::sync::RwLock;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use mpp_common::events::Priority;

/// Frame pushed to one connection's transport channel
#[derive(Debug, Clone)]
pub enum PushFrame {
    /// A routed event
    Event {
        topic: String,
        priority: Priority,
        data: Value,
    },
    /// Heartbeat; rendered as a comment on the wire
    Ping,
}

/// Connection lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Open,
    Closing,
    Closed,
}

/// Registry errors
#[derive(Error, Debug)]
pub enum RegistryError {
    /// A panicked writer poisoned the registry lock
    #[error("connection registry lock poisoned")]
    Poisoned,
}

struct ConnectionEntry {
    subject_id: Option<String>,
    topics: HashSet<String>,
    last_heartbeat: DateTime<Utc>,
    sender: mpsc::Sender<PushFrame>,
    state: ConnectionState,
}

#[derive(Default)]
struct Inner {
    connections: HashMap<Uuid, ConnectionEntry>,
    by_topic: HashMap<String, HashSet<Uuid>>,
}

/// Registry of open push connections and their subscriptions
pub struct ConnectionRegistry {
    inner: RwLock<Inner>,
    channel_capacity: usize,
}

impl ConnectionRegistry {
    pub fn new(channel_capacity: usize) -> Self {
        Self {
            inner: RwLock::new(Inner::default()),
            channel_capacity,
        }
    }

    /// Register a connection; returns its id and the transport receiver
    /// the stream handler reads from
    pub fn register(
        &self,
        subject_id: Option<String>,
        topics: HashSet<String>,
    ) -> Result<(Uuid, mpsc::Receiver<PushFrame>), RegistryError> {
        let (tx, rx) = mpsc::channel(self.channel_capacity);
        let connection_id = Uuid::new_v4();

        let mut inner = self.inner.write().map_err(|_| RegistryError::Poisoned)?;
        for topic in &topics {
            inner
                .by_topic
                .entry(topic.clone())
                .or_default()
                .insert(connection_id);
        }
        inner.connections.insert(
            connection_id,
            ConnectionEntry {
                subject_id,
                topics,
                last_heartbeat: Utc::now(),
                sender: tx,
                state: ConnectionState::Open,
            },
        );

        info!(
            connection_id = %connection_id,
            total = inner.connections.len(),
            "Push connection registered"
        );
        Ok((connection_id, rx))
    }

    /// Begin an orderly close: the connection stops receiving routed
    /// events but its stream stays up until `unregister`
    pub fn begin_close(&self, connection_id: &Uuid) -> Result<bool, RegistryError> {
        let mut inner = self.inner.write().map_err(|_| RegistryError::Poisoned)?;
        match inner.connections.get_mut(connection_id) {
            Some(entry) if entry.state == ConnectionState::Open => {
                entry.state = ConnectionState::Closing;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    /// Remove a connection from all indices and drop its transport
    ///
    /// Idempotent; an already-removed id is a no-op. Dropping the
    /// sender ends the client's stream.
    pub fn unregister(&self, connection_id: &Uuid) -> Result<bool, RegistryError> {
        let mut inner = self.inner.write().map_err(|_| RegistryError::Poisoned)?;
        Ok(remove_connection(&mut inner, connection_id))
    }

    /// Current lifecycle state; ids the registry no longer knows are
    /// Closed (there is no transition out of Closed)
    pub fn state(&self, connection_id: &Uuid) -> Result<ConnectionState, RegistryError> {
        let inner = self.inner.read().map_err(|_| RegistryError::Poisoned)?;
        Ok(inner
            .connections
            .get(connection_id)
            .map(|e| e.state)
            .unwrap_or(ConnectionState::Closed))
    }

    /// Deliver an event to every open connection subscribed to `topic`
    /// and matching the subject scope; returns the delivered count
    ///
    /// A connection whose channel is closed or full is torn down
    /// immediately; the event itself is not retried at this level.
    pub fn route(
        &self,
        topic: &str,
        scope: Option<&str>,
        priority: Priority,
        data: &Value,
    ) -> Result<usize, RegistryError> {
        let mut inner = self.inner.write().map_err(|_| RegistryError::Poisoned)?;

        let candidates: Vec<Uuid> = match inner.by_topic.get(topic) {
            Some(ids) => ids.iter().copied().collect(),
            None => return Ok(0),
        };

        let mut delivered = 0;
        let mut failed: Vec<Uuid> = Vec::new();

        for id in candidates {
            let Some(entry) = inner.connections.get(&id) else {
                continue;
            };
            if entry.state != ConnectionState::Open {
                continue;
            }
            // Subject-scoped connections only see their own subject;
            // unscoped connections see everything on the topic
            if let (Some(scope), Some(conn_subject)) = (scope, entry.subject_id.as_deref()) {
                if scope != conn_subject {
                    continue;
                }
            }

            let frame = PushFrame::Event {
                topic: topic.to_string(),
                priority,
                data: data.clone(),
            };
            match entry.sender.try_send(frame) {
                Ok(()) => delivered += 1,
                Err(e) => {
                    warn!(connection_id = %id, "Transport write failed, closing: {}", e);
                    failed.push(id);
                }
            }
        }

        for id in failed {
            remove_connection(&mut inner, &id);
        }

        debug!(topic, delivered, "Routed event");
        Ok(delivered)
    }

    /// Ping every open connection and close the ones that are stale or
    /// can no longer accept frames; returns the number closed
    ///
    /// Run periodically from a background task. A connection whose last
    /// successful heartbeat is older than `stale_after` is considered
    /// dead even if its channel still has room.
    pub fn heartbeat_sweep(&self, stale_after: Duration) -> Result<usize, RegistryError> {
        let mut inner = self.inner.write().map_err(|_| RegistryError::Poisoned)?;
        let now = Utc::now();
        let cutoff = now - stale_after;

        let ids: Vec<Uuid> = inner.connections.keys().copied().collect();
        let mut closed: Vec<Uuid> = Vec::new();

        for id in ids {
            let Some(entry) = inner.connections.get_mut(&id) else {
                continue;
            };
            if entry.last_heartbeat < cutoff {
                closed.push(id);
                continue;
            }
            match entry.sender.try_send(PushFrame::Ping) {
                Ok(()) => entry.last_heartbeat = now,
                Err(_) => closed.push(id),
            }
        }

        let count = closed.len();
        for id in &closed {
            debug!(connection_id = %id, "Heartbeat failed or stale, closing");
            remove_connection(&mut inner, id);
        }
        Ok(count)
    }

    /// Connection count and per-topic subscription counts
    pub fn status(&self) -> Result<(usize, HashMap<String, usize>), RegistryError> {
        let inner = self.inner.read().map_err(|_| RegistryError::Poisoned)?;
        let topics = inner
            .by_topic
            .iter()
            .filter(|(_, ids)| !ids.is_empty())
            .map(|(topic, ids)| (topic.clone(), ids.len()))
            .collect();
        Ok((inner.connections.len(), topics))
    }
}

/// Remove from the topic indices and the connection map. Dropping the
/// entry drops the sender: the state is Closed from here on.
fn remove_connection(inner: &mut Inner, connection_id: &Uuid) -> bool {
    let Some(entry) = inner.connections.remove(connection_id) else {
        return false;
    };
    for topic in &entry.topics {
        if let Some(ids) = inner.by_topic.get_mut(topic) {
            ids.remove(connection_id);
        }
    }
    true
}
