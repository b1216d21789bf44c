use crate::metrics;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{
    mpsc::{self, error::TrySendError},
    watch, RwLock,
};
use tokio_tungstenite::tungstenite::Utf8Bytes;
use uuid::Uuid;

pub mod connection;
pub mod message_types;

/// Serialized outbound frame, cheap to clone across every member of a room
pub type Frame = Utf8Bytes;

/// Unique identifier for a live connection
///
/// Each WebSocket connection gets its own id when it is admitted, so the
/// registry can remove exactly that connection on teardown.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(Uuid);

impl ConnectionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

/// One-shot teardown gate shared by a connection's tasks and the registry
///
/// Whoever wins `claim` performs the teardown; everyone else only observes
/// `closed`. This gives exactly one deregistration no matter which side
/// detects the failure first.
#[derive(Debug)]
pub struct Teardown {
    claimed: AtomicBool,
    closed: watch::Sender<bool>,
}

impl Default for Teardown {
    fn default() -> Self {
        Self::new()
    }
}

impl Teardown {
    pub fn new() -> Self {
        let (closed, _) = watch::channel(false);
        Self {
            claimed: AtomicBool::new(false),
            closed,
        }
    }

    /// Returns true for exactly one caller.
    pub fn claim(&self) -> bool {
        !self.claimed.swap(true, Ordering::AcqRel)
    }

    /// Wake every task waiting in `closed`.
    pub fn notify_closed(&self) {
        self.closed.send_replace(true);
    }

    pub fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }

    /// Resolves once `notify_closed` has been called (immediately if it already was).
    pub async fn closed(&self) {
        let mut rx = self.closed.subscribe();
        let already = *rx.borrow_and_update();
        if already {
            return;
        }
        // The sender lives in `self`, so this only returns on a change.
        let _ = rx.changed().await;
    }
}

/// Registry-side handle of a connection
///
/// The registry holds the only sender of the connection's outbound queue, so
/// dropping a member closes the queue and tells the writer to stop.
pub struct Member {
    outbound: mpsc::Sender<Frame>,
    teardown: Arc<Teardown>,
}

impl Member {
    pub fn new(outbound: mpsc::Sender<Frame>, teardown: Arc<Teardown>) -> Self {
        Self { outbound, teardown }
    }

    fn evict(&self) {
        if self.teardown.claim() {
            self.teardown.notify_closed();
        }
    }
}

/// Outcome of a single `broadcast` call
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct BroadcastReport {
    pub delivered: usize,
    pub evicted: usize,
}

/// Room registry for WebSocket connections
///
/// Maps room id to the connections currently in that room. Every operation
/// takes the single map-wide lock, including the iteration inside
/// `broadcast`, so a broadcast never skips or double-delivers a member and
/// room deletion never races an iteration.
#[derive(Default, Clone)]
pub struct ConnectionRegistry {
    // room_id -> connection_id -> member
    inner: Arc<RwLock<HashMap<Uuid, HashMap<ConnectionId, Member>>>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a connection to a room, creating the room entry if absent.
    ///
    /// Idempotent: joining twice with the same id keeps the first member.
    /// Returns whether the connection was newly added.
    pub async fn join(&self, room_id: Uuid, id: ConnectionId, member: Member) -> bool {
        let mut guard = self.inner.write().await;
        let room = guard.entry(room_id).or_default();
        let added = match room.entry(id) {
            std::collections::hash_map::Entry::Occupied(_) => false,
            std::collections::hash_map::Entry::Vacant(slot) => {
                slot.insert(member);
                true
            }
        };

        tracing::debug!(
            room_id = %room_id,
            connection_id = %id,
            members = room.len(),
            "connection joined room"
        );

        added
    }

    /// Remove a connection from a room; the room entry goes away with its last member.
    ///
    /// Safe to call repeatedly. Returns whether anything was removed.
    pub async fn leave(&self, room_id: Uuid, id: ConnectionId) -> bool {
        let mut guard = self.inner.write().await;

        let Some(room) = guard.get_mut(&room_id) else {
            return false;
        };
        let removed = room.remove(&id).is_some();
        let remaining = room.len();
        if remaining == 0 {
            guard.remove(&room_id);
            tracing::debug!(room_id = %room_id, "removed empty room from registry");
        }

        if removed {
            tracing::debug!(
                room_id = %room_id,
                connection_id = %id,
                remaining,
                "connection left room"
            );
        }

        removed
    }

    /// Fan a frame out to every member of a room without waiting on anyone.
    ///
    /// A member whose queue is full (slow consumer) or closed (writer gone)
    /// is evicted in the same call: removed from the room and told to close
    /// its stream.
    pub async fn broadcast(&self, room_id: Uuid, frame: Frame) -> BroadcastReport {
        let mut guard = self.inner.write().await;
        let Some(room) = guard.get_mut(&room_id) else {
            return BroadcastReport::default();
        };

        let mut report = BroadcastReport::default();
        room.retain(|id, member| match member.outbound.try_send(frame.clone()) {
            Ok(()) => {
                report.delivered += 1;
                true
            }
            Err(TrySendError::Full(_)) => {
                tracing::warn!(
                    room_id = %room_id,
                    connection_id = %id,
                    "outbound queue full; evicting slow consumer"
                );
                member.evict();
                report.evicted += 1;
                false
            }
            Err(TrySendError::Closed(_)) => {
                tracing::debug!(
                    room_id = %room_id,
                    connection_id = %id,
                    "outbound queue closed; removing member"
                );
                member.evict();
                report.evicted += 1;
                false
            }
        });

        if room.is_empty() {
            guard.remove(&room_id);
        }

        metrics::record_broadcast(report.delivered, report.evicted);
        report
    }

    /// Enqueue a frame for a single member, with the same eviction policy as `broadcast`.
    pub async fn send_to(&self, room_id: Uuid, id: ConnectionId, frame: Frame) -> bool {
        let mut guard = self.inner.write().await;
        let Some(room) = guard.get_mut(&room_id) else {
            return false;
        };
        let Some(member) = room.get(&id) else {
            return false;
        };

        match member.outbound.try_send(frame) {
            Ok(()) => true,
            Err(_) => {
                tracing::warn!(
                    room_id = %room_id,
                    connection_id = %id,
                    "direct send failed; evicting member"
                );
                if let Some(member) = room.remove(&id) {
                    member.evict();
                }
                if room.is_empty() {
                    guard.remove(&room_id);
                }
                metrics::record_broadcast(0, 1);
                false
            }
        }
    }

    pub async fn member_count(&self, room_id: Uuid) -> usize {
        let guard = self.inner.read().await;
        guard.get(&room_id).map(|room| room.len()).unwrap_or(0)
    }

    pub async fn room_count(&self) -> usize {
        self.inner.read().await.len()
    }

    pub async fn contains(&self, room_id: Uuid, id: ConnectionId) -> bool {
        let guard = self.inner.read().await;
        guard
            .get(&room_id)
            .map(|room| room.contains_key(&id))
            .unwrap_or(false)
    }
}
