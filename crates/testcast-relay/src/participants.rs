//! In-memory set of live relay participants.
//!
//! The set never holds more than [`MAX_PARTICIPANTS`] connections. Admission
//! checks the size and inserts under one write lock, so concurrent connection
//! attempts cannot push it past the bound.

use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{RwLock, mpsc};
use tracing::{debug, info, warn};

/// Maximum number of simultaneously admitted connections.
pub const MAX_PARTICIPANTS: usize = 2;

/// Frames a participant may have queued before new ones are dropped.
pub const OUTBOUND_CAPACITY: usize = 256;

/// Arrival-ordered identifier of an admitted connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ParticipantId(u64);

impl fmt::Display for ParticipantId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "p{}", self.0)
    }
}

/// Frames queued for a participant's connection task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outbound {
    /// A text frame, sent as-is.
    Text(String),
    /// Close the connection.
    Close,
}

/// An admitted connection.
#[derive(Debug)]
pub struct Participant {
    pub id: ParticipantId,
    pub addr: SocketAddr,
    frame_tx: mpsc::Sender<Outbound>,
}

impl Participant {
    /// Queue a frame for this participant without waiting.
    ///
    /// Returns `false` if the frame was not queued: either the participant
    /// is not draining its queue fast enough or its connection task has
    /// gone away.
    pub fn send(&self, frame: Outbound) -> bool {
        match self.frame_tx.try_send(frame) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                warn!(participant = %self.id, "Outbound queue full, dropping frame");
                false
            }
            Err(TrySendError::Closed(_)) => false,
        }
    }

    /// Ask the connection task to close, waiting for queue space if needed.
    pub async fn close(&self) {
        if self.frame_tx.send(Outbound::Close).await.is_err() {
            debug!(participant = %self.id, "Connection already gone");
        }
    }
}

/// Returned when the set is already full.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("participant set is full ({current}/{max})")]
pub struct CapacityExceeded {
    pub current: usize,
    pub max: usize,
}

/// Thread-safe set of admitted participants, bounded at [`MAX_PARTICIPANTS`].
#[derive(Debug, Clone, Default)]
pub struct ParticipantSet {
    members: Arc<RwLock<Vec<Arc<Participant>>>>,
    next_id: Arc<AtomicU64>,
}

impl ParticipantSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Admit a connection if there is room.
    pub async fn admit(
        &self,
        addr: SocketAddr,
        frame_tx: mpsc::Sender<Outbound>,
    ) -> Result<Arc<Participant>, CapacityExceeded> {
        let mut members = self.members.write().await;
        if members.len() >= MAX_PARTICIPANTS {
            return Err(CapacityExceeded {
                current: members.len(),
                max: MAX_PARTICIPANTS,
            });
        }
        let participant = Arc::new(Participant {
            id: ParticipantId(self.next_id.fetch_add(1, Ordering::Relaxed)),
            addr,
            frame_tx,
        });
        members.push(Arc::clone(&participant));
        let count = members.len();
        drop(members);

        info!(participant = %participant.id, addr = %addr, count, "Participant admitted");
        Ok(participant)
    }

    /// Remove a participant. Unknown ids are ignored.
    pub async fn remove(&self, id: ParticipantId) -> Option<Arc<Participant>> {
        let mut members = self.members.write().await;
        let removed = members
            .iter()
            .position(|p| p.id == id)
            .map(|idx| members.remove(idx));
        let count = members.len();
        drop(members);

        if removed.is_some() {
            info!(participant = %id, count, "Participant removed");
        } else {
            debug!(participant = %id, "Participant already removed");
        }
        removed
    }

    /// The other admitted participant, if any.
    pub async fn peer_of(&self, id: ParticipantId) -> Option<Arc<Participant>> {
        self.members
            .read()
            .await
            .iter()
            .find(|p| p.id != id)
            .cloned()
    }

    pub async fn count(&self) -> usize {
        self.members.read().await.len()
    }

    /// Remove everyone, returning who was admitted.
    pub async fn drain(&self) -> Vec<Arc<Participant>> {
        std::mem::take(&mut *self.members.write().await)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    fn addr(port: u16) -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], port))
    }

    #[tokio::test]
    async fn admits_up_to_two() {
        let set = ParticipantSet::new();
        let (tx, _rx) = mpsc::channel(OUTBOUND_CAPACITY);

        let a = set.admit(addr(1), tx.clone()).await.unwrap();
        let b = set.admit(addr(2), tx.clone()).await.unwrap();
        assert_ne!(a.id, b.id);
        assert_eq!(set.count().await, 2);

        let err = set.admit(addr(3), tx).await.unwrap_err();
        assert_eq!(err, CapacityExceeded { current: 2, max: 2 });
        assert_eq!(set.count().await, 2);
    }

    #[tokio::test]
    async fn removal_frees_a_slot() {
        let set = ParticipantSet::new();
        let (tx, _rx) = mpsc::channel(OUTBOUND_CAPACITY);

        let a = set.admit(addr(1), tx.clone()).await.unwrap();
        set.admit(addr(2), tx.clone()).await.unwrap();
        assert!(set.remove(a.id).await.is_some());
        assert!(set.remove(a.id).await.is_none());
        assert_eq!(set.count().await, 1);

        assert!(set.admit(addr(3), tx).await.is_ok());
        assert_eq!(set.count().await, 2);
    }

    #[tokio::test]
    async fn peer_is_the_other_participant() {
        let set = ParticipantSet::new();
        let (tx, _rx) = mpsc::channel(OUTBOUND_CAPACITY);

        let a = set.admit(addr(1), tx.clone()).await.unwrap();
        assert!(set.peer_of(a.id).await.is_none());

        let b = set.admit(addr(2), tx).await.unwrap();
        assert_eq!(set.peer_of(a.id).await.unwrap().id, b.id);
        assert_eq!(set.peer_of(b.id).await.unwrap().id, a.id);
    }

    #[tokio::test]
    async fn concurrent_admission_never_exceeds_bound() {
        let set = ParticipantSet::new();
        let (tx, _rx) = mpsc::channel(OUTBOUND_CAPACITY);

        let mut handles = Vec::new();
        for port in 0..16 {
            let set = set.clone();
            let tx = tx.clone();
            handles.push(tokio::spawn(async move { set.admit(addr(port), tx).await.is_ok() }));
        }
        let mut admitted = 0;
        for h in handles {
            if h.await.unwrap() {
                admitted += 1;
            }
        }
        assert_eq!(admitted, MAX_PARTICIPANTS);
        assert_eq!(set.count().await, MAX_PARTICIPANTS);
    }

    #[tokio::test]
    async fn send_reports_closed_connection() {
        let set = ParticipantSet::new();
        let (tx, rx) = mpsc::channel(OUTBOUND_CAPACITY);
        let a = set.admit(addr(1), tx).await.unwrap();

        assert!(a.send(Outbound::Text("x".into())));
        drop(rx);
        assert!(!a.send(Outbound::Text("y".into())));
    }

    #[tokio::test]
    async fn slow_participant_drops_frames_past_capacity() {
        let set = ParticipantSet::new();
        let (tx, mut rx) = mpsc::channel(2);
        let a = set.admit(addr(1), tx).await.unwrap();

        assert!(a.send(Outbound::Text("1".into())));
        assert!(a.send(Outbound::Text("2".into())));
        assert!(!a.send(Outbound::Text("3".into())));

        assert_eq!(rx.recv().await, Some(Outbound::Text("1".into())));
        assert!(a.send(Outbound::Text("4".into())));
        assert_eq!(rx.recv().await, Some(Outbound::Text("2".into())));
        assert_eq!(rx.recv().await, Some(Outbound::Text("4".into())));
    }

    #[tokio::test]
    async fn close_waits_for_room_behind_queued_frames() {
        let set = ParticipantSet::new();
        let (tx, mut rx) = mpsc::channel(1);
        let a = set.admit(addr(1), tx).await.unwrap();
        assert!(a.send(Outbound::Text("last".into())));

        let closing = tokio::spawn(async move { a.close().await });
        assert_eq!(rx.recv().await, Some(Outbound::Text("last".into())));
        assert_eq!(rx.recv().await, Some(Outbound::Close));
        closing.await.unwrap();
    }

    #[tokio::test]
    async fn drain_empties_the_set() {
        let set = ParticipantSet::new();
        let (tx, _rx) = mpsc::channel(OUTBOUND_CAPACITY);
        set.admit(addr(1), tx.clone()).await.unwrap();
        set.admit(addr(2), tx).await.unwrap();

        assert_eq!(set.drain().await.len(), 2);
        assert_eq!(set.count().await, 0);
    }
}
