//! # Leader Election
//!
//! Exactly one process may act as sequencer at a time. Leadership comes from
//! an external mutual-exclusion lock; this module models the lock's callbacks
//! as [`ElectionEvent`]s and the resulting role as a pure state machine.
//!
//! ```text
//!             Queued               Acquired
//!  Follower ─────────► Candidate ───────────► Leader
//!     ▲                    ▲                    │
//!     │                    └────── Lost ────────┤
//!     └──────────────── Disconnected ───────────┘  (from any state)
//! ```
//!
//! Leaving `Leader` is immediate on `Lost` or `Disconnected`, regardless of
//! in-flight work; the role driver trips the sequencer's stop signal on the
//! same event.

use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use tokio::sync::mpsc;
use tracing::debug;

use crate::error::{Error, Result};
use crate::types::ReplicaId;

// =============================================================================
// Events and States
// =============================================================================

/// Callback from the election service.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ElectionEvent {
    /// Waiting in line for the lock.
    Queued,
    /// Lock granted; the token increases with every grant.
    Acquired { fencing_token: u64 },
    /// Lock released (voluntarily or revoked); still queued.
    Lost,
    /// Session with the election service is gone; not queued.
    Disconnected,
}

/// Role of this process with respect to sequencing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LeadershipState {
    #[default]
    Follower,
    Candidate,
    Leader { fencing_token: u64 },
}

impl LeadershipState {
    /// Pure transition function.
    pub fn on_event(self, event: ElectionEvent) -> LeadershipState {
        match (self, event) {
            (_, ElectionEvent::Disconnected) => LeadershipState::Follower,
            (_, ElectionEvent::Acquired { fencing_token }) => LeadershipState::Leader { fencing_token },
            (LeadershipState::Leader { .. }, ElectionEvent::Lost) => LeadershipState::Candidate,
            (LeadershipState::Leader { .. }, ElectionEvent::Queued) => self,
            (_, ElectionEvent::Queued) | (_, ElectionEvent::Lost) => LeadershipState::Candidate,
        }
    }

    pub fn is_leader(&self) -> bool {
        matches!(self, LeadershipState::Leader { .. })
    }
}

// =============================================================================
// Election Service Trait
// =============================================================================

/// Mutual-exclusion lock with automatic re-queue on release.
#[async_trait]
pub trait LeaderElection: Send + Sync {
    /// Joins the election; events for `participant` arrive on the receiver.
    async fn join(&self, participant: &ReplicaId) -> Result<mpsc::UnboundedReceiver<ElectionEvent>>;

    /// Gives up the lock if held and queues again.
    async fn release(&self, participant: &ReplicaId) -> Result<()>;

    /// Leaves the election for good.
    async fn leave(&self, participant: &ReplicaId) -> Result<()>;
}

// =============================================================================
// Local Lock Service
// =============================================================================

struct Participant {
    events: mpsc::UnboundedSender<ElectionEvent>,
    connected: bool,
}

#[derive(Default)]
struct LockState {
    participants: HashMap<ReplicaId, Participant>,
    queue: VecDeque<ReplicaId>,
    holder: Option<ReplicaId>,
    fencing_token: u64,
}

impl LockState {
    fn send(&self, who: &ReplicaId, event: ElectionEvent) {
        if let Some(p) = self.participants.get(who) {
            let _ = p.events.send(event);
        }
    }

    fn enqueue(&mut self, who: &ReplicaId) {
        if !self.queue.contains(who) && self.holder.as_ref() != Some(who) {
            self.queue.push_back(who.clone());
            self.send(who, ElectionEvent::Queued);
        }
    }

    fn drop_holder(&mut self, who: &ReplicaId, event: ElectionEvent) {
        self.queue.retain(|q| q != who);
        if self.holder.as_ref() == Some(who) {
            self.holder = None;
        }
        self.send(who, event);
    }

    fn grant(&mut self) {
        if self.holder.is_some() {
            return;
        }
        while let Some(next) = self.queue.pop_front() {
            let live = self
                .participants
                .get(&next)
                .map(|p| p.connected && !p.events.is_closed())
                .unwrap_or(false);
            if live {
                self.fencing_token += 1;
                debug!(holder = %next, fencing_token = self.fencing_token, "lock granted");
                self.send(
                    &next,
                    ElectionEvent::Acquired {
                        fencing_token: self.fencing_token,
                    },
                );
                self.holder = Some(next);
                return;
            }
        }
    }
}

/// In-process FIFO lock service, with controls to simulate session loss.
#[derive(Default)]
pub struct LocalLockService {
    state: Mutex<LockState>,
}

impl LocalLockService {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<MutexGuard<'_, LockState>> {
        self.state
            .lock()
            .map_err(|_| Error::Election("lock service poisoned".into()))
    }

    /// Current lock holder.
    pub fn holder(&self) -> Option<ReplicaId> {
        self.lock().ok().and_then(|s| s.holder.clone())
    }

    /// Simulates `participant` losing its session: it gets `Disconnected`
    /// and the lock moves on.
    pub fn disconnect(&self, participant: &ReplicaId) -> Result<()> {
        let mut state = self.lock()?;
        if let Some(p) = state.participants.get_mut(participant) {
            p.connected = false;
        }
        state.drop_holder(participant, ElectionEvent::Disconnected);
        state.grant();
        Ok(())
    }

    /// Restores a disconnected participant's session and queues it again.
    pub fn reconnect(&self, participant: &ReplicaId) -> Result<()> {
        let mut state = self.lock()?;
        if let Some(p) = state.participants.get_mut(participant) {
            p.connected = true;
        }
        state.enqueue(participant);
        state.grant();
        Ok(())
    }
}

#[async_trait]
impl LeaderElection for LocalLockService {
    async fn join(&self, participant: &ReplicaId) -> Result<mpsc::UnboundedReceiver<ElectionEvent>> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut state = self.lock()?;
        state.participants.insert(
            participant.clone(),
            Participant {
                events: tx,
                connected: true,
            },
        );
        state.enqueue(participant);
        state.grant();
        Ok(rx)
    }

    async fn release(&self, participant: &ReplicaId) -> Result<()> {
        let mut state = self.lock()?;
        if state.holder.as_ref() == Some(participant) {
            state.drop_holder(participant, ElectionEvent::Lost);
            state.enqueue(participant);
            state.grant();
        }
        Ok(())
    }

    async fn leave(&self, participant: &ReplicaId) -> Result<()> {
        let mut state = self.lock()?;
        if state.holder.as_ref() == Some(participant) {
            state.drop_holder(participant, ElectionEvent::Lost);
        }
        state.queue.retain(|q| q != participant);
        state.participants.remove(participant);
        state.grant();
        Ok(())
    }
}
