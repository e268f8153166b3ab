//! Per-connection turn bookkeeping.
//!
//! Each connected client owns one slot holding its current turn's
//! cancellation handle, a generation counter and the audio assembler for
//! that turn. Every mutation happens under one lock, so cancelling the old
//! handle and installing the new one is a single step.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio_util::sync::CancellationToken;
use tracing::debug;
use uuid::Uuid;
use voxrelay_core::assembler::AudioChunkAssembler;

#[derive(Debug, Default)]
struct Slot {
    cancel: Option<CancellationToken>,
    generation: u64,
    assembler: AudioChunkAssembler,
}

/// Identifies one turn for one session. Goes stale as soon as another turn
/// begins, the turn is cancelled, or the session disconnects.
#[derive(Debug, Clone)]
pub struct TurnTicket {
    pub session: Uuid,
    pub generation: u64,
    pub cancel: CancellationToken,
}

#[derive(Clone, Debug, Default)]
pub struct SessionRegistry {
    slots: Arc<Mutex<HashMap<Uuid, Slot>>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<Uuid, Slot>> {
        self.slots.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn register(&self, session: Uuid) {
        self.lock().entry(session).or_default();
    }

    /// Starts a new turn, cancelling whatever turn was live for `session`.
    ///
    /// Returns `None` when the session is not registered (it already
    /// disconnected).
    pub fn begin_turn(&self, session: Uuid) -> Option<TurnTicket> {
        let mut slots = self.lock();
        let slot = slots.get_mut(&session)?;
        if let Some(previous) = slot.cancel.take() {
            previous.cancel();
            debug!(%session, generation = slot.generation, "Cancelled superseded turn");
        }
        slot.generation += 1;
        slot.assembler.reset();
        let cancel = CancellationToken::new();
        slot.cancel = Some(cancel.clone());
        Some(TurnTicket {
            session,
            generation: slot.generation,
            cancel,
        })
    }

    /// Cancels the live turn, if any. Returns whether one was cancelled.
    pub fn cancel_turn(&self, session: Uuid) -> bool {
        let mut slots = self.lock();
        let Some(slot) = slots.get_mut(&session) else {
            return false;
        };
        slot.generation += 1;
        slot.assembler.reset();
        match slot.cancel.take() {
            Some(cancel) => {
                cancel.cancel();
                true
            }
            None => false,
        }
    }

    /// Releases the handle of a turn that ran to completion.
    pub fn finish_turn(&self, ticket: &TurnTicket) {
        let mut slots = self.lock();
        if let Some(slot) = slots.get_mut(&ticket.session)
            && slot.generation == ticket.generation
        {
            slot.cancel = None;
            slot.assembler.reset();
        }
    }

    pub fn is_current(&self, ticket: &TurnTicket) -> bool {
        self.lock()
            .get(&ticket.session)
            .is_some_and(|slot| slot.generation == ticket.generation)
    }

    /// Runs `f` against the session's assembler while `ticket` is current.
    ///
    /// The registry lock is held for the duration of `f`, so a turn cannot
    /// be superseded halfway through delivering an event. `None` means the
    /// ticket is stale and `f` did not run.
    pub fn with_current<R>(
        &self,
        ticket: &TurnTicket,
        f: impl FnOnce(&mut AudioChunkAssembler) -> R,
    ) -> Option<R> {
        let mut slots = self.lock();
        let slot = slots.get_mut(&ticket.session)?;
        if slot.generation != ticket.generation {
            return None;
        }
        Some(f(&mut slot.assembler))
    }

    /// Drops the session and cancels its live turn.
    pub fn remove(&self, session: Uuid) {
        if let Some(slot) = self.lock().remove(&session)
            && let Some(cancel) = slot.cancel
        {
            cancel.cancel();
        }
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }
}
