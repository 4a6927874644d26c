//! Fan-out of [`DataEvent`] notifications to listeners.
//!
//! Each subscriber gets its own unbounded channel so a slow listener never
//! stalls the radio callback that produced the event. Subscribers whose
//! receiver has been dropped are pruned on the next publish.

use std::sync::Mutex;

use celld_common::models::{ContextState, Purpose};
use celld_common::protocol::{DataEvent, StateChangedPayload};
use crossbeam_channel::{Receiver, Sender, unbounded};

use crate::context::Transition;
use crate::util::lock;

#[derive(Default)]
pub struct EventBus {
    subscribers: Mutex<Vec<Sender<DataEvent>>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self) -> Receiver<DataEvent> {
        let (tx, rx) = unbounded();
        lock(&self.subscribers).push(tx);
        rx
    }

    pub fn subscriber_count(&self) -> usize {
        lock(&self.subscribers).len()
    }

    pub fn publish(&self, event: DataEvent) {
        let mut subs = lock(&self.subscribers);
        subs.retain(|tx| tx.send(event.clone()).is_ok());
    }

    /// Publish a state change if `t` actually changed state.
    pub(crate) fn state_changed(
        &self,
        slot: usize,
        purpose: Purpose,
        t: Transition,
        reason: Option<String>,
    ) {
        if !t.changed() {
            return;
        }
        log_transition(slot, purpose, t.old, t.new, reason.as_deref());
        self.publish(DataEvent::StateChanged(StateChangedPayload {
            slot,
            purpose,
            old: t.old,
            new: t.new,
            reason,
        }));
    }
}

fn log_transition(
    slot: usize,
    purpose: Purpose,
    old: ContextState,
    new: ContextState,
    reason: Option<&str>,
) {
    match new {
        ContextState::Failed => {
            tracing::warn!(slot, %purpose, %old, %new, reason, "context failed")
        }
        _ => tracing::info!(slot, %purpose, %old, %new, reason, "context state changed"),
    }
}
