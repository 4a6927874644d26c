//! # Subscription Router
//!
//! Maps a slot index to the backend serving it and keeps each backend's
//! technology flavor in line with the application type the card reports.
//!
//! Each slot's backend sits behind its own `RwLock`. `resolve` takes the
//! read side just long enough to clone the `Arc`; `reconcile` builds any
//! replacement backend first and then swaps it in under the write side,
//! so a caller sees either the old backend or the new one, never a slot
//! in the middle of replacement. Reconciliations are serialized among
//! themselves by a router-wide mutex.
//!
//! The roster snapshot is published through an `ArcSwap`: readers load
//! the whole snapshot lock-free and never observe a partial copy.

use std::sync::{Arc, Mutex, RwLock};

use arc_swap::ArcSwap;
use celld_common::models::{AppType, SubscriptionIdentity, SubscriptionRoster, TechFlavor};
use celld_common::models::RosterError;
use celld_common::protocol::{DataEvent, TechnologyChangedPayload};
use crossbeam_channel::Sender;

use crate::backend::{AllDisconnected, Backend, CarrierRecord, DataBackend};
use crate::candidate::CandidateCatalog;
use crate::error::RouteError;
use crate::events::EventBus;
use crate::util::{lock, read, write};

/// What `reconcile` did to one slot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SlotChange {
    /// First backend for the slot.
    Provisioned { slot: usize, flavor: TechFlavor },
    /// Backend replaced for a different technology.
    Swapped {
        slot: usize,
        old: TechFlavor,
        new: TechFlavor,
    },
    /// Application type did not determine a technology; slot left as is.
    Ambiguous { slot: usize, app_type: AppType },
}

pub struct SubscriptionRouter {
    slots: Vec<RwLock<Option<Arc<Backend>>>>,
    roster: ArcSwap<SubscriptionRoster>,
    reconcile_lock: Mutex<()>,
    catalog: Arc<CandidateCatalog>,
    events: Arc<EventBus>,
}

impl SubscriptionRouter {
    pub fn new(slot_count: usize, catalog: Arc<CandidateCatalog>, events: Arc<EventBus>) -> Self {
        Self {
            slots: (0..slot_count).map(|_| RwLock::new(None)).collect(),
            roster: ArcSwap::from_pointee(SubscriptionRoster::new(slot_count)),
            reconcile_lock: Mutex::new(()),
            catalog,
            events,
        }
    }

    pub fn slot_count(&self) -> usize {
        self.slots.len()
    }

    fn slot(&self, slot: usize) -> Result<&RwLock<Option<Arc<Backend>>>, RouteError> {
        self.slots.get(slot).ok_or(RouteError::OutOfRange {
            slot,
            slots: self.slots.len(),
        })
    }

    /// Backend currently serving `slot`.
    pub fn resolve(&self, slot: usize) -> Result<Arc<Backend>, RouteError> {
        read(self.slot(slot)?)
            .clone()
            .ok_or(RouteError::NotProvisioned { slot })
    }

    /// Create the slot's first backend. An already provisioned slot keeps
    /// its backend, whatever its flavor; flavor changes go through
    /// [`reconcile`](Self::reconcile).
    pub fn provision(&self, slot: usize, flavor: TechFlavor) -> Result<Arc<Backend>, RouteError> {
        let _serial = lock(&self.reconcile_lock);
        self.provision_locked(slot, flavor)
    }

    /// Provision from an application type.
    pub fn provision_for(&self, slot: usize, app_type: AppType) -> Result<Arc<Backend>, RouteError> {
        let flavor = app_type
            .flavor()
            .ok_or(RouteError::AmbiguousApplicationType { slot, app_type })?;
        self.provision(slot, flavor)
    }

    fn provision_locked(&self, slot: usize, flavor: TechFlavor) -> Result<Arc<Backend>, RouteError> {
        let cell = self.slot(slot)?;
        if let Some(existing) = read(cell).clone() {
            return Ok(existing);
        }
        let backend = Arc::new(self.build(slot, flavor));
        *write(cell) = Some(backend.clone());
        tracing::info!(slot, %flavor, "backend provisioned");
        Ok(backend)
    }

    fn build(&self, slot: usize, flavor: TechFlavor) -> Backend {
        Backend::new(flavor, slot, self.catalog.clone(), self.events.clone())
    }

    // ─── Roster ─────────────────────────────────────────────────────────

    /// Current roster snapshot.
    pub fn roster(&self) -> Arc<SubscriptionRoster> {
        self.roster.load_full()
    }

    /// Identity of the application in a provisioned slot.
    pub fn identity(&self, slot: usize) -> Result<SubscriptionIdentity, RouteError> {
        self.resolve(slot)?;
        Ok(self.roster.load().get(slot).cloned().unwrap_or_default())
    }

    /// Bring every slot's backend in line with `roster` and publish it as
    /// the current snapshot.
    ///
    /// A slot whose application type maps to a different flavor than its
    /// backend gets a new backend and one technology-change notification.
    /// An unrecognized application type leaves the slot untouched.
    pub fn reconcile(&self, roster: &SubscriptionRoster) -> Result<Vec<SlotChange>, RosterError> {
        let _serial = lock(&self.reconcile_lock);
        if roster.len() != self.slots.len() {
            return Err(RosterError::SlotCountMismatch {
                expected: self.slots.len(),
                actual: roster.len(),
            });
        }

        let previous = self.roster.load_full();
        let mut changes = Vec::new();
        for (slot, identity) in roster.iter().enumerate() {
            if let Some(prev) = previous.get(slot) {
                if !prev.is_same(identity) {
                    tracing::info!(slot, app_type = %identity.app_type, "subscription changed");
                } else if prev.status != identity.status {
                    tracing::debug!(slot, status = ?identity.status, "activation status changed");
                }
            }
            if let Some(change) = self.reconcile_slot(slot, identity) {
                changes.push(change);
            }
        }

        let mut next = SubscriptionRoster::new(self.slots.len());
        next.copy_from(roster)?;
        self.roster.store(Arc::new(next));
        Ok(changes)
    }

    fn reconcile_slot(&self, slot: usize, identity: &SubscriptionIdentity) -> Option<SlotChange> {
        let cell = &self.slots[slot];
        let current = read(cell).clone();

        let Some(wanted) = identity.app_type.flavor() else {
            if identity.is_cleared() && identity.app_type == AppType::Unknown {
                tracing::debug!(slot, "no application in slot");
                return None;
            }
            tracing::warn!(
                slot,
                app_type = %identity.app_type,
                current = ?current.as_ref().map(|b| b.flavor()),
                "ambiguous application type; leaving backend untouched"
            );
            return Some(SlotChange::Ambiguous {
                slot,
                app_type: identity.app_type,
            });
        };

        let Some(current) = current else {
            *write(cell) = Some(Arc::new(self.build(slot, wanted)));
            tracing::info!(slot, flavor = %wanted, "backend provisioned");
            return Some(SlotChange::Provisioned {
                slot,
                flavor: wanted,
            });
        };

        let old = current.flavor();
        if old == wanted {
            return None;
        }

        let replacement = self.build(slot, wanted);
        replacement.data().inherit_policy(current.data());
        *write(cell) = Some(Arc::new(replacement));
        current.data().retire();

        tracing::info!(slot, %old, new = %wanted, app_type = %identity.app_type, "backend technology changed");
        self.events
            .publish(DataEvent::TechnologyChanged(TechnologyChangedPayload {
                slot,
                old,
                new: wanted,
            }));
        Some(SlotChange::Swapped {
            slot,
            old,
            new: wanted,
        })
    }

    // ─── Per-slot fan-out ───────────────────────────────────────────────

    pub fn enable_data(&self, slot: usize) -> Result<(), RouteError> {
        self.resolve(slot)?.enable_data();
        Ok(())
    }

    pub fn disable_data(
        &self,
        slot: usize,
        reason: &str,
        completion: Option<Sender<AllDisconnected>>,
    ) -> Result<(), RouteError> {
        self.resolve(slot)?.disable_data(reason, completion);
        Ok(())
    }

    pub fn update_carrier_record(&self, slot: usize, record: CarrierRecord) -> Result<(), RouteError> {
        self.resolve(slot)?.update_carrier_record(record);
        Ok(())
    }

    pub fn register_all_disconnected(
        &self,
        slot: usize,
        waiter: Sender<AllDisconnected>,
    ) -> Result<(), RouteError> {
        self.resolve(slot)?.register_all_disconnected(waiter);
        Ok(())
    }

    /// Every provisioned backend.
    pub fn backends(&self) -> Vec<Arc<Backend>> {
        self.slots.iter().filter_map(|s| read(s).clone()).collect()
    }
}
