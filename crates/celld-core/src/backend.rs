//! # Per-slot backends
//!
//! A slot is served by exactly one backend, GSM-flavored or CDMA-flavored.
//! Both own one [`ConnectionContext`] per [`Purpose`] and share the slot
//! bookkeeping in [`SlotData`]; they differ in which candidates they can
//! use and how they accept carrier records.
//!
//! The router holds a [`Backend`] and talks to it only through
//! [`DataBackend`] and the shared context operations, never by inspecting
//! the concrete flavor.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use celld_common::models::{ContextState, Purpose, TechFlavor};
use celld_common::protocol::DataEvent;
use crossbeam_channel::Sender;

use crate::candidate::{CandidateCatalog, ProfileCandidate};
use crate::context::{AttemptOutcome, AttemptResult, ConnectionContext};
use crate::error::ContextError;
use crate::events::EventBus;
use crate::util::lock;

/// Signal sent once every context of a slot is disconnected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AllDisconnected {
    pub slot: usize,
}

/// Carrier bookkeeping read from the card.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CarrierRecord {
    /// MCC+MNC.
    pub operator_numeric: Option<String>,
    pub spn: Option<String>,
}

/// Capability shared by both backend flavors.
pub trait DataBackend: Send + Sync {
    fn slot(&self) -> usize;
    fn flavor(&self) -> TechFlavor;
    /// Turn the slot's mobile-data switch on.
    fn enable_data(&self);
    /// Turn the switch off and release every active context. `completion`
    /// is signalled exactly once, when all contexts are disconnected.
    fn disable_data(&self, reason: &str, completion: Option<Sender<AllDisconnected>>);
    fn update_carrier_record(&self, record: CarrierRecord);
    /// Signal `waiter` once, as soon as every context is disconnected.
    fn register_all_disconnected(&self, waiter: Sender<AllDisconnected>);
}

// ── Shared slot bookkeeping ─────────────────────────────────────────

pub struct SlotData {
    slot: usize,
    flavor: TechFlavor,
    contexts: BTreeMap<Purpose, Arc<ConnectionContext>>,
    catalog: Arc<CandidateCatalog>,
    events: Arc<EventBus>,
    carrier: Mutex<Option<CarrierRecord>>,
    data_enabled: AtomicBool,
    retired: AtomicBool,
    disconnect_waiters: Mutex<Vec<Sender<AllDisconnected>>>,
}

impl SlotData {
    fn new(
        slot: usize,
        flavor: TechFlavor,
        catalog: Arc<CandidateCatalog>,
        events: Arc<EventBus>,
    ) -> Self {
        let contexts = Purpose::ALL
            .iter()
            .map(|&p| (p, Arc::new(ConnectionContext::new(slot, p))))
            .collect();
        let data = Self {
            slot,
            flavor,
            contexts,
            catalog,
            events,
            carrier: Mutex::new(None),
            data_enabled: AtomicBool::new(true),
            retired: AtomicBool::new(false),
            disconnect_waiters: Mutex::new(Vec::new()),
        };
        data.reseed_all();
        data
    }

    pub fn slot(&self) -> usize {
        self.slot
    }

    pub fn flavor(&self) -> TechFlavor {
        self.flavor
    }

    pub fn context(&self, purpose: Purpose) -> Arc<ConnectionContext> {
        // Every purpose gets a context at construction.
        self.contexts[&purpose].clone()
    }

    pub fn contexts(&self) -> impl Iterator<Item = &Arc<ConnectionContext>> {
        self.contexts.values()
    }

    pub fn is_data_enabled(&self) -> bool {
        self.data_enabled.load(Ordering::Acquire)
    }

    pub fn is_retired(&self) -> bool {
        self.retired.load(Ordering::Acquire)
    }

    pub fn carrier_record(&self) -> Option<CarrierRecord> {
        lock(&self.carrier).clone()
    }

    pub fn all_disconnected(&self) -> bool {
        self.contexts.values().all(|c| c.is_disconnected())
    }

    fn check_live(&self) -> Result<(), ContextError> {
        if self.is_retired() {
            return Err(ContextError::BackendRetired { slot: self.slot });
        }
        Ok(())
    }

    // ─── Candidate seeding ──────────────────────────────────────────────

    fn candidates_for(&self, purpose: Purpose) -> Vec<Arc<ProfileCandidate>> {
        let carrier = lock(&self.carrier)
            .as_ref()
            .and_then(|r| r.operator_numeric.clone());
        self.catalog
            .for_purpose(purpose, self.flavor, carrier.as_deref())
    }

    /// Give `purpose` a fresh list from the catalog. Returns the new list
    /// length, or zero when an attempt or connection holds the current list
    /// and the reseed is deferred until the context comes to rest.
    pub fn reseed(&self, purpose: Purpose) -> Result<usize, ContextError> {
        Ok(self.reseed_if(purpose, at_rest)?.unwrap_or(0))
    }

    fn reseed_if(
        &self,
        purpose: Purpose,
        accept: fn(ContextState) -> bool,
    ) -> Result<Option<usize>, ContextError> {
        let list = self.candidates_for(purpose);
        let n = list.len();
        if self.context(purpose).replace_candidates_if(accept, list)? {
            tracing::debug!(slot = self.slot, %purpose, candidates = n, "context seeded");
            Ok(Some(n))
        } else {
            tracing::debug!(slot = self.slot, %purpose, "context busy, reseed deferred");
            Ok(None)
        }
    }

    /// Reseed every context that is not holding or building a connection.
    /// The others are marked stale and reseed once they come to rest.
    pub fn reseed_all(&self) {
        for ctx in self.contexts.values() {
            if let Err(e) = self.reseed_if(ctx.purpose(), at_rest) {
                tracing::warn!(slot = self.slot, purpose = %ctx.purpose(), error = %e, "reseed rejected");
            }
        }
    }

    /// Apply a deferred reseed once `ctx` has come to rest.
    fn settle(&self, ctx: &ConnectionContext) {
        if !ctx.is_stale() || !at_rest(ctx.state()) {
            return;
        }
        self.catalog.prune_retained();
        if let Err(e) = self.reseed_if(ctx.purpose(), at_rest) {
            tracing::warn!(slot = self.slot, purpose = %ctx.purpose(), error = %e, "reseed rejected");
        }
    }

    // ─── Connection requests ────────────────────────────────────────────

    pub fn request(
        &self,
        purpose: Purpose,
        reason: &str,
    ) -> Result<Arc<ProfileCandidate>, ContextError> {
        self.check_live()?;
        if !self.is_data_enabled() {
            return Err(ContextError::DataDisabled { slot: self.slot });
        }
        let ctx = self.context(purpose);
        if ctx.needs_reseed() {
            self.reseed_if(purpose, |s| {
                matches!(s, ContextState::Idle | ContextState::Scanning)
            })?;
        }
        let (t, candidate) = ctx.begin_attempt(reason)?;
        tracing::info!(
            slot = self.slot,
            %purpose,
            candidate = %candidate.id(),
            apn = %candidate.apn(),
            "connection attempt started"
        );
        self.events
            .state_changed(self.slot, purpose, t, Some(reason.to_string()));
        Ok(candidate)
    }

    pub fn release(&self, purpose: Purpose, reason: &str) -> Result<ContextState, ContextError> {
        self.check_live()?;
        let ctx = self.context(purpose);
        let t = ctx.begin_release(reason);
        self.events
            .state_changed(self.slot, purpose, t, Some(reason.to_string()));
        self.settle(&ctx);
        self.notify_if_all_disconnected();
        Ok(t.new)
    }

    pub fn set_enabled(&self, purpose: Purpose, enabled: bool) -> Result<(), ContextError> {
        self.check_live()?;
        let ctx = self.context(purpose);
        ctx.set_enabled(enabled);
        if !enabled && ctx.is_connected_or_connecting() {
            self.release(purpose, "purposeDisabled")?;
        }
        Ok(())
    }

    pub fn set_dependency_met(&self, purpose: Purpose, met: bool) -> Result<(), ContextError> {
        self.check_live()?;
        let ctx = self.context(purpose);
        ctx.set_dependency_met(met);
        if !met && ctx.is_connected_or_connecting() {
            self.release(purpose, "dependencyUnmet")?;
        }
        Ok(())
    }

    // ─── Radio callbacks ────────────────────────────────────────────────

    pub fn on_attempt_result(
        &self,
        purpose: Purpose,
        candidate_id: &str,
        result: AttemptResult,
    ) -> Result<AttemptOutcome, ContextError> {
        self.check_live()?;
        let ctx = self.context(purpose);
        let (t, outcome) = ctx.complete_attempt(candidate_id, result)?;
        match &outcome {
            AttemptOutcome::Connected => {
                tracing::info!(slot = self.slot, %purpose, candidate = candidate_id, "connected")
            }
            AttemptOutcome::Retry(next) => tracing::info!(
                slot = self.slot,
                %purpose,
                failed = candidate_id,
                next = %next.id(),
                ?result,
                "advancing to next candidate"
            ),
            AttemptOutcome::Scanning => tracing::info!(
                slot = self.slot,
                %purpose,
                countdown = ctx.permanent_failure_countdown(),
                "candidate pass exhausted"
            ),
            AttemptOutcome::Failed => {}
        }
        self.events.state_changed(self.slot, purpose, t, ctx.reason());
        self.settle(&ctx);
        self.notify_if_all_disconnected();
        Ok(outcome)
    }

    pub fn on_disconnected(&self, purpose: Purpose, reason: Option<&str>) -> Result<(), ContextError> {
        self.check_live()?;
        let ctx = self.context(purpose);
        let t = ctx.complete_release(reason);
        self.events.state_changed(self.slot, purpose, t, ctx.reason());
        self.settle(&ctx);
        self.notify_if_all_disconnected();
        Ok(())
    }

    // ─── Slot-wide switches ─────────────────────────────────────────────

    fn enable_data(&self) {
        self.data_enabled.store(true, Ordering::Release);
        tracing::info!(slot = self.slot, flavor = %self.flavor, "mobile data enabled");
    }

    fn disable_data(&self, reason: &str, completion: Option<Sender<AllDisconnected>>) {
        self.data_enabled.store(false, Ordering::Release);
        tracing::info!(slot = self.slot, flavor = %self.flavor, reason, "mobile data disabled");
        if let Some(tx) = completion {
            lock(&self.disconnect_waiters).push(tx);
        }
        for ctx in self.contexts.values() {
            let t = ctx.begin_release(reason);
            self.events
                .state_changed(self.slot, ctx.purpose(), t, Some(reason.to_string()));
            self.settle(ctx);
        }
        self.notify_if_all_disconnected();
    }

    fn register_all_disconnected(&self, waiter: Sender<AllDisconnected>) {
        let mut waiters = lock(&self.disconnect_waiters);
        if self.all_disconnected() {
            let _ = waiter.send(AllDisconnected { slot: self.slot });
            return;
        }
        waiters.push(waiter);
    }

    /// Drain and signal the waiters if every context is disconnected.
    ///
    /// Waiters are taken under the lock, so each is signalled at most once
    /// even when several callbacks race here.
    fn notify_if_all_disconnected(&self) {
        let drained: Vec<_> = {
            let mut waiters = lock(&self.disconnect_waiters);
            if waiters.is_empty() || !self.all_disconnected() {
                return;
            }
            waiters.drain(..).collect()
        };
        tracing::info!(slot = self.slot, waiters = drained.len(), "all contexts disconnected");
        for tx in drained {
            let _ = tx.send(AllDisconnected { slot: self.slot });
        }
        self.events
            .publish(DataEvent::AllDisconnected { slot: self.slot });
    }

    fn set_carrier_record(&self, record: CarrierRecord) {
        tracing::info!(
            slot = self.slot,
            flavor = %self.flavor,
            operator = record.operator_numeric.as_deref().unwrap_or("-"),
            spn = record.spn.as_deref().unwrap_or("-"),
            "carrier record updated"
        );
        *lock(&self.carrier) = Some(record);
        self.reseed_all();
    }

    /// Copy the user-facing switches of the backend being replaced.
    pub(crate) fn inherit_policy(&self, old: &SlotData) {
        self.data_enabled
            .store(old.is_data_enabled(), Ordering::Release);
        for (purpose, ctx) in &self.contexts {
            let prev = old.context(*purpose);
            ctx.set_enabled(prev.is_enabled());
            ctx.set_dependency_met(prev.is_dependency_met());
        }
    }

    /// Tear down every context and release pending waiters. Called once
    /// the router has swapped this backend out.
    pub(crate) fn retire(&self) {
        self.retired.store(true, Ordering::Release);
        for ctx in self.contexts.values() {
            let t = ctx.set_state(ContextState::Idle, Some("technologyChanged"));
            self.events
                .state_changed(self.slot, ctx.purpose(), t, ctx.reason());
        }
        self.notify_if_all_disconnected();
    }
}

// ── GSM ─────────────────────────────────────────────────────────────

/// Backend for SIM/USIM applications.
pub struct GsmBackend {
    data: SlotData,
}

impl GsmBackend {
    pub fn new(slot: usize, catalog: Arc<CandidateCatalog>, events: Arc<EventBus>) -> Self {
        Self {
            data: SlotData::new(slot, TechFlavor::Gsm, catalog, events),
        }
    }
}

impl DataBackend for GsmBackend {
    fn slot(&self) -> usize {
        self.data.slot
    }

    fn flavor(&self) -> TechFlavor {
        TechFlavor::Gsm
    }

    fn enable_data(&self) {
        self.data.enable_data();
    }

    fn disable_data(&self, reason: &str, completion: Option<Sender<AllDisconnected>>) {
        self.data.disable_data(reason, completion);
    }

    /// SIM records always carry an IMSI-derived MCC+MNC; anything that is
    /// not 5 or 6 digits is dropped rather than used as a filter.
    fn update_carrier_record(&self, mut record: CarrierRecord) {
        if let Some(op) = &record.operator_numeric {
            if !is_mcc_mnc(op) {
                tracing::warn!(slot = self.data.slot, operator = %op, "ignoring malformed operator numeric");
                record.operator_numeric = None;
            }
        }
        self.data.set_carrier_record(record);
    }

    fn register_all_disconnected(&self, waiter: Sender<AllDisconnected>) {
        self.data.register_all_disconnected(waiter);
    }
}

// ── CDMA ────────────────────────────────────────────────────────────

/// Backend for RUIM/CSIM applications.
pub struct CdmaBackend {
    data: SlotData,
}

impl CdmaBackend {
    pub fn new(slot: usize, catalog: Arc<CandidateCatalog>, events: Arc<EventBus>) -> Self {
        Self {
            data: SlotData::new(slot, TechFlavor::Cdma, catalog, events),
        }
    }
}

impl DataBackend for CdmaBackend {
    fn slot(&self) -> usize {
        self.data.slot
    }

    fn flavor(&self) -> TechFlavor {
        TechFlavor::Cdma
    }

    fn enable_data(&self) {
        self.data.enable_data();
    }

    fn disable_data(&self, reason: &str, completion: Option<Sender<AllDisconnected>>) {
        self.data.disable_data(reason, completion);
    }

    /// NV-provisioned devices report no operator numeric; an empty one
    /// means "no carrier filter".
    fn update_carrier_record(&self, mut record: CarrierRecord) {
        if record
            .operator_numeric
            .as_deref()
            .is_some_and(|op| op.trim().is_empty())
        {
            record.operator_numeric = None;
        }
        self.data.set_carrier_record(record);
    }

    fn register_all_disconnected(&self, waiter: Sender<AllDisconnected>) {
        self.data.register_all_disconnected(waiter);
    }
}

fn at_rest(state: ContextState) -> bool {
    matches!(
        state,
        ContextState::Idle | ContextState::Failed | ContextState::Scanning
    )
}

fn is_mcc_mnc(op: &str) -> bool {
    matches!(op.len(), 5 | 6) && op.bytes().all(|b| b.is_ascii_digit())
}

// ── Variant ─────────────────────────────────────────────────────────

pub enum Backend {
    Gsm(GsmBackend),
    Cdma(CdmaBackend),
}

impl Backend {
    pub fn new(
        flavor: TechFlavor,
        slot: usize,
        catalog: Arc<CandidateCatalog>,
        events: Arc<EventBus>,
    ) -> Self {
        match flavor {
            TechFlavor::Gsm => Backend::Gsm(GsmBackend::new(slot, catalog, events)),
            TechFlavor::Cdma => Backend::Cdma(CdmaBackend::new(slot, catalog, events)),
        }
    }

    /// Slot bookkeeping common to both flavors.
    pub fn data(&self) -> &SlotData {
        match self {
            Backend::Gsm(b) => &b.data,
            Backend::Cdma(b) => &b.data,
        }
    }

    fn inner(&self) -> &dyn DataBackend {
        match self {
            Backend::Gsm(b) => b as &dyn DataBackend,
            Backend::Cdma(b) => b as &dyn DataBackend,
        }
    }
}

impl DataBackend for Backend {
    fn slot(&self) -> usize {
        self.inner().slot()
    }

    fn flavor(&self) -> TechFlavor {
        self.inner().flavor()
    }

    fn enable_data(&self) {
        self.inner().enable_data();
    }

    fn disable_data(&self, reason: &str, completion: Option<Sender<AllDisconnected>>) {
        self.inner().disable_data(reason, completion);
    }

    fn update_carrier_record(&self, record: CarrierRecord) {
        self.inner().update_carrier_record(record);
    }

    fn register_all_disconnected(&self, waiter: Sender<AllDisconnected>) {
        self.inner().register_all_disconnected(waiter);
    }
}

impl std::fmt::Debug for Backend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Backend")
            .field("slot", &self.slot())
            .field("flavor", &self.flavor())
            .field("retired", &self.data().is_retired())
            .finish()
    }
}
