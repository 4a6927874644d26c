//! # Data service
//!
//! The inbound surface used by the connectivity policy and the radio
//! layer. Built once at start-up from a [`CelldConfig`] and shared by
//! reference; every call names its subscription slot explicitly or goes
//! through the default data slot.

use std::sync::{Arc, Mutex};

use celld_common::models::{AppType, ContextState, Purpose, SubscriptionIdentity, SubscriptionRoster};
use celld_common::protocol::DataEvent;
use crossbeam_channel::{Receiver, Sender};

use crate::backend::{AllDisconnected, Backend, CarrierRecord};
use crate::candidate::{CandidateCatalog, CandidateSpec, ProfileCandidate, ReloadSummary};
use crate::config::CelldConfig;
use crate::context::{AttemptOutcome, AttemptResult, ConnectionContext};
use crate::error::{RouteError, ServiceError};
use crate::events::EventBus;
use crate::router::{SlotChange, SubscriptionRouter};
use crate::util::lock;

pub struct DataService {
    router: SubscriptionRouter,
    catalog: Arc<CandidateCatalog>,
    events: Arc<EventBus>,
    default_data_slot: Mutex<Option<usize>>,
}

impl DataService {
    /// Build the service and apply the configured roster, if any.
    pub fn new(config: &CelldConfig) -> Result<Self, ServiceError> {
        let catalog = Arc::new(CandidateCatalog::new(config.candidates.clone()));
        let events = Arc::new(EventBus::new());
        let service = Self {
            router: SubscriptionRouter::new(config.slots, catalog.clone(), events.clone()),
            catalog,
            events,
            default_data_slot: Mutex::new(config.default_data_slot),
        };
        if let Some(roster) = &config.roster {
            service.on_roster_refresh(roster)?;
        }
        tracing::info!(
            slots = config.slots,
            candidates = service.catalog.len(),
            default_data_slot = ?config.default_data_slot,
            "data service ready"
        );
        Ok(service)
    }

    pub fn subscribe(&self) -> Receiver<DataEvent> {
        self.events.subscribe()
    }

    pub fn router(&self) -> &SubscriptionRouter {
        &self.router
    }

    pub fn catalog(&self) -> &CandidateCatalog {
        &self.catalog
    }

    fn backend(&self, slot: usize) -> Result<Arc<Backend>, RouteError> {
        self.router.resolve(slot).inspect_err(|e| {
            tracing::debug!(slot, error = %e, "slot lookup failed");
        })
    }

    // ─── Policy layer ───────────────────────────────────────────────────

    /// Start an attempt for `purpose` on `slot`. Returns the candidate
    /// the radio layer should dial.
    pub fn request_connection(
        &self,
        slot: usize,
        purpose: Purpose,
        reason: &str,
    ) -> Result<Arc<ProfileCandidate>, ServiceError> {
        Ok(self.backend(slot)?.data().request(purpose, reason)?)
    }

    pub fn release_connection(
        &self,
        slot: usize,
        purpose: Purpose,
        reason: &str,
    ) -> Result<ContextState, ServiceError> {
        Ok(self.backend(slot)?.data().release(purpose, reason)?)
    }

    pub fn set_enabled(&self, slot: usize, purpose: Purpose, enabled: bool) -> Result<(), ServiceError> {
        Ok(self.backend(slot)?.data().set_enabled(purpose, enabled)?)
    }

    pub fn set_dependency_met(
        &self,
        slot: usize,
        purpose: Purpose,
        met: bool,
    ) -> Result<(), ServiceError> {
        Ok(self.backend(slot)?.data().set_dependency_met(purpose, met)?)
    }

    // ─── Default data slot ──────────────────────────────────────────────

    pub fn default_data_slot(&self) -> Option<usize> {
        *lock(&self.default_data_slot)
    }

    pub fn set_default_data_slot(&self, slot: Option<usize>) -> Result<(), ServiceError> {
        if let Some(s) = slot {
            if s >= self.router.slot_count() {
                return Err(RouteError::OutOfRange {
                    slot: s,
                    slots: self.router.slot_count(),
                }
                .into());
            }
        }
        let old = std::mem::replace(&mut *lock(&self.default_data_slot), slot);
        if old != slot {
            tracing::info!(old = ?old, new = ?slot, "default data slot changed");
        }
        Ok(())
    }

    fn default_slot(&self) -> Result<usize, RouteError> {
        // No default is reported the same way as a slot with no backend.
        self.default_data_slot()
            .ok_or(RouteError::NotProvisioned { slot: 0 })
    }

    pub fn request_default(
        &self,
        purpose: Purpose,
        reason: &str,
    ) -> Result<Arc<ProfileCandidate>, ServiceError> {
        self.request_connection(self.default_slot()?, purpose, reason)
    }

    pub fn release_default(&self, purpose: Purpose, reason: &str) -> Result<ContextState, ServiceError> {
        self.release_connection(self.default_slot()?, purpose, reason)
    }

    // ─── Radio layer ────────────────────────────────────────────────────

    pub fn on_attempt_result(
        &self,
        slot: usize,
        purpose: Purpose,
        candidate_id: &str,
        result: AttemptResult,
    ) -> Result<AttemptOutcome, ServiceError> {
        Ok(self
            .backend(slot)?
            .data()
            .on_attempt_result(purpose, candidate_id, result)?)
    }

    pub fn on_disconnected(
        &self,
        slot: usize,
        purpose: Purpose,
        reason: Option<&str>,
    ) -> Result<(), ServiceError> {
        Ok(self.backend(slot)?.data().on_disconnected(purpose, reason)?)
    }

    /// Apply a full card-state snapshot.
    pub fn on_roster_refresh(&self, roster: &SubscriptionRoster) -> Result<Vec<SlotChange>, ServiceError> {
        Ok(self.router.reconcile(roster)?)
    }

    // ─── Slot-wide switches ─────────────────────────────────────────────

    pub fn enable_data(&self, slot: usize) -> Result<(), ServiceError> {
        Ok(self.router.enable_data(slot)?)
    }

    pub fn disable_data(
        &self,
        slot: usize,
        reason: &str,
        completion: Option<Sender<AllDisconnected>>,
    ) -> Result<(), ServiceError> {
        Ok(self.router.disable_data(slot, reason, completion)?)
    }

    pub fn update_carrier_record(&self, slot: usize, record: CarrierRecord) -> Result<(), ServiceError> {
        Ok(self.router.update_carrier_record(slot, record)?)
    }

    pub fn register_all_disconnected(
        &self,
        slot: usize,
        waiter: Sender<AllDisconnected>,
    ) -> Result<(), ServiceError> {
        Ok(self.router.register_all_disconnected(slot, waiter)?)
    }

    // ─── Candidates ─────────────────────────────────────────────────────

    /// Swap in a new candidate set and reseed every idle context. Busy
    /// contexts take the new set when their connection comes to rest.
    pub fn reload_candidates(&self, specs: Vec<CandidateSpec>) -> ReloadSummary {
        let summary = self.catalog.reload(specs);
        for backend in self.router.backends() {
            backend.data().reseed_all();
        }
        summary
    }

    /// Give one purpose a fresh candidate list. This is how a failed
    /// purpose becomes connectable again.
    pub fn reset_candidates(&self, slot: usize, purpose: Purpose) -> Result<usize, ServiceError> {
        Ok(self.backend(slot)?.data().reseed(purpose)?)
    }

    // ─── Queries ────────────────────────────────────────────────────────

    pub fn context(&self, slot: usize, purpose: Purpose) -> Result<Arc<ConnectionContext>, ServiceError> {
        Ok(self.backend(slot)?.data().context(purpose))
    }

    pub fn state(&self, slot: usize, purpose: Purpose) -> Result<ContextState, ServiceError> {
        Ok(self.context(slot, purpose)?.state())
    }

    pub fn subscription(&self, slot: usize) -> Result<SubscriptionIdentity, ServiceError> {
        Ok(self.router.identity(slot)?)
    }

    pub fn iccid(&self, slot: usize) -> Result<Option<String>, ServiceError> {
        Ok(self.subscription(slot)?.iccid)
    }

    pub fn app_label(&self, slot: usize) -> Result<Option<String>, ServiceError> {
        Ok(self.subscription(slot)?.app_label)
    }

    pub fn app_type(&self, slot: usize) -> Result<AppType, ServiceError> {
        Ok(self.subscription(slot)?.app_type)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::ConnectionHandle;
    use crate::error::ContextError;

    const CONFIG: &str = r#"
        slots = 2
        default_data_slot = 0

        [[candidates]]
        id = "primary"
        carrier = "310260"
        apn = "fast.t-mobile.com"
        purposes = ["internet", "supl"]

        [[candidates]]
        id = "fallback"
        carrier = "310260"
        apn = "epc.tmobile.com"
        purposes = ["internet"]

        [[roster]]
        slot = 0
        app_type = "USIM"
        iccid = "8901260000000000001"
        app_label = "T-Mobile"
    "#;

    fn service() -> DataService {
        DataService::new(&CelldConfig::from_toml_str(CONFIG).unwrap()).unwrap()
    }

    #[test]
    fn configured_roster_provisions_slots() {
        let svc = service();
        assert_eq!(svc.app_type(0).unwrap(), AppType::Usim);
        assert_eq!(svc.iccid(0).unwrap().as_deref(), Some("8901260000000000001"));
        assert_eq!(svc.app_label(0).unwrap().as_deref(), Some("T-Mobile"));
        assert!(matches!(
            svc.iccid(1).unwrap_err(),
            ServiceError::Route(RouteError::NotProvisioned { slot: 1 })
        ));
        assert!(matches!(
            svc.iccid(5).unwrap_err(),
            ServiceError::Route(RouteError::OutOfRange { slot: 5, slots: 2 })
        ));
    }

    #[test]
    fn request_needs_enabled_purpose() {
        let svc = service();
        let err = svc
            .request_connection(0, Purpose::Internet, "userRequest")
            .unwrap_err();
        assert!(matches!(err, ServiceError::Context(ContextError::NotReady { .. })));
    }

    #[test]
    fn default_slot_routes_requests() {
        let svc = service();
        svc.set_enabled(0, Purpose::Internet, true).unwrap();
        let c = svc.request_default(Purpose::Internet, "userRequest").unwrap();
        assert_eq!(c.id(), "primary");
        assert_eq!(svc.state(0, Purpose::Internet).unwrap(), ContextState::Connecting);

        svc.set_default_data_slot(None).unwrap();
        assert!(matches!(
            svc.release_default(Purpose::Internet, "x").unwrap_err(),
            ServiceError::Route(RouteError::NotProvisioned { .. })
        ));
        assert!(svc.set_default_data_slot(Some(2)).is_err());
    }

    #[test]
    fn transient_failure_advances_to_fallback() {
        let svc = service();
        svc.set_enabled(0, Purpose::Internet, true).unwrap();
        let first = svc.request_connection(0, Purpose::Internet, "boot").unwrap();
        let outcome = svc
            .on_attempt_result(0, Purpose::Internet, first.id(), AttemptResult::TransientFailure)
            .unwrap();
        let AttemptOutcome::Retry(next) = outcome else {
            panic!("expected retry, got {outcome:?}");
        };
        assert_eq!(next.id(), "fallback");

        let outcome = svc
            .on_attempt_result(
                0,
                Purpose::Internet,
                "fallback",
                AttemptResult::Success(ConnectionHandle(7)),
            )
            .unwrap();
        assert!(matches!(outcome, AttemptOutcome::Connected));
        assert!(svc.catalog().get("fallback").unwrap().is_in_use());
    }

    #[test]
    fn reset_revives_failed_purpose() {
        let svc = service();
        svc.set_enabled(0, Purpose::Supl, true).unwrap();
        let c = svc.request_connection(0, Purpose::Supl, "gps").unwrap();
        let outcome = svc
            .on_attempt_result(0, Purpose::Supl, c.id(), AttemptResult::PermanentFailure)
            .unwrap();
        assert!(matches!(outcome, AttemptOutcome::Failed));
        assert_eq!(svc.state(0, Purpose::Supl).unwrap(), ContextState::Failed);
        assert!(svc.context(0, Purpose::Supl).unwrap().candidates().is_empty());

        assert_eq!(svc.reset_candidates(0, Purpose::Supl).unwrap(), 1);
        assert!(svc.request_connection(0, Purpose::Supl, "gps").is_ok());
    }

    #[test]
    fn reload_keeps_bound_candidate() {
        let svc = service();
        svc.set_enabled(0, Purpose::Internet, true).unwrap();
        let c = svc.request_connection(0, Purpose::Internet, "boot").unwrap();
        svc.on_attempt_result(0, Purpose::Internet, c.id(), AttemptResult::Success(ConnectionHandle(1)))
            .unwrap();

        let summary = svc.reload_candidates(vec![CandidateSpec::new(
            "310260",
            "new.apn",
            &[Purpose::Internet],
        )]);
        assert_eq!(summary.retained_in_use, vec!["primary".to_string()]);
        assert_eq!(svc.state(0, Purpose::Internet).unwrap(), ContextState::Connected);
    }

    fn replacement() -> CandidateSpec {
        let mut spec = CandidateSpec::new("310260", "new.apn", &[Purpose::Internet]);
        spec.id = Some("new".into());
        spec
    }

    #[test]
    fn released_context_dials_reloaded_candidate() {
        let svc = service();
        svc.set_enabled(0, Purpose::Internet, true).unwrap();
        let c = svc.request_connection(0, Purpose::Internet, "boot").unwrap();
        svc.on_attempt_result(0, Purpose::Internet, c.id(), AttemptResult::Success(ConnectionHandle(1)))
            .unwrap();

        svc.reload_candidates(vec![replacement()]);
        let ctx = svc.context(0, Purpose::Internet).unwrap();
        assert!(ctx.is_stale());
        assert_eq!(svc.catalog().retained(), vec!["primary".to_string()]);

        assert_eq!(
            svc.release_connection(0, Purpose::Internet, "userRequest").unwrap(),
            ContextState::Disconnecting
        );
        svc.on_disconnected(0, Purpose::Internet, None).unwrap();
        assert!(!ctx.is_stale());
        assert!(svc.catalog().get("primary").is_none());

        let next = svc.request_connection(0, Purpose::Internet, "userRequest").unwrap();
        assert_eq!(next.id(), "new");
    }

    #[test]
    fn reload_during_attempt_leaves_attempt_resolvable() {
        let svc = service();
        svc.set_enabled(0, Purpose::Internet, true).unwrap();
        let c = svc.request_connection(0, Purpose::Internet, "boot").unwrap();
        svc.reload_candidates(vec![replacement()]);

        // The pass in flight finishes on the list it started with
        let outcome = svc
            .on_attempt_result(0, Purpose::Internet, c.id(), AttemptResult::TransientFailure)
            .unwrap();
        let AttemptOutcome::Retry(next) = outcome else {
            panic!("expected retry, got {outcome:?}");
        };
        assert_eq!(next.id(), "fallback");
        let outcome = svc
            .on_attempt_result(0, Purpose::Internet, "fallback", AttemptResult::TransientFailure)
            .unwrap();
        assert_eq!(outcome, AttemptOutcome::Scanning);

        let ctx = svc.context(0, Purpose::Internet).unwrap();
        let ids: Vec<_> = ctx.candidates().iter().map(|c| c.id().to_string()).collect();
        assert_eq!(ids, vec!["new"]);
        assert_eq!(ctx.permanent_failure_countdown(), 1);
        let next = svc.request_connection(0, Purpose::Internet, "retry").unwrap();
        assert_eq!(next.id(), "new");
    }
}
