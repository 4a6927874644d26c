//! Connectivity policy loop.
//!
//! Keeps the wanted purposes up on the default data slot: requests them,
//! forwards dial and hang-up commands to the radio, feeds radio reports
//! back into the service, and backs off before a fresh pass when a
//! candidate list runs dry.

use std::sync::Arc;
use std::time::{Duration, Instant};

use celld_common::models::{AppType, ContextState, SubscriptionRoster, TechFlavor};
use celld_common::protocol::{DataEvent, Envelope, StateChangedPayload};
use celld_core::backend::AllDisconnected;
use celld_core::context::AttemptOutcome;
use celld_core::service::DataService;
use celld_core::{Purpose, ServiceError};
use crossbeam_channel::{Receiver, Sender, select, unbounded};
use rand::RngExt as _;
use rand::rngs::StdRng;

use crate::radio::{RadioCommand, RadioReport};

pub const RETRY_DELAY: Duration = Duration::from_secs(2);
const SHUTDOWN_GRACE: Duration = Duration::from_secs(3);

pub struct Policy {
    service: Arc<DataService>,
    events: Receiver<DataEvent>,
    reports: Receiver<RadioReport>,
    radios: Vec<Sender<RadioCommand>>,
    wanted: Vec<Purpose>,
    pending: Vec<(Instant, usize, Purpose)>,
    /// Chance per second of a simulated SIM swap on the default slot.
    swap_rate: f64,
    rng: StdRng,
    last_swap_roll: Instant,
}

impl Policy {
    pub fn new(
        service: Arc<DataService>,
        reports: Receiver<RadioReport>,
        radios: Vec<Sender<RadioCommand>>,
        wanted: Vec<Purpose>,
        swap_rate: f64,
        rng: StdRng,
    ) -> Self {
        let events = service.subscribe();
        Self {
            service,
            events,
            reports,
            radios,
            wanted,
            pending: Vec::new(),
            swap_rate,
            rng,
            last_swap_roll: Instant::now(),
        }
    }

    /// Enable the wanted purposes on the default slot and queue requests.
    pub fn start(&mut self) -> Result<(), ServiceError> {
        let Some(slot) = self.service.default_data_slot() else {
            tracing::warn!("no default data slot; nothing to bring up");
            return Ok(());
        };
        for purpose in self.wanted.clone() {
            self.service.set_enabled(slot, purpose, true)?;
            self.schedule(slot, purpose, Duration::ZERO);
        }
        Ok(())
    }

    /// Run one iteration, waiting up to `timeout` for input.
    pub fn step(&mut self, timeout: Duration) {
        select! {
            recv(self.events) -> ev => if let Ok(ev) = ev { self.on_event(ev) },
            recv(self.reports) -> r => if let Ok(r) = r { self.on_report(r) },
            default(timeout) => {}
        }
        self.run_due();
        self.maybe_swap_card();
    }

    fn schedule(&mut self, slot: usize, purpose: Purpose, delay: Duration) {
        if !self
            .pending
            .iter()
            .any(|&(_, s, p)| s == slot && p == purpose)
        {
            self.pending.push((Instant::now() + delay, slot, purpose));
        }
    }

    fn run_due(&mut self) {
        let now = Instant::now();
        let (due, later): (Vec<_>, Vec<_>) =
            self.pending.drain(..).partition(|&(at, _, _)| at <= now);
        self.pending = later;
        for (_, slot, purpose) in due {
            self.request(slot, purpose);
        }
    }

    fn request(&mut self, slot: usize, purpose: Purpose) {
        match self.service.request_connection(slot, purpose, "policy") {
            Ok(candidate) => self.dial(slot, purpose, candidate.id()),
            Err(e) => tracing::debug!(slot, %purpose, error = %e, "request refused"),
        }
    }

    fn dial(&self, slot: usize, purpose: Purpose, candidate: &str) {
        self.command(
            slot,
            RadioCommand::Dial {
                purpose,
                candidate: candidate.to_string(),
            },
        );
    }

    fn command(&self, slot: usize, cmd: RadioCommand) {
        if let Some(tx) = self.radios.get(slot) {
            if tx.send(cmd).is_err() {
                tracing::warn!(slot, "radio gone");
            }
        }
    }

    fn on_event(&mut self, event: DataEvent) {
        match Envelope::new(event.clone()).to_json() {
            Ok(json) => tracing::debug!(target: "celld::events", "{json}"),
            Err(e) => tracing::warn!(error = %e, "event not serializable"),
        }
        match event {
            DataEvent::StateChanged(StateChangedPayload {
                slot,
                purpose,
                new: ContextState::Disconnecting,
                ..
            }) => self.command(slot, RadioCommand::Hangup { purpose }),
            DataEvent::TechnologyChanged(p) => {
                tracing::info!(slot = p.slot, old = %p.old, new = %p.new, "re-attaching after technology change");
                self.command(p.slot, RadioCommand::Reset);
                if self.service.default_data_slot() == Some(p.slot) {
                    for purpose in self.wanted.clone() {
                        self.schedule(p.slot, purpose, Duration::ZERO);
                    }
                }
            }
            _ => {}
        }
    }

    fn on_report(&mut self, report: RadioReport) {
        match report {
            RadioReport::Attempt {
                slot,
                purpose,
                candidate,
                result,
            } => match self
                .service
                .on_attempt_result(slot, purpose, &candidate, result)
            {
                Ok(AttemptOutcome::Retry(next)) => self.dial(slot, purpose, next.id()),
                Ok(AttemptOutcome::Scanning) => self.schedule(slot, purpose, RETRY_DELAY),
                Ok(AttemptOutcome::Connected) => {}
                Ok(AttemptOutcome::Failed) => {
                    tracing::warn!(slot, %purpose, "purpose failed; waiting for new candidates")
                }
                Err(e) => tracing::debug!(slot, %purpose, error = %e, "attempt result ignored"),
            },
            RadioReport::Disconnected {
                slot,
                purpose,
                reason,
            } => {
                if let Err(e) = self.service.on_disconnected(slot, purpose, Some(reason)) {
                    tracing::debug!(slot, %purpose, error = %e, "disconnect ignored");
                    return;
                }
                if reason == "lostConnection" && self.wanted.contains(&purpose) {
                    self.schedule(slot, purpose, RETRY_DELAY);
                }
            }
        }
    }

    /// Flip the default slot's card between a GSM and a CDMA application.
    fn maybe_swap_card(&mut self) {
        if self.swap_rate <= 0.0 || self.last_swap_roll.elapsed() < Duration::from_secs(1) {
            return;
        }
        self.last_swap_roll = Instant::now();
        if !self.rng.random_bool(self.swap_rate.min(1.0)) {
            return;
        }
        let Some(slot) = self.service.default_data_slot() else {
            return;
        };
        let current = self.service.router().roster();
        let Some(identity) = current.get(slot) else {
            return;
        };
        let mut next = identity.clone();
        next.app_type = match identity.app_type.flavor() {
            Some(TechFlavor::Gsm) => AppType::Csim,
            _ => AppType::Usim,
        };
        (next.gsm_app_index, next.cdma_app_index) = match next.app_type.flavor() {
            Some(TechFlavor::Gsm) => (Some(0), None),
            _ => (None, Some(0)),
        };
        let mut roster = SubscriptionRoster::new(current.len());
        if let Err(e) = roster.copy_from(&current) {
            tracing::warn!(error = %e, "roster snapshot unusable");
            return;
        }
        let roster = match roster.with_slot(slot, next) {
            Ok(r) => r,
            Err(e) => {
                tracing::warn!(error = %e, "roster update rejected");
                return;
            }
        };
        tracing::info!(slot, "simulating card refresh");
        if let Err(e) = self.service.on_roster_refresh(&roster) {
            tracing::warn!(error = %e, "roster refresh failed");
        }
    }

    /// Turn data off on every provisioned slot and wait for the radio to
    /// confirm every context is down.
    pub fn shutdown(&mut self) {
        let (done_tx, done_rx) = unbounded::<AllDisconnected>();
        let mut expected = 0;
        for backend in self.service.router().backends() {
            let slot = backend.data().slot();
            match self.service.disable_data(slot, "shutdown", Some(done_tx.clone())) {
                Ok(()) => expected += 1,
                Err(e) => tracing::warn!(slot, error = %e, "disable failed"),
            }
        }
        drop(done_tx);

        let deadline = Instant::now() + SHUTDOWN_GRACE;
        let mut done = 0;
        while done < expected && Instant::now() < deadline {
            done += done_rx.try_iter().count();
            // Only hang-ups and their reports matter now.
            self.pending.clear();
            select! {
                recv(self.events) -> ev => if let Ok(ev) = ev { self.on_event(ev) },
                recv(self.reports) -> r => if let Ok(r) = r { self.on_report(r) },
                default(Duration::from_millis(50)) => {}
            }
        }
        done += done_rx.try_iter().count();
        if done < expected {
            tracing::warn!(done, expected, "shutdown grace elapsed with contexts still up");
        } else {
            tracing::info!(slots = expected, "all slots disconnected");
        }
    }
}
