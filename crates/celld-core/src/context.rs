//! # Connection Context
//!
//! State machine for one (slot, purpose) pair.
//!
//! ```text
//! Idle ──request──▶ Connecting ──success──▶ Connected ──release──▶ Disconnecting
//!  ▲                  │    ▲ transient/permanent,                      │
//!  │                  │    └── next candidate                          │
//!  │                  ├── list exhausted ──▶ Scanning                  │
//!  │                  └── countdown at zero ──▶ Failed                 │
//!  └───────────────────────────── disconnected ◀───────────────────────┘
//! ```
//!
//! All mutable fields sit behind one mutex so a radio callback never reads
//! a half-applied update from an API caller. The purpose and its priority
//! are fixed at construction and read without locking.
//!
//! The candidate list is consumed from the front. `next_candidate` peeks;
//! only `remove_next_candidate` pops. The permanent-failure countdown is
//! set to the list length whenever a list is assigned and otherwise only
//! ever decremented, saturating at zero.
//!
//! A context whose list is held by an attempt or a connection is never
//! reseeded in place. It is marked stale instead, and the next reseed
//! once it comes to rest replaces the list.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use celld_common::models::{ContextState, Purpose};
use serde::Serialize;

use crate::candidate::ProfileCandidate;
use crate::error::ContextError;
use crate::util::lock;

/// Opaque handle the radio layer assigns to an established connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct ConnectionHandle(pub u64);

/// Result of one candidate attempt, reported by the radio layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttemptResult {
    Success(ConnectionHandle),
    /// May succeed on retry or on another candidate.
    TransientFailure,
    /// Retrying this candidate will not help.
    PermanentFailure,
}

/// What the caller should do after an attempt result was applied.
#[derive(Debug, Clone, PartialEq)]
pub enum AttemptOutcome {
    Connected,
    /// Try this candidate next.
    Retry(Arc<ProfileCandidate>),
    /// This pass ran out of candidates; a retry driver may start another.
    Scanning,
    /// Every candidate failed permanently.
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transition {
    pub old: ContextState,
    pub new: ContextState,
}

impl Transition {
    pub fn changed(&self) -> bool {
        self.old != self.new
    }
}

/// Point-in-time view of a context, for status reporting.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ContextSnapshot {
    pub slot: usize,
    pub purpose: Purpose,
    pub priority: u8,
    pub state: ContextState,
    pub reason: Option<String>,
    pub candidates: Vec<String>,
    pub permanent_failure_countdown: usize,
    pub bound: Option<String>,
    pub enabled: bool,
    pub dependency_met: bool,
    pub partial_retry: bool,
    pub stale: bool,
}

struct Inner {
    state: ContextState,
    reason: Option<String>,
    candidates: VecDeque<Arc<ProfileCandidate>>,
    countdown: usize,
    bound: Option<Arc<ProfileCandidate>>,
    connection: Option<ConnectionHandle>,
    enabled: bool,
    dependency_met: bool,
    partial_retry: bool,
    stale: bool,
}

impl Inner {
    fn is_ready(&self) -> bool {
        self.enabled
            && self.dependency_met
            && !self
                .bound
                .as_ref()
                .is_some_and(|c| c.is_tethered_call_active())
    }

    fn is_connectable(&self) -> bool {
        self.is_ready()
            && matches!(
                self.state,
                ContextState::Idle | ContextState::Failed | ContextState::Scanning
            )
    }

    fn bind(&mut self, candidate: Option<Arc<ProfileCandidate>>) {
        if let Some(old) = self.bound.take() {
            old.set_in_use(false);
        }
        if let Some(new) = &candidate {
            new.set_in_use(true);
        }
        self.bound = candidate;
    }

    fn enter(&mut self, new: ContextState) -> Transition {
        let old = self.state;
        self.state = new;
        match new {
            ContextState::Failed => {
                self.candidates.clear();
                self.bind(None);
                self.connection = None;
            }
            ContextState::Idle | ContextState::Scanning => {
                self.bind(None);
                self.connection = None;
            }
            _ => {}
        }
        Transition { old, new }
    }

    fn assign(&mut self, candidates: Vec<Arc<ProfileCandidate>>) {
        self.countdown = candidates.len();
        self.candidates = candidates.into();
        self.stale = false;
    }

    fn head_matches(&self, candidate_id: &str) -> bool {
        self.state == ContextState::Connecting
            && self
                .candidates
                .front()
                .is_some_and(|c| c.id() == candidate_id)
    }

    /// Bind the new head and stay in `Connecting`, or leave the pass.
    fn advance(&mut self) -> (Transition, AttemptOutcome) {
        match self.candidates.front().cloned() {
            Some(next) => {
                self.bind(Some(next.clone()));
                let t = Transition {
                    old: self.state,
                    new: self.state,
                };
                (t, AttemptOutcome::Retry(next))
            }
            None => (self.enter(ContextState::Scanning), AttemptOutcome::Scanning),
        }
    }
}

pub struct ConnectionContext {
    slot: usize,
    purpose: Purpose,
    priority: u8,
    inner: Mutex<Inner>,
}

impl ConnectionContext {
    pub fn new(slot: usize, purpose: Purpose) -> Self {
        Self {
            slot,
            purpose,
            priority: purpose.priority(),
            inner: Mutex::new(Inner {
                state: ContextState::Idle,
                reason: None,
                candidates: VecDeque::new(),
                countdown: 0,
                bound: None,
                connection: None,
                enabled: false,
                dependency_met: true,
                partial_retry: false,
                stale: false,
            }),
        }
    }

    pub fn slot(&self) -> usize {
        self.slot
    }

    pub fn purpose(&self) -> Purpose {
        self.purpose
    }

    pub fn priority(&self) -> u8 {
        self.priority
    }

    // ─── State ──────────────────────────────────────────────────────────

    pub fn state(&self) -> ContextState {
        lock(&self.inner).state
    }

    /// Force a state. Entering `Failed` abandons the remaining candidates.
    pub fn set_state(&self, new: ContextState, reason: Option<&str>) -> Transition {
        let mut inner = lock(&self.inner);
        if let Some(r) = reason {
            inner.reason = Some(r.to_string());
        }
        inner.enter(new)
    }

    pub fn reason(&self) -> Option<String> {
        lock(&self.inner).reason.clone()
    }

    pub fn set_reason(&self, reason: &str) {
        lock(&self.inner).reason = Some(reason.to_string());
    }

    // ─── Candidates ─────────────────────────────────────────────────────

    /// Replace the candidate list and reset the countdown to its length.
    ///
    /// Rejects the list, leaving the previous one in place, if any entry
    /// cannot carry this purpose or appears twice.
    pub fn set_candidate_list(
        &self,
        candidates: Vec<Arc<ProfileCandidate>>,
    ) -> Result<(), ContextError> {
        self.validate(&candidates)?;
        let mut inner = lock(&self.inner);
        inner.assign(candidates);
        Ok(())
    }

    /// Replace the list only if `accept` admits the current state, checked
    /// under the same lock as the assignment. A refused list marks the
    /// context stale. Returns whether the list was applied.
    pub fn replace_candidates_if(
        &self,
        accept: impl FnOnce(ContextState) -> bool,
        candidates: Vec<Arc<ProfileCandidate>>,
    ) -> Result<bool, ContextError> {
        self.validate(&candidates)?;
        let mut inner = lock(&self.inner);
        if !accept(inner.state) {
            inner.stale = true;
            return Ok(false);
        }
        inner.assign(candidates);
        Ok(true)
    }

    /// A reseed was deferred, or nothing is left to try.
    pub fn needs_reseed(&self) -> bool {
        let inner = lock(&self.inner);
        inner.stale || inner.candidates.is_empty()
    }

    pub fn is_stale(&self) -> bool {
        lock(&self.inner).stale
    }

    fn validate(&self, candidates: &[Arc<ProfileCandidate>]) -> Result<(), ContextError> {
        for (i, c) in candidates.iter().enumerate() {
            if !c.can_handle(self.purpose) {
                return Err(ContextError::UnsupportedPurpose {
                    slot: self.slot,
                    purpose: self.purpose,
                    candidate: c.id().to_string(),
                });
            }
            if candidates[..i].iter().any(|p| p.as_ref() == c.as_ref()) {
                return Err(ContextError::DuplicateCandidate {
                    slot: self.slot,
                    purpose: self.purpose,
                    candidate: c.id().to_string(),
                });
            }
        }
        Ok(())
    }

    pub fn candidates(&self) -> Vec<Arc<ProfileCandidate>> {
        lock(&self.inner).candidates.iter().cloned().collect()
    }

    /// Head of the remaining list, without removing it.
    pub fn next_candidate(&self) -> Option<Arc<ProfileCandidate>> {
        lock(&self.inner).candidates.front().cloned()
    }

    /// Pop the head once its failure is confirmed.
    pub fn remove_next_candidate(&self) -> Option<Arc<ProfileCandidate>> {
        lock(&self.inner).candidates.pop_front()
    }

    pub fn permanent_failure_countdown(&self) -> usize {
        lock(&self.inner).countdown
    }

    /// Count one candidate as permanently failed. Returns the new count.
    pub fn decrement_permanent_failure_count(&self) -> usize {
        let mut inner = lock(&self.inner);
        inner.countdown = inner.countdown.saturating_sub(1);
        inner.countdown
    }

    pub fn bound_candidate(&self) -> Option<Arc<ProfileCandidate>> {
        lock(&self.inner).bound.clone()
    }

    pub fn set_bound_candidate(&self, candidate: Option<Arc<ProfileCandidate>>) {
        lock(&self.inner).bind(candidate);
    }

    pub fn connection(&self) -> Option<ConnectionHandle> {
        lock(&self.inner).connection
    }

    pub fn set_connection(&self, handle: Option<ConnectionHandle>) {
        lock(&self.inner).connection = handle;
    }

    // ─── Readiness ──────────────────────────────────────────────────────

    pub fn is_enabled(&self) -> bool {
        lock(&self.inner).enabled
    }

    pub fn set_enabled(&self, enabled: bool) {
        lock(&self.inner).enabled = enabled;
    }

    pub fn is_dependency_met(&self) -> bool {
        lock(&self.inner).dependency_met
    }

    pub fn set_dependency_met(&self, met: bool) {
        lock(&self.inner).dependency_met = met;
    }

    /// Enabled, dependency met, and no tethered call on the bound candidate.
    pub fn is_ready(&self) -> bool {
        lock(&self.inner).is_ready()
    }

    /// Ready, and in a state from which a new attempt may start.
    pub fn is_connectable(&self) -> bool {
        lock(&self.inner).is_connectable()
    }

    pub fn is_connected_or_connecting(&self) -> bool {
        matches!(
            self.state(),
            ContextState::Connected | ContextState::Connecting
        )
    }

    pub fn is_disconnected(&self) -> bool {
        self.state().is_disconnected()
    }

    pub fn is_in_partial_retry(&self) -> bool {
        lock(&self.inner).partial_retry
    }

    pub fn set_in_partial_retry(&self, partial: bool) {
        lock(&self.inner).partial_retry = partial;
    }

    // ─── Priority ───────────────────────────────────────────────────────

    pub fn is_higher_priority(&self, other: &ConnectionContext) -> bool {
        self.priority > other.priority
    }

    pub fn is_lower_priority(&self, other: &ConnectionContext) -> bool {
        self.priority < other.priority
    }

    pub fn is_equal_priority(&self, other: &ConnectionContext) -> bool {
        self.priority == other.priority
    }

    // ─── Attempt bookkeeping ────────────────────────────────────────────

    /// Start an attempt on the head candidate.
    pub fn begin_attempt(
        &self,
        reason: &str,
    ) -> Result<(Transition, Arc<ProfileCandidate>), ContextError> {
        let mut inner = lock(&self.inner);
        if !matches!(
            inner.state,
            ContextState::Idle | ContextState::Failed | ContextState::Scanning
        ) {
            return Err(ContextError::InvalidTransition {
                slot: self.slot,
                purpose: self.purpose,
                from: inner.state,
                to: ContextState::Connecting,
            });
        }
        if !inner.is_ready() {
            return Err(ContextError::NotReady {
                slot: self.slot,
                purpose: self.purpose,
            });
        }
        let head = inner
            .candidates
            .front()
            .cloned()
            .ok_or(ContextError::NoCandidates {
                slot: self.slot,
                purpose: self.purpose,
            })?;

        inner.reason = Some(reason.to_string());
        let t = inner.enter(ContextState::Connecting);
        inner.bind(Some(head.clone()));
        Ok((t, head))
    }

    /// Apply the radio layer's verdict on the pending attempt.
    ///
    /// A transient failure pops the candidate and leaves the countdown
    /// alone. A permanent failure decrements the countdown first; at zero
    /// the whole purpose fails, otherwise the candidate is popped.
    ///
    /// Unlike the `decrement_permanent_failure_count` and
    /// `remove_next_candidate` primitives, this pops automatically: the
    /// decrement and the pop run together under one lock acquisition.
    pub fn complete_attempt(
        &self,
        candidate_id: &str,
        result: AttemptResult,
    ) -> Result<(Transition, AttemptOutcome), ContextError> {
        let mut inner = lock(&self.inner);
        if !inner.head_matches(candidate_id) {
            return Err(ContextError::StaleAttempt {
                slot: self.slot,
                purpose: self.purpose,
                candidate: candidate_id.to_string(),
            });
        }

        match result {
            AttemptResult::Success(handle) => {
                inner.connection = Some(handle);
                Ok((inner.enter(ContextState::Connected), AttemptOutcome::Connected))
            }
            AttemptResult::TransientFailure => {
                inner.candidates.pop_front();
                Ok(inner.advance())
            }
            AttemptResult::PermanentFailure => {
                inner.countdown = inner.countdown.saturating_sub(1);
                if inner.countdown == 0 {
                    inner.reason = Some("permanentFailure".into());
                    return Ok((inner.enter(ContextState::Failed), AttemptOutcome::Failed));
                }
                inner.candidates.pop_front();
                Ok(inner.advance())
            }
        }
    }

    /// Begin tearing the connection down.
    ///
    /// A connected context waits in `Disconnecting` for the radio layer; an
    /// attempt still in progress is abandoned straight to `Idle`.
    pub fn begin_release(&self, reason: &str) -> Transition {
        let mut inner = lock(&self.inner);
        inner.reason = Some(reason.to_string());
        match inner.state {
            ContextState::Connected => inner.enter(ContextState::Disconnecting),
            ContextState::Connecting | ContextState::Scanning => inner.enter(ContextState::Idle),
            s => Transition { old: s, new: s },
        }
    }

    /// The radio layer reports the connection gone.
    pub fn complete_release(&self, reason: Option<&str>) -> Transition {
        let mut inner = lock(&self.inner);
        if let Some(r) = reason {
            inner.reason = Some(r.to_string());
        }
        match inner.state {
            ContextState::Idle | ContextState::Failed => Transition {
                old: inner.state,
                new: inner.state,
            },
            _ => inner.enter(ContextState::Idle),
        }
    }

    pub fn snapshot(&self) -> ContextSnapshot {
        let inner = lock(&self.inner);
        ContextSnapshot {
            slot: self.slot,
            purpose: self.purpose,
            priority: self.priority,
            state: inner.state,
            reason: inner.reason.clone(),
            candidates: inner.candidates.iter().map(|c| c.id().to_string()).collect(),
            permanent_failure_countdown: inner.countdown,
            bound: inner.bound.as_ref().map(|c| c.id().to_string()),
            enabled: inner.enabled,
            dependency_met: inner.dependency_met,
            partial_retry: inner.partial_retry,
            stale: inner.stale,
        }
    }
}

impl std::fmt::Debug for ConnectionContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        std::fmt::Debug::fmt(&self.snapshot(), f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::candidate::CandidateSpec;

    fn candidate(id: &str, purposes: &[Purpose]) -> Arc<ProfileCandidate> {
        let mut spec = CandidateSpec::new("310260", id, purposes);
        spec.id = Some(id.into());
        Arc::new(ProfileCandidate::new(spec))
    }

    fn abc() -> Vec<Arc<ProfileCandidate>> {
        ["a", "b", "c"]
            .iter()
            .map(|id| candidate(id, &[Purpose::Internet]))
            .collect()
    }

    fn ready(purpose: Purpose) -> ConnectionContext {
        let ctx = ConnectionContext::new(0, purpose);
        ctx.set_enabled(true);
        ctx
    }

    fn ids(ctx: &ConnectionContext) -> Vec<String> {
        ctx.candidates().iter().map(|c| c.id().to_string()).collect()
    }

    // ─── Construction ───────────────────────────────────────────────────

    #[test]
    fn starts_idle_with_fixed_priority() {
        let ctx = ConnectionContext::new(1, Purpose::Mms);
        assert_eq!(ctx.state(), ContextState::Idle);
        assert_eq!(ctx.priority(), Purpose::Mms.priority());
        assert!(ctx.is_disconnected());
        assert_eq!(ctx.permanent_failure_countdown(), 0);
    }

    // ─── Candidate list ─────────────────────────────────────────────────

    #[test]
    fn set_list_resets_countdown() {
        let ctx = ready(Purpose::Internet);
        ctx.set_candidate_list(abc()).unwrap();
        assert_eq!(ctx.permanent_failure_countdown(), 3);
        ctx.decrement_permanent_failure_count();
        ctx.set_candidate_list(abc()[..2].to_vec()).unwrap();
        assert_eq!(ctx.permanent_failure_countdown(), 2);
    }

    #[test]
    fn peek_does_not_pop() {
        let ctx = ready(Purpose::Internet);
        ctx.set_candidate_list(abc()).unwrap();
        assert_eq!(ctx.next_candidate().unwrap().id(), "a");
        assert_eq!(ctx.next_candidate().unwrap().id(), "a");
        assert_eq!(ctx.remove_next_candidate().unwrap().id(), "a");
        assert_eq!(ctx.next_candidate().unwrap().id(), "b");
    }

    #[test]
    fn rejects_candidate_for_other_purpose() {
        let ctx = ready(Purpose::Mms);
        ctx.set_candidate_list(vec![candidate("m", &[Purpose::Mms])])
            .unwrap();
        let err = ctx
            .set_candidate_list(vec![candidate("i", &[Purpose::Internet])])
            .unwrap_err();
        assert!(matches!(err, ContextError::UnsupportedPurpose { .. }));
        assert_eq!(ids(&ctx), vec!["m"]);
        assert_eq!(ctx.permanent_failure_countdown(), 1);
    }

    #[test]
    fn rejects_duplicate_candidates() {
        let ctx = ready(Purpose::Internet);
        let a = candidate("a", &[Purpose::Internet]);
        let err = ctx.set_candidate_list(vec![a.clone(), a]).unwrap_err();
        assert!(matches!(err, ContextError::DuplicateCandidate { .. }));
        assert!(ctx.candidates().is_empty());
    }

    #[test]
    fn countdown_saturates_at_zero() {
        let ctx = ready(Purpose::Internet);
        ctx.set_candidate_list(abc()[..1].to_vec()).unwrap();
        assert_eq!(ctx.decrement_permanent_failure_count(), 0);
        assert_eq!(ctx.decrement_permanent_failure_count(), 0);
        assert_eq!(ctx.permanent_failure_countdown(), 0);
    }

    #[test]
    fn entering_failed_clears_list() {
        let ctx = ready(Purpose::Internet);
        ctx.set_candidate_list(abc()).unwrap();
        let t = ctx.set_state(ContextState::Failed, Some("gaveUp"));
        assert_eq!(t.old, ContextState::Idle);
        assert!(ctx.candidates().is_empty());
        assert_eq!(ctx.reason().as_deref(), Some("gaveUp"));
    }

    #[test]
    fn mixed_failure_walkthrough() {
        let ctx = ready(Purpose::Internet);
        ctx.set_candidate_list(abc()).unwrap();

        // A fails transiently
        ctx.remove_next_candidate();
        assert_eq!(ctx.permanent_failure_countdown(), 3);
        assert_eq!(ids(&ctx), vec!["b", "c"]);

        // B fails permanently
        assert_eq!(ctx.decrement_permanent_failure_count(), 2);
        ctx.remove_next_candidate();
        assert_eq!(ids(&ctx), vec!["c"]);

        ctx.decrement_permanent_failure_count();
        if ctx.decrement_permanent_failure_count() == 0 {
            ctx.set_state(ContextState::Failed, None);
        }
        assert_eq!(ctx.state(), ContextState::Failed);
        assert!(ctx.candidates().is_empty());
    }

    #[test]
    fn conditional_replace_defers_while_attempt_runs() {
        let ctx = ready(Purpose::Internet);
        ctx.set_candidate_list(abc()[..1].to_vec()).unwrap();
        ctx.begin_attempt("test").unwrap();

        let at_rest = |s: ContextState| {
            matches!(s, ContextState::Idle | ContextState::Failed | ContextState::Scanning)
        };
        let fresh = vec![candidate("z", &[Purpose::Internet])];
        assert!(!ctx.replace_candidates_if(at_rest, fresh.clone()).unwrap());
        assert!(ctx.is_stale());
        assert_eq!(ids(&ctx), vec!["a"]);

        // The running attempt still resolves against its own head
        let (_, outcome) = ctx
            .complete_attempt("a", AttemptResult::Success(ConnectionHandle(1)))
            .unwrap();
        assert_eq!(outcome, AttemptOutcome::Connected);

        ctx.begin_release("done");
        ctx.complete_release(None);
        assert!(ctx.needs_reseed());
        assert!(ctx.replace_candidates_if(at_rest, fresh).unwrap());
        assert!(!ctx.is_stale());
        assert_eq!(ids(&ctx), vec!["z"]);
        assert_eq!(ctx.permanent_failure_countdown(), 1);
    }

    #[test]
    fn needs_reseed_when_list_empty() {
        let ctx = ready(Purpose::Internet);
        assert!(ctx.needs_reseed());
        ctx.set_candidate_list(abc()).unwrap();
        assert!(!ctx.needs_reseed());
    }

    // ─── Readiness ──────────────────────────────────────────────────────

    #[test]
    fn readiness_requires_all_conditions() {
        let ctx = ConnectionContext::new(0, Purpose::Internet);
        assert!(!ctx.is_ready());
        ctx.set_enabled(true);
        assert!(ctx.is_ready());
        ctx.set_dependency_met(false);
        assert!(!ctx.is_ready());
        ctx.set_dependency_met(true);

        let a = candidate("a", &[Purpose::Internet]);
        ctx.set_bound_candidate(Some(a.clone()));
        a.set_tethered_call_active(true);
        assert!(!ctx.is_ready());
        a.set_tethered_call_active(false);
        assert!(ctx.is_ready());
    }

    #[test]
    fn binding_tracks_in_use() {
        let ctx = ready(Purpose::Internet);
        let a = candidate("a", &[Purpose::Internet]);
        let b = candidate("b", &[Purpose::Internet]);
        ctx.set_bound_candidate(Some(a.clone()));
        assert!(a.is_in_use());
        ctx.set_bound_candidate(Some(b.clone()));
        assert!(!a.is_in_use());
        assert!(b.is_in_use());
        ctx.set_state(ContextState::Idle, None);
        assert!(!b.is_in_use());
        assert!(ctx.bound_candidate().is_none());
    }

    #[test]
    fn partial_retry_flag_is_informational() {
        let ctx = ready(Purpose::Internet);
        ctx.set_in_partial_retry(true);
        assert!(ctx.is_in_partial_retry());
        assert_eq!(ctx.state(), ContextState::Idle);
        ctx.set_in_partial_retry(false);
        assert!(!ctx.is_in_partial_retry());
    }

    // ─── Priority ───────────────────────────────────────────────────────

    #[test]
    fn priority_comparisons() {
        let internet = ConnectionContext::new(0, Purpose::Internet);
        let mms = ConnectionContext::new(0, Purpose::Mms);
        let supl = ConnectionContext::new(1, Purpose::Supl);
        assert!(mms.is_higher_priority(&internet));
        assert!(internet.is_lower_priority(&mms));
        assert!(mms.is_equal_priority(&supl));
        assert!(!mms.is_higher_priority(&supl));
        assert!(!mms.is_lower_priority(&supl));
    }

    // ─── Attempts ───────────────────────────────────────────────────────

    #[test]
    fn attempt_requires_readiness() {
        let ctx = ConnectionContext::new(0, Purpose::Internet);
        ctx.set_candidate_list(abc()).unwrap();
        assert!(matches!(
            ctx.begin_attempt("test"),
            Err(ContextError::NotReady { .. })
        ));
        ctx.set_enabled(true);
        let (t, head) = ctx.begin_attempt("test").unwrap();
        assert_eq!(t.new, ContextState::Connecting);
        assert_eq!(head.id(), "a");
        assert!(head.is_in_use());
    }

    #[test]
    fn attempt_without_candidates() {
        let ctx = ready(Purpose::Internet);
        assert!(matches!(
            ctx.begin_attempt("test"),
            Err(ContextError::NoCandidates { .. })
        ));
        assert_eq!(ctx.state(), ContextState::Idle);
    }

    #[test]
    fn attempt_while_connecting_is_rejected() {
        let ctx = ready(Purpose::Internet);
        ctx.set_candidate_list(abc()).unwrap();
        ctx.begin_attempt("test").unwrap();
        assert!(matches!(
            ctx.begin_attempt("again"),
            Err(ContextError::InvalidTransition {
                from: ContextState::Connecting,
                ..
            })
        ));
    }

    #[test]
    fn success_connects() {
        let ctx = ready(Purpose::Internet);
        ctx.set_candidate_list(abc()).unwrap();
        ctx.begin_attempt("test").unwrap();
        let (t, outcome) = ctx
            .complete_attempt("a", AttemptResult::Success(ConnectionHandle(7)))
            .unwrap();
        assert_eq!(t.new, ContextState::Connected);
        assert_eq!(outcome, AttemptOutcome::Connected);
        assert_eq!(ctx.connection(), Some(ConnectionHandle(7)));
        assert!(ctx.is_connected_or_connecting());
    }

    #[test]
    fn stale_result_is_rejected() {
        let ctx = ready(Purpose::Internet);
        ctx.set_candidate_list(abc()).unwrap();
        ctx.begin_attempt("test").unwrap();
        let err = ctx
            .complete_attempt("b", AttemptResult::TransientFailure)
            .unwrap_err();
        assert!(matches!(err, ContextError::StaleAttempt { .. }));
        assert_eq!(ids(&ctx), vec!["a", "b", "c"]);
    }

    #[test]
    fn transient_failures_advance_then_scan() {
        let ctx = ready(Purpose::Internet);
        ctx.set_candidate_list(abc()[..2].to_vec()).unwrap();
        ctx.begin_attempt("test").unwrap();

        let (_, outcome) = ctx
            .complete_attempt("a", AttemptResult::TransientFailure)
            .unwrap();
        assert!(matches!(outcome, AttemptOutcome::Retry(ref c) if c.id() == "b"));
        assert_eq!(ctx.state(), ContextState::Connecting);
        assert_eq!(ctx.permanent_failure_countdown(), 2);

        let (t, outcome) = ctx
            .complete_attempt("b", AttemptResult::TransientFailure)
            .unwrap();
        assert_eq!(outcome, AttemptOutcome::Scanning);
        assert_eq!(t.new, ContextState::Scanning);
        assert_eq!(ctx.permanent_failure_countdown(), 2);
        assert!(ctx.bound_candidate().is_none());
    }

    #[test]
    fn permanent_failures_exhaust_countdown() {
        let ctx = ready(Purpose::Internet);
        let list = abc();
        ctx.set_candidate_list(list[..2].to_vec()).unwrap();
        ctx.begin_attempt("test").unwrap();

        let (_, outcome) = ctx
            .complete_attempt("a", AttemptResult::PermanentFailure)
            .unwrap();
        assert!(matches!(outcome, AttemptOutcome::Retry(_)));
        assert_eq!(ctx.permanent_failure_countdown(), 1);

        let (t, outcome) = ctx
            .complete_attempt("b", AttemptResult::PermanentFailure)
            .unwrap();
        assert_eq!(outcome, AttemptOutcome::Failed);
        assert_eq!(t.new, ContextState::Failed);
        assert!(ctx.candidates().is_empty());
        assert!(!list[1].is_in_use());
    }

    // ─── Release ────────────────────────────────────────────────────────

    #[test]
    fn release_connected_goes_through_disconnecting() {
        let ctx = ready(Purpose::Internet);
        ctx.set_candidate_list(abc()).unwrap();
        ctx.begin_attempt("test").unwrap();
        ctx.complete_attempt("a", AttemptResult::Success(ConnectionHandle(1)))
            .unwrap();

        let t = ctx.begin_release("userRequest");
        assert_eq!(t.new, ContextState::Disconnecting);
        assert!(!ctx.is_disconnected());
        let t = ctx.complete_release(None);
        assert_eq!(t.new, ContextState::Idle);
        assert!(ctx.connection().is_none());
        assert_eq!(ctx.reason().as_deref(), Some("userRequest"));
    }

    #[test]
    fn release_while_connecting_abandons_attempt() {
        let ctx = ready(Purpose::Internet);
        ctx.set_candidate_list(abc()).unwrap();
        let (_, head) = ctx.begin_attempt("test").unwrap();
        let t = ctx.begin_release("cancel");
        assert_eq!(t.new, ContextState::Idle);
        assert!(!head.is_in_use());
    }

    #[test]
    fn release_when_idle_is_noop() {
        let ctx = ready(Purpose::Internet);
        assert!(!ctx.begin_release("x").changed());
        assert!(!ctx.complete_release(None).changed());
    }
}
