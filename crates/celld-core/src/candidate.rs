//! Access-point profile candidates.
//!
//! A [`ProfileCandidate`] is immutable once built, apart from two flags the
//! owning backend flips: "bound to an active connection" and "tethered voice
//! call in progress". Candidates are shared as `Arc<ProfileCandidate>` and
//! compared by their fingerprint (address + credentials + purposes).

use std::collections::BTreeSet;
use std::hash::{DefaultHasher, Hash, Hasher};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use arc_swap::ArcSwap;
use celld_common::ids;
use celld_common::models::{Purpose, TechFlavor};
use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::util::lock;

// ── Attribute enums ─────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthType {
    #[default]
    None,
    Pap,
    Chap,
    PapOrChap,
}

impl std::str::FromStr for AuthType {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "" | "none" => Ok(AuthType::None),
            "pap" => Ok(AuthType::Pap),
            "chap" => Ok(AuthType::Chap),
            "pap_or_chap" | "pap/chap" => Ok(AuthType::PapOrChap),
            other => Err(ConfigError::InvalidValue {
                field: "auth",
                value: other.to_string(),
            }),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IpProtocol {
    #[default]
    Ip,
    Ipv6,
    Ipv4v6,
}

impl std::str::FromStr for IpProtocol {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "" | "ip" | "ipv4" => Ok(IpProtocol::Ip),
            "ipv6" => Ok(IpProtocol::Ipv6),
            "ipv4v6" => Ok(IpProtocol::Ipv4v6),
            other => Err(ConfigError::InvalidValue {
                field: "protocol",
                value: other.to_string(),
            }),
        }
    }
}

/// Radio bearer a candidate is restricted to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RadioBearer {
    Gprs,
    Edge,
    Umts,
    Hspa,
    Lte,
    Nr,
    OneXRtt,
    Evdo,
    Ehrpd,
}

impl RadioBearer {
    /// Whether a backend of `flavor` can carry this bearer. LTE is shared
    /// by both families.
    pub fn supported_by(self, flavor: TechFlavor) -> bool {
        match self {
            RadioBearer::Lte => true,
            RadioBearer::Gprs
            | RadioBearer::Edge
            | RadioBearer::Umts
            | RadioBearer::Hspa
            | RadioBearer::Nr => flavor == TechFlavor::Gsm,
            RadioBearer::OneXRtt | RadioBearer::Evdo | RadioBearer::Ehrpd => {
                flavor == TechFlavor::Cdma
            }
        }
    }
}

impl std::str::FromStr for RadioBearer {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "gprs" => Ok(RadioBearer::Gprs),
            "edge" => Ok(RadioBearer::Edge),
            "umts" => Ok(RadioBearer::Umts),
            "hspa" => Ok(RadioBearer::Hspa),
            "lte" => Ok(RadioBearer::Lte),
            "nr" => Ok(RadioBearer::Nr),
            "1xrtt" => Ok(RadioBearer::OneXRtt),
            "evdo" => Ok(RadioBearer::Evdo),
            "ehrpd" => Ok(RadioBearer::Ehrpd),
            other => Err(ConfigError::InvalidValue {
                field: "bearer",
                value: other.to_string(),
            }),
        }
    }
}

// ── Candidate ───────────────────────────────────────────────────────

/// Plain description of a candidate, as read from configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CandidateSpec {
    pub id: Option<String>,
    /// MCC+MNC of the carrier this profile belongs to.
    pub carrier: String,
    pub apn: String,
    pub user: String,
    pub password: String,
    pub auth: AuthType,
    pub purposes: BTreeSet<Purpose>,
    pub protocol: IpProtocol,
    pub roaming_protocol: IpProtocol,
    pub bearer: Option<RadioBearer>,
}

impl CandidateSpec {
    /// Minimal spec for `apn` carrying `purposes`, with no credentials.
    pub fn new(carrier: &str, apn: &str, purposes: &[Purpose]) -> Self {
        Self {
            id: None,
            carrier: carrier.to_string(),
            apn: apn.to_string(),
            user: String::new(),
            password: String::new(),
            auth: AuthType::None,
            purposes: purposes.iter().copied().collect(),
            protocol: IpProtocol::Ip,
            roaming_protocol: IpProtocol::Ip,
            bearer: None,
        }
    }
}

pub struct ProfileCandidate {
    id: String,
    carrier: String,
    apn: String,
    user: String,
    password: String,
    auth: AuthType,
    purposes: BTreeSet<Purpose>,
    protocol: IpProtocol,
    roaming_protocol: IpProtocol,
    bearer: Option<RadioBearer>,
    fingerprint: u64,
    in_use: AtomicBool,
    tethered_call: AtomicBool,
}

impl ProfileCandidate {
    pub fn new(spec: CandidateSpec) -> Self {
        let fingerprint = fingerprint(&spec);
        Self {
            id: spec.id.unwrap_or_else(ids::candidate_id),
            carrier: spec.carrier,
            apn: spec.apn,
            user: spec.user,
            password: spec.password,
            auth: spec.auth,
            purposes: spec.purposes,
            protocol: spec.protocol,
            roaming_protocol: spec.roaming_protocol,
            bearer: spec.bearer,
            fingerprint,
            in_use: AtomicBool::new(false),
            tethered_call: AtomicBool::new(false),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn carrier(&self) -> &str {
        &self.carrier
    }

    pub fn apn(&self) -> &str {
        &self.apn
    }

    pub fn user(&self) -> &str {
        &self.user
    }

    pub fn password(&self) -> &str {
        &self.password
    }

    pub fn auth(&self) -> AuthType {
        self.auth
    }

    pub fn purposes(&self) -> &BTreeSet<Purpose> {
        &self.purposes
    }

    pub fn protocol(&self) -> IpProtocol {
        self.protocol
    }

    pub fn roaming_protocol(&self) -> IpProtocol {
        self.roaming_protocol
    }

    pub fn bearer(&self) -> Option<RadioBearer> {
        self.bearer
    }

    /// Hash of address, credentials, and purpose set.
    pub fn fingerprint(&self) -> u64 {
        self.fingerprint
    }

    pub fn can_handle(&self, purpose: Purpose) -> bool {
        self.purposes.contains(&purpose)
    }

    /// Whether a backend of `flavor` may use this candidate.
    pub fn supports(&self, flavor: TechFlavor) -> bool {
        self.bearer.is_none_or(|b| b.supported_by(flavor))
    }

    pub fn is_in_use(&self) -> bool {
        self.in_use.load(Ordering::Acquire)
    }

    pub(crate) fn set_in_use(&self, in_use: bool) {
        self.in_use.store(in_use, Ordering::Release);
    }

    pub fn is_tethered_call_active(&self) -> bool {
        self.tethered_call.load(Ordering::Acquire)
    }

    /// Reported by the voice side when a call on this candidate's bearer
    /// blocks concurrent data.
    pub fn set_tethered_call_active(&self, active: bool) {
        self.tethered_call.store(active, Ordering::Release);
    }
}

fn fingerprint(spec: &CandidateSpec) -> u64 {
    let mut h = DefaultHasher::new();
    spec.apn.to_ascii_lowercase().hash(&mut h);
    spec.user.hash(&mut h);
    spec.password.hash(&mut h);
    spec.auth.hash(&mut h);
    spec.purposes.hash(&mut h);
    h.finish()
}

impl PartialEq for ProfileCandidate {
    fn eq(&self, other: &Self) -> bool {
        self.fingerprint == other.fingerprint
    }
}

impl Eq for ProfileCandidate {}

impl Hash for ProfileCandidate {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.fingerprint.hash(state);
    }
}

impl std::fmt::Debug for ProfileCandidate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProfileCandidate")
            .field("id", &self.id)
            .field("carrier", &self.carrier)
            .field("apn", &self.apn)
            .field("user", &self.user)
            .field("auth", &self.auth)
            .field("purposes", &self.purposes)
            .field("bearer", &self.bearer)
            .field("in_use", &self.is_in_use())
            .finish_non_exhaustive()
    }
}

// ── Catalog ─────────────────────────────────────────────────────────

/// Outcome of a catalog reload.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReloadSummary {
    pub total: usize,
    /// In-use candidates kept although the new configuration dropped them.
    pub retained_in_use: Vec<String>,
    pub duplicates_dropped: usize,
}

/// Configuration-owned list of every known candidate, in priority order.
///
/// Readers take a lock-free snapshot; reloads are serialized and publish a
/// whole new list.
pub struct CandidateCatalog {
    current: ArcSwap<Listing>,
    reload_lock: Mutex<()>,
}

struct Listing {
    configured: Vec<Arc<ProfileCandidate>>,
    /// Dropped by a reload while bound. Never offered to a new seed.
    retained: Vec<Arc<ProfileCandidate>>,
}

impl Listing {
    fn all(&self) -> impl Iterator<Item = &Arc<ProfileCandidate>> {
        self.configured.iter().chain(&self.retained)
    }
}

impl CandidateCatalog {
    pub fn new(specs: Vec<CandidateSpec>) -> Self {
        let (configured, _) = dedup(specs.into_iter().map(ProfileCandidate::new).map(Arc::new));
        Self {
            current: ArcSwap::from_pointee(Listing {
                configured,
                retained: Vec::new(),
            }),
            reload_lock: Mutex::new(()),
        }
    }

    /// Every entry, configured ones first.
    pub fn snapshot(&self) -> Vec<Arc<ProfileCandidate>> {
        self.current.load().all().cloned().collect()
    }

    pub fn len(&self) -> usize {
        let l = self.current.load();
        l.configured.len() + l.retained.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn get(&self, id: &str) -> Option<Arc<ProfileCandidate>> {
        self.current.load().all().find(|c| c.id() == id).cloned()
    }

    /// Ids of entries kept only because they were bound at reload time.
    pub fn retained(&self) -> Vec<String> {
        self.current
            .load()
            .retained
            .iter()
            .map(|c| c.id().to_string())
            .collect()
    }

    /// Ordered candidates usable for `purpose` on a `flavor` backend. When
    /// `carrier` is known, only that carrier's profiles qualify.
    pub fn for_purpose(
        &self,
        purpose: Purpose,
        flavor: TechFlavor,
        carrier: Option<&str>,
    ) -> Vec<Arc<ProfileCandidate>> {
        self.current
            .load()
            .configured
            .iter()
            .filter(|c| c.can_handle(purpose) && c.supports(flavor))
            .filter(|c| carrier.is_none_or(|op| c.carrier() == op))
            .cloned()
            .collect()
    }

    /// Replace the catalog.
    ///
    /// A new entry whose fingerprint matches an existing one reuses the
    /// existing instance, so bound contexts keep pointing at a live entry.
    /// Existing candidates that are in use are retained until released.
    pub fn reload(&self, specs: Vec<CandidateSpec>) -> ReloadSummary {
        let _guard = lock(&self.reload_lock);
        let old = self.current.load_full();

        let fresh = specs.into_iter().map(|spec| {
            let candidate = ProfileCandidate::new(spec);
            old.all()
                .find(|o| o.fingerprint() == candidate.fingerprint())
                .cloned()
                .unwrap_or_else(|| Arc::new(candidate))
        });
        let (configured, duplicates_dropped) = dedup(fresh);

        let mut retained = Vec::new();
        for o in old.all() {
            if o.is_in_use() && !configured.iter().any(|c| Arc::ptr_eq(c, o)) {
                tracing::warn!(candidate = %o.id(), apn = %o.apn(), "keeping in-use candidate dropped by reload");
                retained.push(o.clone());
            }
        }

        let summary = ReloadSummary {
            total: configured.len() + retained.len(),
            retained_in_use: retained.iter().map(|c| c.id().to_string()).collect(),
            duplicates_dropped,
        };
        self.current.store(Arc::new(Listing {
            configured,
            retained,
        }));
        tracing::info!(
            total = summary.total,
            retained = summary.retained_in_use.len(),
            duplicates = summary.duplicates_dropped,
            "candidate catalog reloaded"
        );
        summary
    }

    /// Drop retained entries that are no longer bound. Returns how many
    /// were removed.
    pub fn prune_retained(&self) -> usize {
        let _guard = lock(&self.reload_lock);
        let cur = self.current.load_full();
        let (kept, released): (Vec<_>, Vec<_>) =
            cur.retained.iter().cloned().partition(|c| c.is_in_use());
        if released.is_empty() {
            return 0;
        }
        for c in &released {
            tracing::info!(candidate = %c.id(), apn = %c.apn(), "dropping released candidate");
        }
        self.current.store(Arc::new(Listing {
            configured: cur.configured.clone(),
            retained: kept,
        }));
        released.len()
    }
}

/// Keep the first candidate of each fingerprint.
fn dedup(
    candidates: impl Iterator<Item = Arc<ProfileCandidate>>,
) -> (Vec<Arc<ProfileCandidate>>, usize) {
    let mut out: Vec<Arc<ProfileCandidate>> = Vec::new();
    let mut dropped = 0;
    for c in candidates {
        if out.iter().any(|o| o.fingerprint() == c.fingerprint()) {
            tracing::debug!(candidate = %c.id(), apn = %c.apn(), "dropping duplicate candidate");
            dropped += 1;
            continue;
        }
        out.push(c);
    }
    (out, dropped)
}
