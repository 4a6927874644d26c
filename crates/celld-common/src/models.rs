//! Data models shared by the control plane and its listeners.
//!
//! A `SubscriptionIdentity` describes the SIM application occupying one
//! slot; a `SubscriptionRoster` is the fixed-size, slot-ordered collection
//! of them that the card-state refresh logic publishes as a snapshot.

use serde::{Deserialize, Serialize};
use thiserror::Error;

// ── Purpose ─────────────────────────────────────────────────────────

/// Logical reason for a data connection (the APN type).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Purpose {
    Internet,
    Mms,
    Supl,
    Dun,
    Hipri,
    Fota,
    Ims,
    Cbs,
    Ia,
    Emergency,
}

impl Purpose {
    /// Every purpose, in table order.
    pub const ALL: [Purpose; 10] = [
        Purpose::Internet,
        Purpose::Mms,
        Purpose::Supl,
        Purpose::Dun,
        Purpose::Hipri,
        Purpose::Fota,
        Purpose::Ims,
        Purpose::Cbs,
        Purpose::Ia,
        Purpose::Emergency,
    ];

    /// Fixed admission priority. Higher wins.
    pub fn priority(self) -> u8 {
        match self {
            Purpose::Internet => 0,
            Purpose::Dun => 1,
            Purpose::Mms | Purpose::Supl | Purpose::Fota | Purpose::Cbs | Purpose::Ia => 2,
            Purpose::Hipri => 3,
            Purpose::Ims => 4,
            Purpose::Emergency => 5,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Purpose::Internet => "internet",
            Purpose::Mms => "mms",
            Purpose::Supl => "supl",
            Purpose::Dun => "dun",
            Purpose::Hipri => "hipri",
            Purpose::Fota => "fota",
            Purpose::Ims => "ims",
            Purpose::Cbs => "cbs",
            Purpose::Ia => "ia",
            Purpose::Emergency => "emergency",
        }
    }
}

impl std::fmt::Display for Purpose {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown purpose: {0}")]
pub struct UnknownPurpose(pub String);

impl std::str::FromStr for Purpose {
    type Err = UnknownPurpose;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        // "default" is the carrier-database spelling of internet.
        match s.trim().to_ascii_lowercase().as_str() {
            "internet" | "default" => Ok(Purpose::Internet),
            "mms" => Ok(Purpose::Mms),
            "supl" => Ok(Purpose::Supl),
            "dun" => Ok(Purpose::Dun),
            "hipri" => Ok(Purpose::Hipri),
            "fota" => Ok(Purpose::Fota),
            "ims" => Ok(Purpose::Ims),
            "cbs" => Ok(Purpose::Cbs),
            "ia" => Ok(Purpose::Ia),
            "emergency" => Ok(Purpose::Emergency),
            other => Err(UnknownPurpose(other.to_string())),
        }
    }
}

// ── Connection state ────────────────────────────────────────────────

/// State of one (subscription, purpose) connection context.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContextState {
    #[default]
    Idle,
    Connecting,
    Connected,
    Failed,
    Disconnecting,
    /// Searching an alternate technology.
    Scanning,
}

impl ContextState {
    /// `Idle` and `Failed` both count as disconnected.
    pub fn is_disconnected(self) -> bool {
        matches!(self, ContextState::Idle | ContextState::Failed)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ContextState::Idle => "idle",
            ContextState::Connecting => "connecting",
            ContextState::Connected => "connected",
            ContextState::Failed => "failed",
            ContextState::Disconnecting => "disconnecting",
            ContextState::Scanning => "scanning",
        }
    }
}

impl std::fmt::Display for ContextState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ── Technology ──────────────────────────────────────────────────────

/// Radio technology family of a per-slot backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TechFlavor {
    Gsm,
    Cdma,
}

impl std::fmt::Display for TechFlavor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TechFlavor::Gsm => write!(f, "gsm"),
            TechFlavor::Cdma => write!(f, "cdma"),
        }
    }
}

/// Card application type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum AppType {
    #[default]
    #[serde(rename = "UNKNOWN")]
    Unknown,
    #[serde(rename = "SIM")]
    Sim,
    #[serde(rename = "USIM")]
    Usim,
    #[serde(rename = "RUIM")]
    Ruim,
    #[serde(rename = "CSIM")]
    Csim,
    #[serde(rename = "ISIM")]
    Isim,
}

impl AppType {
    /// Backend flavor this application requires, or `None` when the type
    /// does not determine one.
    pub fn flavor(self) -> Option<TechFlavor> {
        match self {
            AppType::Sim | AppType::Usim => Some(TechFlavor::Gsm),
            AppType::Ruim | AppType::Csim => Some(TechFlavor::Cdma),
            AppType::Isim | AppType::Unknown => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            AppType::Unknown => "UNKNOWN",
            AppType::Sim => "SIM",
            AppType::Usim => "USIM",
            AppType::Ruim => "RUIM",
            AppType::Csim => "CSIM",
            AppType::Isim => "ISIM",
        }
    }
}

impl std::fmt::Display for AppType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<&str> for AppType {
    fn from(s: &str) -> Self {
        match s.trim().to_ascii_uppercase().as_str() {
            "SIM" => AppType::Sim,
            "USIM" => AppType::Usim,
            "RUIM" => AppType::Ruim,
            "CSIM" => AppType::Csim,
            "ISIM" => AppType::Isim,
            _ => AppType::Unknown,
        }
    }
}

/// Activation status of a subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActivationStatus {
    Deactivated,
    Activating,
    Activated,
    DeactivatePending,
    #[default]
    Invalid,
}

// ── Subscription identity ───────────────────────────────────────────

/// The SIM application occupying a slot.
///
/// A cleared identity has every index unset and status `Invalid`. A
/// well-formed entry has exactly one of the GSM-family or CDMA-family
/// application index set.
///
/// `==` compares every field. [`SubscriptionIdentity::is_same`] is the
/// looser "same physical application" test used to tell a card swap
/// apart from an activation-status transition.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubscriptionIdentity {
    pub slot: Option<usize>,
    pub gsm_app_index: Option<u32>,
    pub cdma_app_index: Option<u32>,
    pub sub_index: Option<u32>,
    #[serde(default)]
    pub status: ActivationStatus,
    pub app_id: Option<String>,
    pub app_label: Option<String>,
    #[serde(default)]
    pub app_type: AppType,
    pub iccid: Option<String>,
}

impl SubscriptionIdentity {
    /// A cleared identity.
    pub fn new() -> Self {
        Self::default()
    }

    /// Reset every field to its cleared value.
    pub fn clear(&mut self) {
        *self = Self::default();
    }

    /// Deep value copy of `other` into `self`.
    pub fn copy_from(&mut self, other: &SubscriptionIdentity) {
        self.clone_from(other);
    }

    /// Whether both identities describe the same card application,
    /// ignoring slot and activation status. An absent string and an empty
    /// string compare equal.
    pub fn is_same(&self, other: &SubscriptionIdentity) -> bool {
        self.gsm_app_index == other.gsm_app_index
            && self.cdma_app_index == other.cdma_app_index
            && self.sub_index == other.sub_index
            && self.app_type == other.app_type
            && same_text(&self.app_id, &other.app_id)
            && same_text(&self.app_label, &other.app_label)
            && same_text(&self.iccid, &other.iccid)
    }

    /// GSM-family index if set, otherwise the CDMA-family index.
    pub fn effective_app_index(&self) -> Option<u32> {
        self.gsm_app_index.or(self.cdma_app_index)
    }

    /// True when no application index is set.
    pub fn is_cleared(&self) -> bool {
        self.gsm_app_index.is_none() && self.cdma_app_index.is_none()
    }

    /// Exactly one index set, or neither.
    pub fn is_well_formed(&self) -> bool {
        !(self.gsm_app_index.is_some() && self.cdma_app_index.is_some())
    }
}

fn same_text(a: &Option<String>, b: &Option<String>) -> bool {
    a.as_deref().unwrap_or("") == b.as_deref().unwrap_or("")
}

// ── Subscription roster ─────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RosterError {
    #[error("roster has {expected} slots, got {actual}")]
    SlotCountMismatch { expected: usize, actual: usize },
    #[error("slot {slot} out of range (0..{slots})")]
    SlotOutOfRange { slot: usize, slots: usize },
}

/// Fixed-size, slot-ordered set of subscription identities.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubscriptionRoster {
    entries: Vec<SubscriptionIdentity>,
}

impl SubscriptionRoster {
    /// A roster of `slots` cleared identities.
    pub fn new(slots: usize) -> Self {
        Self {
            entries: vec![SubscriptionIdentity::default(); slots],
        }
    }

    /// Build a roster from slot-ordered entries.
    pub fn from_entries(entries: Vec<SubscriptionIdentity>) -> Self {
        Self { entries }
    }

    /// Return a copy of this roster with `slot` replaced.
    ///
    /// Used to assemble the next snapshot off to the side before it is
    /// published wholesale.
    pub fn with_slot(
        mut self,
        slot: usize,
        identity: SubscriptionIdentity,
    ) -> Result<Self, RosterError> {
        let slots = self.entries.len();
        let entry = self
            .entries
            .get_mut(slot)
            .ok_or(RosterError::SlotOutOfRange { slot, slots })?;
        *entry = identity;
        Ok(self)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, slot: usize) -> Option<&SubscriptionIdentity> {
        self.entries.get(slot)
    }

    pub fn iter(&self) -> impl Iterator<Item = &SubscriptionIdentity> {
        self.entries.iter()
    }

    /// Membership by [`SubscriptionIdentity::is_same`].
    pub fn contains(&self, identity: &SubscriptionIdentity) -> bool {
        self.find(identity).is_some()
    }

    /// Position of the first entry that [`is_same`](SubscriptionIdentity::is_same)
    /// as `identity`.
    pub fn find(&self, identity: &SubscriptionIdentity) -> Option<usize> {
        self.entries.iter().position(|e| e.is_same(identity))
    }

    /// Replace every entry with a deep copy of `other`'s. The slot count
    /// never changes.
    pub fn copy_from(&mut self, other: &SubscriptionRoster) -> Result<(), RosterError> {
        if other.len() != self.len() {
            return Err(RosterError::SlotCountMismatch {
                expected: self.len(),
                actual: other.len(),
            });
        }
        for (mine, theirs) in self.entries.iter_mut().zip(other.entries.iter()) {
            mine.copy_from(theirs);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn usim(slot: usize) -> SubscriptionIdentity {
        SubscriptionIdentity {
            slot: Some(slot),
            gsm_app_index: Some(0),
            cdma_app_index: None,
            sub_index: Some(1),
            status: ActivationStatus::Activated,
            app_id: Some("a0000000871002".into()),
            app_label: Some("USIM".into()),
            app_type: AppType::Usim,
            iccid: Some("8901260000000000001".into()),
        }
    }

    // ─── Purpose ────────────────────────────────────────────────────────

    #[test]
    fn purpose_parses_default_as_internet() {
        assert_eq!("default".parse::<Purpose>().unwrap(), Purpose::Internet);
        assert_eq!(" MMS ".parse::<Purpose>().unwrap(), Purpose::Mms);
        assert!("wap".parse::<Purpose>().is_err());
    }

    #[test]
    fn purpose_display_roundtrips() {
        for p in Purpose::ALL {
            assert_eq!(p.to_string().parse::<Purpose>().unwrap(), p);
        }
    }

    #[test]
    fn emergency_outranks_internet() {
        assert!(Purpose::Emergency.priority() > Purpose::Internet.priority());
        assert_eq!(Purpose::Mms.priority(), Purpose::Supl.priority());
    }

    // ─── App type ───────────────────────────────────────────────────────

    #[test]
    fn app_type_flavor() {
        assert_eq!(AppType::from("usim").flavor(), Some(TechFlavor::Gsm));
        assert_eq!(AppType::from("SIM").flavor(), Some(TechFlavor::Gsm));
        assert_eq!(AppType::from("CSIM").flavor(), Some(TechFlavor::Cdma));
        assert_eq!(AppType::from("RUIM").flavor(), Some(TechFlavor::Cdma));
        assert_eq!(AppType::from("ISIM").flavor(), None);
        assert_eq!(AppType::from("bogus"), AppType::Unknown);
    }

    // ─── Identity ───────────────────────────────────────────────────────

    #[test]
    fn new_identity_is_cleared() {
        let id = SubscriptionIdentity::new();
        assert!(id.is_cleared());
        assert_eq!(id.status, ActivationStatus::Invalid);
        assert_eq!(id.effective_app_index(), None);
    }

    #[test]
    fn clear_resets_everything() {
        let mut id = usim(0);
        id.clear();
        assert_eq!(id, SubscriptionIdentity::default());
    }

    #[test]
    fn is_same_ignores_slot_and_status() {
        let a = usim(0);
        let mut b = usim(1);
        b.status = ActivationStatus::Deactivated;
        assert!(a.is_same(&b));
        assert!(b.is_same(&a));
        assert_ne!(a, b);
    }

    #[test]
    fn is_same_detects_card_swap() {
        let a = usim(0);
        let mut b = usim(0);
        b.iccid = Some("8901260000000000002".into());
        assert!(!a.is_same(&b));
    }

    #[test]
    fn absent_and_empty_text_are_same() {
        let mut a = usim(0);
        let mut b = usim(0);
        a.app_label = None;
        b.app_label = Some(String::new());
        assert!(a.is_same(&b));
        assert_ne!(a, b);
    }

    #[test]
    fn effective_index_prefers_gsm() {
        let mut id = usim(0);
        id.cdma_app_index = Some(3);
        assert_eq!(id.effective_app_index(), Some(0));
        assert!(!id.is_well_formed());
        id.gsm_app_index = None;
        assert_eq!(id.effective_app_index(), Some(3));
        assert!(id.is_well_formed());
    }

    #[test]
    fn copy_from_is_deep() {
        let mut src = usim(0);
        let mut dst = SubscriptionIdentity::new();
        dst.copy_from(&src);
        src.app_id.as_mut().unwrap().push_str("ff");
        assert_eq!(dst.app_id.as_deref(), Some("a0000000871002"));
    }

    // ─── Roster ─────────────────────────────────────────────────────────

    #[test]
    fn roster_lookup_uses_is_same() {
        let roster = SubscriptionRoster::new(2).with_slot(1, usim(1)).unwrap();
        let mut probe = usim(0);
        probe.status = ActivationStatus::Activating;
        assert!(roster.contains(&probe));
        assert_eq!(roster.find(&probe), Some(1));
        assert_ne!(roster.get(1), Some(&probe));
    }

    #[test]
    fn roster_copy_from_keeps_length() {
        let mut roster = SubscriptionRoster::new(2);
        let next = SubscriptionRoster::new(2).with_slot(0, usim(0)).unwrap();
        roster.copy_from(&next).unwrap();
        assert_eq!(roster, next);

        let wrong = SubscriptionRoster::new(3);
        assert_eq!(
            roster.copy_from(&wrong),
            Err(RosterError::SlotCountMismatch {
                expected: 2,
                actual: 3
            })
        );
        assert_eq!(roster.len(), 2);
    }

    #[test]
    fn with_slot_rejects_out_of_range() {
        let err = SubscriptionRoster::new(1).with_slot(4, usim(4)).unwrap_err();
        assert_eq!(err, RosterError::SlotOutOfRange { slot: 4, slots: 1 });
    }
}
