//! Notifications emitted to control-plane listeners.
//!
//! Listeners receive [`DataEvent`] values in-process. For out-of-process
//! consumers an event can be wrapped in an [`Envelope`] and JSON-encoded.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::ids;
use crate::models::{ContextState, Purpose, TechFlavor};

// ── Envelope ────────────────────────────────────────────────────────

/// Outer envelope for serialized notifications.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    /// Unique notification ID (`evt_<uuid7>`).
    pub id: String,
    pub ts: DateTime<Utc>,
    pub event: DataEvent,
}

impl Envelope {
    pub fn new(event: DataEvent) -> Self {
        Self {
            id: ids::event_id(),
            ts: Utc::now(),
            event,
        }
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

// ── Events ──────────────────────────────────────────────────────────

/// Every notification the control plane emits.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload")]
pub enum DataEvent {
    /// A slot's backend was re-created for a different technology.
    #[serde(rename = "slot.technology_changed")]
    TechnologyChanged(TechnologyChangedPayload),

    /// A (slot, purpose) context changed state.
    #[serde(rename = "context.state_changed")]
    StateChanged(StateChangedPayload),

    /// Every context of a slot reached a disconnected state.
    #[serde(rename = "slot.all_disconnected")]
    AllDisconnected { slot: usize },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TechnologyChangedPayload {
    pub slot: usize,
    pub old: TechFlavor,
    pub new: TechFlavor,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateChangedPayload {
    pub slot: usize,
    pub purpose: Purpose,
    pub old: ContextState,
    pub new: ContextState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn technology_change_serializes_tagged() {
        let ev = DataEvent::TechnologyChanged(TechnologyChangedPayload {
            slot: 0,
            old: TechFlavor::Cdma,
            new: TechFlavor::Gsm,
        });
        let json = serde_json::to_value(&ev).unwrap();
        assert_eq!(json["type"], "slot.technology_changed");
        assert_eq!(json["payload"]["new"], "gsm");
    }

    #[test]
    fn state_change_omits_missing_reason() {
        let ev = DataEvent::StateChanged(StateChangedPayload {
            slot: 1,
            purpose: Purpose::Mms,
            old: ContextState::Idle,
            new: ContextState::Connecting,
            reason: None,
        });
        let json = serde_json::to_string(&ev).unwrap();
        assert!(!json.contains("reason"));
        assert!(json.contains("\"purpose\":\"mms\""));
    }

    #[test]
    fn envelope_carries_event_id() {
        let env = Envelope::new(DataEvent::AllDisconnected { slot: 2 });
        assert!(env.id.starts_with("evt_"));
        let back: Envelope = serde_json::from_str(&env.to_json().unwrap()).unwrap();
        assert_eq!(back.event, DataEvent::AllDisconnected { slot: 2 });
    }
}
