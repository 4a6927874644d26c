//! Prefixed ID generation.
//!
//! IDs are a `prefix_` followed by a UUIDv7 (time-ordered), so a candidate
//! or notification id is recognisable by type in logs.

use uuid::Uuid;

fn prefixed_id(prefix: &str) -> String {
    let id = Uuid::now_v7();
    format!("{}_{}", prefix, id.as_simple())
}

/// Generate a profile candidate ID: `apn_<uuid7>`
pub fn candidate_id() -> String {
    prefixed_id("apn")
}

/// Generate a notification ID: `evt_<uuid7>`
pub fn event_id() -> String {
    prefixed_id("evt")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_have_correct_prefix() {
        assert!(candidate_id().starts_with("apn_"));
        assert!(event_id().starts_with("evt_"));
    }

    #[test]
    fn ids_are_unique_and_time_ordered() {
        let a = candidate_id();
        let b = candidate_id();
        assert_ne!(a, b);
        assert!(b > a, "Expected {b} > {a}");
    }
}
