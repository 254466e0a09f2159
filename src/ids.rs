//! Correlation ids for subscriptions and method calls.
//!
//! Ids are opaque strings on the wire. Locally they are random 128-bit
//! values, so uniqueness holds for the registry lifetime without any
//! same-instant collision caveats.

use uuid::Uuid;

/// Generates a fresh opaque correlation id.
pub fn correlation_id() -> String {
    Uuid::new_v4().simple().to_string()
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use super::correlation_id;

    #[test]
    fn ids_are_opaque_hex_strings() {
        let id = correlation_id();
        assert_eq!(id.len(), 32);
        assert!(id.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn ids_do_not_collide_across_a_burst() {
        let ids: HashSet<String> = (0..1000).map(|_| correlation_id()).collect();
        assert_eq!(ids.len(), 1000);
    }
}
