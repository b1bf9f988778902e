//! The append-only audit chain.
//!
//! Every security-relevant operation appends an [`AuditEvent`]. Events form
//! a hash chain: `entry_hash = SHA-256(event minus entry_hash)` and
//! `prev_hash` carries the predecessor's `entry_hash`, so removing or
//! editing any historical entry breaks every hash after it. Chain
//! verification walks the sequence and recomputes both links.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

/// The `prev_hash` of the first entry in a chain.
pub const CHAIN_GENESIS: &str = "0000000000000000000000000000000000000000000000000000000000000000";

/// Who performed an audited action.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ActorType {
    Admin,
    Tenant,
    Agent,
    System,
}

/// One append-only audit entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEvent {
    pub id: Uuid,
    pub timestamp: DateTime<Utc>,
    pub tenant_id: Option<Uuid>,
    pub site_id: Option<Uuid>,
    pub actor_type: ActorType,
    pub actor_id: String,
    /// Verb, e.g. `agent.enroll`, `plan.apply`, `cert.revoke`.
    pub action: String,
    pub resource_type: String,
    pub resource_id: String,
    pub request_id: Uuid,
    pub source_ip: Option<String>,
    pub metadata: serde_json::Value,
    /// `entry_hash` of the previous entry, or [`CHAIN_GENESIS`].
    pub prev_hash: String,
    /// SHA-256 over every other field of this entry, hex-encoded.
    pub entry_hash: String,
}

/// The hashable view of an event — every field except `entry_hash`, in a
/// fixed serialization order.
#[derive(Serialize)]
struct HashableEvent<'a> {
    id: &'a Uuid,
    timestamp: &'a DateTime<Utc>,
    tenant_id: &'a Option<Uuid>,
    site_id: &'a Option<Uuid>,
    actor_type: &'a ActorType,
    actor_id: &'a str,
    action: &'a str,
    resource_type: &'a str,
    resource_id: &'a str,
    request_id: &'a Uuid,
    source_ip: &'a Option<String>,
    metadata: &'a serde_json::Value,
    prev_hash: &'a str,
}

/// Compute the entry hash for an event (ignoring its current `entry_hash`).
///
/// The hash covers `prev_hash`, so an entry's hash commits to the entire
/// chain before it.
#[must_use]
pub fn compute_entry_hash(event: &AuditEvent) -> String {
    let view = HashableEvent {
        id: &event.id,
        timestamp: &event.timestamp,
        tenant_id: &event.tenant_id,
        site_id: &event.site_id,
        actor_type: &event.actor_type,
        actor_id: &event.actor_id,
        action: &event.action,
        resource_type: &event.resource_type,
        resource_id: &event.resource_id,
        request_id: &event.request_id,
        source_ip: &event.source_ip,
        metadata: &event.metadata,
        prev_hash: &event.prev_hash,
    };
    // Serialization of a struct with fixed field order is deterministic.
    let bytes = serde_json::to_vec(&view).unwrap_or_default();
    hex::encode(Sha256::digest(bytes))
}

/// A break found while verifying an audit chain.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ChainViolation {
    /// An entry's stored hash does not match its recomputed hash.
    #[error("entry {index} hash mismatch: stored {stored}, computed {computed}")]
    EntryHashMismatch {
        index: usize,
        stored: String,
        computed: String,
    },
    /// An entry's `prev_hash` does not match its predecessor's `entry_hash`.
    #[error("entry {index} prev_hash broken: expected {expected}, found {found}")]
    LinkBroken {
        index: usize,
        expected: String,
        found: String,
    },
}

/// Verify a chain slice in order, starting from genesis.
///
/// # Errors
///
/// Returns the first [`ChainViolation`] encountered.
pub fn verify_chain(events: &[AuditEvent]) -> Result<(), ChainViolation> {
    let mut expected_prev = CHAIN_GENESIS.to_owned();
    for (index, event) in events.iter().enumerate() {
        if event.prev_hash != expected_prev {
            return Err(ChainViolation::LinkBroken {
                index,
                expected: expected_prev,
                found: event.prev_hash.clone(),
            });
        }
        let computed = compute_entry_hash(event);
        if event.entry_hash != computed {
            return Err(ChainViolation::EntryHashMismatch {
                index,
                stored: event.entry_hash.clone(),
                computed,
            });
        }
        expected_prev = event.entry_hash.clone();
    }
    Ok(())
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn event(prev_hash: &str, action: &str) -> AuditEvent {
        let mut e = AuditEvent {
            id: Uuid::new_v4(),
            timestamp: Utc::now(),
            tenant_id: Some(Uuid::new_v4()),
            site_id: None,
            actor_type: ActorType::Tenant,
            actor_id: "key-1".to_owned(),
            action: action.to_owned(),
            resource_type: "plan".to_owned(),
            resource_id: "p1".to_owned(),
            request_id: Uuid::new_v4(),
            source_ip: Some("203.0.113.9".to_owned()),
            metadata: serde_json::json!({"n": 1}),
            prev_hash: prev_hash.to_owned(),
            entry_hash: String::new(),
        };
        e.entry_hash = compute_entry_hash(&e);
        e
    }

    fn chain(len: usize) -> Vec<AuditEvent> {
        let mut events = Vec::with_capacity(len);
        let mut prev = CHAIN_GENESIS.to_owned();
        for i in 0..len {
            let e = event(&prev, &format!("action-{i}"));
            prev = e.entry_hash.clone();
            events.push(e);
        }
        events
    }

    #[test]
    fn valid_chain_verifies() {
        assert_eq!(verify_chain(&chain(5)), Ok(()));
    }

    #[test]
    fn empty_chain_is_valid() {
        assert_eq!(verify_chain(&[]), Ok(()));
    }

    #[test]
    fn tampered_field_breaks_entry_hash() {
        let mut events = chain(3);
        events[1].action = "forged".to_owned();
        assert!(matches!(
            verify_chain(&events),
            Err(ChainViolation::EntryHashMismatch { index: 1, .. })
        ));
    }

    #[test]
    fn removed_entry_breaks_the_link() {
        let mut events = chain(3);
        events.remove(1);
        assert!(matches!(
            verify_chain(&events),
            Err(ChainViolation::LinkBroken { index: 1, .. })
        ));
    }

    #[test]
    fn entry_hash_commits_to_prev_hash() {
        let a = event(CHAIN_GENESIS, "x");
        let mut b = a.clone();
        b.prev_hash = "f".repeat(64);
        assert_ne!(compute_entry_hash(&a), compute_entry_hash(&b));
    }

    #[test]
    fn hash_is_deterministic() {
        let e = event(CHAIN_GENESIS, "x");
        assert_eq!(compute_entry_hash(&e), compute_entry_hash(&e));
    }
}
