use chrono::SecondsFormat;
use ridepool_core::audit::{AuditDraft, AuditError};
use serde::Serialize;
use serde_json::Value;
use sha2::{Digest, Sha256};

#[derive(Serialize)]
struct CanonicalRef<'a> {
    id: Option<&'a str>,
    #[serde(rename = "type")]
    kind: &'a str,
}

/// Hashed view of an entry. Key order is fixed by JCS, not by this struct.
#[derive(Serialize)]
struct CanonicalEntry<'a> {
    action: &'a str,
    actor: CanonicalRef<'a>,
    #[serde(rename = "correlationId")]
    correlation_id: Option<&'a str>,
    delta: &'a Value,
    entity: CanonicalRef<'a>,
    #[serde(rename = "prevHash")]
    prev_hash: Option<&'a str>,
    reason: Option<&'a str>,
    ts: String,
}

/// RFC 8785 bytes of the draft chained to `prev_hash`.
pub fn canonical_bytes(draft: &AuditDraft, prev_hash: Option<&str>) -> Result<Vec<u8>, AuditError> {
    let record = &draft.record;
    let entry = CanonicalEntry {
        action: &record.action,
        actor: CanonicalRef {
            id: record.actor.id.as_deref(),
            kind: record.actor.kind.as_str(),
        },
        correlation_id: record.correlation_id.as_deref(),
        delta: &record.delta,
        entity: CanonicalRef {
            id: Some(record.entity.id.as_str()),
            kind: &record.entity.kind,
        },
        prev_hash,
        reason: record.reason.as_deref(),
        ts: draft.at.to_rfc3339_opts(SecondsFormat::Micros, true),
    };
    serde_jcs::to_vec(&entry).map_err(|e| AuditError::Schema(format!("cannot canonicalize entry: {e}")))
}

/// Hex SHA-256 of the canonical bytes.
pub fn entry_hash(draft: &AuditDraft, prev_hash: Option<&str>) -> Result<String, AuditError> {
    let bytes = canonical_bytes(draft, prev_hash)?;
    Ok(hex::encode(Sha256::digest(&bytes)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{DateTime, Utc};
    use ridepool_core::audit::{Actor, AuditRecord, EntityRef};
    use serde_json::json;

    fn draft(delta: Value) -> AuditDraft {
        let at = DateTime::parse_from_rfc3339("2024-05-02T08:30:00.250Z").unwrap().with_timezone(&Utc);
        AuditDraft::new(
            AuditRecord {
                actor: Actor::admin("a1"),
                action: "user.suspend".into(),
                entity: EntityRef::new("user", "u9"),
                delta,
                reason: Some("chargeback".into()),
                correlation_id: None,
            },
            at,
        )
    }

    #[test]
    fn test_canonical_form_is_sorted_and_stable() {
        let bytes = canonical_bytes(&draft(json!({"z": 1, "a": 2})), None).unwrap();
        let text = String::from_utf8(bytes).unwrap();
        assert_eq!(
            text,
            r#"{"action":"user.suspend","actor":{"id":"a1","type":"admin"},"correlationId":null,"delta":{"a":2,"z":1},"entity":{"id":"u9","type":"user"},"prevHash":null,"reason":"chargeback","ts":"2024-05-02T08:30:00.250000Z"}"#
        );
    }

    #[test]
    fn test_hash_depends_on_content_and_link() {
        let base = draft(json!({"status": "suspended"}));
        let h1 = entry_hash(&base, None).unwrap();
        assert_eq!(h1.len(), 64);
        assert_eq!(h1, entry_hash(&base, None).unwrap());
        assert_ne!(h1, entry_hash(&base, Some("00")).unwrap());
        assert_ne!(h1, entry_hash(&draft(json!({"status": "active"})), None).unwrap());
    }
}
