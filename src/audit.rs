use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::clock::UnixTimeMs;

/// Inventory of payload field names that carry patient-identifying or
/// clinical content. Queue items record which of these appear in their
/// payload so audit and redaction tooling knows what a blob contains without
/// decrypting and parsing it. New clinical fields added to the bundle shape
/// must be added here to keep the inventory current.
pub const SENSITIVE_FIELDS: &[&str] = &[
    // Patient identification
    "identifier",
    "subject",
    "encounter",
    "author",
    "title",
    // Clinical content
    "valueQuantity",
    "valueCodeableConcept",
    "component",
    "medicationCodeableConcept",
    "dosage",
    "note",
    "section",
    "attachment",
    "description",
    "effectiveDateTime",
];

/// Scan a serialized payload for sensitive field names. Returns the matching
/// inventory names that occur anywhere in the document, deduplicated and in
/// stable (sorted) order. Non-JSON input yields an empty set; the scan is
/// bookkeeping and must never block an enqueue.
pub fn scan_sensitive_fields(payload: &str) -> Vec<String> {
    let value: serde_json::Value = match serde_json::from_str(payload) {
        Ok(v) => v,
        Err(_) => return Vec::new(),
    };

    let mut found = BTreeSet::new();
    collect_keys(&value, &mut found);

    SENSITIVE_FIELDS
        .iter()
        .filter(|name| found.contains(**name))
        .map(|name| name.to_string())
        .collect()
}

fn collect_keys(value: &serde_json::Value, out: &mut BTreeSet<String>) {
    match value {
        serde_json::Value::Object(map) => {
            for (key, nested) in map {
                out.insert(key.clone());
                collect_keys(nested, out);
            }
        }
        serde_json::Value::Array(items) => {
            for item in items {
                collect_keys(item, out);
            }
        }
        _ => {}
    }
}

// ============================================================================
// Audit events
// ============================================================================

const MAX_META_STRING: usize = 100;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum AuditError {
    #[error("meta value for '{key}' exceeds {max} characters")]
    MetaTooLong { key: String, max: usize },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditEventType {
    Enqueue,
    Synced,
    DeadLetter,
}

/// One audit record. Carries pseudonymous identifiers and technical flags
/// only; free text is rejected at construction so clinical content cannot
/// leak into the audit trail.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AuditEvent {
    pub id: String,
    pub event_type: AuditEventType,
    pub at: UnixTimeMs,
    pub patient_id: Option<String>,
    pub user_id: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub meta: Vec<(String, String)>,
}

pub fn make_audit_event(
    event_type: AuditEventType,
    patient_id: Option<&str>,
    user_id: &str,
    meta: Vec<(String, String)>,
    now: UnixTimeMs,
) -> Result<AuditEvent, AuditError> {
    for (key, value) in &meta {
        if value.len() > MAX_META_STRING {
            return Err(AuditError::MetaTooLong {
                key: key.clone(),
                max: MAX_META_STRING,
            });
        }
    }
    Ok(AuditEvent {
        id: uuid::Uuid::new_v4().to_string(),
        event_type,
        at: now,
        patient_id: patient_id.map(str::to_string),
        user_id: user_id.to_string(),
        meta,
    })
}

/// Drop events older than `max_age_days` and, when `max_per_patient` is set,
/// keep only the newest N per patient.
pub fn prune_old_events(
    events: Vec<AuditEvent>,
    max_age_days: u64,
    max_per_patient: Option<usize>,
    now: UnixTimeMs,
) -> Vec<AuditEvent> {
    let cutoff = now.saturating_sub_ms(max_age_days.saturating_mul(24 * 60 * 60 * 1000));
    let recent: Vec<AuditEvent> = events.into_iter().filter(|e| e.at >= cutoff).collect();

    let Some(cap) = max_per_patient.filter(|cap| *cap > 0) else {
        return recent;
    };

    let mut by_patient: std::collections::HashMap<String, Vec<AuditEvent>> =
        std::collections::HashMap::new();
    for event in recent {
        let key = event
            .patient_id
            .clone()
            .unwrap_or_else(|| "__unknown__".to_string());
        by_patient.entry(key).or_default().push(event);
    }

    let mut pruned = Vec::new();
    for (_, mut list) in by_patient {
        list.sort_by(|a, b| b.at.cmp(&a.at));
        list.truncate(cap);
        pruned.extend(list);
    }
    pruned.sort_by(|a, b| a.at.cmp(&b.at));
    pruned
}
