//! The canonical intake submission record.
//!
//! A submission is a point-in-time snapshot of the fields captured during a
//! session. Once built it is only ever read: the store, the delivery client
//! and the dead-letter queue all receive their own copy.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};

/// Accumulated intake answers, keyed by field name in arrival order.
pub type FieldMap = Map<String, Value>;

/// The remote participant that sent intake data.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Participant {
    /// Stable session identifier of the participant
    pub sid: Option<String>,

    /// Human-readable identity
    pub identity: Option<String>,
}

impl Participant {
    pub fn new(sid: impl Into<String>, identity: impl Into<String>) -> Self {
        Self {
            sid: Some(sid.into()),
            identity: Some(identity.into()),
        }
    }
}

/// One immutable snapshot of intake fields plus identity and capture time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Submission {
    /// Capture time, seconds since the Unix epoch
    created_at: f64,

    /// Participant session id (absent if never observed)
    participant_id: Option<String>,

    /// Participant identity string (absent if never observed)
    participant_identity: Option<String>,

    /// Snapshot of the field mapping
    #[serde(default)]
    fields: FieldMap,
}

impl Submission {
    /// Build a submission captured now.
    ///
    /// Takes ownership of `fields`; callers holding a live mapping must pass
    /// a clone.
    pub fn new(fields: FieldMap) -> Self {
        Self::captured_at(now_epoch_seconds(), fields)
    }

    /// Build a submission with an explicit capture time.
    pub fn captured_at(created_at: f64, fields: FieldMap) -> Self {
        Self {
            created_at,
            participant_id: None,
            participant_identity: None,
            fields,
        }
    }

    /// Attach the participant observed at capture time
    pub fn with_participant(mut self, participant: &Participant) -> Self {
        self.participant_id = participant.sid.clone();
        self.participant_identity = participant.identity.clone();
        self
    }

    pub fn created_at(&self) -> f64 {
        self.created_at
    }

    pub fn participant_id(&self) -> Option<&str> {
        self.participant_id.as_deref()
    }

    pub fn participant_identity(&self) -> Option<&str> {
        self.participant_identity.as_deref()
    }

    pub fn fields(&self) -> &FieldMap {
        &self.fields
    }

    /// First present value among `keys`, skipping nulls and empty strings.
    pub fn first_field(&self, keys: &[&str]) -> Option<&Value> {
        keys.iter()
            .filter_map(|key| self.fields.get(*key))
            .find(|value| is_present(value))
    }

    /// Stable key identifying this snapshot across retries and replays.
    ///
    /// Format: first 16 hex chars of SHA-256 over the serialized record.
    pub fn idempotency_key(&self) -> String {
        let encoded = serde_json::to_vec(self).unwrap_or_default();
        let digest = Sha256::digest(&encoded);
        hex::encode(&digest[..8])
    }
}

/// Current time as fractional seconds since the epoch
pub fn now_epoch_seconds() -> f64 {
    Utc::now().timestamp_micros() as f64 / 1_000_000.0
}

fn is_present(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::String(s) => !s.is_empty(),
        Value::Array(items) => !items.is_empty(),
        Value::Object(map) => !map.is_empty(),
        Value::Number(n) => n.as_f64().map(|f| f != 0.0).unwrap_or(true),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn fields(pairs: &[(&str, Value)]) -> FieldMap {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    #[test]
    fn test_serialized_shape() {
        let submission = Submission::captured_at(1_700_000_000.5, fields(&[("name", json!("Jane"))]))
            .with_participant(&Participant::new("PA_1", "jane"));

        let value = serde_json::to_value(&submission).unwrap();
        assert_eq!(
            value,
            json!({
                "created_at": 1_700_000_000.5,
                "participant_id": "PA_1",
                "participant_identity": "jane",
                "fields": {"name": "Jane"}
            })
        );
    }

    #[test]
    fn test_missing_participant_deserializes_as_none() {
        let submission: Submission =
            serde_json::from_str(r#"{"created_at": 1.0, "fields": {"a": 1}}"#).unwrap();
        assert_eq!(submission.participant_id(), None);
        assert_eq!(submission.participant_identity(), None);
        assert_eq!(submission.fields().get("a"), Some(&json!(1)));
    }

    #[test]
    fn test_unknown_keys_rejected() {
        let result: Result<Submission, _> =
            serde_json::from_str(r#"{"created_at": 1.0, "fields": {}, "extra": true}"#);
        assert!(result.is_err());
    }

    #[test]
    fn test_first_field_alias_order() {
        let submission = Submission::captured_at(
            0.0,
            fields(&[("name", json!("")), ("full_name", json!("Jane Doe"))]),
        );
        assert_eq!(
            submission.first_field(&["name", "full_name"]),
            Some(&json!("Jane Doe"))
        );
        assert_eq!(submission.first_field(&["dob", "date_of_birth"]), None);
    }

    #[test]
    fn test_idempotency_key_stable() {
        let a = Submission::captured_at(10.0, fields(&[("a", json!(1))]));
        let b = a.clone();
        let c = Submission::captured_at(11.0, fields(&[("a", json!(1))]));

        assert_eq!(a.idempotency_key(), b.idempotency_key());
        assert_ne!(a.idempotency_key(), c.idempotency_key());
        assert_eq!(a.idempotency_key().len(), 16);
    }

    #[test]
    fn test_snapshot_is_independent_of_source() {
        let mut live = fields(&[("a", json!(1))]);
        let submission = Submission::new(live.clone());
        live.insert("b".to_string(), json!(2));

        assert_eq!(submission.fields().len(), 1);
        assert!(submission.created_at() > 0.0);
    }
}
