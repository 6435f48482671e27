//! Incoming intake events from the live session.
//!
//! Events arrive as raw data packets. Anything that is not a JSON object
//! with a known `type` and an object-valued `fields` is rejected with a
//! [`MalformedEvent`] which the session drops without surfacing.

use std::str::Utf8Error;

use serde_json::Value;
use thiserror::Error;

use super::submission::{FieldMap, Participant};

/// Reasons an incoming packet is not a valid intake event
#[derive(Debug, Error)]
pub enum MalformedEvent {
    #[error("payload is not UTF-8: {0}")]
    Utf8(#[from] Utf8Error),

    #[error("payload is not JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("payload is not a JSON object")]
    NotAnObject,

    #[error("payload has no string `type`")]
    MissingType,

    #[error("unknown event type: {0}")]
    UnknownType(String),

    #[error("`fields` is missing or not an object")]
    FieldsNotObject,
}

/// How an event mutates the live field mapping
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IntakeEventKind {
    /// `intake.update`: merge fields into the mapping
    Update,

    /// `intake.replace`: discard the mapping and use the given fields
    Replace,

    /// `intake.clear`: remove the named keys
    Clear,
}

impl IntakeEventKind {
    pub fn from_type(value: &str) -> Option<Self> {
        match value {
            "intake.update" => Some(Self::Update),
            "intake.replace" => Some(Self::Replace),
            "intake.clear" => Some(Self::Clear),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Update => "intake.update",
            Self::Replace => "intake.replace",
            Self::Clear => "intake.clear",
        }
    }
}

/// A validated intake event
#[derive(Debug, Clone, PartialEq)]
pub struct IntakeEvent {
    pub kind: IntakeEventKind,
    pub fields: FieldMap,
}

impl IntakeEvent {
    /// Parse and shape-check a raw packet body
    pub fn parse(raw: &[u8]) -> Result<Self, MalformedEvent> {
        let text = std::str::from_utf8(raw)?;
        let payload: Value = serde_json::from_str(text)?;
        let object = payload.as_object().ok_or(MalformedEvent::NotAnObject)?;

        let type_name = object
            .get("type")
            .and_then(Value::as_str)
            .ok_or(MalformedEvent::MissingType)?;
        let kind = IntakeEventKind::from_type(type_name)
            .ok_or_else(|| MalformedEvent::UnknownType(type_name.to_string()))?;

        let fields = object
            .get("fields")
            .and_then(Value::as_object)
            .ok_or(MalformedEvent::FieldsNotObject)?
            .clone();

        Ok(Self { kind, fields })
    }

    /// Apply this event to a field mapping
    pub fn apply(self, target: &mut FieldMap) {
        match self.kind {
            IntakeEventKind::Update => target.extend(self.fields),
            IntakeEventKind::Replace => *target = self.fields,
            // retain rather than remove, which would reorder the survivors
            IntakeEventKind::Clear => target.retain(|key, _| !self.fields.contains_key(key)),
        }
    }
}

/// A data packet as delivered by the session transport
#[derive(Debug, Clone, Default)]
pub struct DataPacket {
    /// Raw packet body
    pub data: Vec<u8>,

    /// Sender, when the transport knows it
    pub participant: Option<Participant>,
}

impl DataPacket {
    pub fn new(data: impl Into<Vec<u8>>) -> Self {
        Self {
            data: data.into(),
            participant: None,
        }
    }

    pub fn from_participant(mut self, participant: Participant) -> Self {
        self.participant = Some(participant);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_update() {
        let event =
            IntakeEvent::parse(br#"{"type": "intake.update", "fields": {"name": "Jane"}}"#).unwrap();
        assert_eq!(event.kind, IntakeEventKind::Update);
        assert_eq!(event.fields.get("name"), Some(&json!("Jane")));
    }

    #[test]
    fn test_rejects_bad_shapes() {
        assert!(matches!(
            IntakeEvent::parse(&[0xff, 0xfe]),
            Err(MalformedEvent::Utf8(_))
        ));
        assert!(matches!(
            IntakeEvent::parse(b"not json"),
            Err(MalformedEvent::Json(_))
        ));
        assert!(matches!(
            IntakeEvent::parse(b"[1, 2]"),
            Err(MalformedEvent::NotAnObject)
        ));
        assert!(matches!(
            IntakeEvent::parse(br#"{"fields": {}}"#),
            Err(MalformedEvent::MissingType)
        ));
        assert!(matches!(
            IntakeEvent::parse(br#"{"type": "chat.message", "fields": {}}"#),
            Err(MalformedEvent::UnknownType(t)) if t == "chat.message"
        ));
        assert!(matches!(
            IntakeEvent::parse(br#"{"type": "intake.update", "fields": [1]}"#),
            Err(MalformedEvent::FieldsNotObject)
        ));
        assert!(matches!(
            IntakeEvent::parse(br#"{"type": "intake.update"}"#),
            Err(MalformedEvent::FieldsNotObject)
        ));
    }

    #[test]
    fn test_apply_semantics() {
        let mut fields: FieldMap = [("a".to_string(), json!(1)), ("b".to_string(), json!(2))]
            .into_iter()
            .collect();

        IntakeEvent::parse(br#"{"type": "intake.update", "fields": {"b": 5, "c": 3}}"#)
            .unwrap()
            .apply(&mut fields);
        assert_eq!(fields.len(), 3);
        assert_eq!(fields["b"], json!(5));

        IntakeEvent::parse(br#"{"type": "intake.clear", "fields": {"a": null, "zz": null}}"#)
            .unwrap()
            .apply(&mut fields);
        assert!(!fields.contains_key("a"));
        assert_eq!(fields.len(), 2);

        IntakeEvent::parse(br#"{"type": "intake.replace", "fields": {}}"#)
            .unwrap()
            .apply(&mut fields);
        assert!(fields.is_empty());
    }

    #[test]
    fn test_fields_keep_arrival_order() {
        let mut fields = FieldMap::new();

        let events: [&[u8]; 4] = [
            br#"{"type": "intake.update", "fields": {"name": "Jane", "dob": "1990-01-01"}}"#,
            br#"{"type": "intake.update", "fields": {"symptom": "cough", "allergies": "none"}}"#,
            br#"{"type": "intake.update", "fields": {"dob": "1990-02-01"}}"#,
            br#"{"type": "intake.clear", "fields": {"dob": null}}"#,
        ];
        for raw in events {
            IntakeEvent::parse(raw).unwrap().apply(&mut fields);
        }

        let keys: Vec<&str> = fields.keys().map(String::as_str).collect();
        assert_eq!(keys, vec!["name", "symptom", "allergies"]);
    }

    #[test]
    fn test_kind_round_trip_names() {
        for kind in [
            IntakeEventKind::Update,
            IntakeEventKind::Replace,
            IntakeEventKind::Clear,
        ] {
            assert_eq!(IntakeEventKind::from_type(kind.as_str()), Some(kind));
        }
    }
}
