//! Submission → wire payload conversion.
//!
//! Two formats are supported:
//! - `raw`: the submission record itself
//! - `fhir`: a FHIR-style collection bundle with one Patient resource and
//!   one textual Observation per remaining field

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::domain::Submission;

/// Field names that feed the Patient name, in priority order
pub const NAME_KEYS: [&str; 2] = ["name", "full_name"];

/// Field names that feed the Patient birth date, in priority order
pub const DOB_KEYS: [&str; 2] = ["dob", "date_of_birth"];

/// Patient id used when the participant was never observed
pub const UNKNOWN_PATIENT_ID: &str = "unknown";

/// Wire format selector
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PayloadFormat {
    /// Structured clinical bundle
    #[default]
    Fhir,

    /// Submission echoed as-is
    Raw,
}

impl PayloadFormat {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Fhir => "fhir",
            Self::Raw => "raw",
        }
    }
}

impl fmt::Display for PayloadFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PayloadFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "fhir" => Ok(Self::Fhir),
            "raw" => Ok(Self::Raw),
            other => Err(format!("unknown payload format: {}", other)),
        }
    }
}

/// A payload ready to be serialized as the request body
#[derive(Debug, Clone, Serialize)]
#[serde(untagged)]
pub enum Payload {
    Raw(Submission),
    Fhir(Bundle),
}

#[derive(Debug, Clone, Serialize)]
pub struct Bundle {
    #[serde(rename = "resourceType")]
    resource_type: &'static str,

    #[serde(rename = "type")]
    bundle_type: &'static str,

    pub entry: Vec<BundleEntry>,
}

#[derive(Debug, Clone, Serialize)]
pub struct BundleEntry {
    pub resource: Resource,
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "resourceType")]
pub enum Resource {
    Patient(Patient),
    Observation(Observation),
}

#[derive(Debug, Clone, Serialize)]
pub struct Patient {
    pub id: String,
    pub name: Vec<HumanName>,
    #[serde(rename = "birthDate")]
    pub birth_date: Option<Value>,
}

#[derive(Debug, Clone, Serialize)]
pub struct HumanName {
    pub text: Value,
}

#[derive(Debug, Clone, Serialize)]
pub struct Observation {
    pub status: &'static str,
    pub code: CodeText,
    #[serde(rename = "valueString")]
    pub value_string: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct CodeText {
    pub text: String,
}

/// Convert a submission into the payload for `format`. Never fails: missing
/// patient fields degrade to an empty name list, a null birth date and the
/// placeholder id.
pub fn transform(submission: &Submission, format: PayloadFormat) -> Payload {
    match format {
        PayloadFormat::Raw => Payload::Raw(submission.clone()),
        PayloadFormat::Fhir => Payload::Fhir(fhir_bundle(submission)),
    }
}

fn fhir_bundle(submission: &Submission) -> Bundle {
    let patient = Patient {
        id: submission
            .participant_id()
            .filter(|id| !id.is_empty())
            .unwrap_or(UNKNOWN_PATIENT_ID)
            .to_string(),
        name: submission
            .first_field(&NAME_KEYS)
            .map(|text| vec![HumanName { text: text.clone() }])
            .unwrap_or_default(),
        birth_date: submission.first_field(&DOB_KEYS).cloned(),
    };

    let observations = submission
        .fields()
        .iter()
        .filter(|(key, _)| !NAME_KEYS.contains(&key.as_str()) && !DOB_KEYS.contains(&key.as_str()))
        .map(|(key, value)| {
            Resource::Observation(Observation {
                status: "final",
                code: CodeText { text: key.clone() },
                value_string: stringify(value),
            })
        });

    let entry = std::iter::once(Resource::Patient(patient))
        .chain(observations)
        .map(|resource| BundleEntry { resource })
        .collect();

    Bundle {
        resource_type: "Bundle",
        bundle_type: "collection",
        entry,
    }
}

/// Strings pass through; everything else is rendered as JSON text.
fn stringify(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}
