//! The record handed to the caller when the agent finalizes.

use std::collections::BTreeMap;

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{Map, Value};

use crate::core::evidence::EvidenceStore;

/// Verbal history collected by the agent, as supplied in the finalize call.
///
/// Fields the agent sends as numbers are kept as their text form.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VerbalHistory {
    #[serde(default, deserialize_with = "lenient_string", skip_serializing_if = "Option::is_none")]
    pub age: Option<String>,
    #[serde(default, deserialize_with = "lenient_string", skip_serializing_if = "Option::is_none")]
    pub gender: Option<String>,
    #[serde(default, deserialize_with = "lenient_string", skip_serializing_if = "Option::is_none")]
    pub symptoms: Option<String>,
    #[serde(default, deserialize_with = "lenient_string", skip_serializing_if = "Option::is_none")]
    pub past_medical_history: Option<String>,
    #[serde(default, deserialize_with = "lenient_string", skip_serializing_if = "Option::is_none")]
    pub fever_days: Option<String>,
    #[serde(default, deserialize_with = "lenient_string", skip_serializing_if = "Option::is_none")]
    pub temperature: Option<String>,
    #[serde(default, deserialize_with = "lenient_string", skip_serializing_if = "Option::is_none")]
    pub rdt_result: Option<String>,
    #[serde(default, deserialize_with = "lenient_string", skip_serializing_if = "Option::is_none")]
    pub location: Option<String>,
    #[serde(default, deserialize_with = "lenient_string", skip_serializing_if = "Option::is_none")]
    pub season: Option<String>,
    #[serde(default, deserialize_with = "lenient_string", skip_serializing_if = "Option::is_none")]
    pub travel: Option<String>,

    /// Anything else the agent chose to include
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

fn lenient_string<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(match Option::<Value>::deserialize(deserializer)? {
        None | Some(Value::Null) => None,
        Some(Value::String(s)) => Some(s),
        Some(other) => Some(other.to_string()),
    })
}

/// One evidence entry of the final record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvidencePayload {
    pub base64: String,
    #[serde(rename = "mimeType")]
    pub mime_type: String,
}

/// Verbal history merged with captured evidence into one flat record.
///
/// Serialized as a single JSON object. When a history field shares a key with
/// an evidence entry, the history field wins.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ConsultationRecord {
    pub history: VerbalHistory,
    /// Keyed by record key (`eyePhoto`, `coughAudio`, `photo` for the RDT)
    pub evidence: BTreeMap<String, EvidencePayload>,
}

impl ConsultationRecord {
    pub fn new(history: VerbalHistory, store: &EvidenceStore) -> Self {
        let evidence = store
            .iter()
            .map(|item| {
                (
                    item.modality.payload_key().to_string(),
                    EvidencePayload {
                        base64: item.base64(),
                        mime_type: item.media_type.to_string(),
                    },
                )
            })
            .collect();
        Self { history, evidence }
    }

    pub fn evidence(&self, key: &str) -> Option<&EvidencePayload> {
        self.evidence.get(key)
    }

    /// The record as one flat JSON object.
    pub fn to_map(&self) -> Map<String, Value> {
        let mut map = Map::new();
        for (key, payload) in &self.evidence {
            if let Ok(value) = serde_json::to_value(payload) {
                map.insert(key.clone(), value);
            }
        }
        if let Ok(Value::Object(history)) = serde_json::to_value(&self.history) {
            map.extend(history);
        }
        map
    }
}

impl Serialize for ConsultationRecord {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.to_map().serialize(serializer)
    }
}
