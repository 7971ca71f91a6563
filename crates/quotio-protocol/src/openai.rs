use serde::{Deserialize, Serialize};
use serde_json::Value;

/// The envelope fields the dispatcher reads out of an inbound body.
///
/// The payload itself stays opaque: executors receive the original bytes and
/// the target provider decides what to do with the rest of the document.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ChatEnvelope {
    #[serde(default)]
    pub model: String,
    #[serde(default)]
    pub stream: bool,
}

impl ChatEnvelope {
    pub fn from_slice(body: &[u8]) -> Option<Self> {
        serde_json::from_slice(body).ok()
    }
}

/// Rewrite the `model` field of an otherwise-opaque JSON body.
///
/// Fallback entries map a virtual model name to per-provider model ids; the
/// forwarded payload has to carry the provider's id, not the alias.
pub fn rewrite_model(body: &[u8], model: &str) -> Option<Vec<u8>> {
    let mut value: Value = serde_json::from_slice(body).ok()?;
    let object = value.as_object_mut()?;
    object.insert("model".to_string(), Value::String(model.to_string()));
    serde_json::to_vec(&value).ok()
}

/// OpenAI-style error body, used for every locally-generated failure.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorBody {
    pub error: ErrorDetail,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorDetail {
    pub code: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub provider: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reset_time: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reset_seconds: Option<i64>,
}

impl ErrorBody {
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            error: ErrorDetail {
                code: code.into(),
                message: message.into(),
                model: None,
                provider: None,
                reset_time: None,
                reset_seconds: None,
            },
        }
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        serde_json::to_vec(self).unwrap_or_else(|_| b"{\"error\":{}}".to_vec())
    }
}

/// `GET /v1/models` response shapes.
#[derive(Debug, Clone, Serialize)]
pub struct ModelList {
    pub object: &'static str,
    pub data: Vec<ModelEntry>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ModelEntry {
    pub id: String,
    pub object: &'static str,
    pub owned_by: String,
}

impl ModelList {
    pub fn new(entries: Vec<ModelEntry>) -> Self {
        Self {
            object: "list",
            data: entries,
        }
    }
}

impl ModelEntry {
    pub fn new(id: impl Into<String>, owned_by: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            object: "model",
            owned_by: owned_by.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn envelope_reads_model_and_stream() {
        let body = br#"{"model":"claude-opus","stream":true,"messages":[]}"#;
        let envelope = ChatEnvelope::from_slice(body).unwrap();
        assert_eq!(envelope.model, "claude-opus");
        assert!(envelope.stream);
    }

    #[test]
    fn envelope_defaults_missing_fields() {
        let envelope = ChatEnvelope::from_slice(br#"{"messages":[]}"#).unwrap();
        assert_eq!(envelope.model, "");
        assert!(!envelope.stream);
    }

    #[test]
    fn rewrite_model_preserves_other_fields() {
        let body = br#"{"model":"quotio-opus","stream":false,"max_tokens":16}"#;
        let rewritten = rewrite_model(body, "claude-3-opus").unwrap();
        let value: Value = serde_json::from_slice(&rewritten).unwrap();
        assert_eq!(value["model"], "claude-3-opus");
        assert_eq!(value["max_tokens"], 16);
    }
}
