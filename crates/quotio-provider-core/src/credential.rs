use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use time::{Duration, OffsetDateTime};

/// Provider tags are compared in lower-case trimmed form everywhere.
pub fn normalize_provider(provider: &str) -> String {
    provider.trim().to_ascii_lowercase()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuthStatus {
    Ready,
    Error,
    Pending,
    Disabled,
}

fn default_status() -> AuthStatus {
    AuthStatus::Ready
}

fn default_updated_at() -> OffsetDateTime {
    OffsetDateTime::UNIX_EPOCH
}

/// Persisted identity for one account with one provider.
///
/// The on-disk schema is exactly this struct; identity-acquisition flows
/// (OAuth, device code) live outside the proxy and hand finished records to
/// the store.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoredCredential {
    pub id: String,
    pub provider: String,
    #[serde(default)]
    pub disabled: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub access_token: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refresh_token: Option<String>,
    #[serde(
        default,
        with = "time::serde::timestamp::option",
        skip_serializing_if = "Option::is_none"
    )]
    pub expires_at: Option<OffsetDateTime>,
    /// Free-form provider-specific fields. Recognised keys: `api_key`,
    /// `base_url`, `priority`.
    #[serde(default)]
    pub token_data: Map<String, Value>,
    #[serde(default = "default_status")]
    pub status: AuthStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status_message: Option<String>,
    #[serde(default = "default_updated_at", with = "time::serde::timestamp")]
    pub updated_at: OffsetDateTime,
}

impl StoredCredential {
    pub fn new(id: impl Into<String>, provider: &str) -> Self {
        Self {
            id: id.into(),
            provider: normalize_provider(provider),
            disabled: false,
            access_token: None,
            refresh_token: None,
            expires_at: None,
            token_data: Map::new(),
            status: AuthStatus::Ready,
            status_message: None,
            updated_at: OffsetDateTime::now_utc(),
        }
    }

    pub fn normalized_provider(&self) -> String {
        normalize_provider(&self.provider)
    }

    pub fn api_key(&self) -> Option<&str> {
        self.token_data
            .get("api_key")
            .and_then(Value::as_str)
            .filter(|key| !key.is_empty())
    }

    pub fn base_url(&self) -> Option<&str> {
        self.token_data
            .get("base_url")
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|url| !url.is_empty())
    }

    /// Selector priority; higher wins. Integers, integral floats, and base-10
    /// strings are accepted, anything else falls back to 0.
    pub fn priority(&self) -> i64 {
        match self.token_data.get("priority") {
            Some(Value::Number(number)) => number
                .as_i64()
                .or_else(|| number.as_f64().map(|f| f as i64))
                .unwrap_or(0),
            Some(Value::String(text)) => text.trim().parse::<i64>().unwrap_or(0),
            _ => 0,
        }
    }

    /// Whether the access token expires within `ahead` of `now`.
    pub fn expires_within(&self, now: OffsetDateTime, ahead: Duration) -> bool {
        self.expires_at
            .is_some_and(|expires_at| expires_at <= now + ahead)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn credential_with(key: &str, value: Value) -> StoredCredential {
        let mut cred = StoredCredential::new("a", "claude");
        cred.token_data.insert(key.to_string(), value);
        cred
    }

    #[test]
    fn provider_is_normalized() {
        let cred = StoredCredential::new("a", "  Claude ");
        assert_eq!(cred.provider, "claude");
        assert_eq!(normalize_provider(" GEMINI\t"), "gemini");
    }

    #[test]
    fn priority_tolerates_strings_and_floats() {
        assert_eq!(credential_with("priority", json!(7)).priority(), 7);
        assert_eq!(credential_with("priority", json!("12")).priority(), 12);
        assert_eq!(credential_with("priority", json!(3.0)).priority(), 3);
        assert_eq!(credential_with("priority", json!("oops")).priority(), 0);
        assert_eq!(StoredCredential::new("a", "claude").priority(), 0);
    }

    #[test]
    fn roundtrips_camel_case_schema() {
        let mut cred = StoredCredential::new("acct-1", "claude");
        cred.access_token = Some("at".to_string());
        cred.expires_at = Some(OffsetDateTime::from_unix_timestamp(1_750_000_000).unwrap());
        let raw = serde_json::to_value(&cred).unwrap();
        assert!(raw.get("accessToken").is_some());
        assert_eq!(raw["expiresAt"], json!(1_750_000_000));
        let back: StoredCredential = serde_json::from_value(raw).unwrap();
        assert_eq!(back.id, "acct-1");
        assert_eq!(back.access_token.as_deref(), Some("at"));
    }

    #[test]
    fn expires_within_requires_a_deadline() {
        let now = OffsetDateTime::now_utc();
        let mut cred = StoredCredential::new("a", "claude");
        assert!(!cred.expires_within(now, Duration::seconds(60)));
        cred.expires_at = Some(now + Duration::seconds(30));
        assert!(cred.expires_within(now, Duration::seconds(60)));
        cred.expires_at = Some(now + Duration::seconds(120));
        assert!(!cred.expires_within(now, Duration::seconds(60)));
    }
}
