use crate::error::ProxyError;

/// Inbound bearer-key check. An empty key list leaves the proxy open, the
/// usual setup for a localhost-only tool.
#[derive(Debug, Clone, Default)]
pub struct ApiKeyAuth {
    keys: Vec<String>,
}

impl ApiKeyAuth {
    pub fn new(keys: Vec<String>) -> Self {
        Self {
            keys: keys.into_iter().filter(|key| !key.is_empty()).collect(),
        }
    }

    pub fn check(&self, authorization: Option<&str>) -> Result<(), ProxyError> {
        if self.keys.is_empty() {
            return Ok(());
        }
        let presented = authorization
            .and_then(|value| value.strip_prefix("Bearer "))
            .map(str::trim);
        match presented {
            Some(key) if self.keys.iter().any(|known| known == key) => Ok(()),
            _ => Err(ProxyError::unauthorized()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_key_list_is_open() {
        let auth = ApiKeyAuth::new(Vec::new());
        assert!(auth.check(None).is_ok());
        assert!(auth.check(Some("Bearer whatever")).is_ok());
    }

    #[test]
    fn configured_keys_are_enforced() {
        let auth = ApiKeyAuth::new(vec!["sk-local".to_string()]);
        assert!(auth.check(Some("Bearer sk-local")).is_ok());
        assert!(auth.check(Some("Bearer wrong")).is_err());
        assert!(auth.check(Some("sk-local")).is_err());
        assert!(auth.check(None).is_err());
    }
}
