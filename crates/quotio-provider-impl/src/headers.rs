use quotio_provider_core::{ExecuteError, StoredCredential};

pub type HeaderList = Vec<(String, String)>;

pub fn set_header(headers: &mut HeaderList, name: &str, value: &str) {
    let lower = name.to_ascii_lowercase();
    headers.retain(|(existing, _)| *existing != lower);
    headers.push((lower, value.to_string()));
}

pub fn set_json_headers(headers: &mut HeaderList) {
    set_header(headers, "content-type", "application/json");
    set_header(headers, "accept", "application/json");
}

pub fn set_bearer(headers: &mut HeaderList, token: &str) {
    set_header(headers, "authorization", &format!("Bearer {token}"));
}

/// Join a base URL and a path, tolerating bases that already end in `/v1`.
pub fn build_url(base_url: Option<&str>, default_base: &str, path: &str) -> String {
    let base = base_url.unwrap_or(default_base).trim_end_matches('/');
    let mut path = path.trim_start_matches('/');
    if base.ends_with("/v1") && (path == "v1" || path.starts_with("v1/")) {
        path = path.trim_start_matches("v1/").trim_start_matches("v1");
    }
    format!("{base}/{path}")
}

/// The bearer token for providers that accept either an API key or an OAuth
/// access token.
pub fn bearer_token(auth: &StoredCredential) -> Result<&str, ExecuteError> {
    auth.api_key()
        .or(auth.access_token.as_deref())
        .filter(|token| !token.is_empty())
        .ok_or_else(|| {
            ExecuteError::status_error(401, "credential carries no usable token", Vec::new())
        })
}
