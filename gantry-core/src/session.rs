use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Token-holder state as persisted in the session store.
///
/// The identity stages read this after authentication; the rate-limit
/// side-chain reports the live counters back to the caller.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SessionState {
    /// Key identifier (raw or hashed, depending on gateway config).
    #[serde(default)]
    pub key_id: String,

    #[serde(default)]
    pub org_id: String,

    /// Allowance per window.
    #[serde(default)]
    pub rate: f64,

    /// Window length in seconds.
    #[serde(default)]
    pub per: f64,

    #[serde(default)]
    pub quota_max: i64,

    #[serde(default)]
    pub quota_remaining: i64,

    /// Unix timestamp the quota window renews at.
    #[serde(default)]
    pub quota_renews: i64,

    /// Unix timestamp the key expires at (0 = never).
    #[serde(default)]
    pub expires: i64,

    /// `api_id` → access grant.
    #[serde(default)]
    pub access_rights: HashMap<String, AccessGrant>,

    #[serde(default)]
    pub basic_auth_hash: Option<String>,

    /// Shared secret for HTTP-signature verification.
    #[serde(default)]
    pub hmac_secret: String,

    #[serde(default)]
    pub tags: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AccessGrant {
    #[serde(default)]
    pub api_id: String,

    #[serde(default)]
    pub api_name: String,

    /// Versions this key may call (empty = all).
    #[serde(default)]
    pub versions: Vec<String>,

    /// Granular URL grants (empty = whole API).
    #[serde(default)]
    pub allowed_urls: Vec<AllowedUrl>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AllowedUrl {
    #[serde(default)]
    pub url: String,

    #[serde(default)]
    pub methods: Vec<String>,
}

impl SessionState {
    /// Whether the key is past its expiry.
    pub fn is_expired(&self, now_unix: i64) -> bool {
        self.expires > 0 && self.expires < now_unix
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_expiry() {
        let mut s = SessionState::default();
        assert!(!s.is_expired(1_000));
        s.expires = 500;
        assert!(s.is_expired(1_000));
        s.expires = 2_000;
        assert!(!s.is_expired(1_000));
    }

    #[test]
    fn test_roundtrip() {
        let mut s = SessionState::default();
        s.key_id = "abc".into();
        s.access_rights.insert(
            "api1".into(),
            AccessGrant {
                api_id: "api1".into(),
                ..Default::default()
            },
        );
        let json = serde_json::to_string(&s).unwrap();
        let back: SessionState = serde_json::from_str(&json).unwrap();
        assert_eq!(back.key_id, "abc");
        assert!(back.access_rights.contains_key("api1"));
    }
}
