/// Optional parameters threaded into the composer.
///
/// The only recognised option is the quota-key override for the per-API
/// rate-limit stage; anything else is ignored.
#[derive(Debug, Clone)]
#[non_exhaustive]
pub enum ChainOption {
    QuotaKey(String),
}

/// Resolved option set.
#[derive(Debug, Clone, Default)]
pub struct ComposeOptions {
    pub quota_key: String,
}

impl ComposeOptions {
    pub fn from_slice(opts: &[ChainOption]) -> Self {
        let mut resolved = Self::default();
        for opt in opts {
            #[allow(unreachable_patterns)]
            match opt {
                ChainOption::QuotaKey(key) => resolved.quota_key = key.clone(),
                _ => {}
            }
        }
        resolved
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_quota_key_is_empty() {
        let resolved = ComposeOptions::from_slice(&[]);
        assert_eq!(resolved.quota_key, "");
    }

    #[test]
    fn test_quota_key_applies_last_wins() {
        let resolved = ComposeOptions::from_slice(&[
            ChainOption::QuotaKey("first".into()),
            ChainOption::QuotaKey("second".into()),
        ]);
        assert_eq!(resolved.quota_key, "second");
    }
}
