//! Per-key configuration structures.

use secrecy::SecretString;
use serde::Deserialize;

/// Configuration for a single managed key.
///
/// Immutable once registered with a pool. The secret `value` is what the
/// caller's request function receives; it never appears in logs or stats.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct KeyConfig {
    /// Unique identifier for this key. Used in logs, stats and storage
    /// records; safe to expose.
    pub id: String,

    /// The secret credential handed to the caller's request function.
    pub value: SecretString,

    /// Quota applied to this key.
    pub quota: QuotaConfig,

    /// Requests per second. Acts as both the token refill rate and the
    /// bucket capacity. Keys without a rate are never rate limited locally.
    #[serde(default)]
    pub rps: Option<f64>,

    /// Round-robin weight. A key with weight 2 is selected twice as often
    /// as a key with weight 1.
    #[serde(default = "default_weight")]
    pub weight: u32,
}

fn default_weight() -> u32 {
    1
}

impl KeyConfig {
    /// Create a key configuration with the given id and secret value,
    /// unlimited quota, no rate limit and weight 1.
    pub fn new(id: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            value: SecretString::from(value.into()),
            quota: QuotaConfig::Unlimited,
            rps: None,
            weight: default_weight(),
        }
    }

    /// Set the quota.
    pub fn with_quota(mut self, quota: QuotaConfig) -> Self {
        self.quota = quota;
        self
    }

    /// Set the requests-per-second rate.
    pub fn with_rps(mut self, rps: f64) -> Self {
        self.rps = Some(rps);
        self
    }

    /// Set the round-robin weight.
    pub fn with_weight(mut self, weight: u32) -> Self {
        self.weight = weight;
        self
    }

    /// Validate this configuration.
    ///
    /// Returns the reason a pool must refuse the key, if any.
    pub fn validate(&self) -> Result<(), String> {
        use secrecy::ExposeSecret;

        if self.id.is_empty() {
            return Err("key id must not be empty".to_string());
        }

        if self.value.expose_secret().is_empty() {
            return Err("key value must not be empty".to_string());
        }

        if let Some(rps) = self.rps {
            if !rps.is_finite() || rps <= 0.0 {
                return Err(format!("rps must be a positive number, got {rps}"));
            }
        }

        if self.weight == 0 {
            return Err("weight must be a positive integer".to_string());
        }

        if let Some(limit) = self.quota.limit() {
            if limit == 0 {
                return Err("quota limit must be a positive integer".to_string());
            }
        }

        Ok(())
    }
}

/// Quota configuration for a key.
///
/// Bounded quotas accumulate usage over a period; `monthly` and `yearly`
/// roll over on UTC calendar boundaries, `total` never resets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(tag = "period", rename_all = "lowercase")]
pub enum QuotaConfig {
    /// Usage resets when the UTC calendar month changes.
    Monthly {
        /// Maximum number of requests per month.
        limit: u64,
    },
    /// Usage resets when the UTC calendar year changes.
    Yearly {
        /// Maximum number of requests per year.
        limit: u64,
    },
    /// A lifetime cap that never resets.
    Total {
        /// Maximum number of requests, ever.
        limit: u64,
    },
    /// No quota; the key is never exhausted.
    Unlimited,
}

impl QuotaConfig {
    /// The configured limit, or `None` for unlimited quotas.
    pub fn limit(&self) -> Option<u64> {
        match self {
            Self::Monthly { limit } | Self::Yearly { limit } | Self::Total { limit } => Some(*limit),
            Self::Unlimited => None,
        }
    }

    /// Whether this quota never exhausts.
    pub fn is_unlimited(&self) -> bool {
        matches!(self, Self::Unlimited)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_weight_is_one() {
        let key: KeyConfig = toml::from_str(
            r#"
            id = "k"
            value = "secret"
            quota = { period = "total", limit = 100 }
            "#,
        )
        .unwrap();

        assert_eq!(key.weight, 1);
        assert_eq!(key.quota.limit(), Some(100));
    }

    #[test]
    fn builder_produces_valid_key() {
        let key = KeyConfig::new("k", "secret")
            .with_quota(QuotaConfig::Monthly { limit: 10 })
            .with_rps(5.0)
            .with_weight(3);

        assert!(key.validate().is_ok());
        assert_eq!(key.rps, Some(5.0));
        assert_eq!(key.weight, 3);
    }

    #[test]
    fn empty_id_is_rejected() {
        let key = KeyConfig::new("", "secret");
        assert_eq!(key.validate(), Err("key id must not be empty".to_string()));
    }

    #[test]
    fn empty_value_is_rejected() {
        let key = KeyConfig::new("k", "");
        assert!(key.validate().is_err());
    }

    #[test]
    fn non_positive_rps_is_rejected() {
        assert!(KeyConfig::new("k", "v").with_rps(0.0).validate().is_err());
        assert!(KeyConfig::new("k", "v").with_rps(-1.0).validate().is_err());
        assert!(KeyConfig::new("k", "v").with_rps(f64::NAN).validate().is_err());
    }

    #[test]
    fn zero_weight_is_rejected() {
        assert!(KeyConfig::new("k", "v").with_weight(0).validate().is_err());
    }

    #[test]
    fn zero_quota_limit_is_rejected() {
        let key = KeyConfig::new("k", "v").with_quota(QuotaConfig::Total { limit: 0 });
        assert!(key.validate().is_err());
    }

    #[test]
    fn unlimited_quota_has_no_limit() {
        assert_eq!(QuotaConfig::Unlimited.limit(), None);
        assert!(QuotaConfig::Unlimited.is_unlimited());
        assert!(!QuotaConfig::Yearly { limit: 5 }.is_unlimited());
    }
}
