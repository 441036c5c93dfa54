use std::collections::BTreeMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::cache::CachePolicy;
use crate::error::Error;
use crate::retry::RetryPolicy;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClientProfile {
    #[default]
    StandardSdk,
    LowLatency,
    HighThroughput,
}

#[derive(Clone, Debug)]
pub struct ProfileDefaults {
    pub request_timeout: Duration,
    pub connect_timeout: Duration,
    pub retry_policy: RetryPolicy,
}

impl ClientProfile {
    pub fn defaults(self) -> ProfileDefaults {
        match self {
            Self::StandardSdk => ProfileDefaults {
                request_timeout: Duration::from_secs(10),
                connect_timeout: Duration::from_secs(3),
                retry_policy: RetryPolicy::standard(),
            },
            Self::LowLatency => ProfileDefaults {
                request_timeout: Duration::from_secs(2),
                connect_timeout: Duration::from_millis(500),
                retry_policy: RetryPolicy::standard()
                    .max_retries(1)
                    .base_backoff(Duration::from_millis(50))
                    .max_backoff(Duration::from_millis(300)),
            },
            Self::HighThroughput => ProfileDefaults {
                request_timeout: Duration::from_secs(20),
                connect_timeout: Duration::from_secs(5),
                retry_policy: RetryPolicy::standard()
                    .max_retries(3)
                    .base_backoff(Duration::from_millis(150))
                    .max_backoff(Duration::from_secs(3)),
            },
        }
    }
}

/// Retry overrides layered on top of the profile's policy.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RetryConfig {
    pub max_retries: Option<usize>,
    pub base_backoff_ms: Option<u64>,
    pub max_backoff_ms: Option<u64>,
    pub max_retry_after_ms: Option<u64>,
    pub jitter: Option<bool>,
}

impl RetryConfig {
    pub fn apply(&self, mut policy: RetryPolicy) -> RetryPolicy {
        if let Some(max_retries) = self.max_retries {
            policy = policy.max_retries(max_retries);
        }
        if let Some(base_backoff_ms) = self.base_backoff_ms {
            policy = policy.base_backoff(Duration::from_millis(base_backoff_ms));
        }
        if let Some(max_backoff_ms) = self.max_backoff_ms {
            policy = policy.max_backoff(Duration::from_millis(max_backoff_ms));
        }
        if let Some(max_retry_after_ms) = self.max_retry_after_ms {
            policy = policy.max_retry_after(Duration::from_millis(max_retry_after_ms));
        }
        if let Some(jitter) = self.jitter {
            policy = policy.jitter(jitter);
        }
        policy
    }
}

/// Declarative client settings, applied with `ClientBuilder::config`.
///
/// Durations are whole milliseconds. Every field is optional; anything left
/// unset keeps the builder's current value.
///
/// ```
/// let config = callflow::ClientConfig::from_json(r#"{
///     "profile": "low_latency",
///     "request_timeout_ms": 1500,
///     "cache": { "mode": "etag_or_ttl", "ttl_secs": 30 },
///     "retry": { "max_retries": 4 },
///     "default_headers": { "accept": "application/json" }
/// }"#).unwrap();
/// assert_eq!(config.request_timeout(), Some(std::time::Duration::from_millis(1500)));
/// ```
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ClientConfig {
    pub profile: Option<ClientProfile>,
    pub request_timeout_ms: Option<u64>,
    pub connect_timeout_ms: Option<u64>,
    pub cache: Option<CachePolicy>,
    pub retry: Option<RetryConfig>,
    pub default_headers: BTreeMap<String, String>,
    pub sensitive_keys: Option<Vec<String>>,
}

impl ClientConfig {
    pub fn from_json(text: &str) -> Result<Self, Error> {
        serde_json::from_str(text)
            .map_err(|source| Error::invalid_request(format!("invalid client config: {source}")))
    }

    pub fn request_timeout(&self) -> Option<Duration> {
        self.request_timeout_ms.map(Duration::from_millis)
    }

    pub fn connect_timeout(&self) -> Option<Duration> {
        self.connect_timeout_ms.map(Duration::from_millis)
    }
}
