use std::time::Duration;

use serde::Deserialize;

// the recognized option set. an empty file is a working config, and
// pullthrough cannot be turned off: serving non-managed images is load
// bearing for every cluster this fronts
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub auth: AuthConfig,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub quota: QuotaConfig,
    #[serde(default)]
    pub pullthrough: PullthroughConfig,
    #[serde(default)]
    pub compatibility: CompatibilityConfig,
    #[serde(default)]
    pub requests: RequestsConfig,
    #[serde(default)]
    pub metrics: MetricsConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ServerConfig {
    #[serde(default = "default_addr")]
    pub addr: String,
    // the address clients reach us at, used to refuse pullthrough recursion
    // and to build display references for managed images
    #[serde(default)]
    pub advertised_addr: String,
    // "host:port" dns name resolving to every registry replica, for
    // best-effort delete propagation. empty disables propagation
    #[serde(default)]
    pub sibling_service: String,
    // this replica's own address, so propagation can skip itself
    #[serde(default)]
    pub pod_addr: String,
    // docker config on the node consulted after pod secrets
    #[serde(default)]
    pub node_credentials_path: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AuthConfig {
    #[serde(default)]
    pub realm: String,
    #[serde(default)]
    pub token_realm: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CacheConfig {
    #[serde(default)]
    pub disabled: bool,
    #[serde(default = "default_blob_repository_ttl")]
    pub blob_repository_ttl_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct QuotaConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_quota_cache_ttl")]
    pub cache_ttl_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PullthroughConfig {
    // parsed for compatibility and forced on in validate()
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub mirror: bool,
    // one insecure tag marks the whole registry insecure. the original
    // behavior, deliberately kept behind a flag
    #[serde(default = "default_true")]
    pub insecure_covers_registry: bool,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CompatibilityConfig {
    #[serde(default)]
    pub accept_schema2: bool,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RequestsConfig {
    #[serde(default)]
    pub read: LimitConfig,
    #[serde(default)]
    pub write: LimitConfig,
}

// zero max_running disables the limiter for that class
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LimitConfig {
    #[serde(default)]
    pub max_running: usize,
    #[serde(default)]
    pub max_in_queue: usize,
    #[serde(default = "default_max_wait")]
    pub max_wait_in_queue_secs: u64,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MetricsConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub secret: String,
}

fn default_addr() -> String {
    ":5000".to_string()
}

fn default_blob_repository_ttl() -> u64 {
    10 * 60
}

fn default_quota_cache_ttl() -> u64 {
    60
}

fn default_max_wait() -> u64 {
    15
}

fn default_true() -> bool {
    true
}

impl Default for ServerConfig {
    fn default() -> Self {
        serde_json::from_str("{}").unwrap()
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        serde_json::from_str("{}").unwrap()
    }
}

impl Default for QuotaConfig {
    fn default() -> Self {
        serde_json::from_str("{}").unwrap()
    }
}

impl Default for PullthroughConfig {
    fn default() -> Self {
        serde_json::from_str("{}").unwrap()
    }
}

impl Config {
    pub fn from_json(data: &str) -> Result<Self, serde_json::Error> {
        let mut config: Config = serde_json::from_str(data)?;
        config.validate();
        Ok(config)
    }

    pub fn validate(&mut self) {
        if !self.pullthrough.enabled {
            log::warn!("pullthrough cannot be disabled, forcing it on");
            self.pullthrough.enabled = true;
        }
    }

    pub fn blob_repository_ttl(&self) -> Duration {
        if self.cache.disabled {
            Duration::ZERO
        } else {
            Duration::from_secs(self.cache.blob_repository_ttl_secs)
        }
    }
}

impl LimitConfig {
    pub fn max_wait(&self) -> Duration {
        Duration::from_secs(self.max_wait_in_queue_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_config_works() {
        let config = Config::from_json("{}").unwrap();
        assert!(config.pullthrough.enabled);
        assert_eq!(config.server.addr, ":5000");
        assert_eq!(config.blob_repository_ttl(), Duration::from_secs(600));
    }

    #[test]
    fn test_pullthrough_forced_on() {
        let config = Config::from_json(r#"{"pullthrough":{"enabled":false}}"#).unwrap();
        assert!(config.pullthrough.enabled);
    }

    #[test]
    fn test_disabled_cache_has_zero_ttl() {
        let config = Config::from_json(r#"{"cache":{"disabled":true}}"#).unwrap();
        assert_eq!(config.blob_repository_ttl(), Duration::ZERO);
    }

    #[test]
    fn test_unknown_fields_rejected() {
        assert!(Config::from_json(r#"{"bogus":{}}"#).is_err());
    }
}
