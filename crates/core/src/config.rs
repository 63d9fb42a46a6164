//! Engine knobs, read from `KMAN_*` environment variables.

use serde::{Deserialize, Serialize};
use std::time::Duration;

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|s| s.trim().parse::<T>().ok())
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Field manager recorded on every write.
    pub field_manager: String,
    /// Namespace used for namespaced kinds when the manifest names none.
    pub default_namespace: String,
    /// Rediscovery attempts after a mapping miss before giving up.
    pub mapping_retries: u32,
    /// Base backoff between rediscovery attempts; doubled on each attempt.
    pub mapping_backoff_ms: u64,
    /// Re-read and re-diff attempts after an update conflict.
    pub conflict_retries: u32,
    pub max_manifest_bytes: usize,
    pub max_manifest_nodes: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            field_manager: "kman".to_string(),
            default_namespace: "default".to_string(),
            mapping_retries: 3,
            mapping_backoff_ms: 200,
            conflict_retries: 5,
            max_manifest_bytes: 1 << 20,
            max_manifest_nodes: 100_000,
        }
    }
}

impl EngineConfig {
    /// Defaults overridden by any parsable `KMAN_*` variable.
    pub fn from_env() -> Self {
        let d = Self::default();
        Self {
            field_manager: std::env::var("KMAN_FIELD_MANAGER").ok().filter(|s| !s.is_empty()).unwrap_or(d.field_manager),
            default_namespace: std::env::var("KMAN_DEFAULT_NAMESPACE").ok().filter(|s| !s.is_empty()).unwrap_or(d.default_namespace),
            mapping_retries: env_parse("KMAN_MAPPING_RETRIES").unwrap_or(d.mapping_retries),
            mapping_backoff_ms: env_parse("KMAN_MAPPING_BACKOFF_MS").unwrap_or(d.mapping_backoff_ms),
            conflict_retries: env_parse("KMAN_CONFLICT_RETRIES").unwrap_or(d.conflict_retries),
            max_manifest_bytes: env_parse("KMAN_MAX_MANIFEST_BYTES").unwrap_or(d.max_manifest_bytes),
            max_manifest_nodes: env_parse("KMAN_MAX_MANIFEST_NODES").unwrap_or(d.max_manifest_nodes),
        }
    }

    /// Backoff before rediscovery attempt `attempt` (0-based).
    pub fn mapping_backoff(&self, attempt: u32) -> Duration {
        let factor = 1u64 << attempt.min(16);
        Duration::from_millis(self.mapping_backoff_ms.saturating_mul(factor))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles() {
        let cfg = EngineConfig { mapping_backoff_ms: 100, ..Default::default() };
        assert_eq!(cfg.mapping_backoff(0), Duration::from_millis(100));
        assert_eq!(cfg.mapping_backoff(1), Duration::from_millis(200));
        assert_eq!(cfg.mapping_backoff(3), Duration::from_millis(800));
    }

    #[test]
    fn zero_backoff_stays_zero() {
        let cfg = EngineConfig { mapping_backoff_ms: 0, ..Default::default() };
        assert_eq!(cfg.mapping_backoff(5), Duration::ZERO);
    }
}
