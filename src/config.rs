use std::net::Ipv4Addr;
use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;

use crate::error::{ReplayError, Result};
use crate::interceptor::Verdict;
use crate::ip_header::FingerprintOrder;

pub const DEFAULT_CONTROL_SOCKET: &str = "/run/nfq_replay/prediction.sock";

/// What happens to packets still held when the run stops.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum TeardownPolicy {
    #[default]
    Accept,
    Drop,
}

impl TeardownPolicy {
    pub fn verdict(self) -> Verdict {
        match self {
            TeardownPolicy::Accept => Verdict::Accept,
            TeardownPolicy::Drop => Verdict::Drop,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReleaserConfig {
    /// Sleep when nothing is waiting on a deadline.
    pub idle_sleep: Duration,
    /// Upper bound on any single sleep.
    pub max_sleep: Duration,
    /// Release a head entry unconditionally once it has been held this long.
    pub max_hold: Option<Duration>,
}

impl Default for ReleaserConfig {
    fn default() -> Self {
        Self {
            idle_sleep: Duration::from_millis(2),
            max_sleep: Duration::from_millis(1000),
            max_hold: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ReplayConfig {
    pub target: Ipv4Addr,
    pub queue_num: u16,
    pub queue_max_len: u32,
    pub control_socket: PathBuf,
    pub fingerprint_order: FingerprintOrder,
    pub teardown: TeardownPolicy,
    pub releaser: ReleaserConfig,
}

// ==========================================
// TOML input, every field optional
// ==========================================
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ReplayConfigInput {
    pub target: Option<Ipv4Addr>,
    pub queue_num: Option<u16>,
    pub queue_max_len: Option<u32>,
    pub control_socket: Option<PathBuf>,
    pub fingerprint_order: Option<FingerprintOrder>,
    pub teardown: Option<TeardownPolicy>,
    pub releaser: ReleaserConfigInput,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ReleaserConfigInput {
    pub idle_sleep_ms: Option<u64>,
    pub max_sleep_ms: Option<u64>,
    pub max_hold_ms: Option<u64>,
}

impl ReplayConfigInput {
    pub fn from_toml_str(input: &str) -> Result<Self> {
        if input.trim().is_empty() {
            return Ok(Self::default());
        }
        toml::from_str(input).map_err(|e| ReplayError::Config(format!("invalid TOML: {e}")))
    }

    pub fn resolve(self) -> Result<ReplayConfig> {
        let target = self
            .target
            .ok_or_else(|| ReplayError::Config("no target address given".into()))?;
        if target.is_unspecified() {
            return Err(ReplayError::Config(format!("unusable target address {target}")));
        }

        let defaults = ReleaserConfig::default();
        let releaser = ReleaserConfig {
            idle_sleep: self
                .releaser
                .idle_sleep_ms
                .map_or(defaults.idle_sleep, Duration::from_millis),
            max_sleep: self
                .releaser
                .max_sleep_ms
                .map_or(defaults.max_sleep, Duration::from_millis),
            max_hold: self.releaser.max_hold_ms.map(Duration::from_millis),
        };
        if releaser.max_sleep.is_zero() {
            return Err(ReplayError::Config("max_sleep_ms must be positive".into()));
        }
        if releaser.idle_sleep > releaser.max_sleep {
            return Err(ReplayError::Config(
                "idle_sleep_ms must not exceed max_sleep_ms".into(),
            ));
        }

        Ok(ReplayConfig {
            target,
            queue_num: self.queue_num.unwrap_or(0),
            queue_max_len: self.queue_max_len.unwrap_or(10000),
            control_socket: self
                .control_socket
                .unwrap_or_else(|| PathBuf::from(DEFAULT_CONTROL_SOCKET)),
            fingerprint_order: self.fingerprint_order.unwrap_or_default(),
            teardown: self.teardown.unwrap_or_default(),
            releaser,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_full_toml() {
        let input = r#"
            target = "192.168.10.101"
            queue_num = 3
            fingerprint_order = "native"
            teardown = "drop"

            [releaser]
            idle_sleep_ms = 5
            max_sleep_ms = 250
            max_hold_ms = 30000
        "#;
        let cfg = ReplayConfigInput::from_toml_str(input).unwrap().resolve().unwrap();
        assert_eq!(cfg.target, Ipv4Addr::new(192, 168, 10, 101));
        assert_eq!(cfg.queue_num, 3);
        assert_eq!(cfg.queue_max_len, 10000);
        assert_eq!(cfg.fingerprint_order, FingerprintOrder::Native);
        assert_eq!(cfg.teardown, TeardownPolicy::Drop);
        assert_eq!(cfg.releaser.idle_sleep, Duration::from_millis(5));
        assert_eq!(cfg.releaser.max_sleep, Duration::from_millis(250));
        assert_eq!(cfg.releaser.max_hold, Some(Duration::from_secs(30)));
    }

    #[test]
    fn defaults_apply_when_omitted() {
        let input = ReplayConfigInput {
            target: Some(Ipv4Addr::new(10, 0, 0, 2)),
            ..Default::default()
        };
        let cfg = input.resolve().unwrap();
        assert_eq!(cfg.releaser, ReleaserConfig::default());
        assert_eq!(cfg.teardown, TeardownPolicy::Accept);
        assert_eq!(cfg.fingerprint_order, FingerprintOrder::Network);
        assert_eq!(cfg.control_socket, PathBuf::from(DEFAULT_CONTROL_SOCKET));
    }

    #[test]
    fn rejects_missing_or_unspecified_target() {
        assert!(ReplayConfigInput::from_toml_str("").unwrap().resolve().is_err());
        let zero = ReplayConfigInput::from_toml_str("target = \"0.0.0.0\"").unwrap();
        assert!(matches!(zero.resolve(), Err(ReplayError::Config(_))));
        assert!(ReplayConfigInput::from_toml_str("target = \"300.1.1.1\"").is_err());
    }

    #[test]
    fn rejects_inverted_sleep_bounds() {
        let input = r#"
            target = "10.0.0.2"
            [releaser]
            idle_sleep_ms = 50
            max_sleep_ms = 10
        "#;
        assert!(ReplayConfigInput::from_toml_str(input).unwrap().resolve().is_err());
    }
}
