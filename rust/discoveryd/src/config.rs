//! Service configuration.
//!
//! Everything the engine needs is carried in one immutable [`Config`]
//! passed to each component at construction: credential lists, version
//! preference, network timeouts, poller identity, and storage paths.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::device::{SnmpVersion, V3Auth};

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub snmp: SnmpConfig,
    #[serde(default)]
    pub discovery: DiscoveryConfig,
    #[serde(default)]
    pub poller: PollerConfig,
    #[serde(default)]
    pub rrd: RrdConfig,
    #[serde(default)]
    pub repository: RepositoryConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnmpConfig {
    /// Communities tried in order for v1/v2c.
    #[serde(default = "default_communities")]
    pub communities: Vec<String>,
    /// v3 credential sets tried in order.
    #[serde(default)]
    pub v3: Vec<V3Auth>,
    /// Version tried first when the caller does not pin one.
    #[serde(default = "default_version")]
    pub default_version: SnmpVersion,
    #[serde(default = "default_snmp_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_snmp_retries")]
    pub retries: u8,
    /// Redact credentials in progress messages and logs.
    #[serde(default)]
    pub hide_auth: bool,
    /// Use net-snmp command-line tools instead of the in-process client.
    /// Required for SNMPv3 targets.
    #[serde(default)]
    pub use_netsnmp: bool,
}

impl Default for SnmpConfig {
    fn default() -> Self {
        SnmpConfig {
            communities: default_communities(),
            v3: Vec::new(),
            default_version: default_version(),
            timeout_secs: default_snmp_timeout_secs(),
            retries: default_snmp_retries(),
            hide_auth: false,
            use_netsnmp: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiscoveryConfig {
    /// Extra OS definition documents are loaded from here, after the
    /// embedded corpus.
    #[serde(default)]
    pub definitions_dir: Option<PathBuf>,
    /// Minimum matching system OIDs before a duplicate verdict without a
    /// serial number is decisive.
    #[serde(default = "default_oid_match_min")]
    pub oid_match_min: usize,
    /// Reject literal-IP hostnames; require a resolvable FQDN.
    #[serde(default)]
    pub require_hostname: bool,
    /// Queue a full discovery pass right after adding a local device.
    #[serde(default = "default_true")]
    pub discover_on_add: bool,
    #[serde(default = "default_ping_timeout_ms")]
    pub ping_timeout_ms: u64,
    #[serde(default = "default_ping_retries")]
    pub ping_retries: u8,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        DiscoveryConfig {
            definitions_dir: None,
            oid_match_min: default_oid_match_min(),
            require_hostname: false,
            discover_on_add: default_true(),
            ping_timeout_ms: default_ping_timeout_ms(),
            ping_retries: default_ping_retries(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct PollerConfig {
    /// Identifier of the poller executing this process. Devices added for
    /// another poller are queued, not probed.
    #[serde(default)]
    pub id: i64,
    #[serde(default)]
    pub name: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RrdConfig {
    #[serde(default = "default_rrd_dir")]
    pub dir: PathBuf,
    /// Skip the "directory already exists" conflict check.
    #[serde(default)]
    pub ignore_existing: bool,
}

impl Default for RrdConfig {
    fn default() -> Self {
        RrdConfig {
            dir: default_rrd_dir(),
            ignore_existing: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RepositoryConfig {
    #[serde(default = "default_state_path")]
    pub path: PathBuf,
    /// Bound on the device lookup cache.
    #[serde(default = "default_cache_size")]
    pub cache_size: usize,
}

impl Default for RepositoryConfig {
    fn default() -> Self {
        RepositoryConfig {
            path: default_state_path(),
            cache_size: default_cache_size(),
        }
    }
}

fn default_communities() -> Vec<String> {
    vec!["public".to_string()]
}

const fn default_version() -> SnmpVersion {
    SnmpVersion::V2c
}

const fn default_snmp_timeout_secs() -> u64 {
    3
}

const fn default_snmp_retries() -> u8 {
    2
}

const fn default_oid_match_min() -> usize {
    2
}

const fn default_true() -> bool {
    true
}

const fn default_ping_timeout_ms() -> u64 {
    2000
}

const fn default_ping_retries() -> u8 {
    2
}

fn default_rrd_dir() -> PathBuf {
    PathBuf::from("/var/lib/discoveryd/rrd")
}

fn default_state_path() -> PathBuf {
    PathBuf::from("/var/lib/discoveryd/devices.json")
}

const fn default_cache_size() -> usize {
    256
}

impl Config {
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(&path).context("Failed to read config file")?;
        let cfg: Config = serde_json::from_str(&content).context("Failed to parse config file")?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<()> {
        if self.snmp.communities.is_empty() && self.snmp.v3.is_empty() {
            anyhow::bail!("at least one community or v3 credential set is required");
        }
        if self.snmp.communities.iter().any(|c| c.is_empty()) {
            anyhow::bail!("communities cannot be empty strings");
        }
        if self.snmp.timeout_secs == 0 {
            anyhow::bail!("snmp.timeout_secs must be greater than zero");
        }
        if self.discovery.ping_timeout_ms == 0 {
            anyhow::bail!("discovery.ping_timeout_ms must be greater than zero");
        }
        if self.discovery.oid_match_min == 0 {
            anyhow::bail!("discovery.oid_match_min must be at least 1");
        }
        Ok(())
    }

    /// Version preference when the caller does not pin one: v2c, v3, v1,
    /// with the configured default always tried first.
    pub fn version_order(&self) -> Vec<SnmpVersion> {
        let mut order = vec![SnmpVersion::V2c, SnmpVersion::V3, SnmpVersion::V1];
        order.retain(|v| *v != self.snmp.default_version);
        order.insert(0, self.snmp.default_version);
        order
    }

    pub fn snmp_timeout(&self) -> Duration {
        Duration::from_secs(self.snmp.timeout_secs)
    }

    pub fn ping_timeout(&self) -> Duration {
        Duration::from_millis(self.discovery.ping_timeout_ms)
    }

    /// RRD directory that would belong to a hostname. The engine only ever
    /// computes this path; it never reads RRD contents.
    pub fn rrd_path(&self, hostname: &str) -> PathBuf {
        self.rrd.dir.join(hostname)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::AuthLevel;

    #[test]
    fn version_order_puts_default_first() {
        let cfg = Config::default();
        assert_eq!(
            cfg.version_order(),
            vec![SnmpVersion::V2c, SnmpVersion::V3, SnmpVersion::V1]
        );

        let mut cfg = Config::default();
        cfg.snmp.default_version = SnmpVersion::V3;
        assert_eq!(
            cfg.version_order(),
            vec![SnmpVersion::V3, SnmpVersion::V2c, SnmpVersion::V1]
        );

        cfg.snmp.default_version = SnmpVersion::V1;
        assert_eq!(
            cfg.version_order(),
            vec![SnmpVersion::V1, SnmpVersion::V2c, SnmpVersion::V3]
        );
    }

    #[test]
    fn parses_config_document() {
        let raw = r#"{
            "snmp": {
                "communities": ["public", "private"],
                "default_version": "v2c",
                "hide_auth": true,
                "v3": [
                    {
                        "auth_level": "authPriv",
                        "auth_name": "observer",
                        "auth_pass": "oldpassword",
                        "auth_algo": "sha",
                        "crypto_pass": "oldciphertext",
                        "crypto_algo": "aes"
                    }
                ]
            },
            "discovery": { "oid_match_min": 3 },
            "poller": { "id": 2, "name": "edge-poller" }
        }"#;
        let cfg: Config = serde_json::from_str(raw).unwrap();
        cfg.validate().unwrap();
        assert_eq!(cfg.snmp.communities.len(), 2);
        assert!(cfg.snmp.hide_auth);
        assert_eq!(cfg.snmp.v3[0].auth_level, AuthLevel::AuthPriv);
        assert_eq!(cfg.discovery.oid_match_min, 3);
        assert_eq!(cfg.poller.id, 2);
    }

    #[test]
    fn validate_rejects_empty_credentials() {
        let mut cfg = Config::default();
        cfg.snmp.communities.clear();
        let err = cfg.validate().expect_err("expected validation error");
        assert!(err.to_string().contains("credential"));
    }

    #[test]
    fn validate_rejects_zero_timeout() {
        let mut cfg = Config::default();
        cfg.snmp.timeout_secs = 0;
        assert!(cfg.validate().is_err());
    }
}
