//! Device model: SNMP parameters, credentials, and the persisted device row.

use std::fmt;
use std::net::IpAddr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// SNMP protocol version.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SnmpVersion {
    V1,
    V2c,
    V3,
}

impl SnmpVersion {
    pub fn as_str(&self) -> &'static str {
        match self {
            SnmpVersion::V1 => "v1",
            SnmpVersion::V2c => "v2c",
            SnmpVersion::V3 => "v3",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_lowercase().as_str() {
            "v1" | "1" => Some(SnmpVersion::V1),
            "v2c" | "v2" | "2c" | "2" => Some(SnmpVersion::V2c),
            "v3" | "3" => Some(SnmpVersion::V3),
            _ => None,
        }
    }
}

impl fmt::Display for SnmpVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// SNMP transport. The IPv6 variants force AAAA resolution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SnmpTransport {
    Udp,
    Udp6,
    Tcp,
    Tcp6,
}

impl SnmpTransport {
    pub fn as_str(&self) -> &'static str {
        match self {
            SnmpTransport::Udp => "udp",
            SnmpTransport::Udp6 => "udp6",
            SnmpTransport::Tcp => "tcp",
            SnmpTransport::Tcp6 => "tcp6",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_lowercase().as_str() {
            "udp" => Some(SnmpTransport::Udp),
            "udp6" => Some(SnmpTransport::Udp6),
            "tcp" => Some(SnmpTransport::Tcp),
            "tcp6" => Some(SnmpTransport::Tcp6),
            _ => None,
        }
    }

    pub fn is_ipv6(&self) -> bool {
        matches!(self, SnmpTransport::Udp6 | SnmpTransport::Tcp6)
    }

    pub fn is_tcp(&self) -> bool {
        matches!(self, SnmpTransport::Tcp | SnmpTransport::Tcp6)
    }

    /// Pick the concrete transport for a resolved address, keeping the
    /// TCP/UDP family requested by the caller.
    pub fn for_ip(&self, ip: IpAddr) -> Self {
        match (self.is_tcp(), ip.is_ipv6()) {
            (true, false) => SnmpTransport::Tcp,
            (true, true) => SnmpTransport::Tcp6,
            (false, false) => SnmpTransport::Udp,
            (false, true) => SnmpTransport::Udp6,
        }
    }
}

impl fmt::Display for SnmpTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// SNMPv3 security level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum AuthLevel {
    #[default]
    NoAuthNoPriv,
    AuthNoPriv,
    AuthPriv,
}

impl AuthLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuthLevel::NoAuthNoPriv => "noAuthNoPriv",
            AuthLevel::AuthNoPriv => "authNoPriv",
            AuthLevel::AuthPriv => "authPriv",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_lowercase().as_str() {
            "noauthnopriv" => Some(AuthLevel::NoAuthNoPriv),
            "authnopriv" => Some(AuthLevel::AuthNoPriv),
            "authpriv" => Some(AuthLevel::AuthPriv),
            _ => None,
        }
    }
}

impl fmt::Display for AuthLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuthAlgo {
    Md5,
    #[default]
    Sha,
    Sha256,
    Sha512,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CryptoAlgo {
    Des,
    #[default]
    Aes,
    Aes192,
    Aes256,
}

impl AuthAlgo {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuthAlgo::Md5 => "MD5",
            AuthAlgo::Sha => "SHA",
            AuthAlgo::Sha256 => "SHA-256",
            AuthAlgo::Sha512 => "SHA-512",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_lowercase().as_str() {
            "md5" => Some(AuthAlgo::Md5),
            "sha" | "sha1" => Some(AuthAlgo::Sha),
            "sha256" | "sha-256" => Some(AuthAlgo::Sha256),
            "sha512" | "sha-512" => Some(AuthAlgo::Sha512),
            _ => None,
        }
    }
}

impl CryptoAlgo {
    pub fn as_str(&self) -> &'static str {
        match self {
            CryptoAlgo::Des => "DES",
            CryptoAlgo::Aes => "AES",
            CryptoAlgo::Aes192 => "AES-192",
            CryptoAlgo::Aes256 => "AES-256",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_lowercase().as_str() {
            "des" => Some(CryptoAlgo::Des),
            "aes" | "aes128" | "aes-128" => Some(CryptoAlgo::Aes),
            "aes192" | "aes-192" => Some(CryptoAlgo::Aes192),
            "aes256" | "aes-256" => Some(CryptoAlgo::Aes256),
            _ => None,
        }
    }
}

/// One SNMPv3 credential set.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct V3Auth {
    #[serde(default)]
    pub auth_level: AuthLevel,
    #[serde(default)]
    pub auth_name: String,
    #[serde(default)]
    pub auth_pass: String,
    #[serde(default)]
    pub auth_algo: AuthAlgo,
    #[serde(default)]
    pub crypto_pass: String,
    #[serde(default)]
    pub crypto_algo: CryptoAlgo,
}

/// Full SNMP parameter set for one device or one probe attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnmpParams {
    pub version: SnmpVersion,
    pub port: u16,
    pub transport: SnmpTransport,
    #[serde(default)]
    pub community: Option<String>,
    #[serde(default)]
    pub v3: Option<V3Auth>,
    #[serde(default)]
    pub context: Option<String>,
    #[serde(default)]
    pub timeout_secs: Option<u64>,
    #[serde(default)]
    pub retries: Option<u8>,
    #[serde(default)]
    pub max_repetitions: Option<u32>,
}

impl SnmpParams {
    pub fn community(version: SnmpVersion, community: &str) -> Self {
        SnmpParams {
            version,
            port: DEFAULT_SNMP_PORT,
            transport: SnmpTransport::Udp,
            community: Some(community.to_string()),
            v3: None,
            context: None,
            timeout_secs: None,
            retries: None,
            max_repetitions: None,
        }
    }

    pub fn v3(auth: V3Auth) -> Self {
        SnmpParams {
            version: SnmpVersion::V3,
            port: DEFAULT_SNMP_PORT,
            transport: SnmpTransport::Udp,
            community: None,
            v3: Some(auth),
            context: None,
            timeout_secs: None,
            retries: None,
            max_repetitions: None,
        }
    }

    /// Credential identity for progress messages, honoring auth redaction.
    pub fn auth_label(&self, hide_auth: bool) -> String {
        if hide_auth {
            return match self.version {
                SnmpVersion::V3 => "*** / ###".to_string(),
                _ => "***".to_string(),
            };
        }
        match self.version {
            SnmpVersion::V3 => {
                let auth = self.v3.clone().unwrap_or_default();
                format!("{}/{}", auth.auth_name, auth.auth_level)
            }
            _ => self.community.clone().unwrap_or_default(),
        }
    }
}

pub const DEFAULT_SNMP_PORT: u16 = 161;

/// Device status as stored in the repository.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceStatus {
    Down,
    Up,
}

/// A persisted device row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Device {
    pub device_id: i64,
    pub hostname: String,
    #[serde(default)]
    pub ip: Option<IpAddr>,
    pub snmp: SnmpParams,
    #[serde(default)]
    pub sys_object_id: Option<String>,
    #[serde(default)]
    pub sys_descr: Option<String>,
    /// Stored lower-cased; compared lower-cased everywhere.
    #[serde(default)]
    pub sys_name: Option<String>,
    #[serde(default)]
    pub snmp_engine_id: Option<String>,
    #[serde(default)]
    pub location: Option<String>,
    #[serde(default)]
    pub sys_contact: Option<String>,
    #[serde(default)]
    pub os: Option<String>,
    pub status: DeviceStatus,
    #[serde(default)]
    pub disabled: bool,
    pub poller_id: i64,
    #[serde(default)]
    pub last_polled: Option<DateTime<Utc>>,
    #[serde(default)]
    pub last_discovered: Option<DateTime<Utc>>,
    #[serde(default)]
    pub uptime: Option<u64>,
}

/// A device that has not (yet) been persisted: the unit of work for the
/// probe, the resolver, and the fingerprint matcher.
#[derive(Debug, Clone)]
pub struct DeviceCandidate {
    /// Set when re-validating an existing record; excluded from duplicate
    /// lookups so a device never collides with itself.
    pub device_id: Option<i64>,
    pub hostname: String,
    pub ip: Option<IpAddr>,
    pub snmp: SnmpParams,
    pub os: Option<String>,
}

impl DeviceCandidate {
    pub fn new(hostname: &str, snmp: SnmpParams) -> Self {
        DeviceCandidate {
            device_id: None,
            hostname: canonical_hostname(hostname),
            ip: None,
            snmp,
            os: None,
        }
    }
}

/// Lower-case, trim, and compress literal IPv6 addresses so the same host
/// always normalizes to the same stored hostname.
pub fn canonical_hostname(raw: &str) -> String {
    let trimmed = raw.trim().to_lowercase();
    match trimmed.parse::<IpAddr>() {
        Ok(ip) => ip.to_string(),
        Err(_) => trimmed,
    }
}

/// Parse a literal IPv4/IPv6 address, if the string is one.
pub fn literal_ip(raw: &str) -> Option<IpAddr> {
    raw.trim().parse::<IpAddr>().ok()
}

/// Syntactic hostname check. With `require_fqdn`, at least two labels are
/// required and the last label must not be purely numeric.
pub fn is_valid_hostname(name: &str, require_fqdn: bool) -> bool {
    let name = name.trim_end_matches('.');
    if name.is_empty() || name.len() > 253 {
        return false;
    }
    let labels: Vec<&str> = name.split('.').collect();
    for label in &labels {
        if label.is_empty() || label.len() > 63 {
            return false;
        }
        if label.starts_with('-') || label.ends_with('-') {
            return false;
        }
        if !label
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
        {
            return false;
        }
    }
    if require_fqdn {
        if labels.len() < 2 {
            return false;
        }
        if labels
            .last()
            .map(|l| l.chars().all(|c| c.is_ascii_digit()))
            .unwrap_or(true)
        {
            return false;
        }
    }
    true
}
