//! SNMP capability consumed by the engine.
//!
//! The engine only ever needs GET / GETNEXT / WALK with a status channel
//! that distinguishes timeouts, authentication failures, and empty
//! responses. PDU encoding and transport live behind [`SnmpClient`]; the
//! wire adapter is in [`crate::transport`].

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

use crate::device::{DeviceCandidate, SnmpParams};

pub const SYS_DESCR: &str = "1.3.6.1.2.1.1.1.0";
pub const SYS_OBJECT_ID: &str = "1.3.6.1.2.1.1.2.0";
pub const SYS_UPTIME: &str = "1.3.6.1.2.1.1.3.0";
pub const SYS_CONTACT: &str = "1.3.6.1.2.1.1.4.0";
pub const SYS_NAME: &str = "1.3.6.1.2.1.1.5.0";
pub const SYS_LOCATION: &str = "1.3.6.1.2.1.1.6.0";
pub const SNMP_ENGINE_ID: &str = "1.3.6.1.6.3.10.2.1.1.0";
pub const ENT_PHYSICAL_SERIAL_NUM: &str = "1.3.6.1.2.1.47.1.1.1.1.11";

/// Symbolic names the engine can translate without a MIB compiler. Callers
/// may pass either `MIB::name` or the bare name.
const SYMBOLIC_OIDS: &[(&str, &str)] = &[
    ("sysDescr.0", SYS_DESCR),
    ("sysObjectID.0", SYS_OBJECT_ID),
    ("sysUpTime.0", SYS_UPTIME),
    ("sysContact.0", SYS_CONTACT),
    ("sysName.0", SYS_NAME),
    ("sysLocation.0", SYS_LOCATION),
    ("snmpEngineID.0", SNMP_ENGINE_ID),
    ("entPhysicalSerialNum", ENT_PHYSICAL_SERIAL_NUM),
];

/// A decoded varbind value. Octet strings arrive lossily decoded; the
/// engine compares identity fields as text throughout.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SnmpValue {
    Integer(i64),
    OctetString(String),
    Oid(String),
    Counter(u64),
    Gauge(u64),
    TimeTicks(u64),
    IpAddress(String),
    Null,
}

impl SnmpValue {
    pub fn as_text(&self) -> String {
        match self {
            SnmpValue::Integer(v) => v.to_string(),
            SnmpValue::OctetString(s) => s.clone(),
            SnmpValue::Oid(s) => s.clone(),
            SnmpValue::Counter(v) | SnmpValue::Gauge(v) | SnmpValue::TimeTicks(v) => v.to_string(),
            SnmpValue::IpAddress(s) => s.clone(),
            SnmpValue::Null => String::new(),
        }
    }
}

impl fmt::Display for SnmpValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.as_text())
    }
}

/// Failure modes of a single SNMP request. `EmptyResponse` is not a hard
/// failure: the OS matcher treats it as "no value", and reachability checks
/// treat it as proof the agent answered.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SnmpError {
    #[error("request timed out")]
    Timeout,
    #[error("authentication failed")]
    AuthFailure,
    #[error("empty response")]
    EmptyResponse,
    #[error("transport error: {0}")]
    Transport(String),
}

pub type SnmpResult<T> = std::result::Result<T, SnmpError>;

/// Target of an SNMP request: a concrete host plus its parameters. The host
/// is the resolved address when available, otherwise the hostname.
#[derive(Debug, Clone)]
pub struct SnmpTarget {
    pub host: String,
    pub params: SnmpParams,
}

impl SnmpTarget {
    pub fn new(host: impl Into<String>, params: SnmpParams) -> Self {
        SnmpTarget {
            host: host.into(),
            params,
        }
    }

    pub fn for_candidate(candidate: &DeviceCandidate) -> Self {
        let host = candidate
            .ip
            .map(|ip| ip.to_string())
            .unwrap_or_else(|| candidate.hostname.clone());
        SnmpTarget::new(host, candidate.snmp.clone())
    }

    /// `host:port`, with IPv6 literals bracketed.
    pub fn socket_addr(&self) -> String {
        if self.host.contains(':') {
            format!("[{}]:{}", self.host, self.params.port)
        } else {
            format!("{}:{}", self.host, self.params.port)
        }
    }

    pub fn timeout(&self, default: Duration) -> Duration {
        self.params
            .timeout_secs
            .map(Duration::from_secs)
            .unwrap_or(default)
    }

    pub fn retries(&self, default: u8) -> u8 {
        self.params.retries.unwrap_or(default)
    }
}

/// The SNMP capability. One request per call, no internal credential
/// retries; the orchestrator owns retry policy across credential sets.
#[async_trait]
pub trait SnmpClient: Send + Sync {
    async fn get(&self, target: &SnmpTarget, oid: &str) -> SnmpResult<SnmpValue>;

    async fn get_next(&self, target: &SnmpTarget, oid: &str) -> SnmpResult<(String, SnmpValue)>;

    async fn walk(&self, target: &SnmpTarget, root: &str) -> SnmpResult<Vec<(String, SnmpValue)>>;
}

/// GET an OID and return its trimmed text form. Empty text is reported as
/// `EmptyResponse` so callers can tell "answered with nothing" from a value.
pub async fn get_text(
    client: &dyn SnmpClient,
    target: &SnmpTarget,
    oid: &str,
) -> SnmpResult<String> {
    let value = client.get(target, oid).await?;
    let text = fix_string(&value.as_text());
    if text.is_empty() {
        return Err(SnmpError::EmptyResponse);
    }
    Ok(text)
}

/// Normalize an SNMP string value: strip wrapping quotes, collapse control
/// characters, trim.
pub fn fix_string(raw: &str) -> String {
    let trimmed = raw.trim().trim_matches('"');
    trimmed
        .chars()
        .map(|c| if c.is_control() { ' ' } else { c })
        .collect::<String>()
        .trim()
        .to_string()
}

/// True for dotted numeric OIDs (`1.3.6.1.2.1.1.1.0`, optional leading dot).
pub fn is_numeric_oid(raw: &str) -> bool {
    let raw = raw.strip_prefix('.').unwrap_or(raw);
    if raw.is_empty() {
        return false;
    }
    let mut labels = 0;
    for label in raw.split('.') {
        if label.is_empty() || !label.chars().all(|c| c.is_ascii_digit()) {
            return false;
        }
        labels += 1;
    }
    labels >= 2
}

/// Strip a leading dot so OIDs compare consistently.
pub fn normalize_numeric(raw: &str) -> &str {
    raw.strip_prefix('.').unwrap_or(raw)
}

/// Resolve a caller-supplied OID specification to numeric form. Accepts
/// numeric OIDs and the symbolic names in the built-in table, with or
/// without a `MIB::` prefix. Returns `None` for anything unresolvable.
pub fn translate(raw: &str) -> Option<String> {
    let raw = raw.trim();
    if is_numeric_oid(raw) {
        return Some(normalize_numeric(raw).to_string());
    }
    let name = match raw.split_once("::") {
        Some((_mib, name)) => name,
        None => raw,
    };
    SYMBOLIC_OIDS
        .iter()
        .find(|(sym, _)| *sym == name)
        .map(|(_, num)| (*num).to_string())
}

/// True when `oid` sits under `root` (label-boundary prefix match).
pub fn oid_in_subtree(root: &str, oid: &str) -> bool {
    let root = normalize_numeric(root);
    let oid = normalize_numeric(oid);
    oid == root || oid.starts_with(&format!("{root}."))
}
