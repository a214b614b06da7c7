//! Error types for the discovery engine.

use std::net::IpAddr;
use std::path::PathBuf;

use thiserror::Error;

use crate::device::SnmpVersion;

/// Result type for discovery operations.
pub type Result<T> = std::result::Result<T, DiscoveryError>;

/// Errors that can occur while adding, probing, or deleting devices.
///
/// DNS and ICMP failures abort an add-device attempt immediately; a single
/// credential set failing SNMP is not represented here (the orchestrator
/// moves on to the next set) and only surfaces as `SnmpUnreachable` once
/// every configured combination has been exhausted.
#[derive(Error, Debug)]
pub enum DiscoveryError {
    #[error("hostname '{0}' is not valid")]
    InvalidHostname(String),

    #[error("could not resolve {0}")]
    DnsFailure(String),

    #[error("could not ping {0}")]
    Unreachable(String),

    #[error("could not reach {hostname} with given SNMP parameters using {tried}")]
    SnmpUnreachable { hostname: String, tried: String },

    #[error("already got device with hostname ({0})")]
    DuplicateHostname(String),

    #[error("already got device with resolved IP ({ip}) and SNMP {version} credentials")]
    DuplicateNetworkIdentity { ip: IpAddr, version: SnmpVersion },

    #[error("already got device with same system identity ({hostname}): {detail}")]
    DuplicateSystemIdentity { hostname: String, detail: String },

    #[error("unsupported SNMP version \"{0}\"")]
    UnsupportedSnmpVersion(String),

    #[error("invalid or unknown OID: {0}")]
    InvalidOidSpecification(String),

    #[error("persistence failed: {0}")]
    PersistenceFailure(String),

    #[error("RRD directory {} already exists", .0.display())]
    RrdConflict(PathBuf),

    #[error("unknown target poller [{0}]")]
    UnknownPoller(i64),

    #[error("device '{hostname}' already queued for addition on poller [{poller_id}]")]
    AlreadyQueued { hostname: String, poller_id: i64 },

    #[error("device {0} not found")]
    DeviceNotFound(i64),

    #[error("invalid OS definition: {0}")]
    Definition(String),

    #[error("operation aborted")]
    Aborted,
}

impl DiscoveryError {
    /// True when the error is one of the duplicate verdicts, which abort an
    /// add-device operation entirely (as opposed to moving on to the next
    /// credential set).
    pub fn is_duplicate(&self) -> bool {
        matches!(
            self,
            DiscoveryError::DuplicateHostname(_)
                | DiscoveryError::DuplicateNetworkIdentity { .. }
                | DiscoveryError::DuplicateSystemIdentity { .. }
        )
    }
}
