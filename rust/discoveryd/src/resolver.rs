//! Identity resolution: does a candidate duplicate a known device?
//!
//! Three tiers, short-circuiting on the first decisive match: hostname,
//! network + credentials, then system identity signals (snmpEngineID,
//! sysName, physical serial, other system OIDs). Weaker overlaps are
//! reported as non-decisive "possible" collisions.

use std::net::IpAddr;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::debug;

use crate::audit::{EventSink, Severity};
use crate::device::{is_valid_hostname, Device, DeviceCandidate, SnmpVersion, V3Auth};
use crate::error::{DiscoveryError, Result};
use crate::fingerprint::{Fingerprint, MatchContext, OsMatcher};
use crate::osdb::GENERIC_OS;
use crate::probe::NetworkProbe;
use crate::repository::DeviceRepository;
use crate::snmp::{
    get_text, SnmpClient, SnmpTarget, ENT_PHYSICAL_SERIAL_NUM, SNMP_ENGINE_ID, SYS_CONTACT,
    SYS_DESCR, SYS_LOCATION, SYS_NAME, SYS_OBJECT_ID,
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DuplicateKind {
    Hostname,
    IpSnmp(SnmpVersion),
    SystemIdentity,
}

/// Outcome of a duplicate check. `kind = None` means no decisive collision;
/// `possible` carries same-IP/port devices whose credentials differ.
#[derive(Debug, Clone, Default)]
pub struct DuplicateVerdict {
    pub kind: Option<DuplicateKind>,
    pub matched: Vec<Device>,
    pub possible: Vec<Device>,
    pub ip: Option<IpAddr>,
    pub detail: Option<String>,
}

impl DuplicateVerdict {
    pub fn is_decisive(&self) -> bool {
        self.kind.is_some()
    }

    /// Map a decisive verdict onto the error taxonomy.
    pub fn into_error(self, candidate: &DeviceCandidate) -> Option<DiscoveryError> {
        match self.kind? {
            DuplicateKind::Hostname => {
                Some(DiscoveryError::DuplicateHostname(candidate.hostname.clone()))
            }
            DuplicateKind::IpSnmp(version) => Some(DiscoveryError::DuplicateNetworkIdentity {
                ip: self.ip.unwrap_or(IpAddr::from([0, 0, 0, 0])),
                version,
            }),
            DuplicateKind::SystemIdentity => Some(DiscoveryError::DuplicateSystemIdentity {
                hostname: self
                    .matched
                    .first()
                    .map(|d| d.hostname.clone())
                    .unwrap_or_default(),
                detail: self.detail.unwrap_or_default(),
            }),
        }
    }
}

/// Compares the broader set of system OIDs between a candidate and a known
/// device. Owned by the SNMP cache layer in spirit; the resolver only needs
/// the boolean outcome.
#[async_trait]
pub trait OidComparator: Send + Sync {
    async fn compare(&self, candidate: &SnmpTarget, existing: &Device) -> bool;
}

const OTHER_SYSTEM_OIDS: &[(&str, fn(&Device) -> Option<&str>)] = &[
    (SYS_OBJECT_ID, |d| d.sys_object_id.as_deref()),
    (SYS_DESCR, |d| d.sys_descr.as_deref()),
    (SYS_CONTACT, |d| d.sys_contact.as_deref()),
    (SYS_LOCATION, |d| d.location.as_deref()),
];

/// Live-reads the candidate's system OIDs and compares them to the stored
/// row of the existing device. Any conflicting non-empty pair refutes the
/// match; at least `min_matches` agreeing pairs confirm it.
pub struct SnmpOidComparator {
    client: Arc<dyn SnmpClient>,
    min_matches: usize,
}

impl SnmpOidComparator {
    pub fn new(client: Arc<dyn SnmpClient>, min_matches: usize) -> Self {
        SnmpOidComparator {
            client,
            min_matches: min_matches.max(1),
        }
    }
}

#[async_trait]
impl OidComparator for SnmpOidComparator {
    async fn compare(&self, candidate: &SnmpTarget, existing: &Device) -> bool {
        let mut matches = 0;
        for (oid, stored) in OTHER_SYSTEM_OIDS {
            let Some(known) = stored(existing).map(str::trim).filter(|v| !v.is_empty()) else {
                continue;
            };
            let Ok(live) = get_text(self.client.as_ref(), candidate, oid).await else {
                continue;
            };
            if live.eq_ignore_ascii_case(known) {
                matches += 1;
            } else {
                debug!(oid, live = %live, known = %known, "system OID mismatch");
                return false;
            }
        }
        matches >= self.min_matches
    }
}

enum SysNameKind {
    Empty,
    Fqdn,
    NotFqdn,
}

pub struct IdentityResolver {
    repo: Arc<dyn DeviceRepository>,
    client: Arc<dyn SnmpClient>,
    probe: Arc<NetworkProbe>,
    matcher: Arc<OsMatcher>,
    comparator: Arc<dyn OidComparator>,
    events: Arc<dyn EventSink>,
}

impl IdentityResolver {
    pub fn new(
        repo: Arc<dyn DeviceRepository>,
        client: Arc<dyn SnmpClient>,
        probe: Arc<NetworkProbe>,
        matcher: Arc<OsMatcher>,
        comparator: Arc<dyn OidComparator>,
        events: Arc<dyn EventSink>,
    ) -> Self {
        IdentityResolver {
            repo,
            client,
            probe,
            matcher,
            comparator,
            events,
        }
    }

    /// Run all three tiers. Reads the repository and the candidate device,
    /// writes nothing; identical state yields an identical verdict.
    pub async fn find_duplicate(&self, candidate: &DeviceCandidate) -> Result<DuplicateVerdict> {
        let mut verdict = DuplicateVerdict::default();

        // Tier 1: hostname is unique among stored devices.
        let same_hostname = self
            .repo
            .devices_by_hostname(&candidate.hostname, candidate.device_id)
            .await?;
        if !same_hostname.is_empty() {
            verdict.kind = Some(DuplicateKind::Hostname);
            verdict.matched = same_hostname;
            return Ok(verdict);
        }

        // Tier 2: same resolved IP, SNMP port and context, matching auth.
        let ip = match candidate.ip {
            Some(ip) => Some(ip),
            None => self
                .probe
                .resolve(&candidate.hostname, candidate.snmp.transport)
                .await
                .ok(),
        };
        if let Some(ip) = ip {
            verdict.ip = Some(ip);
            let shared = self
                .repo
                .devices_by_network(
                    ip,
                    candidate.snmp.port,
                    candidate.snmp.context.as_deref(),
                    candidate.device_id,
                )
                .await?;
            for existing in shared {
                if credentials_collide(candidate, &existing) {
                    verdict.kind = Some(DuplicateKind::IpSnmp(candidate.snmp.version));
                    verdict.matched.push(existing);
                    return Ok(verdict);
                }
                verdict.possible.push(existing);
            }
        }

        // Tier 3: system identity signals read from the candidate itself.
        let target = SnmpTarget::for_candidate(candidate);
        let engine_id = get_text(self.client.as_ref(), &target, SNMP_ENGINE_ID)
            .await
            .ok();
        let sys_name_orig = get_text(self.client.as_ref(), &target, SYS_NAME)
            .await
            .unwrap_or_default();
        let sys_name = sys_name_orig.to_lowercase();
        let sys_name_kind = if sys_name.is_empty() {
            SysNameKind::Empty
        } else if is_valid_hostname(&sys_name_orig, true) {
            SysNameKind::Fqdn
        } else {
            SysNameKind::NotFqdn
        };

        let candidates = match engine_id.as_deref() {
            Some(engine_id) => {
                let mut found = Vec::new();
                for existing in self.repo.devices_by_engine_id(engine_id).await? {
                    if existing.sys_name.as_deref().unwrap_or_default().to_lowercase() == sys_name {
                        found.push(existing);
                    }
                }
                found
            }
            None => {
                let os_is_unknown = candidate
                    .os
                    .as_deref()
                    .map(|os| os == GENERIC_OS)
                    .unwrap_or(true);
                if sys_name.is_empty() && os_is_unknown {
                    // Some devices expose nothing but their enterprise
                    // tree; narrow the empty-sysName pool by detected OS.
                    let fingerprint = self.fetch_fingerprint(&target).await;
                    let ctx = MatchContext::new(&fingerprint, self.client.as_ref(), &target);
                    let os = self.matcher.identify(&ctx, None).await;
                    self.repo.devices_by_sys_name_and_os(&sys_name, &os).await?
                } else {
                    self.repo.devices_by_sys_name(&sys_name).await?
                }
            }
        };

        for existing in candidates {
            if candidate.device_id == Some(existing.device_id) {
                continue;
            }
            match self.repo.serial_sample(existing.device_id).await? {
                Some(ent) => {
                    let oid = format!("{ENT_PHYSICAL_SERIAL_NUM}.{}", ent.index);
                    let Ok(serial) = get_text(self.client.as_ref(), &target, &oid).await else {
                        continue;
                    };
                    if serial.eq_ignore_ascii_case(&ent.serial) {
                        verdict.kind = Some(DuplicateKind::SystemIdentity);
                        verdict.detail = Some(format!(
                            "sysName ({sys_name}), snmpEngineID and entPhysicalSerialNum = {serial}"
                        ));
                        verdict.matched.push(existing);
                        return Ok(verdict);
                    }
                }
                None => {
                    // Without a serial, a non-FQDN sysName needs the wider
                    // OID comparison before the match is trusted. When the
                    // engine ID is absent the comparison is always required.
                    let need_oids = engine_id.is_none()
                        || !matches!(sys_name_kind, SysNameKind::Fqdn);
                    if need_oids && !self.comparator.compare(&target, &existing).await {
                        continue;
                    }
                    verdict.kind = Some(DuplicateKind::SystemIdentity);
                    verdict.detail = Some(match engine_id.as_deref() {
                        Some(engine_id) => {
                            format!("sysName ({sys_name}) and snmpEngineID = {engine_id}")
                        }
                        None => format!("sysName ({sys_name}) and other system OIDs"),
                    });
                    verdict.matched.push(existing);
                    return Ok(verdict);
                }
            }
        }

        Ok(verdict)
    }

    /// `find_duplicate` with operator messaging layered on top.
    pub async fn is_duplicate(&self, candidate: &DeviceCandidate) -> Result<bool> {
        let verdict = self.find_duplicate(candidate).await?;
        let Some(kind) = verdict.kind.clone() else {
            return Ok(false);
        };
        let message = match (&kind, &verdict) {
            (DuplicateKind::Hostname, _) => {
                format!("Already got device with hostname ({}).", candidate.hostname)
            }
            (DuplicateKind::IpSnmp(version), v) => format!(
                "Already got device with resolved IP ({}) and SNMP {} credentials.",
                v.ip.map(|ip| ip.to_string()).unwrap_or_default(),
                version
            ),
            (DuplicateKind::SystemIdentity, v) => format!(
                "Already got device with {} ({}).",
                v.detail.clone().unwrap_or_default(),
                v.matched
                    .first()
                    .map(|d| d.hostname.clone())
                    .unwrap_or_default()
            ),
        };
        self.events.log_event(&message, None, Severity::Error);
        Ok(true)
    }

    async fn fetch_fingerprint(&self, target: &SnmpTarget) -> Fingerprint {
        Fingerprint {
            sys_object_id: get_text(self.client.as_ref(), target, SYS_OBJECT_ID)
                .await
                .ok(),
            sys_descr: get_text(self.client.as_ref(), target, SYS_DESCR).await.ok(),
        }
    }
}

/// Decisive credential overlap for devices sharing IP, port, and context.
fn credentials_collide(candidate: &DeviceCandidate, existing: &Device) -> bool {
    match candidate.snmp.version {
        SnmpVersion::V3 => {
            let (Some(a), Some(b)) = (candidate.snmp.v3.as_ref(), existing.snmp.v3.as_ref())
            else {
                return false;
            };
            v3_collides(a, b)
        }
        SnmpVersion::V1 | SnmpVersion::V2c => {
            candidate.snmp.community.is_some()
                && candidate.snmp.community == existing.snmp.community
        }
    }
}

fn v3_collides(a: &V3Auth, b: &V3Auth) -> bool {
    use crate::device::AuthLevel::*;
    if a.auth_level != b.auth_level {
        return false;
    }
    match a.auth_level {
        NoAuthNoPriv => a.auth_name == b.auth_name,
        AuthNoPriv => {
            a.auth_name == b.auth_name && a.auth_pass == b.auth_pass && a.auth_algo == b.auth_algo
        }
        AuthPriv => {
            a.auth_name == b.auth_name
                && a.auth_pass == b.auth_pass
                && a.auth_algo == b.auth_algo
                && a.crypto_pass == b.crypto_pass
                && a.crypto_algo == b.crypto_algo
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::{AuthAlgo, AuthLevel};

    fn auth(level: AuthLevel, name: &str, pass: &str) -> V3Auth {
        V3Auth {
            auth_level: level,
            auth_name: name.into(),
            auth_pass: pass.into(),
            auth_algo: AuthAlgo::Sha,
            ..Default::default()
        }
    }

    #[test]
    fn noauthnopriv_needs_only_the_name() {
        let a = auth(AuthLevel::NoAuthNoPriv, "observer", "ignored");
        let b = auth(AuthLevel::NoAuthNoPriv, "observer", "different");
        assert!(v3_collides(&a, &b));

        let c = auth(AuthLevel::NoAuthNoPriv, "other", "ignored");
        assert!(!v3_collides(&a, &c));
    }

    #[test]
    fn authnopriv_needs_pass_and_algo() {
        let a = auth(AuthLevel::AuthNoPriv, "observer", "secret");
        let b = auth(AuthLevel::AuthNoPriv, "observer", "secret");
        assert!(v3_collides(&a, &b));

        let mut c = b.clone();
        c.auth_pass = "other".into();
        assert!(!v3_collides(&a, &c));

        let mut d = b.clone();
        d.auth_algo = AuthAlgo::Md5;
        assert!(!v3_collides(&a, &d));
    }

    #[test]
    fn authpriv_needs_crypto_fields_too() {
        let mut a = auth(AuthLevel::AuthPriv, "observer", "secret");
        a.crypto_pass = "cipher".into();
        let mut b = a.clone();
        assert!(v3_collides(&a, &b));

        b.crypto_pass = "different".into();
        assert!(!v3_collides(&a, &b));
    }

    #[test]
    fn level_mismatch_is_never_decisive() {
        let a = auth(AuthLevel::NoAuthNoPriv, "observer", "x");
        let b = auth(AuthLevel::AuthPriv, "observer", "x");
        assert!(!v3_collides(&a, &b));
    }
}
