//! Device lifecycle orchestration.
//!
//! Add-device walks `Validating -> ProbingCredentials -> Deduplicating ->
//! Fingerprinting -> Persisting`; version and credential attempts are an
//! explicit ordered iteration, abortable between attempts. Delete-device is
//! a single cascading pass that tolerates partial failure and reports every
//! table it touched.

use std::fmt;
use std::net::IpAddr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::audit::{EventSink, Severity};
use crate::cache::DeviceCache;
use crate::config::Config;
use crate::device::{
    canonical_hostname, is_valid_hostname, literal_ip, Device, DeviceCandidate, DeviceStatus,
    SnmpParams, SnmpTransport, SnmpVersion, V3Auth, DEFAULT_SNMP_PORT,
};
use crate::error::{DiscoveryError, Result};
use crate::fingerprint::{Fingerprint, MatchContext, OsMatcher};
use crate::probe::NetworkProbe;
use crate::repository::{DeviceRepository, DEVICE_TABLES, ENTITY_TABLES};
use crate::resolver::IdentityResolver;
use crate::snmp::{
    self, get_text, SnmpClient, SnmpTarget, SNMP_ENGINE_ID, SYS_CONTACT, SYS_DESCR, SYS_LOCATION,
    SYS_NAME, SYS_OBJECT_ID,
};

/// Cooperative cancellation between credential attempts. An in-flight
/// network call still runs to its own timeout.
#[derive(Debug, Clone, Default)]
pub struct AbortSignal(Arc<AtomicBool>);

impl AbortSignal {
    pub fn new() -> Self {
        AbortSignal::default()
    }

    pub fn abort(&self) {
        self.0.store(true, Ordering::Relaxed);
    }

    pub fn is_aborted(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }
}

#[derive(Debug, Clone, Default)]
pub struct AddDeviceRequest {
    pub hostname: String,
    /// Pin one version; `None` walks the configured preference order.
    pub version: Option<SnmpVersion>,
    pub port: Option<u16>,
    pub transport: Option<SnmpTransport>,
    /// Overrides the configured community list when set.
    pub community: Option<String>,
    /// Tried before the configured v3 credential sets when set.
    pub v3: Option<V3Auth>,
    pub context: Option<String>,
    /// OIDs proving SNMP reachability on agents without the standard
    /// system tree. Numeric or translatable symbolic names.
    pub snmpable: Vec<String>,
    pub ping_skip: bool,
    /// Probe and report, persist nothing.
    pub test: bool,
    pub ignore_rrd: bool,
    /// Target poller; a non-local value queues the addition instead of
    /// probing.
    pub poller_id: Option<i64>,
    pub timeout_secs: Option<u64>,
    pub retries: Option<u8>,
    pub max_repetitions: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AddOutcome {
    Added { device_id: i64 },
    /// Test mode: the device answered and would have been added.
    TestPassed {
        version: SnmpVersion,
        transport: SnmpTransport,
    },
    Queued { action_id: i64, poller_id: i64 },
}

#[derive(Debug, Clone, Default)]
pub struct DeleteReport {
    pub hostname: String,
    pub ports: Vec<String>,
    pub entity_types: Vec<String>,
    pub tables: Vec<String>,
    pub failed: Vec<(String, String)>,
    pub rrd_removed: Option<PathBuf>,
}

impl fmt::Display for DeleteReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if !self.ports.is_empty() {
            writeln!(f, " * Deleted interfaces: {}", self.ports.join(", "))?;
        }
        if !self.entity_types.is_empty() {
            writeln!(
                f,
                " * Deleted common entity entries linked to device: {}",
                self.entity_types.join(", ")
            )?;
        }
        if !self.tables.is_empty() {
            writeln!(f, " * Deleted device entries from tables: {}", self.tables.join(", "))?;
        }
        if let Some(path) = &self.rrd_removed {
            writeln!(f, " * Deleted device RRDs dir: {}", path.display())?;
        }
        for (table, error) in &self.failed {
            writeln!(f, " ! Failed cleaning {table}: {error}")?;
        }
        write!(f, " * Deleted device: {}", self.hostname)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusKind {
    Ok,
    Dns,
    Ping,
    Snmp,
}

#[derive(Debug, Clone)]
pub struct StatusSummary {
    pub up: bool,
    pub kind: StatusKind,
    pub message: String,
}

enum VersionOutcome {
    Done(AddOutcome),
    NoReply,
}

pub struct Orchestrator {
    config: Arc<Config>,
    repo: Arc<dyn DeviceRepository>,
    client: Arc<dyn SnmpClient>,
    probe: Arc<NetworkProbe>,
    resolver: IdentityResolver,
    matcher: Arc<OsMatcher>,
    cache: Arc<DeviceCache>,
    events: Arc<dyn EventSink>,
}

impl Orchestrator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: Arc<Config>,
        repo: Arc<dyn DeviceRepository>,
        client: Arc<dyn SnmpClient>,
        probe: Arc<NetworkProbe>,
        resolver: IdentityResolver,
        matcher: Arc<OsMatcher>,
        cache: Arc<DeviceCache>,
        events: Arc<dyn EventSink>,
    ) -> Self {
        Orchestrator {
            config,
            repo,
            client,
            probe,
            resolver,
            matcher,
            cache,
            events,
        }
    }

    pub fn cache(&self) -> &DeviceCache {
        &self.cache
    }

    /// Add a device, walking the configured version/credential matrix in
    /// strict order. The first SNMP-able combination decides: a duplicate
    /// verdict aborts everything, a clean one persists (or, in test mode,
    /// reports success).
    pub async fn add_device(&self, req: &AddDeviceRequest, abort: &AbortSignal) -> Result<AddOutcome> {
        let hostname = canonical_hostname(&req.hostname);

        match literal_ip(&hostname) {
            Some(_) if self.config.discovery.require_hostname => {
                return Err(DiscoveryError::InvalidHostname(hostname));
            }
            Some(_) => {}
            None => {
                if !is_valid_hostname(&hostname, false) {
                    return Err(DiscoveryError::InvalidHostname(hostname));
                }
            }
        }

        // Reject the whole request if any reachability OID is unknown.
        let mut snmpable = Vec::with_capacity(req.snmpable.len());
        for raw in &req.snmpable {
            match snmp::translate(raw) {
                Some(oid) => snmpable.push(oid),
                None => {
                    self.events.log_event(
                        &format!("Invalid or unknown OID: {raw}"),
                        None,
                        Severity::Warning,
                    );
                    return Err(DiscoveryError::InvalidOidSpecification(raw.clone()));
                }
            }
        }

        if let Some(poller_id) = req.poller_id {
            if poller_id != self.config.poller.id {
                return self.queue_remote_add(&hostname, poller_id).await;
            }
        }

        if self.repo.device_exists(&hostname, None).await? {
            return Err(DiscoveryError::DuplicateHostname(hostname));
        }

        let base_transport = req.transport.unwrap_or(SnmpTransport::Udp);
        let ip = self.probe.resolve(&hostname, base_transport).await?;

        if !req.ping_skip {
            match self.probe.is_reachable(ip).await {
                Some(rtt) => self.events.log_event(
                    &format!("{} responds to ICMP echo ({} ms).", hostname, rtt.as_millis()),
                    None,
                    Severity::Info,
                ),
                None => return Err(DiscoveryError::Unreachable(hostname)),
            }
        }

        if !(req.ignore_rrd || self.config.rrd.ignore_existing) {
            let rrd_path = self.config.rrd_path(&hostname);
            if rrd_path.exists() {
                return Err(DiscoveryError::RrdConflict(rrd_path));
            }
        }

        let transport = base_transport.for_ip(ip);
        let port = req.port.unwrap_or(DEFAULT_SNMP_PORT);

        let versions = match req.version {
            Some(version) => vec![version],
            None => self.config.version_order(),
        };

        let mut tried = Vec::with_capacity(versions.len());
        for version in versions {
            if abort.is_aborted() {
                return Err(DiscoveryError::Aborted);
            }
            tried.push(version.as_str());
            match self
                .try_version(req, &hostname, ip, transport, port, version, &snmpable, abort)
                .await?
            {
                VersionOutcome::Done(outcome) => return Ok(outcome),
                VersionOutcome::NoReply => {
                    self.events.log_event(
                        &format!(
                            "Could not reach {hostname} with given SNMP parameters using {version}."
                        ),
                        None,
                        Severity::Warning,
                    );
                }
            }
        }

        Err(DiscoveryError::SnmpUnreachable {
            hostname,
            tried: tried.join(", "),
        })
    }

    #[allow(clippy::too_many_arguments)]
    async fn try_version(
        &self,
        req: &AddDeviceRequest,
        hostname: &str,
        ip: IpAddr,
        transport: SnmpTransport,
        port: u16,
        version: SnmpVersion,
        snmpable: &[String],
        abort: &AbortSignal,
    ) -> Result<VersionOutcome> {
        let hide_auth = self.config.snmp.hide_auth;

        for (index, params) in self
            .credentials_for(req, version, transport, port)
            .into_iter()
            .enumerate()
        {
            if abort.is_aborted() {
                return Err(DiscoveryError::Aborted);
            }

            let label = params.auth_label(hide_auth);
            let progress = match version {
                SnmpVersion::V3 if hide_auth => format!("Trying v3 parameters {label} [{index}] ..."),
                SnmpVersion::V3 => format!("Trying v3 parameters {label} ..."),
                _ if hide_auth => format!("Trying {version} community {label} [{index}] ..."),
                _ => format!("Trying {version} community {label} ..."),
            };
            self.events.log_event(&progress, None, Severity::Info);

            let target = SnmpTarget::new(ip.to_string(), params.clone());
            let (snmpable_ok, _rtt) = self
                .probe
                .snmp_check(self.client.as_ref(), &target, snmpable)
                .await;
            if !snmpable_ok {
                let warning = match version {
                    SnmpVersion::V3 => format!("No reply on credentials {label} using {version}."),
                    _ => format!("No reply on community {label} using {version}."),
                };
                self.events.log_event(&warning, None, Severity::Warning);
                continue;
            }

            let candidate = DeviceCandidate {
                device_id: None,
                hostname: hostname.to_string(),
                ip: Some(ip),
                snmp: params,
                os: None,
            };

            // An SNMP-able duplicate means no other credential can help.
            let verdict = self.resolver.find_duplicate(&candidate).await?;
            if verdict.is_decisive() {
                let err = verdict
                    .into_error(&candidate)
                    .unwrap_or_else(|| DiscoveryError::DuplicateHostname(hostname.to_string()));
                self.events.log_event(&err.to_string(), None, Severity::Error);
                return Err(err);
            }

            if req.test {
                self.events.log_event(
                    &format!(
                        "Device \"{hostname}\" has successfully been tested and available by {} transport with SNMP {version} credentials.",
                        transport.as_str().to_uppercase()
                    ),
                    None,
                    Severity::Info,
                );
                return Ok(VersionOutcome::Done(AddOutcome::TestPassed { version, transport }));
            }

            let device_id = self
                .create_device(hostname, &candidate, self.config.poller.id)
                .await?;

            if req.ping_skip {
                self.repo
                    .set_device_attrib(device_id, "ping_skip", "1")
                    .await?;
                if self.probe.is_reachable(ip).await.is_some() {
                    self.events.log_event(
                        "You have checked the option to skip ICMP ping, but the device responds to an ICMP ping. Perhaps you need to check the device settings.",
                        Some(device_id),
                        Severity::Warning,
                    );
                }
            }

            return Ok(VersionOutcome::Done(AddOutcome::Added { device_id }));
        }

        Ok(VersionOutcome::NoReply)
    }

    fn credentials_for(
        &self,
        req: &AddDeviceRequest,
        version: SnmpVersion,
        transport: SnmpTransport,
        port: u16,
    ) -> Vec<SnmpParams> {
        let build = |community: Option<String>, v3: Option<V3Auth>| SnmpParams {
            version,
            port,
            transport,
            community,
            v3,
            context: req.context.clone(),
            timeout_secs: req.timeout_secs,
            retries: req.retries,
            max_repetitions: req.max_repetitions,
        };

        match version {
            SnmpVersion::V3 => {
                let mut sets: Vec<SnmpParams> = Vec::new();
                if let Some(auth) = &req.v3 {
                    sets.push(build(None, Some(auth.clone())));
                }
                for auth in &self.config.snmp.v3 {
                    if req.v3.as_ref() != Some(auth) {
                        sets.push(build(None, Some(auth.clone())));
                    }
                }
                sets
            }
            SnmpVersion::V1 | SnmpVersion::V2c => match &req.community {
                // An explicit community replaces the configured list.
                Some(community) => vec![build(Some(community.clone()), None)],
                None => self
                    .config
                    .snmp
                    .communities
                    .iter()
                    .map(|c| build(Some(c.clone()), None))
                    .collect(),
            },
        }
    }

    async fn queue_remote_add(&self, hostname: &str, poller_id: i64) -> Result<AddOutcome> {
        self.events.log_event(
            &format!("Requested add device with hostname '{hostname}' to remote Poller [{poller_id}]."),
            None,
            Severity::Info,
        );
        if !(is_valid_hostname(hostname, false) || literal_ip(hostname).is_some()) {
            return Err(DiscoveryError::InvalidHostname(hostname.to_string()));
        }
        if !self.repo.poller_exists(poller_id).await? {
            return Err(DiscoveryError::UnknownPoller(poller_id));
        }
        if let Some(queued_on) = self.repo.queued_action_poller("device_add", hostname).await? {
            return Err(DiscoveryError::AlreadyQueued {
                hostname: hostname.to_string(),
                poller_id: queued_on,
            });
        }
        if self.repo.device_exists(hostname, None).await? {
            return Err(DiscoveryError::DuplicateHostname(hostname.to_string()));
        }
        let action_id = self.repo.queue_action("device_add", hostname, poller_id).await?;
        self.events.log_event(
            &format!(
                "Device with hostname '{hostname}' added to queue [{action_id}] for addition on remote Poller [{poller_id}]."
            ),
            None,
            Severity::Info,
        );
        Ok(AddOutcome::Queued { action_id, poller_id })
    }

    /// Insert a device row. Only a locally-owned device is enriched over
    /// SNMP before the insert; rows owned by another poller stay blank for
    /// that poller to fill in.
    pub async fn create_device(
        &self,
        hostname: &str,
        candidate: &DeviceCandidate,
        poller_id: i64,
    ) -> Result<i64> {
        let local = poller_id == self.config.poller.id;

        let mut device = Device {
            device_id: 0,
            hostname: hostname.to_string(),
            ip: candidate.ip,
            snmp: candidate.snmp.clone(),
            sys_object_id: None,
            sys_descr: None,
            sys_name: Some(hostname.to_string()),
            snmp_engine_id: None,
            location: None,
            sys_contact: None,
            os: None,
            status: DeviceStatus::Up,
            disabled: false,
            poller_id,
            last_polled: None,
            last_discovered: None,
            uptime: None,
        };

        if local {
            let target = SnmpTarget::for_candidate(candidate);
            let fingerprint = Fingerprint {
                sys_object_id: get_text(self.client.as_ref(), &target, SYS_OBJECT_ID).await.ok(),
                sys_descr: get_text(self.client.as_ref(), &target, SYS_DESCR).await.ok(),
            };
            let ctx = MatchContext::new(&fingerprint, self.client.as_ref(), &target);
            let os = self.matcher.identify(&ctx, candidate.os.as_deref()).await;

            device.os = Some(os);
            device.sys_object_id = fingerprint.sys_object_id.clone();
            device.sys_descr = fingerprint.sys_descr.clone();
            device.snmp_engine_id = get_text(self.client.as_ref(), &target, SNMP_ENGINE_ID).await.ok();
            device.sys_name = get_text(self.client.as_ref(), &target, SYS_NAME)
                .await
                .ok()
                .map(|v| v.to_lowercase())
                .or(device.sys_name);
            device.location = get_text(self.client.as_ref(), &target, SYS_LOCATION).await.ok();
            device.sys_contact = get_text(self.client.as_ref(), &target, SYS_CONTACT).await.ok();
        }

        let sys_object_id = device.sys_object_id.clone();
        let engine_id = device.snmp_engine_id.clone();

        let device_id = self.repo.insert_device(device).await?;

        let mut log_msg = format!("Device added: {hostname}");
        if poller_id > 0 {
            if let Some(poller_name) = self.repo.poller_name(poller_id).await? {
                log_msg.push_str(&format!(" (Poller: {poller_name} [{poller_id}])"));
            }
        }
        self.events.log_event(&log_msg, Some(device_id), Severity::Notice);
        if let Some(sys_object_id) = sys_object_id.filter(|v| !v.is_empty()) {
            self.events
                .log_event(&format!("sysObjectID -> {sys_object_id}"), Some(device_id), Severity::Info);
        }
        if let Some(engine_id) = engine_id.filter(|v| !v.is_empty()) {
            self.events
                .log_event(&format!("snmpEngineID -> {engine_id}"), Some(device_id), Severity::Info);
        }

        self.cache.invalidate_hostname(hostname);
        self.cache.invalidate(device_id);

        if local && self.config.discovery.discover_on_add {
            self.events.log_event(
                &format!("Now discovering {hostname} (id = {device_id})"),
                Some(device_id),
                Severity::Info,
            );
            self.repo.clear_last_discovered(device_id).await?;
        }

        Ok(device_id)
    }

    /// Walk the version/credential matrix and report the first working
    /// parameter set without adding anything.
    pub async fn detect_snmp_auth(
        &self,
        hostname: &str,
        port: Option<u16>,
        transport: Option<SnmpTransport>,
    ) -> Result<Option<SnmpParams>> {
        let hostname = canonical_hostname(hostname);
        let base_transport = transport.unwrap_or(SnmpTransport::Udp);
        let ip = self.probe.resolve(&hostname, base_transport).await?;
        let transport = base_transport.for_ip(ip);
        let port = port.unwrap_or(DEFAULT_SNMP_PORT);
        let req = AddDeviceRequest::default();
        let hide_auth = self.config.snmp.hide_auth;

        for version in self.config.version_order() {
            for params in self.credentials_for(&req, version, transport, port) {
                let label = params.auth_label(hide_auth);
                self.events.log_event(
                    &format!("Trying {version} parameters {label} ..."),
                    None,
                    Severity::Info,
                );
                let target = SnmpTarget::new(ip.to_string(), params.clone());
                let (ok, _) = self.probe.snmp_check(self.client.as_ref(), &target, &[]).await;
                if ok {
                    return Ok(Some(params));
                }
                self.events.log_event(
                    &format!("No reply on {label} using {version}."),
                    None,
                    Severity::Warning,
                );
            }
        }
        Ok(None)
    }

    /// Current reachability of a known device: DNS, ICMP, then SNMP, with
    /// the failing layer identified.
    pub async fn device_status(&self, device: &Device, ping_skip: bool) -> StatusSummary {
        let ip = match device.ip {
            Some(ip) => Some(ip),
            None => self
                .probe
                .resolve(&device.hostname, device.snmp.transport)
                .await
                .ok(),
        };
        let Some(ip) = ip else {
            return StatusSummary {
                up: false,
                kind: StatusKind::Dns,
                message: "Device hostname is not resolved".to_string(),
            };
        };

        let ping_rtt = if ping_skip {
            None
        } else {
            match self.probe.is_reachable(ip).await {
                Some(rtt) => Some(rtt),
                None => {
                    return StatusSummary {
                        up: false,
                        kind: StatusKind::Ping,
                        message: "Device is not responding to PINGs".to_string(),
                    }
                }
            }
        };

        let target = SnmpTarget::new(ip.to_string(), device.snmp.clone());
        let (snmpable, snmp_rtt) = self.probe.snmp_check(self.client.as_ref(), &target, &[]).await;
        if snmpable {
            let ping_part = ping_rtt
                .map(|rtt| format!("PING ({} ms) and ", rtt.as_millis()))
                .unwrap_or_default();
            StatusSummary {
                up: true,
                kind: StatusKind::Ok,
                message: format!(
                    "Device is reachable by {ping_part}SNMP ({} ms)",
                    snmp_rtt.unwrap_or_default().as_millis()
                ),
            }
        } else {
            StatusSummary {
                up: false,
                kind: StatusKind::Snmp,
                message: "Device is not responding to SNMP requests".to_string(),
            }
        }
    }

    /// Delete a device and everything that references it. Partial failure
    /// never aborts the pass; cleanup is maximally thorough and the report
    /// says exactly what happened.
    pub async fn delete_device(&self, device_id: i64, delete_rrd: bool) -> Result<DeleteReport> {
        let device = match self.cache.get(device_id) {
            Some(device) => device,
            None => self
                .repo
                .device_by_id(device_id)
                .await?
                .ok_or(DiscoveryError::DeviceNotFound(device_id))?,
        };

        let mut report = DeleteReport {
            hostname: device.hostname.clone(),
            ..Default::default()
        };

        match self.repo.ports(device_id).await {
            Ok(ports) => {
                for port in ports {
                    match self.repo.delete_port(port.port_id).await {
                        Ok(()) => report
                            .ports
                            .push(format!("id={} ({})", port.port_id, port.if_descr)),
                        Err(err) => report.failed.push(("ports".to_string(), err.to_string())),
                    }
                }
            }
            Err(err) => report.failed.push(("ports".to_string(), err.to_string())),
        }

        match self.repo.entity_ids(device_id).await {
            Ok(grouped) => {
                for (entity_type, entity_ids) in grouped {
                    let mut any = false;
                    for table in ENTITY_TABLES {
                        match self
                            .repo
                            .delete_entity_rows(table, &entity_type, &entity_ids)
                            .await
                        {
                            Ok(n) if n > 0 => any = true,
                            Ok(_) => {}
                            Err(err) => {
                                report.failed.push(((*table).to_string(), err.to_string()))
                            }
                        }
                    }
                    if any {
                        report.entity_types.push(entity_type);
                    }
                }
            }
            Err(err) => report.failed.push(("entities".to_string(), err.to_string())),
        }

        for table in DEVICE_TABLES {
            match self.repo.delete_device_rows(table, device_id).await {
                Ok(n) if n > 0 => report.tables.push((*table).to_string()),
                Ok(_) => {}
                Err(err) => report.failed.push(((*table).to_string(), err.to_string())),
            }
        }

        match self.repo.delete_autodiscovery(device_id).await {
            Ok(n) if n > 0 => report.tables.push("autodiscovery".to_string()),
            Ok(_) => {}
            Err(err) => report
                .failed
                .push(("autodiscovery".to_string(), err.to_string())),
        }

        if delete_rrd {
            let rrd_path = self.config.rrd_path(&device.hostname);
            if rrd_path.is_dir() {
                match std::fs::remove_dir_all(&rrd_path) {
                    Ok(()) => report.rrd_removed = Some(rrd_path),
                    Err(err) => report
                        .failed
                        .push(("rrd".to_string(), err.to_string())),
                }
            }
        }

        self.cache.invalidate(device_id);
        self.events.log_event(
            &format!("Deleted device: {}", device.hostname),
            Some(device_id),
            Severity::Notice,
        );

        Ok(report)
    }
}
