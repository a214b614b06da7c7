//! Shared harness for the integration suites: a scripted SNMP agent map,
//! a capturing audit sink, a stub pinger, and wiring helpers.

#![allow(dead_code)]

use std::collections::{BTreeMap, HashMap, HashSet};
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;

use discoveryd::audit::{EventSink, Severity};
use discoveryd::cache::DeviceCache;
use discoveryd::config::Config;
use discoveryd::device::{Device, DeviceStatus, SnmpParams, SnmpVersion};
use discoveryd::fingerprint::{CustomMatchers, OsMatcher};
use discoveryd::lifecycle::Orchestrator;
use discoveryd::osdb::OsDb;
use discoveryd::probe::{NetworkProbe, Pinger};
use discoveryd::repository::MemoryRepository;
use discoveryd::resolver::{IdentityResolver, SnmpOidComparator};
use discoveryd::snmp::{
    oid_in_subtree, normalize_numeric, SnmpClient, SnmpError, SnmpResult, SnmpTarget, SnmpValue,
};

/// Credential key a scripted agent accepts.
pub fn cred_key(params: &SnmpParams) -> String {
    match params.version {
        SnmpVersion::V3 => {
            let auth = params.v3.clone().unwrap_or_default();
            format!(
                "v3:{}:{}:{}:{}",
                auth.auth_name, auth.auth_level, auth.auth_pass, auth.crypto_pass
            )
        }
        version => format!(
            "{}:{}",
            version,
            params.community.clone().unwrap_or_default()
        ),
    }
}

#[derive(Default)]
struct Agent {
    accepts: HashSet<String>,
    values: BTreeMap<String, String>,
    walks: HashMap<String, Vec<(String, String)>>,
}

/// In-memory SNMP fabric: agents keyed by host, values keyed by OID.
/// Unknown hosts and rejected credentials behave like timeouts, exactly as
/// the wire does.
#[derive(Default)]
pub struct ScriptedSnmp {
    agents: Mutex<HashMap<String, Agent>>,
    calls: Mutex<Vec<String>>,
}

impl ScriptedSnmp {
    pub fn new() -> Self {
        ScriptedSnmp::default()
    }

    pub fn add_agent(&self, host: &str, accepts: &[&str]) {
        let mut agents = self.agents.lock();
        let agent = agents.entry(host.to_string()).or_default();
        for key in accepts {
            agent.accepts.insert((*key).to_string());
        }
    }

    pub fn set_value(&self, host: &str, oid: &str, value: &str) {
        let mut agents = self.agents.lock();
        agents
            .entry(host.to_string())
            .or_default()
            .values
            .insert(normalize_numeric(oid).to_string(), value.to_string());
    }

    pub fn set_walk(&self, host: &str, root: &str, varbinds: &[(&str, &str)]) {
        let mut agents = self.agents.lock();
        agents.entry(host.to_string()).or_default().walks.insert(
            normalize_numeric(root).to_string(),
            varbinds
                .iter()
                .map(|(oid, value)| ((*oid).to_string(), (*value).to_string()))
                .collect(),
        );
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().clone()
    }

    fn record(&self, op: &str, target: &SnmpTarget, oid: &str) {
        self.calls
            .lock()
            .push(format!("{op} {} {oid}", target.host));
    }

    fn check_access(&self, target: &SnmpTarget) -> SnmpResult<()> {
        let agents = self.agents.lock();
        let Some(agent) = agents.get(&target.host) else {
            return Err(SnmpError::Timeout);
        };
        if !agent.accepts.contains(&cred_key(&target.params)) {
            return Err(SnmpError::Timeout);
        }
        Ok(())
    }
}

#[async_trait]
impl SnmpClient for ScriptedSnmp {
    async fn get(&self, target: &SnmpTarget, oid: &str) -> SnmpResult<SnmpValue> {
        self.record("get", target, oid);
        self.check_access(target)?;
        let agents = self.agents.lock();
        let agent = agents.get(&target.host).unwrap();
        match agent.values.get(normalize_numeric(oid)) {
            Some(value) => Ok(SnmpValue::OctetString(value.clone())),
            None => Err(SnmpError::EmptyResponse),
        }
    }

    async fn get_next(&self, target: &SnmpTarget, oid: &str) -> SnmpResult<(String, SnmpValue)> {
        self.record("getnext", target, oid);
        self.check_access(target)?;
        let agents = self.agents.lock();
        let agent = agents.get(&target.host).unwrap();
        agent
            .values
            .iter()
            .find(|(key, _)| oid_in_subtree(oid, key))
            .map(|(key, value)| (key.clone(), SnmpValue::OctetString(value.clone())))
            .ok_or(SnmpError::EmptyResponse)
    }

    async fn walk(&self, target: &SnmpTarget, root: &str) -> SnmpResult<Vec<(String, SnmpValue)>> {
        self.record("walk", target, root);
        self.check_access(target)?;
        let agents = self.agents.lock();
        let agent = agents.get(&target.host).unwrap();
        if let Some(varbinds) = agent.walks.get(normalize_numeric(root)) {
            return Ok(varbinds
                .iter()
                .map(|(oid, value)| (oid.clone(), SnmpValue::OctetString(value.clone())))
                .collect());
        }
        let derived: Vec<(String, SnmpValue)> = agent
            .values
            .iter()
            .filter(|(key, _)| oid_in_subtree(root, key))
            .map(|(key, value)| (key.clone(), SnmpValue::OctetString(value.clone())))
            .collect();
        if derived.is_empty() {
            return Err(SnmpError::EmptyResponse);
        }
        Ok(derived)
    }
}

/// Capturing audit sink.
#[derive(Default)]
pub struct MemorySink {
    entries: Mutex<Vec<(Severity, String)>>,
}

impl MemorySink {
    pub fn new() -> Self {
        MemorySink::default()
    }

    pub fn messages(&self) -> Vec<String> {
        self.entries.lock().iter().map(|(_, m)| m.clone()).collect()
    }

    pub fn contains(&self, needle: &str) -> bool {
        self.entries.lock().iter().any(|(_, m)| m.contains(needle))
    }
}

impl EventSink for MemorySink {
    fn log_event(&self, message: &str, _device_id: Option<i64>, severity: Severity) {
        self.entries.lock().push((severity, message.to_string()));
    }
}

/// Pinger stub: every address answers (or none does).
pub struct StubPinger {
    pub alive: bool,
}

#[async_trait]
impl Pinger for StubPinger {
    async fn ping(&self, _ip: IpAddr, _timeout: Duration) -> Option<Duration> {
        self.alive.then(|| Duration::from_millis(1))
    }
}

pub fn base_config() -> Config {
    let mut config = Config::default();
    config.discovery.ping_retries = 0;
    config
}

pub struct Harness {
    pub config: Arc<Config>,
    pub repo: Arc<MemoryRepository>,
    pub snmp: Arc<ScriptedSnmp>,
    pub sink: Arc<MemorySink>,
    pub resolver: IdentityResolver,
    pub orchestrator: Orchestrator,
}

pub fn harness(config: Config) -> Harness {
    harness_with(config, true, CustomMatchers::new())
}

pub fn harness_with(config: Config, alive: bool, custom: CustomMatchers) -> Harness {
    let config = Arc::new(config);
    let repo = Arc::new(MemoryRepository::new());
    let snmp = Arc::new(ScriptedSnmp::new());
    let sink = Arc::new(MemorySink::new());
    let client: Arc<dyn SnmpClient> = snmp.clone();
    let events: Arc<dyn EventSink> = sink.clone();
    let probe = Arc::new(NetworkProbe::with_pinger(
        &config,
        Box::new(StubPinger { alive }),
    ));
    let db = Arc::new(OsDb::load(None).expect("embedded corpus"));
    let matcher = Arc::new(OsMatcher::new(db, Arc::new(custom)));
    let comparator = Arc::new(SnmpOidComparator::new(
        client.clone(),
        config.discovery.oid_match_min,
    ));
    let resolver = IdentityResolver::new(
        repo.clone(),
        client.clone(),
        probe.clone(),
        matcher.clone(),
        comparator.clone(),
        events.clone(),
    );
    let resolver_for_orchestrator = IdentityResolver::new(
        repo.clone(),
        client.clone(),
        probe.clone(),
        matcher.clone(),
        comparator,
        events.clone(),
    );
    let cache = Arc::new(DeviceCache::new(config.repository.cache_size));
    let orchestrator = Orchestrator::new(
        config.clone(),
        repo.clone(),
        client,
        probe,
        resolver_for_orchestrator,
        matcher,
        cache,
        events,
    );
    Harness {
        config,
        repo,
        snmp,
        sink,
        resolver,
        orchestrator,
    }
}

/// A bare device row for seeding the repository.
pub fn seed_device(hostname: &str, ip: Option<&str>, snmp: SnmpParams) -> Device {
    Device {
        device_id: 0,
        hostname: hostname.to_string(),
        ip: ip.map(|raw| raw.parse::<IpAddr>().unwrap()),
        snmp,
        sys_object_id: None,
        sys_descr: None,
        sys_name: None,
        snmp_engine_id: None,
        location: None,
        sys_contact: None,
        os: None,
        status: DeviceStatus::Up,
        disabled: false,
        poller_id: 0,
        last_polled: None,
        last_discovered: None,
        uptime: None,
    }
}
