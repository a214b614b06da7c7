//! Network probe: DNS resolution, ICMP reachability, SNMP reachability.
//!
//! One probe call is one observation of one host/transport/version/
//! credential tuple. Nothing here persists or retries across credential
//! sets; the orchestrator drives the permutations.

use std::net::IpAddr;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::net::lookup_host;
use tracing::debug;

use crate::config::Config;
use crate::device::{literal_ip, SnmpTransport};
use crate::error::{DiscoveryError, Result};
use crate::snmp::{self, SnmpClient, SnmpError, SnmpTarget};

/// ICMP echo capability. Swappable so the engine can be exercised without
/// raw-socket privileges.
#[async_trait]
pub trait Pinger: Send + Sync {
    /// Round-trip time on success, `None` when the host did not answer
    /// within the timeout.
    async fn ping(&self, ip: IpAddr, timeout: Duration) -> Option<Duration>;
}

/// ICMP echo via surge-ping.
#[derive(Debug, Default)]
pub struct IcmpPinger;

#[async_trait]
impl Pinger for IcmpPinger {
    async fn ping(&self, ip: IpAddr, timeout: Duration) -> Option<Duration> {
        let payload = [0u8; 8];
        match tokio::time::timeout(timeout, surge_ping::ping(ip, &payload)).await {
            Ok(Ok((_packet, rtt))) => Some(rtt),
            Ok(Err(err)) => {
                debug!(%ip, error = %err, "ping failed");
                None
            }
            Err(_) => None,
        }
    }
}

/// Result of a full probe pass against one credential tuple.
#[derive(Debug, Clone, Default)]
pub struct ProbeResult {
    pub ip: Option<IpAddr>,
    pub reachable: bool,
    pub ping_rtt: Option<Duration>,
    pub snmpable: bool,
    pub snmp_rtt: Option<Duration>,
}

pub struct NetworkProbe {
    ping_timeout: Duration,
    ping_retries: u8,
    pinger: Box<dyn Pinger>,
}

impl NetworkProbe {
    pub fn new(config: &Config) -> Self {
        NetworkProbe {
            ping_timeout: config.ping_timeout(),
            ping_retries: config.discovery.ping_retries,
            pinger: Box::new(IcmpPinger),
        }
    }

    pub fn with_pinger(config: &Config, pinger: Box<dyn Pinger>) -> Self {
        NetworkProbe {
            ping_timeout: config.ping_timeout(),
            ping_retries: config.discovery.ping_retries,
            pinger,
        }
    }

    /// Resolve a hostname for the given transport. Literal addresses pass
    /// through (compressed). IPv6 is used only when the transport demands
    /// it or no IPv4 address exists.
    pub async fn resolve(&self, hostname: &str, transport: SnmpTransport) -> Result<IpAddr> {
        if let Some(ip) = literal_ip(hostname) {
            if transport.is_ipv6() && ip.is_ipv4() {
                return Err(DiscoveryError::DnsFailure(format!(
                    "{hostname} is IPv4 but transport {transport} requires IPv6"
                )));
            }
            return Ok(ip);
        }

        let addrs: Vec<IpAddr> = lookup_host((hostname, 0u16))
            .await
            .map_err(|_| DiscoveryError::DnsFailure(hostname.to_string()))?
            .map(|sa| sa.ip())
            .collect();

        let picked = if transport.is_ipv6() {
            addrs.iter().find(|ip| ip.is_ipv6()).copied()
        } else {
            addrs
                .iter()
                .find(|ip| ip.is_ipv4())
                .or_else(|| addrs.first())
                .copied()
        };
        picked.ok_or_else(|| DiscoveryError::DnsFailure(hostname.to_string()))
    }

    /// ICMP reachability with the configured bounded retry count.
    pub async fn is_reachable(&self, ip: IpAddr) -> Option<Duration> {
        for attempt in 0..=self.ping_retries {
            if let Some(rtt) = self.pinger.ping(ip, self.ping_timeout).await {
                return Some(rtt);
            }
            debug!(%ip, attempt, "no ICMP echo reply");
        }
        None
    }

    /// SNMP reachability for one credential set: a GET of sysDescr, or a
    /// GETNEXT over each caller-supplied OID (first answer wins). An empty
    /// response still proves the agent answered with these credentials.
    pub async fn snmp_check(
        &self,
        client: &dyn SnmpClient,
        target: &SnmpTarget,
        snmpable_oids: &[String],
    ) -> (bool, Option<Duration>) {
        let started = Instant::now();
        if snmpable_oids.is_empty() {
            return match client.get(target, snmp::SYS_DESCR).await {
                Ok(_) | Err(SnmpError::EmptyResponse) => (true, Some(started.elapsed())),
                Err(err) => {
                    debug!(host = %target.host, error = %err, "SNMP check failed");
                    (false, None)
                }
            };
        }
        for oid in snmpable_oids {
            match client.get_next(target, oid).await {
                Ok(_) | Err(SnmpError::EmptyResponse) => return (true, Some(started.elapsed())),
                Err(err) => {
                    debug!(host = %target.host, oid = %oid, error = %err, "SNMP check failed");
                }
            }
        }
        (false, None)
    }

    /// Full probe contract: resolve, ping unless skipped, then SNMP.
    /// Reachability failures short-circuit without touching SNMP.
    pub async fn probe(
        &self,
        client: &dyn SnmpClient,
        hostname: &str,
        target: &SnmpTarget,
        snmpable_oids: &[String],
        ping_skip: bool,
    ) -> Result<ProbeResult> {
        let mut result = ProbeResult::default();

        let ip = match literal_ip(&target.host) {
            Some(ip) => ip,
            None => self.resolve(hostname, target.params.transport).await?,
        };
        result.ip = Some(ip);

        if ping_skip {
            result.reachable = true;
        } else {
            match self.is_reachable(ip).await {
                Some(rtt) => {
                    result.reachable = true;
                    result.ping_rtt = Some(rtt);
                }
                None => return Ok(result),
            }
        }

        let (snmpable, rtt) = self.snmp_check(client, target, snmpable_oids).await;
        result.snmpable = snmpable;
        result.snmp_rtt = rtt;
        Ok(result)
    }
}
