//! SNMP wire adapter.
//!
//! v1/v2c requests over UDP run in-process through `snmp2` sync sessions on
//! the blocking pool. v3 and TCP targets are delegated to the net-snmp
//! command-line tools, which carry the full USM and transport matrix. Both
//! paths normalize into the [`SnmpClient`] status channel: timeout,
//! auth failure, empty response, or transport error.

use std::time::Duration;

use async_trait::async_trait;
use tokio::process::Command;
use tokio::task::spawn_blocking;
use tracing::debug;

use crate::config::Config;
use crate::device::{SnmpParams, SnmpVersion};
use crate::snmp::{oid_in_subtree, SnmpClient, SnmpError, SnmpResult, SnmpTarget, SnmpValue};

const WALK_LIMIT: usize = 500;

pub struct WireClient {
    default_timeout: Duration,
    default_retries: u8,
    force_netsnmp: bool,
}

impl WireClient {
    pub fn new(config: &Config) -> Self {
        WireClient {
            default_timeout: config.snmp_timeout(),
            default_retries: config.snmp.retries,
            force_netsnmp: config.snmp.use_netsnmp,
        }
    }

    fn needs_netsnmp(&self, target: &SnmpTarget) -> bool {
        self.force_netsnmp
            || target.params.version == SnmpVersion::V3
            || target.params.transport.is_tcp()
    }

    fn timeout_for(&self, target: &SnmpTarget) -> Duration {
        target.timeout(self.default_timeout)
    }

    fn retries_for(&self, target: &SnmpTarget) -> u8 {
        target.retries(self.default_retries)
    }

    async fn native_request(
        &self,
        target: &SnmpTarget,
        oid: &str,
        next: bool,
    ) -> SnmpResult<(String, SnmpValue)> {
        let addr = target.socket_addr();
        let params = target.params.clone();
        let oid = oid.to_string();
        let timeout = self.timeout_for(target);
        // The session enforces its own receive timeout; the outer timer is
        // the backstop so a wedged socket cannot stall the caller.
        let outer = timeout * (u32::from(self.retries_for(target)) + 1) + Duration::from_secs(1);

        let handle = spawn_blocking(move || native::request(&addr, &params, &oid, timeout, next));
        match tokio::time::timeout(outer, handle).await {
            Err(_) => Err(SnmpError::Timeout),
            Ok(Err(join)) => Err(SnmpError::Transport(join.to_string())),
            Ok(Ok(result)) => result,
        }
    }
}

#[async_trait]
impl SnmpClient for WireClient {
    async fn get(&self, target: &SnmpTarget, oid: &str) -> SnmpResult<SnmpValue> {
        if self.needs_netsnmp(target) {
            let (_, value) = netsnmp::request(
                "snmpget",
                target,
                oid,
                self.timeout_for(target),
                self.retries_for(target),
            )
            .await?;
            return Ok(value);
        }
        let (_, value) = self.native_request(target, oid, false).await?;
        Ok(value)
    }

    async fn get_next(&self, target: &SnmpTarget, oid: &str) -> SnmpResult<(String, SnmpValue)> {
        if self.needs_netsnmp(target) {
            return netsnmp::request(
                "snmpgetnext",
                target,
                oid,
                self.timeout_for(target),
                self.retries_for(target),
            )
            .await;
        }
        self.native_request(target, oid, true).await
    }

    async fn walk(&self, target: &SnmpTarget, root: &str) -> SnmpResult<Vec<(String, SnmpValue)>> {
        if self.needs_netsnmp(target) {
            return netsnmp::walk(
                target,
                root,
                self.timeout_for(target),
                self.retries_for(target),
            )
            .await;
        }
        let mut varbinds = Vec::new();
        let mut current = root.to_string();
        for _ in 0..WALK_LIMIT {
            match self.native_request(target, &current, true).await {
                Ok((oid, value)) => {
                    if !oid_in_subtree(root, &oid) {
                        break;
                    }
                    current = oid.clone();
                    varbinds.push((oid, value));
                }
                Err(SnmpError::EmptyResponse) => break,
                Err(err) => return Err(err),
            }
        }
        if varbinds.is_empty() {
            return Err(SnmpError::EmptyResponse);
        }
        Ok(varbinds)
    }
}

/// In-process v1/v2c path.
mod native {
    use super::*;

    pub fn request(
        addr: &str,
        params: &SnmpParams,
        oid: &str,
        timeout: Duration,
        next: bool,
    ) -> SnmpResult<(String, SnmpValue)> {
        let parts = parse_oid(oid)?;
        let oid = snmp2::Oid::from(&parts[..])
            .map_err(|e| SnmpError::Transport(format!("bad OID {oid}: {e:?}")))?;
        let community = params.community.clone().unwrap_or_default();

        let mut session = match params.version {
            SnmpVersion::V1 => {
                snmp2::SyncSession::new_v1(addr, community.as_bytes(), Some(timeout), 0)
            }
            SnmpVersion::V2c => {
                snmp2::SyncSession::new_v2c(addr, community.as_bytes(), Some(timeout), 0)
            }
            SnmpVersion::V3 => {
                return Err(SnmpError::Transport(
                    "v3 requests are routed through net-snmp".to_string(),
                ))
            }
        }
        .map_err(classify)?;

        let pdu = if next {
            session.getnext(&oid).map_err(classify)?
        } else {
            session.get(&oid).map_err(classify)?
        };

        let mut varbinds = pdu.varbinds.clone();
        match varbinds.next() {
            Some((oid, value)) => {
                if is_exception(&value) {
                    return Err(SnmpError::EmptyResponse);
                }
                Ok((format!("{oid}"), convert(&value)))
            }
            None => Err(SnmpError::EmptyResponse),
        }
    }

    fn parse_oid(raw: &str) -> SnmpResult<Vec<u64>> {
        let raw = crate::snmp::normalize_numeric(raw);
        raw.split('.')
            .map(|label| {
                label
                    .parse::<u64>()
                    .map_err(|_| SnmpError::Transport(format!("bad OID label '{label}'")))
            })
            .collect()
    }

    fn classify<E: std::fmt::Debug>(err: E) -> SnmpError {
        let text = format!("{err:?}");
        if text.contains("Timeout") || text.contains("TimedOut") || text.contains("WouldBlock") {
            SnmpError::Timeout
        } else if text.contains("AuthFailure") || text.contains("Authentication") {
            SnmpError::AuthFailure
        } else {
            SnmpError::Transport(text)
        }
    }

    fn is_exception(value: &snmp2::Value<'_>) -> bool {
        matches!(
            value,
            snmp2::Value::Null
                | snmp2::Value::NoSuchObject
                | snmp2::Value::NoSuchInstance
                | snmp2::Value::EndOfMibView
        )
    }

    fn convert(value: &snmp2::Value<'_>) -> SnmpValue {
        match value {
            snmp2::Value::Integer(n) => SnmpValue::Integer(*n),
            snmp2::Value::OctetString(bytes) => {
                SnmpValue::OctetString(String::from_utf8_lossy(bytes).into_owned())
            }
            snmp2::Value::ObjectIdentifier(oid) => SnmpValue::Oid(format!("{oid}")),
            snmp2::Value::Counter32(n) => SnmpValue::Counter(u64::from(*n)),
            snmp2::Value::Counter64(n) => SnmpValue::Counter(*n),
            snmp2::Value::Unsigned32(n) => SnmpValue::Gauge(u64::from(*n)),
            snmp2::Value::Timeticks(n) => SnmpValue::TimeTicks(u64::from(*n)),
            snmp2::Value::IpAddress(octets) => {
                SnmpValue::IpAddress(std::net::Ipv4Addr::from(*octets).to_string())
            }
            other => SnmpValue::OctetString(format!("{other:?}")),
        }
    }
}

/// net-snmp command-line path, used for v3 and TCP targets.
mod netsnmp {
    use super::*;

    pub async fn request(
        tool: &str,
        target: &SnmpTarget,
        oid: &str,
        timeout: Duration,
        retries: u8,
    ) -> SnmpResult<(String, SnmpValue)> {
        let stdout = run(tool, target, oid, timeout, retries).await?;
        let line = stdout
            .lines()
            .next()
            .ok_or(SnmpError::EmptyResponse)?
            .trim()
            .to_string();
        parse_line(&line).ok_or(SnmpError::EmptyResponse)
    }

    pub async fn walk(
        target: &SnmpTarget,
        root: &str,
        timeout: Duration,
        retries: u8,
    ) -> SnmpResult<Vec<(String, SnmpValue)>> {
        let stdout = run("snmpwalk", target, root, timeout, retries).await?;
        let varbinds: Vec<(String, SnmpValue)> = stdout
            .lines()
            .take(WALK_LIMIT)
            .filter_map(|line| parse_line(line.trim()))
            .collect();
        if varbinds.is_empty() {
            return Err(SnmpError::EmptyResponse);
        }
        Ok(varbinds)
    }

    async fn run(
        tool: &str,
        target: &SnmpTarget,
        oid: &str,
        timeout: Duration,
        retries: u8,
    ) -> SnmpResult<String> {
        let mut cmd = Command::new(tool);
        cmd.kill_on_drop(true);
        cmd.arg("-Oqn");
        cmd.arg("-t").arg(timeout.as_secs().max(1).to_string());
        cmd.arg("-r").arg(retries.to_string());
        auth_args(&mut cmd, &target.params);
        cmd.arg(agent_address(target));
        cmd.arg(oid);

        let outer = timeout * (u32::from(retries) + 1) + Duration::from_secs(2);
        let output = match tokio::time::timeout(outer, cmd.output()).await {
            Err(_) => return Err(SnmpError::Timeout),
            Ok(Err(err)) => return Err(SnmpError::Transport(format!("{tool}: {err}"))),
            Ok(Ok(output)) => output,
        };

        let stderr = String::from_utf8_lossy(&output.stderr);
        if !output.status.success() {
            return Err(classify_stderr(&stderr));
        }

        let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
        if stdout.contains("No Such Object")
            || stdout.contains("No Such Instance")
            || stdout.contains("No more variables")
        {
            return Err(SnmpError::EmptyResponse);
        }
        debug!(tool, lines = stdout.lines().count(), "net-snmp reply");
        Ok(stdout)
    }

    fn classify_stderr(stderr: &str) -> SnmpError {
        if stderr.contains("Timeout") {
            SnmpError::Timeout
        } else if stderr.contains("Unknown user name")
            || stderr.contains("Authentication failure")
            || stderr.contains("authorization error")
            || stderr.contains("usmStats")
        {
            SnmpError::AuthFailure
        } else {
            SnmpError::Transport(stderr.trim().to_string())
        }
    }

    fn auth_args(cmd: &mut Command, params: &SnmpParams) {
        match params.version {
            SnmpVersion::V1 => {
                cmd.arg("-v").arg("1");
                cmd.arg("-c").arg(params.community.clone().unwrap_or_default());
            }
            SnmpVersion::V2c => {
                cmd.arg("-v").arg("2c");
                cmd.arg("-c").arg(params.community.clone().unwrap_or_default());
            }
            SnmpVersion::V3 => {
                cmd.arg("-v").arg("3");
                let auth = params.v3.clone().unwrap_or_default();
                cmd.arg("-l").arg(auth.auth_level.as_str());
                cmd.arg("-u").arg(&auth.auth_name);
                if !matches!(auth.auth_level, crate::device::AuthLevel::NoAuthNoPriv) {
                    cmd.arg("-a").arg(auth.auth_algo.as_str());
                    cmd.arg("-A").arg(&auth.auth_pass);
                }
                if matches!(auth.auth_level, crate::device::AuthLevel::AuthPriv) {
                    cmd.arg("-x").arg(auth.crypto_algo.as_str());
                    cmd.arg("-X").arg(&auth.crypto_pass);
                }
            }
        }
        if let Some(context) = &params.context {
            cmd.arg("-n").arg(context);
        }
    }

    fn agent_address(target: &SnmpTarget) -> String {
        let transport = target.params.transport.as_str();
        if target.host.contains(':') {
            format!("{transport}:[{}]:{}", target.host, target.params.port)
        } else {
            format!("{transport}:{}:{}", target.host, target.params.port)
        }
    }

    fn parse_line(line: &str) -> Option<(String, SnmpValue)> {
        if line.is_empty() {
            return None;
        }
        let (oid, value) = match line.split_once(' ') {
            Some((oid, value)) => (oid, value.trim().trim_matches('"').to_string()),
            None => (line, String::new()),
        };
        Some((
            crate::snmp::normalize_numeric(oid).to_string(),
            SnmpValue::OctetString(value),
        ))
    }
}
