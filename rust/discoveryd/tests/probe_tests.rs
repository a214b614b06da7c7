//! Probe contract: resolve, ICMP short-circuit, SNMP reachability.

mod support;

use discoveryd::device::{SnmpParams, SnmpTransport, SnmpVersion};
use discoveryd::error::DiscoveryError;
use discoveryd::probe::NetworkProbe;
use discoveryd::snmp::{SnmpTarget, SYS_DESCR};
use pretty_assertions::assert_eq;
use support::{base_config, ScriptedSnmp, StubPinger};

fn probe(alive: bool) -> NetworkProbe {
    NetworkProbe::with_pinger(&base_config(), Box::new(StubPinger { alive }))
}

fn target(host: &str) -> SnmpTarget {
    SnmpTarget::new(host, SnmpParams::community(SnmpVersion::V2c, "public"))
}

#[tokio::test]
async fn ping_failure_short_circuits_without_snmp() {
    let snmp = ScriptedSnmp::new();
    snmp.add_agent("192.0.2.60", &["v2c:public"]);
    snmp.set_value("192.0.2.60", SYS_DESCR, "Linux host 5.10");

    let result = probe(false)
        .probe(&snmp, "192.0.2.60", &target("192.0.2.60"), &[], false)
        .await
        .unwrap();
    assert_eq!(result.ip.unwrap().to_string(), "192.0.2.60");
    assert!(!result.reachable);
    assert!(!result.snmpable);
    // SNMP was never attempted against the unreachable host.
    assert!(snmp.calls().is_empty());
}

#[tokio::test]
async fn reachable_host_is_probed_over_snmp() {
    let snmp = ScriptedSnmp::new();
    snmp.add_agent("192.0.2.61", &["v2c:public"]);
    snmp.set_value("192.0.2.61", SYS_DESCR, "Linux host 5.10");

    let result = probe(true)
        .probe(&snmp, "192.0.2.61", &target("192.0.2.61"), &[], false)
        .await
        .unwrap();
    assert!(result.reachable);
    assert!(result.ping_rtt.is_some());
    assert!(result.snmpable);
    assert!(result.snmp_rtt.is_some());
}

#[tokio::test]
async fn ping_skip_goes_straight_to_snmp() {
    let snmp = ScriptedSnmp::new();
    snmp.add_agent("192.0.2.62", &["v2c:public"]);
    snmp.set_value("192.0.2.62", SYS_DESCR, "Linux host 5.10");

    let result = probe(false)
        .probe(&snmp, "192.0.2.62", &target("192.0.2.62"), &[], true)
        .await
        .unwrap();
    assert!(result.reachable);
    assert_eq!(result.ping_rtt, None);
    assert!(result.snmpable);
}

#[tokio::test]
async fn wrong_credentials_are_not_snmpable() {
    let snmp = ScriptedSnmp::new();
    snmp.add_agent("192.0.2.63", &["v2c:private"]);
    snmp.set_value("192.0.2.63", SYS_DESCR, "Linux host 5.10");

    let result = probe(true)
        .probe(&snmp, "192.0.2.63", &target("192.0.2.63"), &[], false)
        .await
        .unwrap();
    assert!(result.reachable);
    assert!(!result.snmpable);
}

#[tokio::test]
async fn caller_supplied_oids_drive_the_reachability_check() {
    let snmp = ScriptedSnmp::new();
    // An agent without the standard system tree, answering only under a
    // vendor subtree.
    snmp.add_agent("192.0.2.64", &["v2c:public"]);
    snmp.set_value("192.0.2.64", "1.3.6.1.4.1.99999.1.1.0", "vendor-ok");

    let p = probe(true);
    let result = p
        .probe(
            &snmp,
            "192.0.2.64",
            &target("192.0.2.64"),
            &["1.3.6.1.4.1.99999.1.1".to_string()],
            false,
        )
        .await
        .unwrap();
    assert!(result.snmpable);
    assert!(snmp
        .calls()
        .iter()
        .any(|call| call.starts_with("getnext 192.0.2.64")));
}

#[tokio::test]
async fn ipv6_transport_rejects_ipv4_literals() {
    let p = probe(true);
    let err = p.resolve("192.0.2.65", SnmpTransport::Udp6).await.unwrap_err();
    assert!(matches!(err, DiscoveryError::DnsFailure(_)));

    let ip = p.resolve("2001:db8::5", SnmpTransport::Udp6).await.unwrap();
    assert_eq!(ip.to_string(), "2001:db8::5");
}
