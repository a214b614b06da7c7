//! End-to-end add/delete lifecycle against the scripted SNMP fabric.

mod support;

use discoveryd::device::{AuthLevel, SnmpParams, SnmpVersion, V3Auth};
use discoveryd::error::DiscoveryError;
use discoveryd::lifecycle::{AbortSignal, AddDeviceRequest, AddOutcome};
use discoveryd::repository::DeviceRepository;
use discoveryd::snmp::{
    SNMP_ENGINE_ID, SYS_CONTACT, SYS_DESCR, SYS_LOCATION, SYS_NAME, SYS_OBJECT_ID,
};
use pretty_assertions::assert_eq;
use support::{base_config, harness, harness_with, seed_device};
use discoveryd::fingerprint::CustomMatchers;

fn add_request(hostname: &str) -> AddDeviceRequest {
    AddDeviceRequest {
        hostname: hostname.to_string(),
        version: Some(SnmpVersion::V2c),
        ..Default::default()
    }
}

fn script_cisco_agent(h: &support::Harness, host: &str) {
    h.snmp.add_agent(host, &["v2c:public"]);
    h.snmp.set_value(host, SYS_DESCR, "Cisco IOS Software, C2960 Software");
    h.snmp.set_value(host, SYS_OBJECT_ID, "1.3.6.1.4.1.9.1.1");
    h.snmp.set_value(host, SYS_NAME, "SW1.Lab");
    h.snmp.set_value(host, SNMP_ENGINE_ID, "80001f888001aabb");
    h.snmp.set_value(host, SYS_LOCATION, "dc1 rack 4");
    h.snmp.set_value(host, SYS_CONTACT, "noc@example.com");
}

#[tokio::test]
async fn add_device_persists_fingerprint_and_identity() {
    let h = harness(base_config());
    script_cisco_agent(&h, "192.0.2.10");

    let device_id = match h
        .orchestrator
        .add_device(&add_request("192.0.2.10"), &AbortSignal::new())
        .await
        .unwrap()
    {
        AddOutcome::Added { device_id } => device_id,
        other => panic!("expected Added, got {other:?}"),
    };

    let device = h.repo.device_by_id(device_id).await.unwrap().unwrap();
    assert_eq!(device.hostname, "192.0.2.10");
    assert_eq!(device.ip.unwrap().to_string(), "192.0.2.10");
    assert_eq!(device.os.as_deref(), Some("ios"));
    assert_eq!(device.sys_object_id.as_deref(), Some("1.3.6.1.4.1.9.1.1"));
    assert_eq!(device.sys_name.as_deref(), Some("sw1.lab"));
    assert_eq!(device.snmp_engine_id.as_deref(), Some("80001f888001aabb"));
    assert_eq!(device.location.as_deref(), Some("dc1 rack 4"));
    assert_eq!(device.poller_id, 0);

    assert!(h.sink.contains("Device added: 192.0.2.10"));
    assert!(h.sink.contains("sysObjectID -> 1.3.6.1.4.1.9.1.1"));
    assert!(h.sink.contains("snmpEngineID -> 80001f888001aabb"));
    assert!(h.sink.contains("Now discovering 192.0.2.10"));
}

#[tokio::test]
async fn credentials_are_tried_in_configured_order() {
    let mut config = base_config();
    config.snmp.communities = vec!["wrong".to_string(), "public".to_string()];
    let h = harness(config);
    script_cisco_agent(&h, "192.0.2.11");

    let outcome = h
        .orchestrator
        .add_device(&add_request("192.0.2.11"), &AbortSignal::new())
        .await
        .unwrap();
    assert!(matches!(outcome, AddOutcome::Added { .. }));

    assert!(h.sink.contains("Trying v2c community wrong ..."));
    assert!(h.sink.contains("No reply on community wrong using v2c."));
    assert!(h.sink.contains("Trying v2c community public ..."));
}

#[tokio::test]
async fn exhausting_all_versions_reports_snmp_unreachable() {
    let mut config = base_config();
    config.snmp.v3.push(V3Auth {
        auth_level: AuthLevel::AuthNoPriv,
        auth_name: "observer".to_string(),
        auth_pass: "secret".to_string(),
        ..Default::default()
    });
    let h = harness(config);
    // Host answers pings but rejects every credential.
    h.snmp.add_agent("192.0.2.12", &[]);

    let mut request = add_request("192.0.2.12");
    request.version = None;
    let err = h
        .orchestrator
        .add_device(&request, &AbortSignal::new())
        .await
        .unwrap_err();
    match err {
        DiscoveryError::SnmpUnreachable { hostname, tried } => {
            assert_eq!(hostname, "192.0.2.12");
            assert_eq!(tried, "v2c, v3, v1");
        }
        other => panic!("expected SnmpUnreachable, got {other}"),
    }
    assert!(h.sink.contains("Could not reach 192.0.2.12 with given SNMP parameters using v2c."));
}

#[tokio::test]
async fn duplicate_verdict_stops_all_further_credentials() {
    let mut config = base_config();
    config.snmp.communities = vec!["public".to_string(), "backup".to_string()];
    let h = harness(config);

    let mut existing = seed_device(
        "core.lab",
        Some("192.0.2.20"),
        SnmpParams::community(SnmpVersion::V2c, "public"),
    );
    existing.sys_name = Some("core".to_string());
    h.repo.insert_device(existing).await.unwrap();

    h.snmp.add_agent("192.0.2.20", &["v2c:public", "v2c:backup"]);
    h.snmp.set_value("192.0.2.20", SYS_DESCR, "Cisco IOS Software");

    let err = h
        .orchestrator
        .add_device(&add_request("192.0.2.20"), &AbortSignal::new())
        .await
        .unwrap_err();
    assert!(matches!(err, DiscoveryError::DuplicateNetworkIdentity { .. }));

    // The duplicate is SNMP-able, so no other credential can change the
    // answer; the second community must never have been attempted.
    assert!(!h.sink.contains("Trying v2c community backup"));
    assert_eq!(h.repo.device_count(), 1);
}

#[tokio::test]
async fn duplicate_hostname_is_rejected_before_probing() {
    let h = harness(base_config());
    h.repo
        .insert_device(seed_device(
            "192.0.2.30",
            Some("192.0.2.30"),
            SnmpParams::community(SnmpVersion::V2c, "public"),
        ))
        .await
        .unwrap();

    let err = h
        .orchestrator
        .add_device(&add_request("192.0.2.30"), &AbortSignal::new())
        .await
        .unwrap_err();
    assert!(matches!(err, DiscoveryError::DuplicateHostname(_)));
    // No credential attempt was made at all.
    assert!(h.snmp.calls().is_empty());
}

#[tokio::test]
async fn test_mode_probes_without_persisting() {
    let h = harness(base_config());
    script_cisco_agent(&h, "192.0.2.13");

    let mut request = add_request("192.0.2.13");
    request.test = true;
    let outcome = h
        .orchestrator
        .add_device(&request, &AbortSignal::new())
        .await
        .unwrap();
    assert!(matches!(
        outcome,
        AddOutcome::TestPassed {
            version: SnmpVersion::V2c,
            ..
        }
    ));
    assert_eq!(h.repo.device_count(), 0);
    assert!(h.sink.contains("successfully been tested"));
}

#[tokio::test]
async fn unreachable_host_fails_before_snmp() {
    let h = harness_with(base_config(), false, CustomMatchers::new());
    script_cisco_agent(&h, "192.0.2.14");

    let err = h
        .orchestrator
        .add_device(&add_request("192.0.2.14"), &AbortSignal::new())
        .await
        .unwrap_err();
    assert!(matches!(err, DiscoveryError::Unreachable(_)));
    assert!(h.snmp.calls().is_empty());
}

#[tokio::test]
async fn ping_skip_adds_attribute_and_warns_when_host_answers() {
    let h = harness(base_config());
    script_cisco_agent(&h, "192.0.2.15");

    let mut request = add_request("192.0.2.15");
    request.ping_skip = true;
    let outcome = h
        .orchestrator
        .add_device(&request, &AbortSignal::new())
        .await
        .unwrap();
    let AddOutcome::Added { device_id } = outcome else {
        panic!("expected Added");
    };
    assert_eq!(h.repo.attrib(device_id, "ping_skip").as_deref(), Some("1"));
    assert!(h.sink.contains("the device responds to an ICMP ping"));
}

#[tokio::test]
async fn invalid_snmpable_oid_rejects_whole_request() {
    let h = harness(base_config());
    script_cisco_agent(&h, "192.0.2.16");

    let mut request = add_request("192.0.2.16");
    request.snmpable = vec![
        "SNMPv2-MIB::sysDescr.0".to_string(),
        "TOTALLY-BOGUS::nope.0".to_string(),
    ];
    let err = h
        .orchestrator
        .add_device(&request, &AbortSignal::new())
        .await
        .unwrap_err();
    assert!(matches!(err, DiscoveryError::InvalidOidSpecification(_)));
    assert_eq!(h.repo.device_count(), 0);
}

#[tokio::test]
async fn remote_poller_addition_is_queued_without_probing() {
    let h = harness(base_config());
    h.repo.add_poller(5, "edge-poller");

    let mut request = add_request("remote.lab");
    request.poller_id = Some(5);
    let outcome = h
        .orchestrator
        .add_device(&request, &AbortSignal::new())
        .await
        .unwrap();
    assert_eq!(
        outcome,
        AddOutcome::Queued {
            action_id: 1,
            poller_id: 5
        }
    );
    assert!(h.snmp.calls().is_empty());

    // Queuing the same hostname again is refused.
    let err = h
        .orchestrator
        .add_device(&request, &AbortSignal::new())
        .await
        .unwrap_err();
    assert!(matches!(err, DiscoveryError::AlreadyQueued { poller_id: 5, .. }));
}

#[tokio::test]
async fn unknown_remote_poller_is_rejected() {
    let h = harness(base_config());
    let mut request = add_request("remote.lab");
    request.poller_id = Some(9);
    let err = h
        .orchestrator
        .add_device(&request, &AbortSignal::new())
        .await
        .unwrap_err();
    assert!(matches!(err, DiscoveryError::UnknownPoller(9)));
}

#[tokio::test]
async fn abort_signal_stops_between_attempts() {
    let h = harness(base_config());
    script_cisco_agent(&h, "192.0.2.17");

    let abort = AbortSignal::new();
    abort.abort();
    let err = h
        .orchestrator
        .add_device(&add_request("192.0.2.17"), &abort)
        .await
        .unwrap_err();
    assert!(matches!(err, DiscoveryError::Aborted));
}

#[tokio::test]
async fn hide_auth_redacts_progress_messages() {
    let mut config = base_config();
    config.snmp.hide_auth = true;
    config.snmp.communities = vec!["sekrit".to_string()];
    let h = harness(config);
    h.snmp.add_agent("192.0.2.18", &["v2c:sekrit"]);
    h.snmp.set_value("192.0.2.18", SYS_DESCR, "Linux host 5.10");

    h.orchestrator
        .add_device(&add_request("192.0.2.18"), &AbortSignal::new())
        .await
        .unwrap();

    assert!(h.sink.contains("Trying v2c community *** [0] ..."));
    assert!(!h.sink.messages().iter().any(|m| m.contains("sekrit")));
}

#[tokio::test]
async fn late_insert_conflict_is_a_persistence_failure() {
    let h = harness(base_config());
    script_cisco_agent(&h, "192.0.2.19");

    let candidate = discoveryd::device::DeviceCandidate {
        device_id: None,
        hostname: "192.0.2.19".to_string(),
        ip: Some("192.0.2.19".parse().unwrap()),
        snmp: SnmpParams::community(SnmpVersion::V2c, "public"),
        os: None,
    };
    h.orchestrator
        .create_device("192.0.2.19", &candidate, 0)
        .await
        .unwrap();
    let err = h
        .orchestrator
        .create_device("192.0.2.19", &candidate, 0)
        .await
        .unwrap_err();
    assert!(matches!(err, DiscoveryError::PersistenceFailure(_)));
}

#[tokio::test]
async fn remote_owned_insert_leaves_identity_blank() {
    let h = harness(base_config());
    h.repo.add_poller(7, "far-poller");
    script_cisco_agent(&h, "192.0.2.21");

    let candidate = discoveryd::device::DeviceCandidate {
        device_id: None,
        hostname: "192.0.2.21".to_string(),
        ip: Some("192.0.2.21".parse().unwrap()),
        snmp: SnmpParams::community(SnmpVersion::V2c, "public"),
        os: None,
    };
    let device_id = h
        .orchestrator
        .create_device("192.0.2.21", &candidate, 7)
        .await
        .unwrap();

    let device = h.repo.device_by_id(device_id).await.unwrap().unwrap();
    assert_eq!(device.poller_id, 7);
    assert_eq!(device.os, None);
    assert_eq!(device.sys_object_id, None);
    assert_eq!(device.snmp_engine_id, None);
    assert!(h.sink.contains("(Poller: far-poller [7])"));
}

#[tokio::test]
async fn delete_device_reports_every_table() {
    let mut config = base_config();
    let rrd_root = tempfile::tempdir().unwrap();
    config.rrd.dir = rrd_root.path().to_path_buf();
    let h = harness(config);

    let device_id = h
        .repo
        .insert_device(seed_device(
            "del.lab",
            Some("10.9.9.9"),
            SnmpParams::community(SnmpVersion::V2c, "public"),
        ))
        .await
        .unwrap();
    h.repo.add_port(101, device_id, "GigabitEthernet0/1");
    h.repo.add_port(102, device_id, "GigabitEthernet0/2");
    h.repo.add_port(103, device_id, "Vlan1");
    h.repo.add_entity("sensor", 11, device_id);
    h.repo.add_entity("sensor", 12, device_id);
    h.repo.seed_device_row("sensors", device_id);
    h.repo.seed_device_row("eventlog", device_id);
    h.repo.add_autodiscovery_link(device_id);
    std::fs::create_dir_all(rrd_root.path().join("del.lab")).unwrap();

    let report = h.orchestrator.delete_device(device_id, true).await.unwrap();

    assert_eq!(report.ports.len(), 3);
    assert!(report.ports.iter().any(|p| p.contains("GigabitEthernet0/1")));
    assert_eq!(report.entity_types, vec!["sensor".to_string()]);
    assert!(report.tables.contains(&"sensors".to_string()));
    assert!(report.tables.contains(&"eventlog".to_string()));
    assert!(report.tables.contains(&"devices".to_string()));
    assert!(report.tables.contains(&"autodiscovery".to_string()));
    assert!(report.failed.is_empty());
    assert!(report.rrd_removed.is_some());
    assert!(!rrd_root.path().join("del.lab").exists());

    assert!(h.repo.device_by_id(device_id).await.unwrap().is_none());
    assert_eq!(h.repo.ports(device_id).await.unwrap().len(), 0);
    assert!(h.sink.contains("Deleted device: del.lab"));

    let rendered = report.to_string();
    assert!(rendered.contains(" * Deleted interfaces:"));
    assert!(rendered.contains(" * Deleted device: del.lab"));
}

#[tokio::test]
async fn delete_missing_device_errors() {
    let h = harness(base_config());
    let err = h.orchestrator.delete_device(404, false).await.unwrap_err();
    assert!(matches!(err, DiscoveryError::DeviceNotFound(404)));
}

#[tokio::test]
async fn detect_snmp_auth_walks_the_matrix() {
    let mut config = base_config();
    config.snmp.v3.push(V3Auth {
        auth_level: AuthLevel::AuthNoPriv,
        auth_name: "observer".to_string(),
        auth_pass: "secret".to_string(),
        ..Default::default()
    });
    let h = harness(config);
    // Only the v3 credentials work.
    h.snmp.add_agent("192.0.2.40", &["v3:observer:authNoPriv:secret:"]);
    h.snmp.set_value("192.0.2.40", SYS_DESCR, "Linux host 5.10");

    let params = h
        .orchestrator
        .detect_snmp_auth("192.0.2.40", None, None)
        .await
        .unwrap()
        .expect("expected working credentials");
    assert_eq!(params.version, SnmpVersion::V3);
    assert_eq!(params.v3.unwrap().auth_name, "observer");
}

#[tokio::test]
async fn device_status_reports_the_failing_layer() {
    let h = harness(base_config());
    script_cisco_agent(&h, "192.0.2.50");
    let device = seed_device(
        "192.0.2.50",
        Some("192.0.2.50"),
        SnmpParams::community(SnmpVersion::V2c, "public"),
    );

    let summary = h.orchestrator.device_status(&device, false).await;
    assert!(summary.up);
    assert!(summary.message.contains("reachable by PING"));

    let dead = seed_device(
        "192.0.2.51",
        Some("192.0.2.51"),
        SnmpParams::community(SnmpVersion::V2c, "public"),
    );
    let summary = h.orchestrator.device_status(&dead, false).await;
    assert!(!summary.up);
    assert_eq!(
        summary.message,
        "Device is not responding to SNMP requests"
    );
}
