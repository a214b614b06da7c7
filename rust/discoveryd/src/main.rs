use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::error;

use discoveryd::audit::{EventSink, TracingSink};
use discoveryd::cache::DeviceCache;
use discoveryd::config::Config;
use discoveryd::device::{AuthAlgo, AuthLevel, CryptoAlgo, SnmpTransport, SnmpVersion, V3Auth};
use discoveryd::error::DiscoveryError;
use discoveryd::fingerprint::{CustomMatchers, OsMatcher};
use discoveryd::lifecycle::{AbortSignal, AddDeviceRequest, AddOutcome, Orchestrator};
use discoveryd::osdb::OsDb;
use discoveryd::probe::NetworkProbe;
use discoveryd::repository::{DeviceRepository, MemoryRepository};
use discoveryd::resolver::{IdentityResolver, SnmpOidComparator};
use discoveryd::snmp::SnmpClient;
use discoveryd::telemetry;
use discoveryd::transport::WireClient;

#[derive(Parser, Debug)]
#[command(name = "discoveryd")]
#[command(about = "SNMP device discovery and identity resolution", long_about = None)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, env = "DISCOVERYD_CONFIG")]
    config: Option<String>,

    #[command(subcommand)]
    command: Cmd,
}

#[derive(Subcommand, Debug)]
enum Cmd {
    /// Probe a host and add it as a monitored device
    Add {
        hostname: String,
        /// SNMP version (v1, v2c, v3); all configured versions when omitted
        #[arg(long)]
        version: Option<String>,
        #[arg(long)]
        port: Option<u16>,
        /// udp, udp6, tcp, or tcp6
        #[arg(long)]
        transport: Option<String>,
        /// v1/v2c community; replaces the configured list
        #[arg(long)]
        community: Option<String>,
        /// v3 security level (noAuthNoPriv, authNoPriv, authPriv)
        #[arg(long)]
        authlevel: Option<String>,
        #[arg(long)]
        authname: Option<String>,
        #[arg(long)]
        authpass: Option<String>,
        #[arg(long)]
        authalgo: Option<String>,
        #[arg(long)]
        cryptopass: Option<String>,
        #[arg(long)]
        cryptoalgo: Option<String>,
        /// SNMP context
        #[arg(long)]
        context: Option<String>,
        /// OID proving SNMP reachability; repeatable
        #[arg(long)]
        snmpable: Vec<String>,
        /// Skip the ICMP reachability check
        #[arg(long)]
        ping_skip: bool,
        /// Probe only; do not persist
        #[arg(long)]
        test: bool,
        /// Ignore an existing RRD directory for this hostname
        #[arg(long)]
        ignore_rrd: bool,
        /// Queue the addition for another poller
        #[arg(long)]
        poller_id: Option<i64>,
        #[arg(long)]
        snmp_timeout: Option<u64>,
        #[arg(long)]
        snmp_retries: Option<u8>,
    },
    /// Delete a device and all dependent records
    Remove {
        device_id: i64,
        /// Also remove the on-disk RRD directory
        #[arg(long)]
        delete_rrd: bool,
    },
    /// Detect working SNMP credentials without adding the device
    Detect {
        hostname: String,
        #[arg(long)]
        port: Option<u16>,
        #[arg(long)]
        transport: Option<String>,
    },
    /// Check reachability of a known device
    Status { device_id: i64 },
}

struct Engine {
    config: Arc<Config>,
    repo: Arc<MemoryRepository>,
    orchestrator: Orchestrator,
}

fn build_engine(config: Config) -> Result<Engine> {
    let config = Arc::new(config);
    let repo = Arc::new(
        MemoryRepository::load(&config.repository.path).context("Failed to load device state")?,
    );
    let client: Arc<dyn SnmpClient> = Arc::new(WireClient::new(&config));
    let probe = Arc::new(NetworkProbe::new(&config));
    let db = Arc::new(
        OsDb::load(config.discovery.definitions_dir.as_deref())
            .context("Failed to load OS definitions")?,
    );
    let matcher = Arc::new(OsMatcher::new(db, Arc::new(CustomMatchers::new())));
    let comparator = Arc::new(SnmpOidComparator::new(
        client.clone(),
        config.discovery.oid_match_min,
    ));
    let events: Arc<dyn EventSink> = Arc::new(TracingSink);
    let resolver = IdentityResolver::new(
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
        resolver,
        matcher,
        cache,
        events,
    );
    Ok(Engine {
        config,
        repo,
        orchestrator,
    })
}

fn parse_with<T>(
    raw: Option<&str>,
    what: &str,
    parse: impl Fn(&str) -> Option<T>,
) -> Result<Option<T>> {
    match raw {
        None => Ok(None),
        Some(raw) => parse(raw)
            .map(Some)
            .with_context(|| format!("invalid {what}: {raw}")),
    }
}

#[allow(clippy::too_many_arguments)]
fn v3_from_flags(
    authlevel: Option<&str>,
    authname: Option<&str>,
    authpass: Option<&str>,
    authalgo: Option<&str>,
    cryptopass: Option<&str>,
    cryptoalgo: Option<&str>,
) -> Result<Option<V3Auth>> {
    let Some(level) = authlevel else {
        return Ok(None);
    };
    let auth_level = AuthLevel::parse(level)
        .with_context(|| format!("invalid authlevel: {level}"))?;
    Ok(Some(V3Auth {
        auth_level,
        auth_name: authname.unwrap_or_default().to_string(),
        auth_pass: authpass.unwrap_or_default().to_string(),
        auth_algo: parse_with(authalgo, "authalgo", AuthAlgo::parse)?.unwrap_or_default(),
        crypto_pass: cryptopass.unwrap_or_default().to_string(),
        crypto_algo: parse_with(cryptoalgo, "cryptoalgo", CryptoAlgo::parse)?.unwrap_or_default(),
    }))
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    telemetry::init_tracing();

    let cli = Cli::parse();
    let config = match &cli.config {
        Some(path) => Config::from_file(path)?,
        None => Config::default(),
    };
    let engine = build_engine(config)?;

    match cli.command {
        Cmd::Add {
            hostname,
            version,
            port,
            transport,
            community,
            authlevel,
            authname,
            authpass,
            authalgo,
            cryptopass,
            cryptoalgo,
            context,
            snmpable,
            ping_skip,
            test,
            ignore_rrd,
            poller_id,
            snmp_timeout,
            snmp_retries,
        } => {
            let request = AddDeviceRequest {
                hostname,
                version: parse_with(version.as_deref(), "version", SnmpVersion::parse)?,
                port,
                transport: parse_with(transport.as_deref(), "transport", SnmpTransport::parse)?,
                community,
                v3: v3_from_flags(
                    authlevel.as_deref(),
                    authname.as_deref(),
                    authpass.as_deref(),
                    authalgo.as_deref(),
                    cryptopass.as_deref(),
                    cryptoalgo.as_deref(),
                )?,
                context,
                snmpable,
                ping_skip,
                test,
                ignore_rrd,
                poller_id,
                timeout_secs: snmp_timeout,
                retries: snmp_retries,
                max_repetitions: None,
            };

            let abort = AbortSignal::new();
            match engine.orchestrator.add_device(&request, &abort).await {
                Ok(AddOutcome::Added { device_id }) => {
                    engine.repo.save(&engine.config.repository.path)?;
                    println!("Device added (id = {device_id}).");
                    Ok(ExitCode::SUCCESS)
                }
                Ok(AddOutcome::TestPassed { version, transport }) => {
                    println!("Device is available over {transport} with SNMP {version}; nothing persisted.");
                    Ok(ExitCode::SUCCESS)
                }
                Ok(AddOutcome::Queued { action_id, poller_id }) => {
                    engine.repo.save(&engine.config.repository.path)?;
                    println!("Addition queued [{action_id}] for poller [{poller_id}].");
                    Ok(ExitCode::SUCCESS)
                }
                // Unreachable with the supplied parameters: the caller may
                // retry with other options, signalled by a distinct code.
                Err(err @ DiscoveryError::SnmpUnreachable { .. }) => {
                    error!("{err}");
                    Ok(ExitCode::from(2))
                }
                Err(err) => {
                    error!("{err}");
                    Ok(ExitCode::FAILURE)
                }
            }
        }
        Cmd::Remove {
            device_id,
            delete_rrd,
        } => match engine.orchestrator.delete_device(device_id, delete_rrd).await {
            Ok(report) => {
                engine.repo.save(&engine.config.repository.path)?;
                println!("{report}");
                Ok(ExitCode::SUCCESS)
            }
            Err(err) => {
                error!("{err}");
                Ok(ExitCode::FAILURE)
            }
        },
        Cmd::Detect {
            hostname,
            port,
            transport,
        } => {
            let transport = parse_with(transport.as_deref(), "transport", SnmpTransport::parse)?;
            match engine
                .orchestrator
                .detect_snmp_auth(&hostname, port, transport)
                .await
            {
                Ok(Some(params)) => {
                    println!(
                        "SNMP {} reachable on port {} ({}).",
                        params.version,
                        params.port,
                        params.auth_label(engine.config.snmp.hide_auth)
                    );
                    Ok(ExitCode::SUCCESS)
                }
                Ok(None) => {
                    println!("No working SNMP credentials found for {hostname}.");
                    Ok(ExitCode::from(2))
                }
                Err(err) => {
                    error!("{err}");
                    Ok(ExitCode::FAILURE)
                }
            }
        }
        Cmd::Status { device_id } => {
            let device = engine
                .repo
                .device_by_id(device_id)
                .await?
                .ok_or(DiscoveryError::DeviceNotFound(device_id))?;
            let ping_skip = engine.repo.attrib(device_id, "ping_skip").is_some();
            let summary = engine.orchestrator.device_status(&device, ping_skip).await;
            println!("{}", summary.message);
            if summary.up {
                Ok(ExitCode::SUCCESS)
            } else {
                Ok(ExitCode::FAILURE)
            }
        }
    }
}
