//! Device repository.
//!
//! The engine issues logical reads and writes against [`DeviceRepository`];
//! physical storage is an external concern. [`MemoryRepository`] is the
//! in-process implementation used by the CLI (with JSON persistence) and by
//! the test suites.

use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::net::IpAddr;
use std::path::Path;

use async_trait::async_trait;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::device::Device;
use crate::error::{DiscoveryError, Result};

/// Tables holding polymorphic entity rows (`entity_type` + `entity_id`).
pub const ENTITY_TABLES: &[&str] = &[
    "entity_permissions",
    "entity_attribs",
    "alert_table",
    "group_table",
];

/// Device-scoped tables cleaned on deletion, in deletion order. The
/// `devices` row itself goes last.
pub const DEVICE_TABLES: &[&str] = &[
    "device_graphs",
    "devices_attribs",
    "devices_locations",
    "devices_perftimes",
    "eventlog",
    "syslog",
    "sensors",
    "status",
    "processors",
    "mempools",
    "storage",
    "devices",
];

/// A physical inventory row: enough to compare serial numbers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EntPhysical {
    pub index: String,
    pub serial: String,
    pub class: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Port {
    pub port_id: i64,
    pub device_id: i64,
    pub if_descr: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueuedAction {
    pub action_id: i64,
    pub action: String,
    pub identifier: String,
    pub poller_id: i64,
}

#[async_trait]
pub trait DeviceRepository: Send + Sync {
    async fn device_exists(&self, hostname: &str, exclude: Option<i64>) -> Result<bool>;

    async fn device_by_id(&self, device_id: i64) -> Result<Option<Device>>;

    async fn device_by_hostname(&self, hostname: &str) -> Result<Option<Device>>;

    async fn devices_by_hostname(&self, hostname: &str, exclude: Option<i64>)
        -> Result<Vec<Device>>;

    /// Devices sharing a resolved IP, SNMP port, and SNMP context. A `None`
    /// context matches only devices without a context.
    async fn devices_by_network(
        &self,
        ip: IpAddr,
        port: u16,
        context: Option<&str>,
        exclude: Option<i64>,
    ) -> Result<Vec<Device>>;

    /// Enabled devices with the given SNMP engine ID.
    async fn devices_by_engine_id(&self, engine_id: &str) -> Result<Vec<Device>>;

    /// Enabled devices with the given (lower-cased) sysName.
    async fn devices_by_sys_name(&self, sys_name: &str) -> Result<Vec<Device>>;

    async fn devices_by_sys_name_and_os(&self, sys_name: &str, os: &str) -> Result<Vec<Device>>;

    /// Insert a device row; hostname is unique among stored devices and a
    /// violation is a persistence failure (a late-detected duplicate).
    async fn insert_device(&self, device: Device) -> Result<i64>;

    /// First inventory row with a non-empty serial, lowest class first.
    async fn serial_sample(&self, device_id: i64) -> Result<Option<EntPhysical>>;

    async fn ports(&self, device_id: i64) -> Result<Vec<Port>>;

    async fn delete_port(&self, port_id: i64) -> Result<()>;

    /// Entity ids belonging to a device, grouped by entity type.
    async fn entity_ids(&self, device_id: i64) -> Result<Vec<(String, Vec<i64>)>>;

    async fn delete_entity_rows(
        &self,
        table: &str,
        entity_type: &str,
        entity_ids: &[i64],
    ) -> Result<u64>;

    async fn delete_device_rows(&self, table: &str, device_id: i64) -> Result<u64>;

    /// Remove autodiscovery links pointing at the device as remote target.
    async fn delete_autodiscovery(&self, remote_device_id: i64) -> Result<u64>;

    async fn poller_exists(&self, poller_id: i64) -> Result<bool>;

    async fn poller_name(&self, poller_id: i64) -> Result<Option<String>>;

    /// Poller an identical action is already queued for, if any.
    async fn queued_action_poller(&self, action: &str, identifier: &str) -> Result<Option<i64>>;

    async fn queue_action(&self, action: &str, identifier: &str, poller_id: i64) -> Result<i64>;

    async fn set_device_attrib(&self, device_id: i64, key: &str, value: &str) -> Result<()>;

    async fn clear_last_discovered(&self, device_id: i64) -> Result<()>;
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct Inner {
    next_device_id: i64,
    next_action_id: i64,
    devices: BTreeMap<i64, Device>,
    ports: BTreeMap<i64, Port>,
    /// (entity_type, entity_id, device_id)
    entities: Vec<(String, i64, i64)>,
    /// table -> rows of (entity_type, entity_id)
    entity_rows: HashMap<String, Vec<(String, i64)>>,
    /// table -> device_id per row
    device_rows: HashMap<String, Vec<i64>>,
    ent_physical: HashMap<i64, Vec<EntPhysical>>,
    autodiscovery_remote: Vec<i64>,
    pollers: BTreeMap<i64, String>,
    actions: Vec<QueuedAction>,
    attribs: BTreeMap<String, String>,
}

/// In-process repository with optional JSON persistence.
#[derive(Debug, Default)]
pub struct MemoryRepository {
    inner: RwLock<Inner>,
}

impl MemoryRepository {
    pub fn new() -> Self {
        MemoryRepository::default()
    }

    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            return Ok(MemoryRepository::new());
        }
        let raw = fs::read_to_string(path)
            .map_err(|e| DiscoveryError::PersistenceFailure(format!("{}: {e}", path.display())))?;
        let inner: Inner = serde_json::from_str(&raw)
            .map_err(|e| DiscoveryError::PersistenceFailure(format!("{}: {e}", path.display())))?;
        Ok(MemoryRepository {
            inner: RwLock::new(inner),
        })
    }

    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|e| {
                DiscoveryError::PersistenceFailure(format!("{}: {e}", parent.display()))
            })?;
        }
        let raw = serde_json::to_string_pretty(&*self.inner.read())
            .map_err(|e| DiscoveryError::PersistenceFailure(e.to_string()))?;
        fs::write(path, raw)
            .map_err(|e| DiscoveryError::PersistenceFailure(format!("{}: {e}", path.display())))
    }

    pub fn device_count(&self) -> usize {
        self.inner.read().devices.len()
    }

    // Seeding helpers for tests and fixtures.

    pub fn add_poller(&self, poller_id: i64, name: &str) {
        self.inner.write().pollers.insert(poller_id, name.to_string());
    }

    pub fn add_port(&self, port_id: i64, device_id: i64, if_descr: &str) {
        self.inner.write().ports.insert(
            port_id,
            Port {
                port_id,
                device_id,
                if_descr: if_descr.to_string(),
            },
        );
    }

    /// Register an entity and seed a row for it in every entity table.
    pub fn add_entity(&self, entity_type: &str, entity_id: i64, device_id: i64) {
        let mut inner = self.inner.write();
        inner
            .entities
            .push((entity_type.to_string(), entity_id, device_id));
        for table in ENTITY_TABLES {
            inner
                .entity_rows
                .entry((*table).to_string())
                .or_default()
                .push((entity_type.to_string(), entity_id));
        }
    }

    pub fn add_ent_physical(&self, device_id: i64, index: &str, serial: &str, class: &str) {
        self.inner
            .write()
            .ent_physical
            .entry(device_id)
            .or_default()
            .push(EntPhysical {
                index: index.to_string(),
                serial: serial.to_string(),
                class: class.to_string(),
            });
    }

    pub fn seed_device_row(&self, table: &str, device_id: i64) {
        self.inner
            .write()
            .device_rows
            .entry(table.to_string())
            .or_default()
            .push(device_id);
    }

    pub fn add_autodiscovery_link(&self, remote_device_id: i64) {
        self.inner.write().autodiscovery_remote.push(remote_device_id);
    }

    pub fn attrib(&self, device_id: i64, key: &str) -> Option<String> {
        self.inner
            .read()
            .attribs
            .get(&attrib_key(device_id, key))
            .cloned()
    }
}

fn attrib_key(device_id: i64, key: &str) -> String {
    format!("{device_id}:{key}")
}

#[async_trait]
impl DeviceRepository for MemoryRepository {
    async fn device_exists(&self, hostname: &str, exclude: Option<i64>) -> Result<bool> {
        let inner = self.inner.read();
        Ok(inner
            .devices
            .values()
            .any(|d| d.hostname == hostname && Some(d.device_id) != exclude))
    }

    async fn device_by_id(&self, device_id: i64) -> Result<Option<Device>> {
        Ok(self.inner.read().devices.get(&device_id).cloned())
    }

    async fn device_by_hostname(&self, hostname: &str) -> Result<Option<Device>> {
        let inner = self.inner.read();
        Ok(inner
            .devices
            .values()
            .find(|d| d.hostname == hostname)
            .cloned())
    }

    async fn devices_by_hostname(
        &self,
        hostname: &str,
        exclude: Option<i64>,
    ) -> Result<Vec<Device>> {
        let inner = self.inner.read();
        Ok(inner
            .devices
            .values()
            .filter(|d| d.hostname == hostname && Some(d.device_id) != exclude)
            .cloned()
            .collect())
    }

    async fn devices_by_network(
        &self,
        ip: IpAddr,
        port: u16,
        context: Option<&str>,
        exclude: Option<i64>,
    ) -> Result<Vec<Device>> {
        let inner = self.inner.read();
        Ok(inner
            .devices
            .values()
            .filter(|d| {
                d.ip == Some(ip)
                    && d.snmp.port == port
                    && d.snmp.context.as_deref() == context
                    && Some(d.device_id) != exclude
            })
            .cloned()
            .collect())
    }

    async fn devices_by_engine_id(&self, engine_id: &str) -> Result<Vec<Device>> {
        let inner = self.inner.read();
        Ok(inner
            .devices
            .values()
            .filter(|d| !d.disabled && d.snmp_engine_id.as_deref() == Some(engine_id))
            .cloned()
            .collect())
    }

    async fn devices_by_sys_name(&self, sys_name: &str) -> Result<Vec<Device>> {
        let inner = self.inner.read();
        Ok(inner
            .devices
            .values()
            .filter(|d| {
                !d.disabled
                    && d.sys_name.as_deref().unwrap_or_default().to_lowercase() == sys_name
            })
            .cloned()
            .collect())
    }

    async fn devices_by_sys_name_and_os(&self, sys_name: &str, os: &str) -> Result<Vec<Device>> {
        let inner = self.inner.read();
        Ok(inner
            .devices
            .values()
            .filter(|d| {
                !d.disabled
                    && d.sys_name.as_deref().unwrap_or_default().to_lowercase() == sys_name
                    && d.os.as_deref() == Some(os)
            })
            .cloned()
            .collect())
    }

    async fn insert_device(&self, mut device: Device) -> Result<i64> {
        let mut inner = self.inner.write();
        if inner.devices.values().any(|d| d.hostname == device.hostname) {
            return Err(DiscoveryError::PersistenceFailure(format!(
                "device hostname '{}' already exists",
                device.hostname
            )));
        }
        inner.next_device_id += 1;
        let device_id = inner.next_device_id;
        device.device_id = device_id;
        inner.devices.insert(device_id, device);
        Ok(device_id)
    }

    async fn serial_sample(&self, device_id: i64) -> Result<Option<EntPhysical>> {
        let inner = self.inner.read();
        let mut rows: Vec<EntPhysical> = inner
            .ent_physical
            .get(&device_id)
            .map(|v| v.iter().filter(|e| !e.serial.is_empty()).cloned().collect())
            .unwrap_or_default();
        rows.sort_by(|a, b| a.class.cmp(&b.class));
        Ok(rows.into_iter().next())
    }

    async fn ports(&self, device_id: i64) -> Result<Vec<Port>> {
        let inner = self.inner.read();
        Ok(inner
            .ports
            .values()
            .filter(|p| p.device_id == device_id)
            .cloned()
            .collect())
    }

    async fn delete_port(&self, port_id: i64) -> Result<()> {
        self.inner.write().ports.remove(&port_id);
        Ok(())
    }

    async fn entity_ids(&self, device_id: i64) -> Result<Vec<(String, Vec<i64>)>> {
        let inner = self.inner.read();
        let mut grouped: BTreeMap<String, Vec<i64>> = BTreeMap::new();
        for (entity_type, entity_id, owner) in &inner.entities {
            if *owner == device_id {
                grouped.entry(entity_type.clone()).or_default().push(*entity_id);
            }
        }
        Ok(grouped.into_iter().collect())
    }

    async fn delete_entity_rows(
        &self,
        table: &str,
        entity_type: &str,
        entity_ids: &[i64],
    ) -> Result<u64> {
        let mut inner = self.inner.write();
        let Some(rows) = inner.entity_rows.get_mut(table) else {
            return Ok(0);
        };
        let before = rows.len();
        rows.retain(|(t, id)| !(t == entity_type && entity_ids.contains(id)));
        Ok((before - rows.len()) as u64)
    }

    async fn delete_device_rows(&self, table: &str, device_id: i64) -> Result<u64> {
        let mut inner = self.inner.write();
        if table == "devices" {
            let removed = inner.devices.remove(&device_id).is_some();
            inner.entities.retain(|(_, _, owner)| *owner != device_id);
            return Ok(u64::from(removed));
        }
        let Some(rows) = inner.device_rows.get_mut(table) else {
            return Ok(0);
        };
        let before = rows.len();
        rows.retain(|id| *id != device_id);
        Ok((before - rows.len()) as u64)
    }

    async fn delete_autodiscovery(&self, remote_device_id: i64) -> Result<u64> {
        let mut inner = self.inner.write();
        let before = inner.autodiscovery_remote.len();
        inner.autodiscovery_remote.retain(|id| *id != remote_device_id);
        Ok((before - inner.autodiscovery_remote.len()) as u64)
    }

    async fn poller_exists(&self, poller_id: i64) -> Result<bool> {
        Ok(self.inner.read().pollers.contains_key(&poller_id))
    }

    async fn poller_name(&self, poller_id: i64) -> Result<Option<String>> {
        Ok(self.inner.read().pollers.get(&poller_id).cloned())
    }

    async fn queued_action_poller(&self, action: &str, identifier: &str) -> Result<Option<i64>> {
        let inner = self.inner.read();
        Ok(inner
            .actions
            .iter()
            .find(|a| a.action == action && a.identifier == identifier)
            .map(|a| a.poller_id))
    }

    async fn queue_action(&self, action: &str, identifier: &str, poller_id: i64) -> Result<i64> {
        let mut inner = self.inner.write();
        inner.next_action_id += 1;
        let action_id = inner.next_action_id;
        inner.actions.push(QueuedAction {
            action_id,
            action: action.to_string(),
            identifier: identifier.to_string(),
            poller_id,
        });
        Ok(action_id)
    }

    async fn set_device_attrib(&self, device_id: i64, key: &str, value: &str) -> Result<()> {
        self.inner
            .write()
            .attribs
            .insert(attrib_key(device_id, key), value.to_string());
        Ok(())
    }

    async fn clear_last_discovered(&self, device_id: i64) -> Result<()> {
        if let Some(device) = self.inner.write().devices.get_mut(&device_id) {
            device.last_discovered = None;
        }
        Ok(())
    }
}
