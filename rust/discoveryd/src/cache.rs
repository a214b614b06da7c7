//! Bounded device lookup cache with explicit invalidation.

use std::collections::{HashMap, VecDeque};

use parking_lot::Mutex;

use crate::device::Device;

/// Caches devices by id and hostname. Insertion order is the eviction
/// order; the bound keeps long-running processes from holding every device
/// row ever touched.
pub struct DeviceCache {
    capacity: usize,
    inner: Mutex<Inner>,
}

#[derive(Default)]
struct Inner {
    by_id: HashMap<i64, Device>,
    by_hostname: HashMap<String, i64>,
    order: VecDeque<i64>,
}

impl DeviceCache {
    pub fn new(capacity: usize) -> Self {
        DeviceCache {
            capacity: capacity.max(1),
            inner: Mutex::new(Inner::default()),
        }
    }

    pub fn get(&self, device_id: i64) -> Option<Device> {
        self.inner.lock().by_id.get(&device_id).cloned()
    }

    pub fn get_by_hostname(&self, hostname: &str) -> Option<Device> {
        let inner = self.inner.lock();
        inner
            .by_hostname
            .get(hostname)
            .and_then(|id| inner.by_id.get(id))
            .cloned()
    }

    pub fn put(&self, device: Device) {
        let mut inner = self.inner.lock();
        let id = device.device_id;
        if inner.by_id.insert(id, device.clone()).is_none() {
            inner.order.push_back(id);
        }
        inner.by_hostname.insert(device.hostname, id);
        while inner.order.len() > self.capacity {
            if let Some(evicted) = inner.order.pop_front() {
                if let Some(old) = inner.by_id.remove(&evicted) {
                    inner.by_hostname.remove(&old.hostname);
                }
            }
        }
    }

    pub fn invalidate(&self, device_id: i64) {
        let mut inner = self.inner.lock();
        if let Some(old) = inner.by_id.remove(&device_id) {
            inner.by_hostname.remove(&old.hostname);
        }
        inner.order.retain(|id| *id != device_id);
    }

    pub fn invalidate_hostname(&self, hostname: &str) {
        let id = self.inner.lock().by_hostname.get(hostname).copied();
        if let Some(id) = id {
            self.invalidate(id);
        }
    }

    pub fn len(&self) -> usize {
        self.inner.lock().by_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
