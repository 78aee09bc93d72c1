//! Local compute devices and the per-session device manager.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use dataflow_ir::{DeviceName, Graph};
use serde::{Deserialize, Serialize};

use crate::error::{Result, SessionError};
use crate::thread_pool::ThreadPool;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceAttributes {
    /// Fully qualified name, e.g. `/job:localhost/replica:0/task:0/device:CPU:0`.
    pub name: String,
    pub device_type: String,
    /// Changes every time a device with this name is created.
    pub incarnation: u64,
}

pub trait Device: Send + Sync {
    fn attributes(&self) -> &DeviceAttributes;

    fn name(&self) -> &str {
        &self.attributes().name
    }

    /// A pool that runs every op placed on this device, overriding the step's runner.
    fn thread_pool(&self) -> Option<Arc<ThreadPool>> {
        None
    }

    /// Last chance to rewrite this device's partition before kernels are created.
    fn maybe_rewrite_graph(&self, _graph: &mut Graph) -> Result<()> {
        Ok(())
    }
}

static NEXT_INCARNATION: AtomicU64 = AtomicU64::new(1);

fn new_incarnation() -> u64 {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or(0);
    // Never zero: zero marks an unknown incarnation in transfer keys.
    (nanos ^ NEXT_INCARNATION.fetch_add(1, Ordering::Relaxed).rotate_left(32)) | 1
}

/// Host device.
pub struct LocalDevice {
    attributes: DeviceAttributes,
    pool: Option<Arc<ThreadPool>>,
}

impl LocalDevice {
    pub fn new(device_type: &str, id: u32) -> Self {
        LocalDevice {
            attributes: DeviceAttributes {
                name: DeviceName::local(device_type, id).to_string(),
                device_type: device_type.to_string(),
                incarnation: new_incarnation(),
            },
            pool: None,
        }
    }

    pub fn cpu(id: u32) -> Self {
        Self::new("CPU", id)
    }

    pub fn with_thread_pool(mut self, pool: Arc<ThreadPool>) -> Self {
        self.pool = Some(pool);
        self
    }
}

impl Device for LocalDevice {
    fn attributes(&self) -> &DeviceAttributes {
        &self.attributes
    }

    fn thread_pool(&self) -> Option<Arc<ThreadPool>> {
        self.pool.clone()
    }
}

/// Ordered, immutable set of devices owned by a session. The first device is
/// the client device: feeds and fetches are exchanged there.
pub struct DeviceMgr {
    devices: Vec<Arc<dyn Device>>,
}

impl DeviceMgr {
    pub fn new(devices: Vec<Arc<dyn Device>>) -> Result<Self> {
        if devices.is_empty() {
            return Err(SessionError::invalid_argument(
                "A session needs at least one device",
            ));
        }
        for (i, d) in devices.iter().enumerate() {
            if devices[..i].iter().any(|prev| prev.name() == d.name()) {
                return Err(SessionError::invalid_argument(format!(
                    "Duplicate device name: {}",
                    d.name()
                )));
            }
        }
        Ok(DeviceMgr { devices })
    }

    /// `count` host devices `CPU:0..count`.
    pub fn with_cpus(count: u32) -> Result<Self> {
        Self::new(
            (0..count)
                .map(|i| Arc::new(LocalDevice::cpu(i)) as Arc<dyn Device>)
                .collect(),
        )
    }

    /// Looks up a device by full name or by local name (`CPU:0`).
    pub fn lookup(&self, name: &str) -> Result<Arc<dyn Device>> {
        if let Some(d) = self.devices.iter().find(|d| d.name() == name) {
            return Ok(d.clone());
        }
        let wanted = DeviceName::parse(name)?;
        self.devices
            .iter()
            .find(|d| {
                DeviceName::parse(d.name())
                    .map(|full| wanted.matches(&full))
                    .unwrap_or(false)
            })
            .cloned()
            .ok_or_else(|| {
                SessionError::invalid_argument(format!("Unknown device: {}", name))
            })
    }

    pub fn list_devices(&self) -> &[Arc<dyn Device>] {
        &self.devices
    }

    pub fn client_device(&self) -> &Arc<dyn Device> {
        &self.devices[0]
    }

    pub fn device_names(&self) -> Vec<String> {
        self.devices.iter().map(|d| d.name().to_string()).collect()
    }

    /// Incarnation of the named device, 0 if unknown.
    pub fn incarnation(&self, name: &str) -> u64 {
        self.devices
            .iter()
            .find(|d| d.name() == name)
            .map(|d| d.attributes().incarnation)
            .unwrap_or(0)
    }

    pub fn len(&self) -> usize {
        self.devices.len()
    }
}
