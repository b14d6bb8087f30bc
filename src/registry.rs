// MIT License - Copyright (c) 2026 Peter Wright
// Device registry: inventory records -> device descriptors

use std::collections::{HashMap, HashSet};

use crate::config::DeviceRecord;
use crate::error::ConfigError;

/// How a device is reached.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeviceKind {
    /// Own connection, no children.
    Direct,
    /// Own connection, also relays frames for its sub-devices.
    Gateway,
    /// Reached through the parent gateway's connection, tagged with `cid`.
    SubDevice { parent: String, cid: String },
}

/// Everything needed to open a session to one device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceDescriptor {
    pub name: String,
    pub id: String,
    pub address: String,
    pub key: String,
    pub version: String,
    pub kind: DeviceKind,
    pub refresh_dps: Option<Vec<u32>>,
}

impl DeviceDescriptor {
    pub fn cid(&self) -> Option<&str> {
        match &self.kind {
            DeviceKind::SubDevice { cid, .. } => Some(cid),
            _ => None,
        }
    }

    pub fn parent(&self) -> Option<&str> {
        match &self.kind {
            DeviceKind::SubDevice { parent, .. } => Some(parent),
            _ => None,
        }
    }

    /// Id of the device that owns the socket this device talks through.
    pub fn connection_owner(&self) -> &str {
        self.parent().unwrap_or(&self.id)
    }
}

/// Gateway channel id -> sub-device display name. Read-only once built.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NameTable {
    names: HashMap<String, String>,
}

impl NameTable {
    pub fn name_for(&self, cid: &str) -> Option<&str> {
        self.names.get(cid).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }
}

/// All devices of the inventory, in inventory order, with gateways expanded.
#[derive(Debug, Clone, Default)]
pub struct Registry {
    devices: Vec<DeviceDescriptor>,
    by_id: HashMap<String, usize>,
    names: NameTable,
}

impl Registry {
    /// Build descriptors from inventory records.
    ///
    /// Each gateway's children become standalone descriptors placed right
    /// after their gateway, inheriting its address, key and version.
    pub fn from_inventory(records: Vec<DeviceRecord>) -> Result<Self, ConfigError> {
        let mut registry = Registry::default();
        let mut seen_names = HashSet::new();

        for record in records {
            check_field(&record.id, "id", &record.name)?;
            check_field(&record.name, "name", &record.id)?;
            check_field(&record.ip, "ip", &record.name)?;

            let subs = record.sub_devices.unwrap_or_default();
            let kind = if subs.is_empty() {
                DeviceKind::Direct
            } else {
                DeviceKind::Gateway
            };

            registry.insert(
                DeviceDescriptor {
                    name: record.name.clone(),
                    id: record.id.clone(),
                    address: record.ip.clone(),
                    key: record.key.clone(),
                    version: record.version.clone(),
                    kind,
                    refresh_dps: record.refresh_dps.clone(),
                },
                &mut seen_names,
            )?;

            for sub in subs {
                check_field(&sub.id, "id", &sub.name)?;
                check_field(&sub.name, "name", &sub.id)?;
                check_field(&sub.cid, "cid", &sub.name)?;

                if registry.names.names.contains_key(&sub.cid) {
                    return Err(ConfigError::InvalidInventory(format!(
                        "duplicate sub-device cid: {}",
                        sub.cid
                    )));
                }
                registry
                    .names
                    .names
                    .insert(sub.cid.clone(), sub.name.clone());

                registry.insert(
                    DeviceDescriptor {
                        name: sub.name,
                        id: sub.id,
                        address: record.ip.clone(),
                        key: record.key.clone(),
                        version: record.version.clone(),
                        kind: DeviceKind::SubDevice {
                            parent: record.id.clone(),
                            cid: sub.cid,
                        },
                        refresh_dps: None,
                    },
                    &mut seen_names,
                )?;
            }
        }

        Ok(registry)
    }

    fn insert(
        &mut self,
        descriptor: DeviceDescriptor,
        seen_names: &mut HashSet<String>,
    ) -> Result<(), ConfigError> {
        if self.by_id.contains_key(&descriptor.id) {
            return Err(ConfigError::InvalidInventory(format!(
                "duplicate device id: {}",
                descriptor.id
            )));
        }
        // Names become topic segments, so they must be unique and wildcard-free.
        if descriptor.name.contains(['/', '+', '#']) {
            return Err(ConfigError::InvalidInventory(format!(
                "device name {:?} contains a topic separator or wildcard",
                descriptor.name
            )));
        }
        if !seen_names.insert(descriptor.name.clone()) {
            return Err(ConfigError::InvalidInventory(format!(
                "duplicate device name: {}",
                descriptor.name
            )));
        }
        self.by_id.insert(descriptor.id.clone(), self.devices.len());
        self.devices.push(descriptor);
        Ok(())
    }

    pub fn get(&self, id: &str) -> Option<&DeviceDescriptor> {
        self.by_id.get(id).map(|&i| &self.devices[i])
    }

    pub fn devices(&self) -> &[DeviceDescriptor] {
        &self.devices
    }

    pub fn len(&self) -> usize {
        self.devices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }

    pub fn names(&self) -> &NameTable {
        &self.names
    }

    /// Split into descriptors and the shared name table.
    pub fn into_parts(self) -> (Vec<DeviceDescriptor>, NameTable) {
        (self.devices, self.names)
    }
}

fn check_field(value: &str, field: &str, owner: &str) -> Result<(), ConfigError> {
    if value.trim().is_empty() {
        return Err(ConfigError::InvalidInventory(format!(
            "empty {field} for device {owner:?}"
        )));
    }
    Ok(())
}
