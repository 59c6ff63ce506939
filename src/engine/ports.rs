use serde::Serialize;
use std::collections::BTreeMap;
use std::net::{TcpListener, UdpSocket};
use std::sync::{Mutex, MutexGuard, PoisonError};

use crate::engine::model::{InstallId, PortBinding, Protocol};

/// Who holds a port reservation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PortOwner {
    Install { id: InstallId, service: String },
    /// A port used by something outside the app installs, such as the panel.
    System { name: String },
}

impl std::fmt::Display for PortOwner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PortOwner::Install { id, service } => write!(f, "install {id} ({service})"),
            PortOwner::System { name } => write!(f, "{name}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortConflict {
    pub port: u16,
    pub protocol: Protocol,
    pub requested_by: String,
    /// `None` when the port is bound on the host by an unmanaged process.
    pub owner: Option<PortOwner>,
}

impl std::fmt::Display for PortConflict {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.owner {
            Some(owner) => write!(
                f,
                "Port {}/{} required by '{}' is already in use by {}",
                self.port, self.protocol, self.requested_by, owner
            ),
            None => write!(
                f,
                "Port {}/{} required by '{}' is already in use on the host",
                self.port, self.protocol, self.requested_by
            ),
        }
    }
}

impl std::error::Error for PortConflict {}

/// Check whether the host lets us bind `port` right now.
pub fn check_port_available(port: u16, protocol: Protocol) -> bool {
    match protocol {
        Protocol::Tcp => TcpListener::bind(("0.0.0.0", port)).is_ok(),
        Protocol::Udp => UdpSocket::bind(("0.0.0.0", port)).is_ok(),
    }
}

type PortKey = (u16, Protocol);

/// Process-wide index of port reservations.
///
/// All reads and writes go through one mutex which is never held across an
/// await point, so checking and inserting a reservation is atomic with respect
/// to every other install.
pub struct PortAllocator {
    table: Mutex<BTreeMap<PortKey, PortOwner>>,
    probe_host: bool,
}

impl PortAllocator {
    pub fn new(probe_host: bool) -> Self {
        Self {
            table: Mutex::new(BTreeMap::new()),
            probe_host,
        }
    }

    fn table(&self) -> MutexGuard<'_, BTreeMap<PortKey, PortOwner>> {
        self.table.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Reserve a port for a non-install owner. System reservations are never
    /// released.
    pub fn reserve_system(
        &self,
        port: u16,
        protocol: Protocol,
        name: &str,
    ) -> Result<(), PortConflict> {
        self.reserve(
            port,
            protocol,
            PortOwner::System {
                name: name.to_string(),
            },
        )
    }

    /// Reserve a single port. Re-reserving a port already held by the same
    /// owner succeeds without changing anything.
    pub fn reserve(
        &self,
        port: u16,
        protocol: Protocol,
        owner: PortOwner,
    ) -> Result<(), PortConflict> {
        let mut table = self.table();
        match table.get(&(port, protocol)) {
            Some(existing) if *existing == owner => return Ok(()),
            Some(existing) => {
                return Err(PortConflict {
                    port,
                    protocol,
                    requested_by: requester(&owner),
                    owner: Some(existing.clone()),
                })
            }
            None => {}
        }
        if self.probe_host && !check_port_available(port, protocol) {
            return Err(PortConflict {
                port,
                protocol,
                requested_by: requester(&owner),
                owner: None,
            });
        }
        table.insert((port, protocol), owner);
        Ok(())
    }

    /// Reserve every binding for `install`, or none of them.
    pub fn reserve_all(&self, install: InstallId, bindings: &[PortBinding]) -> Result<(), PortConflict> {
        self.reserve_bindings(install, bindings, self.probe_host)
    }

    /// Rebuild the reservations of a persisted install. Its ports are
    /// expected to be bound on the host already, so the host is not probed.
    pub fn restore(&self, install: InstallId, bindings: &[PortBinding]) -> Result<(), PortConflict> {
        self.reserve_bindings(install, bindings, false)
    }

    fn reserve_bindings(
        &self,
        install: InstallId,
        bindings: &[PortBinding],
        probe_host: bool,
    ) -> Result<(), PortConflict> {
        let mut table = self.table();
        let mut taken: Vec<PortKey> = Vec::new();
        for binding in bindings {
            let key = (binding.host_port, binding.protocol);
            let owner = PortOwner::Install {
                id: install,
                service: binding.service.clone(),
            };
            let conflict = match table.get(&key) {
                Some(existing) if *existing == owner => None,
                Some(existing) => Some(Some(existing.clone())),
                None if probe_host && !check_port_available(key.0, key.1) => Some(None),
                None => None,
            };
            if let Some(existing) = conflict {
                for key in &taken {
                    table.remove(key);
                }
                return Err(PortConflict {
                    port: binding.host_port,
                    protocol: binding.protocol,
                    requested_by: binding.service.clone(),
                    owner: existing,
                });
            }
            if !table.contains_key(&key) {
                table.insert(key, owner);
                taken.push(key);
            }
        }
        Ok(())
    }

    /// Release a port if, and only if, `install` owns it.
    pub fn release(&self, port: u16, protocol: Protocol, install: InstallId) -> bool {
        let mut table = self.table();
        match table.get(&(port, protocol)) {
            Some(PortOwner::Install { id, .. }) if *id == install => {
                table.remove(&(port, protocol));
                true
            }
            _ => false,
        }
    }

    /// Release every reservation held by `install`. Returns how many were freed.
    pub fn release_all(&self, install: InstallId) -> usize {
        let mut table = self.table();
        let before = table.len();
        table.retain(|_, owner| !matches!(owner, PortOwner::Install { id, .. } if *id == install));
        before - table.len()
    }

    pub fn owner(&self, port: u16, protocol: Protocol) -> Option<PortOwner> {
        self.table().get(&(port, protocol)).cloned()
    }

    pub fn reservations_for(&self, install: InstallId) -> Vec<(u16, Protocol)> {
        self.table()
            .iter()
            .filter(|(_, owner)| matches!(owner, PortOwner::Install { id, .. } if *id == install))
            .map(|(key, _)| *key)
            .collect()
    }

    pub fn len(&self) -> usize {
        self.table().len()
    }

    pub fn is_empty(&self) -> bool {
        self.table().is_empty()
    }
}

fn requester(owner: &PortOwner) -> String {
    match owner {
        PortOwner::Install { service, .. } => service.clone(),
        PortOwner::System { name } => name.clone(),
    }
}

pub fn format_port_conflicts(conflicts: &[PortConflict]) -> String {
    let mut msg = String::from("Port conflicts detected:\n");
    for conflict in conflicts {
        msg.push_str(&format!("  - {}\n", conflict));
    }
    msg.push_str("\nFree the ports or change the install's port assignments.");
    msg
}
