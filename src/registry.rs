//! Per-node lockspace registry.
//!
//! A [`Dlm`] owns every lockspace this node joined and routes inbound
//! frames to them by the lockspace id in the frame header.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::{debug, info, warn};

use crate::config::{ConfigError, LockspaceConfig};
use crate::lockspace::{Collaborators, Lockspace, Scand};
use crate::wire::{Header, WireError};

/// Errors from creating, releasing or routing to lockspaces.
#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    /// A lockspace with this name (or id) already exists.
    #[error("lockspace {0} already exists")]
    Exists(String),
    /// No lockspace with this id.
    #[error("no lockspace {0:08x}")]
    NotFound(u32),
    /// The lockspace still holds locks.
    #[error("lockspace {name} still holds {locks} locks")]
    Busy {
        /// Lockspace name
        name: String,
        /// Locks left in its table
        locks: usize,
    },
    /// Rejected configuration.
    #[error("config error: {0}")]
    Config(#[from] ConfigError),
    /// Undecodable frame.
    #[error("wire error: {0}")]
    Wire(#[from] WireError),
}

/// Cluster-wide lockspace id for `name`.
pub fn lockspace_id(name: &str) -> u32 {
    let h = xxhash_rust::xxh3::xxh3_64(name.as_bytes());
    (h ^ (h >> 32)) as u32
}

struct Entry {
    lockspace: Arc<Lockspace>,
    scand: Option<Scand>,
}

/// The lockspaces of one node.
pub struct Dlm {
    collaborators: Collaborators,
    scanning: bool,
    lockspaces: RwLock<HashMap<u32, Entry>>,
}

impl Dlm {
    /// Registry whose lockspaces share `collaborators`
    pub fn new(collaborators: Collaborators) -> Self {
        Self {
            collaborators,
            scanning: false,
            lockspaces: RwLock::new(HashMap::new()),
        }
    }

    /// Start a background scanner for every new lockspace
    pub fn with_scanning(mut self, enabled: bool) -> Self {
        self.scanning = enabled;
        self
    }

    /// Create lockspace `name`. Its id is derived from the name so every
    /// node agrees on it.
    pub fn new_lockspace(
        &self,
        name: &str,
        config: LockspaceConfig,
    ) -> Result<Arc<Lockspace>, RegistryError> {
        let id = lockspace_id(name);
        let mut lockspaces = self.lockspaces.write();
        if let Some(existing) = lockspaces.get(&id) {
            if existing.lockspace.name() != name {
                warn!(
                    name,
                    existing = %existing.lockspace.name(),
                    id = format_args!("{id:08x}"),
                    "lockspace id collision"
                );
            }
            return Err(RegistryError::Exists(name.to_string()));
        }

        let lockspace = Arc::new(Lockspace::new(
            name,
            id,
            config,
            self.collaborators.clone(),
        )?);
        let scand = self.scanning.then(|| Scand::start(&lockspace));
        lockspaces.insert(
            id,
            Entry {
                lockspace: Arc::clone(&lockspace),
                scand,
            },
        );
        Ok(lockspace)
    }

    /// Look up a lockspace by id
    pub fn find(&self, id: u32) -> Option<Arc<Lockspace>> {
        self.lockspaces
            .read()
            .get(&id)
            .map(|entry| Arc::clone(&entry.lockspace))
    }

    /// Look up a lockspace by name
    pub fn find_by_name(&self, name: &str) -> Option<Arc<Lockspace>> {
        self.find(lockspace_id(name))
    }

    /// Number of lockspaces
    pub fn len(&self) -> usize {
        self.lockspaces.read().len()
    }

    /// Whether no lockspace exists
    pub fn is_empty(&self) -> bool {
        self.lockspaces.read().is_empty()
    }

    /// Remove lockspace `id`. Without `force`, a lockspace that still holds
    /// locks is kept and `Busy` is returned.
    pub fn release_lockspace(&self, id: u32, force: bool) -> Result<(), RegistryError> {
        let entry = {
            let mut lockspaces = self.lockspaces.write();
            let Some(entry) = lockspaces.get(&id) else {
                return Err(RegistryError::NotFound(id));
            };
            let locks = entry.lockspace.lock_count();
            if locks > 0 && !force {
                return Err(RegistryError::Busy {
                    name: entry.lockspace.name().to_string(),
                    locks,
                });
            }
            lockspaces.remove(&id)
        };
        if let Some(entry) = entry {
            if let Some(scand) = &entry.scand {
                scand.stop();
            }
            info!(
                lockspace = %entry.lockspace.name(),
                locks = entry.lockspace.lock_count(),
                force,
                "lockspace released"
            );
        }
        Ok(())
    }

    /// Route one inbound frame to its lockspace.
    ///
    /// Frames for a lockspace this node does not have are dropped.
    pub fn receive(&self, bytes: &[u8]) -> Result<(), RegistryError> {
        let header = Header::decode(bytes)?;
        let Some(lockspace) = self.find(header.lockspace) else {
            warn!(
                id = format_args!("{:08x}", header.lockspace),
                nodeid = header.nodeid,
                "dropping frame for unknown lockspace"
            );
            return Err(RegistryError::NotFound(header.lockspace));
        };
        debug!(lockspace = %lockspace.name(), nodeid = header.nodeid, "routing frame");
        lockspace.receive(bytes)?;
        Ok(())
    }

    /// Run recovery on every lockspace after a membership change
    pub fn recover_all(&self) -> usize {
        let lockspaces: Vec<_> = self
            .lockspaces
            .read()
            .values()
            .map(|entry| Arc::clone(&entry.lockspace))
            .collect();
        for lockspace in &lockspaces {
            lockspace.recover();
        }
        lockspaces.len()
    }
}

impl Drop for Dlm {
    fn drop(&mut self) {
        for entry in self.lockspaces.get_mut().values() {
            if let Some(scand) = &entry.scand {
                scand.stop();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lockspace_id_is_stable() {
        assert_eq!(lockspace_id("gfs2"), lockspace_id("gfs2"));
        assert_ne!(lockspace_id("gfs2"), lockspace_id("clvmd"));
    }
}
