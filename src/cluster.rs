//! Cluster collaborators: node identities, directory, transport and
//! membership.
//!
//! The lockspace never talks to the network or the failure detector
//! directly. It consumes these traits; the embedding layer implements them.
//! `HashDirectory` is a complete in-memory directory that a single process
//! hosting several nodes (or a test) can share between them.

use std::collections::HashMap;

use parking_lot::{Mutex, RwLock};

/// Cluster node identifier. Zero is never a valid node.
pub type NodeId = u32;

/// Where a resource is mastered, or which node owns a master copy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum NodeRef {
    /// Not known yet; a directory lookup is needed
    #[default]
    Unknown,
    /// This node
    Local,
    /// Another node
    Remote(NodeId),
}

impl NodeRef {
    /// Classify `nodeid` relative to `our_nodeid`. Zero maps to `Unknown`.
    pub fn from_nodeid(nodeid: NodeId, our_nodeid: NodeId) -> Self {
        match nodeid {
            0 => NodeRef::Unknown,
            n if n == our_nodeid => NodeRef::Local,
            n => NodeRef::Remote(n),
        }
    }

    /// Whether this is `Local`
    #[inline]
    pub fn is_local(self) -> bool {
        matches!(self, NodeRef::Local)
    }

    /// Whether this is `Unknown`
    #[inline]
    pub fn is_unknown(self) -> bool {
        matches!(self, NodeRef::Unknown)
    }

    /// The remote node id, if any
    #[inline]
    pub fn remote(self) -> Option<NodeId> {
        match self {
            NodeRef::Remote(n) => Some(n),
            _ => None,
        }
    }

    /// Concrete node id, with `Local` resolved to `our_nodeid` and
    /// `Unknown` to zero.
    pub fn nodeid(self, our_nodeid: NodeId) -> NodeId {
        match self {
            NodeRef::Unknown => 0,
            NodeRef::Local => our_nodeid,
            NodeRef::Remote(n) => n,
        }
    }
}

/// Errors a transport may report when handed a frame.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    /// No connection to the node.
    #[error("node {0} is unreachable")]
    Unreachable(NodeId),
    /// The connection was shut down.
    #[error("transport closed")]
    Closed,
}

/// Reliable, in-order delivery of frames between node pairs.
///
/// Implementations must not call back into the lockspace from `send`.
pub trait Transport: Send + Sync {
    /// Hand a complete frame to the connection for `to`.
    fn send(&self, to: NodeId, frame: Vec<u8>) -> Result<(), TransportError>;
}

/// Resource name to master node map, sharded over the cluster by name hash.
pub trait Directory: Send + Sync {
    /// The node holding the directory entry for `hash`.
    fn dir_nodeid(&self, hash: u32) -> NodeId;

    /// Return the master recorded for `name`, recording `from` as master if
    /// there is no entry yet. Only valid on the directory node for the name,
    /// or during recovery once the directory has been rebuilt.
    fn lookup(&self, name: &[u8], from: NodeId) -> NodeId;

    /// Drop the entry for `name` if `from` is its recorded master.
    fn remove(&self, name: &[u8], from: NodeId);
}

/// Membership view supplied by the failure detector.
pub trait Membership: Send + Sync {
    /// This node's id.
    fn our_nodeid(&self) -> NodeId;

    /// Whether `nodeid` is a current member of the lockspace.
    fn is_member(&self, nodeid: NodeId) -> bool;

    /// Whether `nodeid` left (or failed) in the membership change being recovered.
    fn is_removed(&self, nodeid: NodeId) -> bool;
}

/// In-memory directory shared by every node of one process.
///
/// Directory nodes are picked by `hash % members`, over the sorted member
/// list. `purge_master` is the rebuild step the recovery layer runs when a
/// master leaves.
#[derive(Debug, Default)]
pub struct HashDirectory {
    members: RwLock<Vec<NodeId>>,
    entries: Mutex<HashMap<Vec<u8>, NodeId>>,
}

impl HashDirectory {
    /// Create a directory over `members`
    pub fn new(members: &[NodeId]) -> Self {
        let dir = Self::default();
        dir.set_members(members);
        dir
    }

    /// Replace the member list
    pub fn set_members(&self, members: &[NodeId]) {
        let mut sorted = members.to_vec();
        sorted.sort_unstable();
        sorted.dedup();
        *self.members.write() = sorted;
    }

    /// Forget every entry mastered by `nodeid`; returns how many were dropped
    pub fn purge_master(&self, nodeid: NodeId) -> usize {
        let mut entries = self.entries.lock();
        let before = entries.len();
        entries.retain(|_, master| *master != nodeid);
        before - entries.len()
    }

    /// The recorded master for `name`, without creating an entry
    pub fn master_of(&self, name: &[u8]) -> Option<NodeId> {
        self.entries.lock().get(name).copied()
    }

    /// Number of entries
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    /// Whether the directory has no entries
    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}

impl Directory for HashDirectory {
    fn dir_nodeid(&self, hash: u32) -> NodeId {
        let members = self.members.read();
        if members.is_empty() {
            return 0;
        }
        members[hash as usize % members.len()]
    }

    fn lookup(&self, name: &[u8], from: NodeId) -> NodeId {
        *self.entries.lock().entry(name.to_vec()).or_insert(from)
    }

    fn remove(&self, name: &[u8], from: NodeId) {
        let mut entries = self.entries.lock();
        match entries.get(name) {
            Some(master) if *master == from => {
                entries.remove(name);
            }
            Some(master) => {
                tracing::debug!(
                    from,
                    master = *master,
                    "directory remove from a node that is not master"
                );
            }
            None => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_noderef_classify() {
        assert_eq!(NodeRef::from_nodeid(0, 1), NodeRef::Unknown);
        assert_eq!(NodeRef::from_nodeid(1, 1), NodeRef::Local);
        assert_eq!(NodeRef::from_nodeid(2, 1), NodeRef::Remote(2));
        assert_eq!(NodeRef::Local.nodeid(7), 7);
        assert_eq!(NodeRef::Remote(3).remote(), Some(3));
    }

    #[test]
    fn test_directory_first_lookup_wins() {
        let dir = HashDirectory::new(&[3, 1, 2]);
        assert_eq!(dir.lookup(b"res", 2), 2);
        assert_eq!(dir.lookup(b"res", 3), 2);
        dir.remove(b"res", 3);
        assert_eq!(dir.master_of(b"res"), Some(2));
        dir.remove(b"res", 2);
        assert!(dir.is_empty());
    }

    #[test]
    fn test_directory_node_selection() {
        let dir = HashDirectory::new(&[3, 1, 2]);
        assert_eq!(dir.dir_nodeid(0), 1);
        assert_eq!(dir.dir_nodeid(4), 2);
        dir.set_members(&[1]);
        assert_eq!(dir.dir_nodeid(4), 1);
    }

    #[test]
    fn test_purge_master() {
        let dir = HashDirectory::new(&[1, 2]);
        dir.lookup(b"a", 1);
        dir.lookup(b"b", 2);
        dir.lookup(b"c", 2);
        assert_eq!(dir.purge_master(2), 2);
        assert_eq!(dir.len(), 1);
    }
}
