//! Shared test utilities: an in-memory cluster of lockspaces.
//!
//! Every node runs its own `Lockspace` with its own `AstQueue`. Frames sent
//! through the transport land in one FIFO network queue; `pump` delivers
//! them (and runs queued callbacks) until the cluster is idle. Nothing runs
//! on background threads, so every test is deterministic.

#![allow(dead_code)]

use std::collections::{BTreeMap, BTreeSet, HashSet, VecDeque};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};

use oxidlm::cluster::{Directory, HashDirectory, Membership, NodeId, Transport, TransportError};
use oxidlm::{
    AstQueue, Collaborators, Lksb, LockFlags, LockMode, LockRequest, Lockspace, LockspaceConfig,
    RecoveryReport, Status,
};

/// Lockspace id shared by every test node
pub const LS_ID: u32 = 0x5eed_0001;

/// Frames in flight between nodes.
#[derive(Default)]
pub struct Network {
    queue: Mutex<VecDeque<(NodeId, NodeId, Vec<u8>)>>,
    down: Mutex<HashSet<NodeId>>,
    sent: Mutex<u64>,
}

impl Network {
    /// Frames waiting for delivery
    pub fn pending(&self) -> usize {
        self.queue.lock().len()
    }

    /// Total frames accepted
    pub fn sent(&self) -> u64 {
        *self.sent.lock()
    }

    /// Swap the next two frames in flight. Returns false when fewer
    /// than two are queued.
    pub fn swap_head(&self) -> bool {
        let mut queue = self.queue.lock();
        if queue.len() < 2 {
            return false;
        }
        queue.swap(0, 1);
        true
    }

    fn pop(&self) -> Option<(NodeId, NodeId, Vec<u8>)> {
        self.queue.lock().pop_front()
    }

    fn is_down(&self, nodeid: NodeId) -> bool {
        self.down.lock().contains(&nodeid)
    }
}

struct NodeTransport {
    from: NodeId,
    net: Arc<Network>,
}

impl Transport for NodeTransport {
    fn send(&self, to: NodeId, frame: Vec<u8>) -> Result<(), TransportError> {
        if self.net.is_down(to) {
            return Err(TransportError::Unreachable(to));
        }
        self.net.queue.lock().push_back((self.from, to, frame));
        *self.net.sent.lock() += 1;
        Ok(())
    }
}

/// Membership shared by the whole cluster.
#[derive(Default)]
pub struct View {
    members: RwLock<BTreeSet<NodeId>>,
    removed: RwLock<BTreeSet<NodeId>>,
}

struct NodeMembership {
    nodeid: NodeId,
    view: Arc<View>,
}

impl Membership for NodeMembership {
    fn our_nodeid(&self) -> NodeId {
        self.nodeid
    }

    fn is_member(&self, nodeid: NodeId) -> bool {
        self.view.members.read().contains(&nodeid)
    }

    fn is_removed(&self, nodeid: NodeId) -> bool {
        self.view.removed.read().contains(&nodeid)
    }
}

/// One simulated node.
pub struct Node {
    pub id: NodeId,
    pub ls: Arc<Lockspace>,
    pub asts: Arc<AstQueue>,
}

/// A cluster of nodes sharing a directory and a network.
pub struct Cluster {
    pub dir: Arc<HashDirectory>,
    pub net: Arc<Network>,
    pub view: Arc<View>,
    pub nodes: BTreeMap<NodeId, Node>,
}

impl Cluster {
    /// Nodes `1..=n` with default configuration
    pub fn new(n: u32) -> Self {
        Self::with_config(n, test_config())
    }

    /// Nodes `1..=n` sharing `config`
    pub fn with_config(n: u32, config: LockspaceConfig) -> Self {
        let ids: Vec<NodeId> = (1..=n).collect();
        let dir = Arc::new(HashDirectory::new(&ids));
        let net = Arc::new(Network::default());
        let view = Arc::new(View::default());
        view.members.write().extend(ids.iter().copied());

        let nodes = ids
            .iter()
            .map(|&id| {
                let asts = Arc::new(AstQueue::new());
                let collaborators = node_collaborators(id, &dir, &net, &view, &asts);
                let ls = Lockspace::new("test", LS_ID, config.clone(), collaborators)
                    .expect("valid test config");
                (
                    id,
                    Node {
                        id,
                        ls: Arc::new(ls),
                        asts,
                    },
                )
            })
            .collect();

        Self {
            dir,
            net,
            view,
            nodes,
        }
    }

    /// Fresh collaborators for node `id` on this cluster's network, with
    /// their own callback queue
    pub fn collaborators(&self, id: NodeId) -> (Collaborators, Arc<AstQueue>) {
        let asts = Arc::new(AstQueue::new());
        let collaborators = node_collaborators(id, &self.dir, &self.net, &self.view, &asts);
        (collaborators, asts)
    }

    /// Lockspace of node `id`
    pub fn ls(&self, id: NodeId) -> &Arc<Lockspace> {
        &self.nodes[&id].ls
    }

    /// Deliver frames and run callbacks until nothing is left to do.
    /// Returns the number of frames delivered.
    pub fn pump(&self) -> usize {
        let mut delivered = 0;
        loop {
            while let Some((from, to, frame)) = self.net.pop() {
                if self.net.is_down(to) || self.net.is_down(from) {
                    continue;
                }
                if let Some(node) = self.nodes.get(&to) {
                    let _ = node.ls.receive(&frame);
                    delivered += 1;
                }
            }
            let ran: usize = self.nodes.values().map(|n| n.asts.deliver_pending()).sum();
            if ran == 0 && self.net.pending() == 0 {
                return delivered;
            }
        }
    }

    /// Deliver exactly one frame, if any. Returns the (from, to) pair.
    pub fn step(&self) -> Option<(NodeId, NodeId)> {
        let (from, to, frame) = self.net.pop()?;
        if let Some(node) = self.nodes.get(&to) {
            let _ = node.ls.receive(&frame);
        }
        Some((from, to))
    }

    /// Run queued callbacks without delivering frames
    pub fn run_asts(&self) -> usize {
        self.nodes.values().map(|n| n.asts.deliver_pending()).sum()
    }

    /// Node `id` leaves: its frames are lost, the directory forgets the
    /// masters it held, and the survivors see it as removed.
    pub fn fail(&mut self, id: NodeId) {
        self.net.down.lock().insert(id);
        self.net
            .queue
            .lock()
            .retain(|(from, to, _)| *from != id && *to != id);
        self.view.members.write().remove(&id);
        self.view.removed.write().insert(id);
        let members: Vec<NodeId> = self.view.members.read().iter().copied().collect();
        self.dir.set_members(&members);
        self.dir.purge_master(id);
        self.nodes.remove(&id);
    }

    /// Recover every surviving node, lowest id first
    pub fn recover(&self) -> BTreeMap<NodeId, RecoveryReport> {
        self.nodes
            .iter()
            .map(|(&id, node)| (id, node.ls.recover()))
            .collect()
    }

    /// Node that masters `name` according to the directory
    pub fn master_of(&self, name: &[u8]) -> Option<NodeId> {
        self.dir.master_of(name)
    }

    /// Total locks over every node
    pub fn lock_count(&self) -> usize {
        self.nodes.values().map(|n| n.ls.lock_count()).sum()
    }
}

fn node_collaborators(
    id: NodeId,
    dir: &Arc<HashDirectory>,
    net: &Arc<Network>,
    view: &Arc<View>,
    asts: &Arc<AstQueue>,
) -> Collaborators {
    Collaborators {
        directory: dir.clone() as Arc<dyn Directory>,
        transport: Arc::new(NodeTransport {
            from: id,
            net: Arc::clone(net),
        }),
        membership: Arc::new(NodeMembership {
            nodeid: id,
            view: Arc::clone(view),
        }),
        asts: asts.clone(),
    }
}

/// Small tables and no timewarn noise
pub fn test_config() -> LockspaceConfig {
    LockspaceConfig::new()
        .with_rsbtbl_size(16)
        .with_lkbtbl_size(4)
        .with_timewarn_cs(0)
}

/// Caller side of one lock: its status block plus recorded callbacks.
#[derive(Clone)]
pub struct Caller {
    pub lksb: Arc<Lksb>,
    completions: Arc<Mutex<Vec<Status>>>,
    basts: Arc<Mutex<Vec<LockMode>>>,
}

impl Caller {
    pub fn new() -> Self {
        Self::from_lksb(Lksb::new())
    }

    pub fn with_lvb(len: usize) -> Self {
        Self::from_lksb(Lksb::with_lvb(len))
    }

    fn from_lksb(lksb: Arc<Lksb>) -> Self {
        Self {
            lksb,
            completions: Arc::new(Mutex::new(Vec::new())),
            basts: Arc::new(Mutex::new(Vec::new())),
        }
    }

    fn hooks(&self, req: LockRequest) -> LockRequest {
        let completions = Arc::clone(&self.completions);
        let basts = Arc::clone(&self.basts);
        req.with_completion(move |sb: &Lksb| completions.lock().push(sb.status()))
            .with_blocking(move |mode| basts.lock().push(mode))
    }

    /// New request for `name` at `mode`
    pub fn request(&self, name: &[u8], mode: LockMode) -> LockRequest {
        self.hooks(LockRequest::new(name, mode, Arc::clone(&self.lksb)))
    }

    /// Conversion of this caller's lock to `mode`
    pub fn convert(&self, mode: LockMode) -> LockRequest {
        self.hooks(LockRequest::convert(Arc::clone(&self.lksb), mode))
    }

    /// Submit a new request on `ls`
    pub fn lock(&self, ls: &Lockspace, name: &[u8], mode: LockMode, flags: LockFlags) -> Status {
        ls.lock(self.request(name, mode).with_flags(flags))
    }

    /// Submit a conversion on `ls`
    pub fn convert_on(&self, ls: &Lockspace, mode: LockMode, flags: LockFlags) -> Status {
        ls.lock(self.convert(mode).with_flags(flags))
    }

    /// Unlock (or cancel, with `LockFlags::CANCEL`) on `ls`
    pub fn unlock(&self, ls: &Lockspace, flags: LockFlags) -> Status {
        ls.unlock(self.lkid(), flags, &self.lksb)
    }

    pub fn lkid(&self) -> u32 {
        self.lksb.lock_id()
    }

    /// Completions delivered so far
    pub fn completions(&self) -> Vec<Status> {
        self.completions.lock().clone()
    }

    /// Last delivered completion
    pub fn last(&self) -> Option<Status> {
        self.completions.lock().last().copied()
    }

    /// Blocking notifications delivered so far
    pub fn basts(&self) -> Vec<LockMode> {
        self.basts.lock().clone()
    }

    pub fn clear(&self) {
        self.completions.lock().clear();
        self.basts.lock().clear();
    }
}

impl Default for Caller {
    fn default() -> Self {
        Self::new()
    }
}

/// Lock `name` at `mode` on `node` and pump until the grant arrived
pub fn granted(cluster: &Cluster, node: NodeId, name: &[u8], mode: LockMode) -> Caller {
    let caller = Caller::new();
    assert_eq!(
        caller.lock(cluster.ls(node), name, mode, LockFlags::empty()),
        Status::InProgress
    );
    cluster.pump();
    assert_eq!(caller.completions(), vec![Status::Ok], "grant of {mode} on node {node}");
    caller
}
