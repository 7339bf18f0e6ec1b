//! oxidlm - the core of a distributed lock manager
//!
//! Processes across a cluster acquire named locks in one of six modes
//! (NL, CR, CW, PR, PW, EX) within a lockspace. Every resource is mastered
//! by exactly one node; other nodes keep process copies of their locks and
//! forward operations to the master as messages.
//!
//! # Features
//!
//! - Grant queues with conversion, deadlock detection and alternate modes
//! - Lock value blocks with recovery-time invalidation
//! - Master lookup through a directory, or masterless hash placement
//! - Overlapping unlock/cancel handling for operations in flight
//! - Recovery after membership changes: stub replies, resends, remastering
//! - Lock timeouts, timewarn reporting and a background scanner
//!
//! The network, the directory and the failure detector are supplied by the
//! embedding layer through the traits in [`cluster`].
//!
//! # Quick Start
//!
//! ```rust,ignore
//! use oxidlm::{Dlm, LockMode, LockRequest, Lksb, LockspaceConfig};
//!
//! let dlm = Dlm::new(collaborators);
//! let ls = dlm.new_lockspace("fs0", LockspaceConfig::default())?;
//!
//! let lksb = Lksb::new();
//! let req = LockRequest::new(b"inode-7", LockMode::Ex, lksb.clone())
//!     .with_completion(|lksb| println!("granted: {}", lksb.status()));
//! ls.lock(req);
//! ```

#![warn(missing_docs)]

pub mod ast;
pub mod cluster;
pub mod config;
pub mod flags;
pub mod lockspace;
pub mod mode;
pub mod registry;
pub mod stats;
pub mod status;
pub mod wire;

// Re-exports for convenience
pub use ast::{Ast, AstQueue, AstSink, Lksb};
pub use cluster::{Directory, HashDirectory, Membership, NodeId, NodeRef, Transport, TransportError};
pub use config::{ConfigError, DlmConfig, LockspaceConfig};
pub use flags::{LockFlags, SbFlags};
pub use lockspace::{
    Collaborators, LkbStatus, LockInfo, LockRequest, Lockspace, RecoveryReport, ResourceInfo,
    ScanReport, Scand, StubReply,
};
pub use mode::LockMode;
pub use registry::{lockspace_id, Dlm, RegistryError};
pub use stats::{StatsReporter, StatsSnapshot};
pub use status::Status;
pub use wire::{Frame, Message, MsgType, WireError};

/// Prelude module for common imports
pub mod prelude {
    pub use crate::ast::{AstQueue, Lksb};
    pub use crate::config::LockspaceConfig;
    pub use crate::flags::LockFlags;
    pub use crate::lockspace::{Collaborators, LockRequest, Lockspace};
    pub use crate::mode::LockMode;
    pub use crate::registry::Dlm;
    pub use crate::status::Status;
}
