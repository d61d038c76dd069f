//! A small hierarchical file system served to client processes over a
//! request/reply channel.
//!
//! The volume lives on any `fileblock::BlockStorage`. Disk blocks are brought
//! into memory by a write-back block cache; files are 256 byte records stored
//! inline in their parent directory and addressed by direct and single indirect
//! block pointers. A single `Server` owns the volume and answers requests in
//! arrival order.

pub mod alloc;
pub mod cache;
pub mod config;
pub mod fs;
pub mod ipc;
pub mod node;
pub mod protocol;
mod sb;
pub mod serv;

pub use crate::config::ServerConfig;
pub use crate::fs::{NodeStatus, SFSError, VolumeInfo, SFS};
pub use crate::node::{FileRef, FileType, Stat};
pub use crate::serv::Server;
