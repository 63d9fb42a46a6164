//! kman kubehub: REST mapping, the generic object client and its backends

#![forbid(unsafe_code)]

pub mod backend;
pub mod client;
pub mod cluster;
pub mod connect;
pub mod mapping;
pub mod memory;

pub use backend::{ObjectRef, ResourceBackend};
pub use client::DynamicClient;
pub use cluster::KubeBackend;
pub use connect::{connect, ConnectionParams};
pub use mapping::{DiscoverySource, RestMapper, RestMapping};
pub use memory::{merge_patch, MemoryCluster};
