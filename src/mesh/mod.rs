//! Peer mesh built on chitchat gossip.
//!
//! The [`Cluster`] node serves two purposes: it is the shared-counter
//! backend for distributed rate limiting, and its live member list drives
//! shard ownership on the hash ring.

mod cluster;
mod membership;

pub use cluster::{Cluster, ClusterConfig, ClusterError, CounterKey};
pub use membership::{reconcile_ring, spawn_membership_sync};
