//! Shard ownership across running instances.
//!
//! A [`ConsistentHashRing`] decides which instance owns a given cache or
//! index key, moving as few keys as possible when instances come and go.

mod hash;
mod ring;

pub use hash::{fnv1a_32, HashFn};
pub use ring::{ConsistentHashRing, DEFAULT_VIRTUAL_NODES};
