//! Bounded, self-expiring in-memory storage.

mod bounded;

pub use bounded::{BoundedStore, DEFAULT_MAX_ENTRIES};
