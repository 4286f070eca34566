//! Bulwark - Request Admission and Resilience Layer
//!
//! This crate implements the admission-control and resilience core of the
//! facilitator service: per-client rate limiting (local and cluster-wide),
//! consistent-hash shard ownership across running instances, retry with
//! circuit breaking around the upstream RPC, and a bounded TTL store used
//! as fallback persistence.

pub mod config;
pub mod error;
pub mod http;
pub mod mesh;
pub mod ratelimit;
pub mod resilience;
pub mod sharding;
pub mod store;
pub mod tasks;
pub mod upstream;
