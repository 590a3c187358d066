//! Infrastructure bus implementations.
//!
//! The bus abstraction and the in-memory log live in `atlas-events` as pure
//! mechanics. This module provides the Redis-backed transport.

#[cfg(feature = "redis")]
pub mod redis_streams;

#[cfg(feature = "redis")]
pub use redis_streams::{RedisStreamsBus, StreamsConfig};
