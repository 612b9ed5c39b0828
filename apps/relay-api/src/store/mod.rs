//! The shared presence/membership store and broker.
//!
//! Backed by Redis in production and an in-memory implementation in tests.
//! Injected at construction time (never a singleton) so every consumer is
//! testable against the fake.

use async_trait::async_trait;

use crate::error::Error;

pub mod keys;
pub mod memory;
pub mod redis;

pub use memory::MemoryStore;
pub use redis::RedisStore;

/// Abstraction over the shared key-value/pub-sub store that coordinates
/// presence, membership views, and job locks across the fleet.
#[async_trait]
pub trait CoordStore: Send + Sync {
    /// Set a string value with a time-to-live.
    async fn set_ex(&self, key: &str, value: &str, ttl_secs: u64) -> Result<(), Error>;

    async fn get(&self, key: &str) -> Result<Option<String>, Error>;

    async fn del(&self, key: &str) -> Result<(), Error>;

    /// Delete `key` only if its current value equals `expected`. Returns
    /// whether a deletion happened. This is the compare-and-delete used to
    /// retract presence records and release job locks without clobbering a
    /// newer writer.
    async fn del_if_eq(&self, key: &str, expected: &str) -> Result<bool, Error>;

    async fn sadd(&self, key: &str, member: &str) -> Result<(), Error>;

    async fn srem(&self, key: &str, member: &str) -> Result<(), Error>;

    async fn smembers(&self, key: &str) -> Result<Vec<String>, Error>;

    async fn hset(&self, key: &str, field: &str, value: &str) -> Result<(), Error>;

    async fn hget(&self, key: &str, field: &str) -> Result<Option<String>, Error>;

    /// Atomically claim `key` for `owner` with a TTL if it is currently
    /// unclaimed (SET NX EX). Returns whether the claim succeeded.
    async fn try_lock(&self, key: &str, owner: &str, ttl_secs: u64) -> Result<bool, Error>;

    async fn publish(&self, channel: &str, payload: &str) -> Result<(), Error>;

    /// Open a subscription. Channels are added and removed dynamically as
    /// local membership changes.
    async fn subscribe(&self) -> Result<Box<dyn Subscription>, Error>;
}

/// A live pub/sub subscription with a dynamic channel set.
#[async_trait]
pub trait Subscription: Send {
    async fn subscribe(&mut self, channel: &str) -> Result<(), Error>;

    async fn unsubscribe(&mut self, channel: &str) -> Result<(), Error>;

    /// Next `(channel, payload)` pair, or `None` when the stream is closed.
    async fn next_message(&mut self) -> Option<(String, String)>;
}
