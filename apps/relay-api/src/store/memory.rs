//! In-memory `CoordStore` for tests and single-process development.
//!
//! Honors TTLs (lazily, on read) and lock semantics so that presence expiry
//! and job-lock races behave like the Redis backend.

use std::collections::{HashMap, HashSet};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::sync::broadcast;

use crate::error::Error;

use super::{CoordStore, Subscription};

/// Capacity of the fake pub/sub bus. Lagged receivers skip messages, same as
/// a slow Redis subscriber would.
const BUS_CAPACITY: usize = 1024;

struct ValueEntry {
    value: String,
    expires_at: Option<Instant>,
}

impl ValueEntry {
    fn expired(&self) -> bool {
        matches!(self.expires_at, Some(at) if at <= Instant::now())
    }
}

pub struct MemoryStore {
    kv: Mutex<HashMap<String, ValueEntry>>,
    sets: Mutex<HashMap<String, HashSet<String>>>,
    hashes: Mutex<HashMap<String, HashMap<String, String>>>,
    bus: broadcast::Sender<(String, String)>,
}

impl MemoryStore {
    pub fn new() -> Self {
        let (bus, _) = broadcast::channel(BUS_CAPACITY);
        Self {
            kv: Mutex::new(HashMap::new()),
            sets: Mutex::new(HashMap::new()),
            hashes: Mutex::new(HashMap::new()),
            bus,
        }
    }

    fn live_value(&self, key: &str) -> Option<String> {
        let mut kv = self.kv.lock().unwrap();
        match kv.get(key) {
            Some(entry) if entry.expired() => {
                kv.remove(key);
                None
            }
            Some(entry) => Some(entry.value.clone()),
            None => None,
        }
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CoordStore for MemoryStore {
    async fn set_ex(&self, key: &str, value: &str, ttl_secs: u64) -> Result<(), Error> {
        self.kv.lock().unwrap().insert(
            key.to_string(),
            ValueEntry {
                value: value.to_string(),
                expires_at: Some(Instant::now() + Duration::from_secs(ttl_secs)),
            },
        );
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<String>, Error> {
        Ok(self.live_value(key))
    }

    async fn del(&self, key: &str) -> Result<(), Error> {
        self.kv.lock().unwrap().remove(key);
        self.sets.lock().unwrap().remove(key);
        self.hashes.lock().unwrap().remove(key);
        Ok(())
    }

    async fn del_if_eq(&self, key: &str, expected: &str) -> Result<bool, Error> {
        let mut kv = self.kv.lock().unwrap();
        match kv.get(key) {
            Some(entry) if !entry.expired() && entry.value == expected => {
                kv.remove(key);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn sadd(&self, key: &str, member: &str) -> Result<(), Error> {
        self.sets
            .lock()
            .unwrap()
            .entry(key.to_string())
            .or_default()
            .insert(member.to_string());
        Ok(())
    }

    async fn srem(&self, key: &str, member: &str) -> Result<(), Error> {
        let mut sets = self.sets.lock().unwrap();
        if let Some(set) = sets.get_mut(key) {
            set.remove(member);
            if set.is_empty() {
                sets.remove(key);
            }
        }
        Ok(())
    }

    async fn smembers(&self, key: &str) -> Result<Vec<String>, Error> {
        Ok(self
            .sets
            .lock()
            .unwrap()
            .get(key)
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default())
    }

    async fn hset(&self, key: &str, field: &str, value: &str) -> Result<(), Error> {
        self.hashes
            .lock()
            .unwrap()
            .entry(key.to_string())
            .or_default()
            .insert(field.to_string(), value.to_string());
        Ok(())
    }

    async fn hget(&self, key: &str, field: &str) -> Result<Option<String>, Error> {
        Ok(self
            .hashes
            .lock()
            .unwrap()
            .get(key)
            .and_then(|hash| hash.get(field).cloned()))
    }

    async fn try_lock(&self, key: &str, owner: &str, ttl_secs: u64) -> Result<bool, Error> {
        let mut kv = self.kv.lock().unwrap();
        match kv.get(key) {
            Some(entry) if !entry.expired() => Ok(false),
            _ => {
                kv.insert(
                    key.to_string(),
                    ValueEntry {
                        value: owner.to_string(),
                        expires_at: Some(Instant::now() + Duration::from_secs(ttl_secs)),
                    },
                );
                Ok(true)
            }
        }
    }

    async fn publish(&self, channel: &str, payload: &str) -> Result<(), Error> {
        // send() errs only when there are no receivers — fine for a broker.
        let _ = self.bus.send((channel.to_string(), payload.to_string()));
        Ok(())
    }

    async fn subscribe(&self) -> Result<Box<dyn Subscription>, Error> {
        Ok(Box::new(MemorySubscription {
            rx: self.bus.subscribe(),
            channels: HashSet::new(),
        }))
    }
}

struct MemorySubscription {
    rx: broadcast::Receiver<(String, String)>,
    channels: HashSet<String>,
}

#[async_trait]
impl Subscription for MemorySubscription {
    async fn subscribe(&mut self, channel: &str) -> Result<(), Error> {
        self.channels.insert(channel.to_string());
        Ok(())
    }

    async fn unsubscribe(&mut self, channel: &str) -> Result<(), Error> {
        self.channels.remove(channel);
        Ok(())
    }

    async fn next_message(&mut self) -> Option<(String, String)> {
        loop {
            match self.rx.recv().await {
                Ok((channel, payload)) if self.channels.contains(&channel) => {
                    return Some((channel, payload));
                }
                Ok(_) => continue,
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "memory subscription lagged");
                    continue;
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}
