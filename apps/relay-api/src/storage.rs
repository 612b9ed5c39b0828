//! Object storage seam.
//!
//! Uploads and pre-signed URL issuance belong to the media service; the
//! realtime core only ever deletes artifacts during cleanup, so the trait is
//! deliberately narrow. Backed by S3-compatible storage in production and an
//! in-memory map in tests.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;

use crate::error::Error;

/// All artifacts belonging to a group live under this key prefix.
pub fn group_prefix(group_id: &str) -> String {
    format!("groups/{group_id}/")
}

#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Delete every object whose key starts with `prefix`. Returns the
    /// number of objects removed.
    async fn delete_prefix(&self, prefix: &str) -> Result<usize, Error>;
}

pub struct MemoryObjectStore {
    objects: Mutex<HashMap<String, Vec<u8>>>,
}

impl MemoryObjectStore {
    pub fn new() -> Self {
        Self {
            objects: Mutex::new(HashMap::new()),
        }
    }

    pub fn put(&self, key: &str, data: Vec<u8>) {
        self.objects.lock().unwrap().insert(key.to_string(), data);
    }

    pub fn contains(&self, key: &str) -> bool {
        self.objects.lock().unwrap().contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.objects.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for MemoryObjectStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ObjectStore for MemoryObjectStore {
    async fn delete_prefix(&self, prefix: &str) -> Result<usize, Error> {
        let mut objects = self.objects.lock().unwrap();
        let before = objects.len();
        objects.retain(|key, _| !key.starts_with(prefix));
        Ok(before - objects.len())
    }
}
