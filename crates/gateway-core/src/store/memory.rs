//! In-memory fake of [`StoreClient`] used by tests so the core can be
//! exercised without a live Redis instance.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::sync::Mutex;

use super::{StoreClient, StoreError, StoreWrite};

struct Entry {
    value: String,
    expires_at: Option<Instant>,
}

#[derive(Clone, Default)]
pub struct InMemoryStoreClient {
    data: Arc<Mutex<HashMap<String, Entry>>>,
}

impl InMemoryStoreClient {
    pub fn new() -> Self {
        Self::default()
    }

    fn is_live(entry: &Entry) -> bool {
        match entry.expires_at {
            Some(deadline) => Instant::now() < deadline,
            None => true,
        }
    }
}

#[async_trait]
impl StoreClient for InMemoryStoreClient {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        let data = self.data.lock().await;
        Ok(data.get(key).filter(|e| Self::is_live(e)).map(|e| e.value.clone()))
    }

    async fn set(&self, key: &str, value: &str, expire_seconds: Option<u64>) -> Result<(), StoreError> {
        let mut data = self.data.lock().await;
        data.insert(
            key.to_string(),
            Entry {
                value: value.to_string(),
                expires_at: expire_seconds.map(|s| Instant::now() + Duration::from_secs(s)),
            },
        );
        Ok(())
    }

    async fn incr(&self, key: &str) -> Result<i64, StoreError> {
        let mut data = self.data.lock().await;
        let current = data
            .get(key)
            .filter(|e| Self::is_live(e))
            .map(|e| e.value.parse::<i64>().unwrap_or(0))
            .unwrap_or(0);
        let next = current + 1;
        let expires_at = data.get(key).and_then(|e| e.expires_at);
        data.insert(
            key.to_string(),
            Entry { value: next.to_string(), expires_at },
        );
        Ok(next)
    }

    async fn expire(&self, key: &str, seconds: u64) -> Result<(), StoreError> {
        let mut data = self.data.lock().await;
        if let Some(entry) = data.get_mut(key) {
            entry.expires_at = Some(Instant::now() + Duration::from_secs(seconds));
        }
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        let mut data = self.data.lock().await;
        data.remove(key);
        Ok(())
    }

    async fn atomic_write(&self, writes: Vec<StoreWrite>) -> Result<(), StoreError> {
        let mut data = self.data.lock().await;
        for write in writes {
            match write {
                StoreWrite::Set { key, value, expire_seconds } => {
                    data.insert(
                        key,
                        Entry {
                            value,
                            expires_at: expire_seconds.map(|s| Instant::now() + Duration::from_secs(s)),
                        },
                    );
                }
                StoreWrite::Delete { key } => {
                    data.remove(&key);
                }
            }
        }
        Ok(())
    }
}
