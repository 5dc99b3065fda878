//! Redis-backed implementation of [`StoreClient`].

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;

use super::{StoreClient, StoreError, StoreWrite};

/// Connection settings read once at startup (see `GatewayConfig` in `config`).
#[derive(Debug, Clone)]
pub struct RedisSettings {
    pub host: String,
    pub port: u16,
    pub password: Option<String>,
    pub db: i64,
}

impl Default for RedisSettings {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 6379,
            password: None,
            db: 0,
        }
    }
}

/// Thin wrapper over `redis::aio::ConnectionManager`, which transparently
/// reconnects on connection loss so callers never hold a dead handle.
#[derive(Clone)]
pub struct RedisStoreClient {
    manager: ConnectionManager,
}

impl RedisStoreClient {
    pub async fn connect(settings: &RedisSettings) -> Result<Self, StoreError> {
        let mut url = format!("redis://{}:{}/{}", settings.host, settings.port, settings.db);
        if let Some(password) = &settings.password {
            url = format!("redis://:{}@{}:{}/{}", password, settings.host, settings.port, settings.db);
        }
        let client = redis::Client::open(url).map_err(|e| StoreError::Connection(e.to_string()))?;
        let manager = client
            .get_connection_manager()
            .await
            .map_err(|e| StoreError::Connection(e.to_string()))?;
        Ok(Self { manager })
    }
}

#[async_trait]
impl StoreClient for RedisStoreClient {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        let mut conn = self.manager.clone();
        conn.get(key)
            .await
            .map_err(|e| StoreError::Protocol(e.to_string()))
    }

    async fn set(&self, key: &str, value: &str, expire_seconds: Option<u64>) -> Result<(), StoreError> {
        let mut conn = self.manager.clone();
        match expire_seconds {
            Some(ttl) => conn
                .set_ex::<_, _, ()>(key, value, ttl)
                .await
                .map_err(|e| StoreError::Protocol(e.to_string())),
            None => conn
                .set::<_, _, ()>(key, value)
                .await
                .map_err(|e| StoreError::Protocol(e.to_string())),
        }
    }

    async fn incr(&self, key: &str) -> Result<i64, StoreError> {
        let mut conn = self.manager.clone();
        conn.incr(key, 1)
            .await
            .map_err(|e| StoreError::Protocol(e.to_string()))
    }

    async fn expire(&self, key: &str, seconds: u64) -> Result<(), StoreError> {
        let mut conn = self.manager.clone();
        conn.expire::<_, ()>(key, seconds as i64)
            .await
            .map_err(|e| StoreError::Protocol(e.to_string()))
    }

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        let mut conn = self.manager.clone();
        conn.del::<_, ()>(key)
            .await
            .map_err(|e| StoreError::Protocol(e.to_string()))
    }

    async fn atomic_write(&self, writes: Vec<StoreWrite>) -> Result<(), StoreError> {
        let mut conn = self.manager.clone();
        let mut pipe = redis::pipe();
        pipe.atomic();
        for write in &writes {
            match write {
                StoreWrite::Set { key, value, expire_seconds: Some(ttl) } => {
                    pipe.set_ex(key, value, *ttl);
                }
                StoreWrite::Set { key, value, expire_seconds: None } => {
                    pipe.set(key, value);
                }
                StoreWrite::Delete { key } => {
                    pipe.del(key);
                }
            }
        }
        pipe.query_async::<_, ()>(&mut conn)
            .await
            .map_err(|e| StoreError::Protocol(e.to_string()))
    }
}
