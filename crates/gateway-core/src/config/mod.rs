//! Config Manager: owns the active route list, persists it durably, and
//! broadcasts hot-reload notifications to subscribers.
//!
//! Grounded on the teacher's `config::hot_reload::ConfigWatcher` (the
//! `broadcast::Sender` + monotonic version counter pattern), generalized
//! from "watch a file, reload Settings" into "shared-store-first load order,
//! atomic file persistence, route CRUD" per SPEC_FULL.md §4.4.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use log::{info, warn};
use tokio::sync::{broadcast, RwLock};

use crate::routing::Route;
use crate::store::{StoreClient, StoreError};

const SHARED_STORE_ROUTES_KEY: &str = "config:routes";
const ROUTES_FILE_NAME: &str = "routes.json";
const UPDATE_CHANNEL_CAPACITY: usize = 64;

/// A versioned, immutable view of the active route set, published on every
/// successful mutation (SPEC_FULL.md §3 "Config snapshot / version").
#[derive(Debug, Clone)]
pub struct ConfigSnapshot {
    pub routes: Vec<Route>,
    pub version: u64,
    pub loaded_at: chrono::DateTime<chrono::Utc>,
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("a route named '{0}' already exists")]
    DuplicateName(String),
    #[error("route validation failed: {0}")]
    Invalid(#[from] crate::routing::RouteError),
    #[error("failed to persist routes to disk: {0}")]
    FileIo(String),
    #[error("shared store error while persisting routes: {0}")]
    Store(#[from] StoreError),
}

fn default_route() -> Route {
    Route {
        name: "default".to_string(),
        pattern: "/health".to_string(),
        target: "http://127.0.0.1:8081".to_string(),
        methods: vec!["GET".to_string()],
        policies: vec![],
        circuit_breaker: None,
        timeout_ms: 30_000,
        retries: 0,
    }
}

pub struct ConfigManager {
    current: RwLock<ConfigSnapshot>,
    config_dir: PathBuf,
    store: Option<Arc<dyn StoreClient>>,
    update_sender: broadcast::Sender<ConfigSnapshot>,
    version_counter: AtomicU64,
}

impl ConfigManager {
    fn routes_path(config_dir: &Path) -> PathBuf {
        config_dir.join(ROUTES_FILE_NAME)
    }

    /// Loads the route set using the order in SPEC_FULL.md §4.4: shared
    /// store, then the on-disk file, then a single seeded default route.
    pub async fn initialize(config_dir: PathBuf, store: Option<Arc<dyn StoreClient>>) -> Result<Arc<Self>, ConfigError> {
        tokio::fs::create_dir_all(&config_dir).await.map_err(|e| ConfigError::FileIo(e.to_string()))?;

        let routes = if let Some(store) = &store {
            match store.get(SHARED_STORE_ROUTES_KEY).await {
                Ok(Some(json)) if !json.trim().is_empty() => {
                    match serde_json::from_str::<Vec<Route>>(&json) {
                        Ok(routes) if !routes.is_empty() => {
                            info!("loaded {} routes from shared store", routes.len());
                            Some(routes)
                        }
                        Ok(_) => None,
                        Err(e) => {
                            warn!("shared store routes were malformed, falling back: {e}");
                            None
                        }
                    }
                }
                Ok(_) => None,
                Err(e) => {
                    warn!("shared store unavailable while loading routes: {e}");
                    None
                }
            }
        } else {
            None
        };

        let routes = match routes {
            Some(routes) => routes,
            None => match Self::load_from_file(&config_dir).await {
                Some(routes) => {
                    info!("loaded {} routes from {}", routes.len(), Self::routes_path(&config_dir).display());
                    routes
                }
                None => {
                    info!("no existing route configuration found, seeding default route");
                    vec![default_route()]
                }
            },
        };

        let (update_sender, _) = broadcast::channel(UPDATE_CHANNEL_CAPACITY);
        let manager = Arc::new(Self {
            current: RwLock::new(ConfigSnapshot { routes: routes.clone(), version: 1, loaded_at: chrono::Utc::now() }),
            config_dir,
            store,
            update_sender,
            version_counter: AtomicU64::new(1),
        });

        manager.persist(&routes).await?;
        Ok(manager)
    }

    async fn load_from_file(config_dir: &Path) -> Option<Vec<Route>> {
        let contents = tokio::fs::read_to_string(Self::routes_path(config_dir)).await.ok()?;
        serde_json::from_str(&contents).ok()
    }

    /// Writes the route set to both the shared store and disk (temp file
    /// then atomic rename). Mirrors to the store even when the initial load
    /// came from disk, so the two stay in agreement (SPEC_FULL.md §8 #4).
    async fn persist(&self, routes: &[Route]) -> Result<(), ConfigError> {
        let json = serde_json::to_string_pretty(routes).map_err(|e| ConfigError::FileIo(e.to_string()))?;

        let final_path = Self::routes_path(&self.config_dir);
        let temp_path = final_path.with_extension("json.tmp");
        tokio::fs::write(&temp_path, &json).await.map_err(|e| ConfigError::FileIo(e.to_string()))?;
        tokio::fs::rename(&temp_path, &final_path).await.map_err(|e| ConfigError::FileIo(e.to_string()))?;

        if let Some(store) = &self.store {
            store.set(SHARED_STORE_ROUTES_KEY, &json, None).await?;
        }
        Ok(())
    }

    pub async fn get_routes(&self) -> Vec<Route> {
        self.current.read().await.routes.clone()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ConfigSnapshot> {
        self.update_sender.subscribe()
    }

    async fn publish(&self, routes: Vec<Route>) {
        let version = self.version_counter.fetch_add(1, Ordering::Relaxed) + 1;
        let snapshot = ConfigSnapshot { routes, version, loaded_at: chrono::Utc::now() };
        *self.current.write().await = snapshot.clone();
        if self.update_sender.send(snapshot).is_err() {
            // No subscribers; not an error.
        }
    }

    /// Appends a new route. Rolls back the in-memory state if persistence
    /// fails so a partial write never leaves memory and disk disagreeing.
    pub async fn add_route(&self, route: Route) -> Result<(), ConfigError> {
        route.validate()?;
        let mut routes = self.get_routes().await;
        if routes.iter().any(|r| r.name == route.name) {
            return Err(ConfigError::DuplicateName(route.name));
        }
        routes.push(route);
        self.persist(&routes).await?;
        self.publish(routes).await;
        Ok(())
    }

    /// Replaces the route named `name`. Returns whether a route with that
    /// name existed.
    pub async fn update_route(&self, name: &str, route: Route) -> Result<bool, ConfigError> {
        route.validate()?;
        let mut routes = self.get_routes().await;
        let Some(slot) = routes.iter_mut().find(|r| r.name == name) else {
            return Ok(false);
        };
        *slot = route;
        self.persist(&routes).await?;
        self.publish(routes).await;
        Ok(true)
    }

    /// Removes the route named `name`. Returns whether it existed.
    pub async fn delete_route(&self, name: &str) -> Result<bool, ConfigError> {
        let mut routes = self.get_routes().await;
        let original_len = routes.len();
        routes.retain(|r| r.name != name);
        if routes.len() == original_len {
            return Ok(false);
        }
        self.persist(&routes).await?;
        self.publish(routes).await;
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::InMemoryStoreClient;

    fn route(name: &str) -> Route {
        Route {
            name: name.to_string(),
            pattern: format!("/{name}"),
            target: "http://upstream".to_string(),
            methods: vec![],
            policies: vec![],
            circuit_breaker: None,
            timeout_ms: 30_000,
            retries: 0,
        }
    }

    #[tokio::test]
    async fn seeds_default_route_when_nothing_exists() {
        let dir = tempfile::tempdir().unwrap();
        let manager = ConfigManager::initialize(dir.path().to_path_buf(), None).await.unwrap();
        let routes = manager.get_routes().await;
        assert_eq!(routes.len(), 1);
        assert_eq!(routes[0].name, "default");
    }

    #[tokio::test]
    async fn add_then_delete_restores_route_set() {
        let dir = tempfile::tempdir().unwrap();
        let manager = ConfigManager::initialize(dir.path().to_path_buf(), None).await.unwrap();
        let before = manager.get_routes().await;

        manager.add_route(route("x")).await.unwrap();
        assert!(manager.get_routes().await.iter().any(|r| r.name == "x"));

        let deleted = manager.delete_route("x").await.unwrap();
        assert!(deleted);
        assert_eq!(manager.get_routes().await.len(), before.len());

        let deleted_again = manager.delete_route("x").await.unwrap();
        assert!(!deleted_again);
    }

    #[tokio::test]
    async fn duplicate_name_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let manager = ConfigManager::initialize(dir.path().to_path_buf(), None).await.unwrap();
        manager.add_route(route("x")).await.unwrap();
        let result = manager.add_route(route("x")).await;
        assert!(matches!(result, Err(ConfigError::DuplicateName(_))));
    }

    #[tokio::test]
    async fn reload_after_restart_yields_same_routes() {
        let dir = tempfile::tempdir().unwrap();
        let manager = ConfigManager::initialize(dir.path().to_path_buf(), None).await.unwrap();
        manager.add_route(route("x")).await.unwrap();
        let routes_before = manager.get_routes().await;

        let reloaded = ConfigManager::initialize(dir.path().to_path_buf(), None).await.unwrap();
        let routes_after = reloaded.get_routes().await;
        assert_eq!(routes_before.len(), routes_after.len());
        assert!(routes_after.iter().any(|r| r.name == "x"));
    }

    #[tokio::test]
    async fn shared_store_and_file_agree_after_mutation() {
        let dir = tempfile::tempdir().unwrap();
        let store: Arc<dyn StoreClient> = Arc::new(InMemoryStoreClient::new());
        let manager = ConfigManager::initialize(dir.path().to_path_buf(), Some(store.clone())).await.unwrap();
        manager.add_route(route("x")).await.unwrap();

        let from_store: Vec<Route> = serde_json::from_str(&store.get("config:routes").await.unwrap().unwrap()).unwrap();
        let from_disk: Vec<Route> = serde_json::from_str(&tokio::fs::read_to_string(dir.path().join("routes.json")).await.unwrap()).unwrap();
        assert_eq!(from_store.len(), from_disk.len());
    }
}
