//! Tunnel registration store
//!
//! Tracks ephemeral tunnel registrations (id, allocated port, credentials)
//! in a 5-minute TTL cache. Expired registrations are demoted into a
//! 3-day historical cache and dropped from the live indices by the expiry
//! callback, atomically relative to cache access.

use dashmap::DashMap;
use mirrortrap_cache::TtlCache;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info};

const ACTIVE_TTL: Duration = Duration::from_secs(5 * 60);
const HISTORY_TTL: Duration = Duration::from_secs(3 * 24 * 60 * 60);

/// Registry errors
#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("Failed to allocate a local port: {0}")]
    PortAllocation(#[from] std::io::Error),

    #[error("Tunnel not found: {0}")]
    TunnelNotFound(String),
}

/// Lifecycle of a registration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TunnelStatus {
    Alive,
    Expired,
}

/// One tunnel registration
#[derive(Debug, Clone)]
pub struct TunnelRegistration {
    pub id: String,
    pub host: String,
    pub port: u16,
    pub public_key: Vec<u8>,
    pub secret: String,
    pub verbose: String,
    pub status: TunnelStatus,
}

/// Registration store with TTL promotion to history
pub struct TunnelRegistry {
    active: TtlCache<String, TunnelRegistration>,
    history: TtlCache<String, TunnelRegistration>,
    by_port: Arc<DashMap<u16, String>>,
}

impl TunnelRegistry {
    pub fn new() -> Self {
        let active: TtlCache<String, TunnelRegistration> = TtlCache::new(ACTIVE_TTL);
        let history: TtlCache<String, TunnelRegistration> = TtlCache::new(HISTORY_TTL);
        let by_port: Arc<DashMap<u16, String>> = Arc::new(DashMap::new());

        let index = by_port.clone();
        active.set_on_insert(Arc::new(move |id: &String, reg: &TunnelRegistration| {
            index.insert(reg.port, id.clone());
        }));

        let index = by_port.clone();
        let demoted = history.clone();
        active.set_on_expire(Arc::new(move |id: &String, reg: &TunnelRegistration| {
            index.remove(&reg.port);
            let mut historical = reg.clone();
            historical.status = TunnelStatus::Expired;
            demoted.set(id.clone(), historical);
            debug!(id = %id, port = reg.port, "Tunnel registration demoted to history");
        }));

        Self {
            active,
            history,
            by_port,
        }
    }

    /// Register a tunnel: fresh UUID, freshly allocated local port
    pub fn register(
        &self,
        host: impl Into<String>,
        public_key: Vec<u8>,
        secret: String,
        verbose: String,
    ) -> Result<TunnelRegistration, RegistryError> {
        let id = uuid::Uuid::new_v4().to_string();
        let port = allocate_free_port()?;

        let registration = TunnelRegistration {
            id: id.clone(),
            host: host.into(),
            port,
            public_key,
            secret,
            verbose,
            status: TunnelStatus::Alive,
        };
        self.active.set(id.clone(), registration.clone());

        info!(id = %id, port = port, "Registered tunnel");
        Ok(registration)
    }

    /// Look up an active registration by id
    pub fn get(&self, id: &str) -> Result<TunnelRegistration, RegistryError> {
        self.active
            .get(&id.to_string())
            .ok_or_else(|| RegistryError::TunnelNotFound(id.to_string()))
    }

    /// All active registrations
    pub fn list(&self) -> Vec<TunnelRegistration> {
        self.active.entries().into_iter().map(|(_, r)| r).collect()
    }

    /// Remove an active registration (history is untouched)
    pub fn remove(&self, id: &str) -> Result<TunnelRegistration, RegistryError> {
        let registration = self
            .active
            .remove(&id.to_string())
            .ok_or_else(|| RegistryError::TunnelNotFound(id.to_string()))?;
        self.by_port.remove(&registration.port);
        info!(id = %id, "Removed tunnel registration");
        Ok(registration)
    }

    /// Port reserved by an active registration for `id`, if any
    pub fn port_for_id(&self, id: &str) -> Option<u16> {
        self.get(id).ok().map(|r| r.port)
    }

    /// Whether `port` is reserved by any active registration
    pub fn is_port_claimed(&self, port: u16) -> bool {
        // Copy the id out before touching the active cache: a lazy expiry
        // there re-enters the index and must not find this shard locked.
        let id = match self.by_port.get(&port) {
            Some(entry) => entry.value().clone(),
            None => return false,
        };
        self.active.contains_key(&id)
    }

    /// Historical (expired) registration by id
    pub fn history(&self, id: &str) -> Option<TunnelRegistration> {
        self.history.get(&id.to_string())
    }

    #[doc(hidden)]
    pub fn set_active_ttl(&self, ttl: Duration) {
        self.active.set_ttl(ttl);
    }

    #[doc(hidden)]
    pub fn sweep(&self) {
        self.active.sweep();
    }
}

impl Default for TunnelRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Probe the kernel for a currently free TCP port
fn allocate_free_port() -> Result<u16, std::io::Error> {
    let listener = std::net::TcpListener::bind("127.0.0.1:0")?;
    Ok(listener.local_addr()?.port())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_register_allocates_distinct_ids() {
        let registry = TunnelRegistry::new();
        let first = registry
            .register("198.51.100.1", vec![1], "s".into(), "v".into())
            .unwrap();
        let second = registry
            .register("198.51.100.1", vec![2], "s".into(), "v".into())
            .unwrap();

        assert_ne!(first.id, second.id);
        assert_ne!(first.port, 0);
        assert_eq!(first.status, TunnelStatus::Alive);
    }

    #[tokio::test]
    async fn test_get_list_remove() {
        let registry = TunnelRegistry::new();
        let reg = registry
            .register("h", Vec::new(), "s".into(), "".into())
            .unwrap();

        assert_eq!(registry.get(&reg.id).unwrap().port, reg.port);
        assert_eq!(registry.list().len(), 1);
        assert!(registry.is_port_claimed(reg.port));
        assert_eq!(registry.port_for_id(&reg.id), Some(reg.port));

        registry.remove(&reg.id).unwrap();
        assert!(registry.get(&reg.id).is_err());
        assert!(registry.list().is_empty());
        assert!(!registry.is_port_claimed(reg.port));
    }

    #[tokio::test]
    async fn test_remove_unknown_is_an_error() {
        let registry = TunnelRegistry::new();
        assert!(matches!(
            registry.remove("missing"),
            Err(RegistryError::TunnelNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_expiry_demotes_to_history_and_drops_indices() {
        let registry = TunnelRegistry::new();
        registry.set_active_ttl(Duration::from_millis(30));

        let reg = registry
            .register("h", Vec::new(), "s".into(), "".into())
            .unwrap();

        tokio::time::sleep(Duration::from_millis(80)).await;
        registry.sweep();

        assert!(registry.get(&reg.id).is_err());
        assert!(!registry.is_port_claimed(reg.port));

        let historical = registry.history(&reg.id).expect("demoted entry");
        assert_eq!(historical.status, TunnelStatus::Expired);
        assert_eq!(historical.port, reg.port);
    }
}
