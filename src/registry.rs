use crate::config::InstanceSettings;
use crate::error::BullpenError;
use crate::instance::{validate_tenant, Instance, ASSETS_TENANT};
use crate::ports::PortAllocator;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

/// How long request-path starts of the shared-assets instance are skipped
/// after one fails. The reaper keeps retrying regardless.
const ASSETS_RETRY_BACKOFF: Duration = Duration::from_secs(5);

/// Everything guarded by the registry lock
struct RegistryState {
    instances: HashMap<String, Arc<Instance>>,
    ports: PortAllocator,
}

/// Snapshot of one registered instance
#[derive(Debug, Clone, serde::Serialize)]
pub struct InstanceStatus {
    pub tenant: String,
    pub port: u16,
    /// Path prefix the editor is mounted under
    pub root: String,
    pub content_dir: PathBuf,
    pub pid: Option<u32>,
    pub alive: bool,
    pub idle_secs: u64,
    pub uptime_secs: u64,
    pub assets: bool,
}

/// Single source of truth for which tenants have a running editor.
///
/// # Locking
///
/// The instance map and the allocated-port set live under one
/// `parking_lot::Mutex` that is only held for short, non-async sections.
/// Spawning and health-checking a new instance happens outside of it, under a
/// per-tenant `tokio` mutex: concurrent first requests for the same tenant
/// queue behind one cold start and then share the instance, while cold starts
/// for different tenants proceed in parallel.
///
/// ```ignore
/// let registry = InstanceRegistry::new(settings);
/// // registry is already Arc<InstanceRegistry>
/// let instance = registry.get_or_create("alice").await?;
/// ```
pub struct InstanceRegistry {
    state: Mutex<RegistryState>,
    creation_locks: DashMap<String, Arc<tokio::sync::Mutex<()>>>,
    assets_failed_at: Mutex<Option<Instant>>,
    settings: InstanceSettings,
}

impl InstanceRegistry {
    pub fn new(settings: InstanceSettings) -> Arc<Self> {
        let ports = PortAllocator::new(settings.port_range_start, settings.port_range_end);
        Arc::new(Self {
            state: Mutex::new(RegistryState {
                instances: HashMap::new(),
                ports,
            }),
            creation_locks: DashMap::new(),
            assets_failed_at: Mutex::new(None),
            settings,
        })
    }

    pub fn settings(&self) -> &InstanceSettings {
        &self.settings
    }

    /// Content directory backing a tenant (scratch directory for the
    /// shared-assets instance)
    pub fn content_dir(&self, tenant: &str) -> Result<PathBuf, BullpenError> {
        if tenant == ASSETS_TENANT {
            return Ok(self.settings.assets_dir.clone());
        }
        validate_tenant(tenant)?;
        let dir = self.settings.content_root.join(tenant);
        if dir.is_dir() {
            Ok(dir)
        } else {
            Err(BullpenError::TenantNotFound(tenant.to_string()))
        }
    }

    /// Return the tenant's live instance, starting one if needed
    pub async fn get_or_create(&self, tenant: &str) -> Result<Arc<Instance>, BullpenError> {
        self.content_dir(tenant)?;

        if let Some(instance) = self.get_live(tenant) {
            instance.touch();
            return Ok(instance);
        }

        let creation_lock = self.creation_lock(tenant);
        let _creating = creation_lock.lock().await;

        // Someone else may have finished a cold start while we queued
        let stale = {
            let mut state = self.state.lock();
            let alive = state.instances.get(tenant).map(|instance| instance.is_alive());
            match alive {
                Some(true) => {
                    let instance = Arc::clone(&state.instances[tenant]);
                    instance.touch();
                    return Ok(instance);
                }
                Some(false) => state.instances.remove(tenant),
                None => None,
            }
        };

        if let Some(stale) = stale {
            warn!(tenant, port = stale.port(), "Editor process died, restarting");
            self.teardown(&stale).await;
        }

        let port = {
            let mut state = self.state.lock();
            match state.ports.allocate() {
                Ok(port) => port,
                Err(e) => {
                    error!(
                        tenant,
                        allocated = state.ports.len(),
                        capacity = state.ports.capacity(),
                        "Port range exhausted, cannot start editor"
                    );
                    return Err(e);
                }
            }
        };

        let instance = Arc::new(if tenant == ASSETS_TENANT {
            Instance::for_assets(port, &self.settings)
        } else {
            Instance::for_tenant(tenant, port, &self.settings)
        });

        if let Err(e) = instance.start(&self.settings).await {
            // start() has already torn the child down
            self.state.lock().ports.release(port);
            error!(tenant, port, error = %e, "Failed to start editor");
            return Err(e);
        }

        self.state
            .lock()
            .instances
            .insert(tenant.to_string(), Arc::clone(&instance));
        info!(tenant, port, "Editor registered");

        Ok(instance)
    }

    /// Stop and deregister a tenant's instance. Returns false when there was
    /// nothing to remove.
    pub async fn remove(&self, tenant: &str) -> bool {
        let instance = self.state.lock().instances.remove(tenant);
        match instance {
            Some(instance) => {
                self.teardown(&instance).await;
                info!(tenant, "Editor removed");
                true
            }
            None => false,
        }
    }

    /// Make sure the shared-assets instance exists and is alive. Returns
    /// true when it had to be (re)started.
    pub async fn ensure_assets(&self) -> Result<bool, BullpenError> {
        if self.get_live(ASSETS_TENANT).is_some() {
            return Ok(false);
        }
        let result = self.start_assets().await;
        *self.assets_failed_at.lock() = result.is_err().then(Instant::now);
        result.map(|_| true)
    }

    async fn start_assets(&self) -> Result<(), BullpenError> {
        std::fs::create_dir_all(&self.settings.assets_dir).map_err(|source| {
            BullpenError::SpawnFailed {
                tenant: ASSETS_TENANT.to_string(),
                source,
            }
        })?;
        self.get_or_create(ASSETS_TENANT).await?;
        Ok(())
    }

    /// True while a failed start of the shared-assets instance is recent
    /// enough that request handlers should not retry it
    pub fn assets_backing_off(&self) -> bool {
        self.assets_failed_at
            .lock()
            .is_some_and(|failed| failed.elapsed() < ASSETS_RETRY_BACKOFF)
    }

    /// The tenant's instance if it is registered and its process still runs
    pub fn get_live(&self, tenant: &str) -> Option<Arc<Instance>> {
        let state = self.state.lock();
        state
            .instances
            .get(tenant)
            .filter(|instance| instance.is_alive())
            .cloned()
    }

    /// Most recently active live instance other than `exclude`
    pub fn most_recent_live(&self, exclude: &str) -> Option<Arc<Instance>> {
        let state = self.state.lock();
        state
            .instances
            .values()
            .filter(|instance| instance.tenant() != exclude && instance.is_alive())
            .min_by_key(|instance| instance.idle_for())
            .cloned()
    }

    /// Tenants idle for longer than `threshold`, never the assets instance
    pub fn idle_tenants(&self, threshold: Duration) -> Vec<String> {
        let state = self.state.lock();
        state
            .instances
            .values()
            .filter(|instance| !instance.is_assets() && instance.idle_for() > threshold)
            .map(|instance| instance.tenant().to_string())
            .collect()
    }

    pub fn contains(&self, tenant: &str) -> bool {
        self.state.lock().instances.contains_key(tenant)
    }

    pub fn len(&self) -> usize {
        self.state.lock().instances.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Ports currently claimed, ascending
    pub fn allocated_ports(&self) -> Vec<u16> {
        self.state.lock().ports.allocated()
    }

    /// Number of ports in the configured range
    pub fn port_capacity(&self) -> usize {
        self.state.lock().ports.capacity()
    }

    /// Status of every registered instance, sorted by tenant
    pub fn list(&self) -> Vec<InstanceStatus> {
        let state = self.state.lock();
        let mut list: Vec<InstanceStatus> = state
            .instances
            .values()
            .map(|instance| InstanceStatus {
                tenant: instance.tenant().to_string(),
                port: instance.port(),
                root: instance.root().to_string(),
                content_dir: instance.content_dir().to_path_buf(),
                pid: instance.pid(),
                alive: instance.is_alive(),
                idle_secs: instance.idle_for().as_secs(),
                uptime_secs: instance.uptime().as_secs(),
                assets: instance.is_assets(),
            })
            .collect();
        list.sort_by(|a, b| a.tenant.cmp(&b.tenant));
        list
    }

    /// Stop every instance (graceful shutdown)
    pub async fn stop_all(&self) {
        let instances: Vec<Arc<Instance>> = {
            let mut state = self.state.lock();
            state.instances.drain().map(|(_, instance)| instance).collect()
        };
        for instance in instances {
            self.teardown(&instance).await;
        }
    }

    fn creation_lock(&self, tenant: &str) -> Arc<tokio::sync::Mutex<()>> {
        self.creation_locks
            .entry(tenant.to_string())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone()
    }

    /// Stop a deregistered instance, then give its port back. The port is
    /// only released once the process is gone.
    async fn teardown(&self, instance: &Instance) {
        instance.stop().await;
        let released = self.state.lock().ports.release(instance.port());
        debug!(
            tenant = instance.tenant(),
            port = instance.port(),
            released,
            "Instance torn down"
        );
    }

    #[cfg(test)]
    pub(crate) fn instance(&self, tenant: &str) -> Option<Arc<Instance>> {
        self.state.lock().instances.get(tenant).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn garden(tenants: &[&str]) -> TempDir {
        let dir = TempDir::new().unwrap();
        for tenant in tenants {
            std::fs::create_dir(dir.path().join(tenant)).unwrap();
        }
        dir
    }

    fn settings(root: &TempDir, command: &str, start: u16, end: u16) -> InstanceSettings {
        let mut settings = InstanceSettings::new(root.path(), command)
            .with_port_range(start, end)
            .with_assets_dir(root.path().join("_scratch"));
        settings.startup_retries = 3;
        settings.startup_poll_interval_ms = 20;
        settings.shutdown_grace_period_secs = 1;
        settings
    }

    #[test]
    fn test_content_dir_resolution() {
        let root = garden(&["alice"]);
        let registry = InstanceRegistry::new(settings(&root, "true", 23000, 23010));

        assert_eq!(
            registry.content_dir("alice").unwrap(),
            root.path().join("alice")
        );
        assert!(matches!(
            registry.content_dir("bob"),
            Err(BullpenError::TenantNotFound(_))
        ));
        assert!(matches!(
            registry.content_dir("../alice"),
            Err(BullpenError::InvalidTenant(_))
        ));
        assert_eq!(
            registry.content_dir(ASSETS_TENANT).unwrap(),
            root.path().join("_scratch")
        );
    }

    #[tokio::test]
    async fn test_missing_tenant_allocates_nothing() {
        let root = garden(&[]);
        let registry = InstanceRegistry::new(settings(&root, "true", 23010, 23020));

        let err = registry.get_or_create("missinguser").await.unwrap_err();
        assert!(matches!(err, BullpenError::TenantNotFound(_)));
        assert!(registry.is_empty());
        assert!(registry.allocated_ports().is_empty());
    }

    #[tokio::test]
    async fn test_startup_failure_releases_port() {
        let root = garden(&["alice"]);
        let registry = InstanceRegistry::new(settings(&root, "true", 23020, 23030));

        let err = registry.get_or_create("alice").await.unwrap_err();
        assert!(matches!(err, BullpenError::StartupTimeout { .. }));
        assert!(!registry.contains("alice"));
        assert!(registry.allocated_ports().is_empty());
    }

    #[tokio::test]
    async fn test_spawn_failure_releases_port() {
        let root = garden(&["alice"]);
        let registry =
            InstanceRegistry::new(settings(&root, "/nonexistent/bullpen-editor", 23030, 23040));

        let err = registry.get_or_create("alice").await.unwrap_err();
        assert!(matches!(err, BullpenError::SpawnFailed { .. }));
        assert!(registry.allocated_ports().is_empty());
    }

    #[tokio::test]
    async fn test_exhausted_range_registers_nothing() {
        let root = garden(&["alice"]);
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let registry = InstanceRegistry::new(settings(
            &root,
            "true",
            port,
            port.saturating_add(1),
        ));

        let err = registry.get_or_create("alice").await.unwrap_err();
        assert!(matches!(err, BullpenError::ResourceExhausted { .. }));
        assert!(registry.is_empty());
        assert!(registry.allocated_ports().is_empty());
    }

    #[tokio::test]
    async fn test_failed_assets_start_backs_off() {
        let root = garden(&[]);
        let blocker = root.path().join("not-a-dir");
        std::fs::write(&blocker, b"").unwrap();
        let settings =
            settings(&root, "true", 23060, 23070).with_assets_dir(blocker.join("scratch"));
        let registry = InstanceRegistry::new(settings);

        assert!(!registry.assets_backing_off());
        assert!(registry.ensure_assets().await.is_err());
        assert!(registry.assets_backing_off());
        assert!(registry.allocated_ports().is_empty());

        // The reaper's retry still goes through and keeps the backoff fresh
        assert!(registry.ensure_assets().await.is_err());
        assert!(registry.assets_backing_off());
    }

    #[tokio::test]
    async fn test_remove_unknown_tenant_is_noop() {
        let root = garden(&["alice"]);
        let registry = InstanceRegistry::new(settings(&root, "true", 23040, 23050));

        assert!(!registry.remove("alice").await);
        assert!(!registry.remove("alice").await);
    }

    #[test]
    fn test_idle_tenants_empty_registry() {
        let root = garden(&[]);
        let registry = InstanceRegistry::new(settings(&root, "true", 23050, 23060));

        assert!(registry.idle_tenants(Duration::ZERO).is_empty());
        assert!(registry.most_recent_live(ASSETS_TENANT).is_none());
        assert!(registry.list().is_empty());
        assert_eq!(registry.port_capacity(), 10);
    }
}
