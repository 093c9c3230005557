//! Background eviction of idle editor instances

use crate::registry::InstanceRegistry;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info};

/// What one reaper cycle did
#[derive(Debug, Default)]
pub struct ReapReport {
    /// Tenants stopped for being idle
    pub evicted: Vec<String>,
    /// Whether the shared-assets instance had to be (re)started
    pub assets_restarted: bool,
    /// Why the shared-assets instance could not be started, if it failed
    pub assets_error: Option<String>,
}

/// Periodically evicts idle instances and keeps the shared-assets instance up
pub struct Reaper {
    registry: Arc<InstanceRegistry>,
    interval: Duration,
    idle_timeout: Duration,
}

impl Reaper {
    pub fn new(registry: Arc<InstanceRegistry>, interval: Duration, idle_timeout: Duration) -> Self {
        Self {
            registry,
            interval,
            idle_timeout,
        }
    }

    /// Reaper configured from the registry's instance settings
    pub fn from_settings(registry: Arc<InstanceRegistry>) -> Self {
        let interval = registry.settings().reap_interval();
        let idle_timeout = registry.settings().idle_timeout();
        Self::new(registry, interval, idle_timeout)
    }

    /// Run cycles until the shutdown signal flips to true
    pub async fn run(self, mut shutdown_rx: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick completes immediately; startup already ensured assets
        ticker.tick().await;

        info!(
            interval_secs = self.interval.as_secs(),
            idle_timeout_secs = self.idle_timeout.as_secs(),
            "Idle reaper started"
        );

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.run_cycle().await;
                }
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        debug!("Idle reaper stopping");
                        break;
                    }
                }
            }
        }
    }

    /// One pass: ensure the shared-assets instance, then evict idle tenants.
    /// A failure for one instance never stops the pass.
    pub async fn run_cycle(&self) -> ReapReport {
        let mut report = ReapReport::default();

        match self.registry.ensure_assets().await {
            Ok(restarted) => {
                if restarted {
                    info!("Shared-assets instance (re)started");
                }
                report.assets_restarted = restarted;
            }
            Err(e) => {
                error!(error = %e, "Failed to ensure shared-assets instance");
                report.assets_error = Some(e.to_string());
            }
        }

        for tenant in self.registry.idle_tenants(self.idle_timeout) {
            info!(tenant = %tenant, "Reaping idle instance");
            if self.registry.remove(&tenant).await {
                report.evicted.push(tenant);
            }
        }

        if !report.evicted.is_empty() {
            info!(
                evicted = report.evicted.len(),
                remaining = self.registry.len(),
                "Reaper cycle complete"
            );
        }

        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::InstanceSettings;
    use crate::instance::ASSETS_TENANT;

    #[tokio::test]
    async fn test_assets_failure_does_not_stop_cycle() {
        let root = tempfile::TempDir::new().unwrap();
        let mut settings = InstanceSettings::new(root.path(), "true")
            .with_port_range(23100, 23110)
            .with_assets_dir(root.path().join("_scratch"));
        settings.startup_retries = 2;
        settings.startup_poll_interval_ms = 10;
        let registry = InstanceRegistry::new(settings);

        let reaper = Reaper::new(
            Arc::clone(&registry),
            Duration::from_secs(60),
            Duration::from_secs(600),
        );
        let report = reaper.run_cycle().await;

        assert!(!report.assets_restarted);
        assert!(report.assets_error.is_some());
        assert!(report.evicted.is_empty());
        assert!(!registry.contains(ASSETS_TENANT));
        assert!(registry.allocated_ports().is_empty());
    }

    #[tokio::test]
    async fn test_run_stops_on_shutdown() {
        let root = tempfile::TempDir::new().unwrap();
        let settings = InstanceSettings::new(root.path(), "true").with_port_range(23110, 23120);
        let registry = InstanceRegistry::new(settings);
        let reaper = Reaper::new(registry, Duration::from_secs(3600), Duration::from_secs(600));

        let (tx, rx) = watch::channel(false);
        let handle = tokio::spawn(reaper.run(rx));
        tx.send(true).unwrap();

        tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .expect("reaper should stop")
            .unwrap();
    }
}
