use std::net::IpAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::task::JoinHandle;
use tracing::{info, warn};

use super::commands::CommandResolver;
use super::events::{HubMessage, NotificationLevel};
use super::hub::EventHub;
use super::lifecycle::ProcessManager;
use super::ports::PortAllocator;
use super::progress::ExtractorRegistry;
use super::queue::BuildQueue;
use super::store::{ProjectStore, SnapshotStore};
use crate::config::PlaneConfig;

/// Everything the HTTP layer talks to, wired together.
pub struct ControlPlane {
    pub store: Arc<SnapshotStore>,
    pub hub: Arc<EventHub>,
    pub ports: Arc<PortAllocator>,
    pub queue: BuildQueue,
    pub manager: ProcessManager,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl ControlPlane {
    pub fn new(
        config: &PlaneConfig,
        store: Arc<SnapshotStore>,
        resolver: Arc<dyn CommandResolver>,
    ) -> Result<Self> {
        let port_host: IpAddr = config
            .ports
            .host
            .parse()
            .with_context(|| format!("Invalid ports.host '{}'", config.ports.host))?;
        let hub = Arc::new(EventHub::new(config.hub_config()));
        let ports = Arc::new(PortAllocator::new(port_host));
        let queue = BuildQueue::new(
            config.queue_config(),
            Arc::clone(&hub),
            Arc::clone(&resolver),
            ExtractorRegistry::default(),
        );
        let store_handle: Arc<dyn ProjectStore> = store.clone();
        let manager = ProcessManager::new(
            config.lifecycle_config(),
            store_handle,
            Arc::clone(&hub),
            Arc::clone(&ports),
            queue.clone(),
            resolver,
        );
        Ok(Self {
            store,
            hub,
            ports,
            queue,
            manager,
            tasks: Mutex::new(Vec::new()),
        })
    }

    /// Open the snapshot named in the config and build the plane around it.
    pub fn from_config(config: &PlaneConfig) -> Result<Self> {
        let store = Arc::new(SnapshotStore::load(&config.store.snapshot_path, config.debounce())?);
        let resolver: Arc<dyn CommandResolver> = Arc::from(config.commands.resolver());
        Self::new(config, store, resolver)
    }

    /// Reconcile persisted state and start the heartbeat and snapshot writer.
    pub fn start_background(&self) {
        let report = self.manager.recover();
        if !report.dropped.is_empty() {
            warn!(dropped = ?report.dropped, "Dropped projects whose directories are gone");
        }
        let mut tasks = self.tasks.lock().unwrap_or_else(|e| e.into_inner());
        tasks.push(self.hub.spawn_heartbeat());
        tasks.push(self.store.spawn_writer());
    }

    /// Stop all processes, then persist the final state. The flush happens
    /// after the processes are gone so their last status changes are kept.
    pub async fn shutdown(&self, wait: Duration) -> Result<()> {
        info!("Shutting down control plane");
        self.hub.publish(HubMessage::SystemNotification {
            level: NotificationLevel::Warning,
            message: "Control plane is shutting down".to_string(),
        });
        self.manager.shutdown(wait).await;
        for task in self.tasks.lock().unwrap_or_else(|e| e.into_inner()).drain(..) {
            task.abort();
        }
        self.store
            .flush()
            .await
            .context("Failed to persist project snapshot on shutdown")?;
        Ok(())
    }
}
