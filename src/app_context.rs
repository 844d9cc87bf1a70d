//! Composition root: one broker, one queue set, one bus and the registered
//! automations, owned together for the life of the process.

use std::future::Future;
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use tracing::{error, info};

use page_broker::PageBroker;
use pagepilot_core_types::PilotEvent;
use pagepilot_event_bus::{EventBus, InMemoryBus};
use pagepilot_scheduler::{metrics, QueueSet};

use crate::automations::{Automation, AutomationDeps, AutomationRegistry};
use crate::config::AppConfig;
use crate::entities::{Entity, HostSink};

pub struct AppContext {
    config: Arc<AppConfig>,
    broker: Arc<PageBroker>,
    queues: Arc<QueueSet>,
    bus: Arc<dyn EventBus<PilotEvent>>,
    registry: AutomationRegistry,
}

impl AppContext {
    pub fn new(config: AppConfig, broker: Arc<PageBroker>) -> Self {
        let config = Arc::new(config);
        let queues = QueueSet::new(Arc::clone(&broker), config.queue.clone());
        let bus: Arc<dyn EventBus<PilotEvent>> = InMemoryBus::<PilotEvent>::new();
        let deps = AutomationDeps {
            config: Arc::clone(&config),
            queues: Arc::clone(&queues),
            bus: Arc::clone(&bus),
        };
        let registry = AutomationRegistry::build(&deps);
        Self {
            config,
            broker,
            queues,
            bus,
            registry,
        }
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    pub fn broker(&self) -> Arc<PageBroker> {
        Arc::clone(&self.broker)
    }

    pub fn queues(&self) -> Arc<QueueSet> {
        Arc::clone(&self.queues)
    }

    pub fn bus(&self) -> Arc<dyn EventBus<PilotEvent>> {
        Arc::clone(&self.bus)
    }

    pub fn automation(&self, key: &str) -> Option<Arc<dyn Automation>> {
        self.registry.get(key)
    }

    pub fn registry(&self) -> &AutomationRegistry {
        &self.registry
    }

    pub fn entity(&self, entity_id: &str) -> Option<Arc<dyn Entity>> {
        self.registry
            .iter()
            .flat_map(|automation| automation.entities())
            .find(|entity| entity.entity_id() == entity_id)
    }

    /// Adds every entity to the host, then starts the automations.
    pub async fn start(&self, sink: Arc<dyn HostSink>) -> Result<()> {
        for automation in self.registry.iter() {
            for entity in automation.entities() {
                entity.on_added(Arc::clone(&sink)).await;
            }
        }
        for automation in self.registry.iter() {
            automation
                .start()
                .await
                .with_context(|| format!("failed to start automation {}", automation.key()))?;
        }
        info!(automations = self.registry.len(), "PagePilot started");
        Ok(())
    }

    /// Runs until `stop` resolves or the browser context fails, then shuts
    /// down. A failed browser context is returned as an error.
    pub async fn run_until<F>(&self, stop: F) -> Result<()>
    where
        F: Future<Output = Result<()>>,
    {
        let outcome = tokio::select! {
            stopped = stop => stopped,
            fatal = self.broker.wait_fatal() => match fatal {
                Some(reason) => {
                    error!(%reason, "browser context failed");
                    Err(anyhow!("browser context failed: {reason}"))
                }
                None => Ok(()),
            },
        };
        info!("Shutting down");
        self.shutdown().await;
        outcome
    }

    /// Stops accepting commands, drains the workers and closes the browser.
    pub async fn shutdown(&self) {
        self.queues.shutdown_all().await;
        self.broker.shutdown().await;
        let snapshot = metrics::snapshot();
        info!(
            enqueued = snapshot.enqueued,
            completed = snapshot.completed,
            failed = snapshot.failed,
            rejected = snapshot.rejected,
            "PagePilot stopped"
        );
    }
}
