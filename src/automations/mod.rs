//! Automations: one browser page, one login session and a set of host
//! entities each.
//!
//! The registry is an explicit list of factories; adding an automation means
//! adding its factory to [`BUILTIN`].

pub mod declaraguate;
pub mod whatsapp;

use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use tracing::info;

use pagepilot_core_types::{PageKey, PilotEvent};
use pagepilot_event_bus::EventBus;
use pagepilot_scheduler::QueueSet;
use pagepilot_session::Session;

use crate::config::AppConfig;
use crate::entities::Entity;

#[async_trait]
pub trait Automation: Send + Sync {
    fn key(&self) -> &PageKey;

    fn session(&self) -> Arc<Session>;

    fn entities(&self) -> Vec<Arc<dyn Entity>>;

    /// Installs listeners and, when configured, queues the first login.
    async fn start(&self) -> Result<()>;
}

/// Shared services handed to every factory.
#[derive(Clone)]
pub struct AutomationDeps {
    pub config: Arc<AppConfig>,
    pub queues: Arc<QueueSet>,
    pub bus: Arc<dyn EventBus<PilotEvent>>,
}

/// Builds an automation, or `None` when it is disabled in the config.
pub type AutomationFactory = fn(&AutomationDeps) -> Option<Arc<dyn Automation>>;

pub const BUILTIN: &[(&str, AutomationFactory)] = &[
    ("whatsapp", whatsapp::factory),
    ("declaraguate", declaraguate::factory),
];

pub struct AutomationRegistry {
    automations: Vec<Arc<dyn Automation>>,
}

impl AutomationRegistry {
    pub fn build(deps: &AutomationDeps) -> Self {
        Self::from_factories(BUILTIN, deps)
    }

    pub fn from_factories(factories: &[(&str, AutomationFactory)], deps: &AutomationDeps) -> Self {
        let mut automations = Vec::new();
        for (name, factory) in factories {
            match factory(deps) {
                Some(automation) => {
                    info!(automation = name, "automation registered");
                    automations.push(automation);
                }
                None => info!(automation = name, "automation disabled"),
            }
        }
        Self { automations }
    }

    pub fn get(&self, key: &str) -> Option<Arc<dyn Automation>> {
        self.automations
            .iter()
            .find(|automation| automation.key().as_str() == key)
            .cloned()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<dyn Automation>> {
        self.automations.iter()
    }

    pub fn len(&self) -> usize {
        self.automations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.automations.is_empty()
    }
}
