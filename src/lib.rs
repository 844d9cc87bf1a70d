//! PagePilot library
//!
//! Exposes the composition root, automations and host entities for the
//! binary and integration tests.

pub mod app_context;
pub mod automations;
pub mod config;
pub mod entities;

pub use app_context::AppContext;
pub use automations::{Automation, AutomationDeps, AutomationRegistry};
pub use config::{load_config, AppConfig, LoadedConfig};
pub use entities::{Entity, EntityUpdate, HostSink, LoggingSink};
