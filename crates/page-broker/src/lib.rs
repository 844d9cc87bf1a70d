//! Browser context ownership and the keyed page broker.
//!
//! The broker owns the single browser context and hands out one page per
//! logical key. Callers never create tabs directly.

pub mod broker;
pub mod chromium;
pub mod config;
pub mod driver;
#[cfg(any(test, feature = "testing"))]
pub mod memory;

pub use broker::{BrokerError, ContextState, PageBroker};
pub use chromium::ChromiumContext;
pub use config::BrowserSettings;
pub use driver::{BrowserContext, PageDriver, PageError, PageHandle};
