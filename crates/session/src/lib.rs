//! Login status tracking for one automation's page.
//!
//! A login runs as a single command on the page's queue: probe the page,
//! then loop on a human confirmation step (scan a code, or wait for a code
//! delivered as a chat message) until the page shows the authenticated UI.

pub mod config;
pub mod error;
pub mod machine;
pub mod site;

pub use config::SessionConfig;
pub use error::SessionError;
pub use machine::{LoginRequest, Session};
pub use site::{Confirmation, LoginSite};
