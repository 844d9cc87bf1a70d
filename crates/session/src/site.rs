use std::path::PathBuf;

use async_trait::async_trait;

use page_broker::{PageError, PageHandle};

/// How a human confirms a login once the unauthenticated UI is showing.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Confirmation {
    /// A scannable code is rendered on the page and refreshed by the site.
    ScanCode,
    /// A one-time code arrives as a chat message from `sender`.
    MessagedCode { sender: String },
}

/// Site-specific half of a login flow.
#[async_trait]
pub trait LoginSite: Send + Sync {
    fn authenticated_marker(&self) -> &str;

    fn unauthenticated_marker(&self) -> &str;

    fn confirmation(&self) -> Confirmation;

    /// Brings the page to the site before probing.
    async fn open(&self, page: &PageHandle) -> Result<(), PageError>;

    /// Runs once the page is known to be unauthenticated (fill a form, etc).
    async fn prepare(&self, _page: &PageHandle) -> Result<(), PageError> {
        Ok(())
    }

    /// Opaque marker of the currently rendered code; `None` if none is shown.
    async fn artifact_marker(&self, _page: &PageHandle) -> Result<Option<String>, PageError> {
        Ok(None)
    }

    /// Renders the current code to disk and returns where it was written.
    async fn capture_artifact(&self, _page: &PageHandle) -> Result<PathBuf, PageError> {
        Err(PageError::Protocol("site has no scannable code".into()))
    }

    async fn enter_code(&self, _page: &PageHandle, _code: &str) -> Result<(), PageError> {
        Err(PageError::Protocol("site does not accept one-time codes".into()))
    }
}
