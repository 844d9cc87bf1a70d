use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::signal;
use tracing::info;

use page_broker::PageBroker;
use pagepilot::{AppConfig, AppContext, LoggingSink};

pub async fn cmd_run(config: AppConfig) -> Result<()> {
    info!(
        profile = %config.browser.profile_dir.display(),
        headless = config.browser.headless,
        "launching browser"
    );
    let broker = PageBroker::launch(config.browser.clone());
    let context = AppContext::new(config, broker);
    context.start(Arc::new(LoggingSink)).await?;

    info!("PagePilot running; press Ctrl-C to stop");
    context
        .run_until(async {
            signal::ctrl_c()
                .await
                .context("Failed to listen for Ctrl-C")
        })
        .await
}
