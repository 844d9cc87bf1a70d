use std::time::Duration;

use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Bound on the authenticated/unauthenticated marker race.
    pub probe_timeout_ms: u64,
    /// One confirmation iteration waits at most this long for progress.
    pub poll_timeout_ms: u64,
    pub poll_interval_ms: u64,
    /// Whole confirmation loop, from the first prompt to authenticated UI.
    pub login_deadline_ms: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            probe_timeout_ms: 30_000,
            poll_timeout_ms: 20_000,
            poll_interval_ms: 1_000,
            login_deadline_ms: 300_000,
        }
    }
}

impl SessionConfig {
    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms)
    }

    pub fn poll_timeout(&self) -> Duration {
        Duration::from_millis(self.poll_timeout_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(1))
    }

    pub fn login_deadline(&self) -> Duration {
        Duration::from_millis(self.login_deadline_ms)
    }
}
