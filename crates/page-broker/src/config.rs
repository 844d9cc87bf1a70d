use std::env;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use which::which;

/// Launch settings for the shared browser context.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct BrowserSettings {
    pub executable: Option<PathBuf>,
    pub profile_dir: PathBuf,
    pub headless: bool,
    pub startup_timeout_ms: u64,
    pub window_width: u32,
    pub window_height: u32,
}

impl Default for BrowserSettings {
    fn default() -> Self {
        Self {
            executable: None,
            profile_dir: default_profile_dir(),
            headless: resolve_headless_default(),
            startup_timeout_ms: 60_000,
            window_width: 1280,
            window_height: 900,
        }
    }
}

impl BrowserSettings {
    pub fn startup_timeout(&self) -> Duration {
        Duration::from_millis(self.startup_timeout_ms)
    }

    /// Explicit path, then `PAGEPILOT_CHROME`, then well-known names on `PATH`.
    pub fn resolve_executable(&self) -> Option<PathBuf> {
        self.executable
            .clone()
            .filter(|path| path.exists())
            .or_else(detect_chrome_executable)
    }

    /// Applies `PAGEPILOT_*` environment overrides on top of loaded values.
    pub fn apply_env(&mut self) {
        if let Ok(value) = env::var("PAGEPILOT_HEADLESS") {
            self.headless = parse_flag(&value);
        }
        if let Ok(value) = env::var("PAGEPILOT_PROFILE") {
            let trimmed = value.trim();
            if !trimmed.is_empty() {
                self.profile_dir = PathBuf::from(trimmed);
            }
        }
    }
}

fn parse_flag(value: &str) -> bool {
    let lower = value.trim().to_ascii_lowercase();
    !matches!(lower.as_str(), "0" | "false" | "no" | "off")
}

fn resolve_headless_default() -> bool {
    env::var("PAGEPILOT_HEADLESS")
        .map(|value| parse_flag(&value))
        .unwrap_or(true)
}

fn default_profile_dir() -> PathBuf {
    if let Ok(path) = env::var("PAGEPILOT_PROFILE") {
        return PathBuf::from(path);
    }
    Path::new("./.pagepilot-profile").into()
}

fn detect_chrome_executable() -> Option<PathBuf> {
    if let Ok(raw) = env::var("PAGEPILOT_CHROME") {
        let candidate = PathBuf::from(raw.trim());
        if candidate.exists() {
            return Some(candidate);
        }
    }

    [
        "google-chrome-stable",
        "google-chrome",
        "chromium",
        "chromium-browser",
    ]
    .iter()
    .find_map(|name| which(name).ok())
}
