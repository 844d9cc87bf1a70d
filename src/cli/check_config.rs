use anyhow::{Context, Result};

use pagepilot::automations::BUILTIN;
use pagepilot::LoadedConfig;

pub fn cmd_check_config(loaded: &LoadedConfig) -> Result<()> {
    let source = if loaded.from_file {
        "file"
    } else {
        "defaults, file not found"
    };
    println!("Configuration ({}, {source}):", loaded.path.display());
    println!(
        "{}",
        loaded
            .config
            .to_yaml()
            .context("Failed to render configuration")?
    );

    let config = &loaded.config;
    let enabled = |name: &str| match name {
        "whatsapp" => config.whatsapp.enabled,
        "declaraguate" => config.declaraguate.enabled,
        _ => false,
    };
    println!("Automations:");
    for (name, _) in BUILTIN {
        let state = if enabled(*name) { "enabled" } else { "disabled" };
        println!("  {name}: {state}");
    }
    match config.browser.resolve_executable() {
        Some(path) => println!("Browser: {}", path.display()),
        None => println!("Browser: not found (set browser.executable or PAGEPILOT_CHROME)"),
    }
    Ok(())
}
