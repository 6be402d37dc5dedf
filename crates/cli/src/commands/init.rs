//! `meshtalk init`: Write a default config file.

use std::path::{Path, PathBuf};

use meshtalk_config::AppConfig;

pub fn run(path: Option<PathBuf>, force: bool) -> Result<(), Box<dyn std::error::Error>> {
    let path = path.unwrap_or_else(|| AppConfig::config_dir().join("config.toml"));
    if write_default(&path, force)? {
        println!("✅ Wrote {}", path.display());
        println!("   Set `model` there (or MESHTALK_MODEL) before chatting.");
    } else {
        println!("  Config already exists at {} (use --force to overwrite)", path.display());
    }
    Ok(())
}

/// Returns false when the file exists and `force` is not set.
fn write_default(path: &Path, force: bool) -> std::io::Result<bool> {
    if path.exists() && !force {
        return Ok(false);
    }
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, AppConfig::default_toml())?;
    Ok(true)
}
