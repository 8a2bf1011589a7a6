//! Config command implementation.

use std::path::Path;

use anyhow::{Context, Result};

use peersync_core::config::Config;

use super::{ConfigAction, ConfigArgs};

/// Run the config command.
pub fn run(args: &ConfigArgs) -> Result<()> {
    match args.action {
        ConfigAction::Show => {
            let config = Config::load().context("failed to load configuration")?;
            print!("{}", config.to_toml()?);
        }
        ConfigAction::Path => println!("{}", Config::config_path().display()),
        ConfigAction::Init { force } => {
            let path = Config::config_path();
            if init_at(&path, force)? {
                println!("Wrote default configuration to {}", path.display());
            } else {
                println!("Configuration already exists at {}", path.display());
            }
        }
    }
    Ok(())
}

/// Write the default configuration to `path`. An existing file is only
/// replaced with `force`. Returns whether anything was written.
fn init_at(path: &Path, force: bool) -> Result<bool> {
    if path.exists() && !force {
        return Ok(false);
    }
    Config::default()
        .save_to(path)
        .with_context(|| format!("failed to write {}", path.display()))?;
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_init_creates_loadable_defaults() {
        let dir = TempDir::new().expect("tempdir");
        let path = dir.path().join("nested").join("config.toml");

        assert!(init_at(&path, false).expect("init"));

        let loaded = Config::load_from(&path).expect("load");
        assert_eq!(loaded.to_toml().expect("toml"), Config::default().to_toml().expect("toml"));
    }

    #[test]
    fn test_init_keeps_existing_file_unless_forced() {
        let dir = TempDir::new().expect("tempdir");
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "[transfer]\nauto_accept = true\n").expect("write");

        assert!(!init_at(&path, false).expect("init"));
        assert!(Config::load_from(&path).expect("load").transfer.auto_accept);

        assert!(init_at(&path, true).expect("forced init"));
        assert!(!Config::load_from(&path).expect("load").transfer.auto_accept);
    }
}
