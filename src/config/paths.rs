use std::path::PathBuf;

use anyhow::{Context, Result};

/// Returns the base termbridge directory: ~/.termbridge
pub fn base_dir() -> Result<PathBuf> {
    let home = dirs::home_dir().context("Could not determine home directory")?;
    Ok(home.join(".termbridge"))
}

/// Returns the log directory: ~/.termbridge/logs
pub fn logs_dir() -> Result<PathBuf> {
    Ok(base_dir()?.join("logs"))
}

/// Returns the spawner PID file path: ~/.termbridge/spawner.pid
pub fn spawner_pid_path() -> Result<PathBuf> {
    Ok(base_dir()?.join("spawner.pid"))
}

/// Returns the spawner log path: ~/.termbridge/logs/spawner.log
pub fn spawner_log_path() -> Result<PathBuf> {
    Ok(logs_dir()?.join("spawner.log"))
}

/// Returns the log path of the server bound to `port`: ~/.termbridge/logs/server-<port>.log
pub fn server_log_path(port: u16) -> Result<PathBuf> {
    Ok(logs_dir()?.join(format!("server-{}.log", port)))
}

/// Returns the global config path: ~/.config/termbridge/config.toml
pub fn global_config_path() -> Result<PathBuf> {
    let config = dirs::config_dir().context("Could not determine config directory")?;
    Ok(config.join("termbridge").join("config.toml"))
}

/// Ensures all required directories exist
pub fn ensure_dirs() -> Result<()> {
    let dirs = [base_dir()?, logs_dir()?];
    for dir in &dirs {
        std::fs::create_dir_all(dir)
            .with_context(|| format!("Failed to create directory: {}", dir.display()))?;
    }
    Ok(())
}
