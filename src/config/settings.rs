use std::path::Path;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};

/// Top-level configuration file (config.toml)
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(deny_unknown_fields)]
pub struct Settings {
    #[serde(default)]
    pub spawner: SpawnerConfig,
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub client: ClientConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SpawnerConfig {
    #[serde(default = "default_bind")]
    pub bind: String,
    #[serde(default = "default_spawner_port")]
    pub port: u16,
    #[serde(default = "default_port_range_start")]
    pub port_range_start: u16,
    #[serde(default = "default_port_range_end")]
    pub port_range_end: u16,
    /// How often instances with a dropped control connection are reaped
    #[serde(default = "default_spawner_sweep")]
    pub sweep_interval_ms: u64,
}

impl SpawnerConfig {
    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms)
    }
}

impl Default for SpawnerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            port: default_spawner_port(),
            port_range_start: default_port_range_start(),
            port_range_end: default_port_range_end(),
            sweep_interval_ms: default_spawner_sweep(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ServerConfig {
    #[serde(default = "default_bind")]
    pub bind: String,
    /// Sessions without client activity for longer than this are destroyed
    #[serde(default = "default_idle_timeout")]
    pub idle_timeout_secs: u64,
    #[serde(default = "default_server_sweep")]
    pub sweep_interval_ms: u64,
    /// Overrides the login shell from the user database
    pub shell: Option<String>,
    #[serde(default = "default_term")]
    pub term: String,
}

impl ServerConfig {
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms)
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            idle_timeout_secs: default_idle_timeout(),
            sweep_interval_ms: default_server_sweep(),
            shell: None,
            term: default_term(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ClientConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_spawner_port")]
    pub spawner_port: u16,
    #[serde(default = "default_title_poll")]
    pub title_poll_ms: u64,
    #[serde(default = "default_heartbeat")]
    pub heartbeat_ms: u64,
    /// How long to keep retrying the data socket of a freshly launched server
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_ms: u64,
}

impl ClientConfig {
    pub fn title_poll(&self) -> Duration {
        Duration::from_millis(self.title_poll_ms)
    }

    pub fn heartbeat(&self) -> Duration {
        Duration::from_millis(self.heartbeat_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            spawner_port: default_spawner_port(),
            title_poll_ms: default_title_poll(),
            heartbeat_ms: default_heartbeat(),
            connect_timeout_ms: default_connect_timeout(),
        }
    }
}

fn default_bind() -> String {
    "0.0.0.0".to_string()
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_spawner_port() -> u16 {
    26489
}

fn default_port_range_start() -> u16 {
    26490
}

fn default_port_range_end() -> u16 {
    26999
}

fn default_spawner_sweep() -> u64 {
    5000
}

fn default_idle_timeout() -> u64 {
    60
}

fn default_server_sweep() -> u64 {
    1000
}

fn default_term() -> String {
    "xterm-256color".to_string()
}

fn default_title_poll() -> u64 {
    1000
}

fn default_heartbeat() -> u64 {
    20_000
}

fn default_connect_timeout() -> u64 {
    2500
}

impl Settings {
    /// Parse settings from a TOML string
    pub fn parse(content: &str) -> Result<Self> {
        let settings: Settings = toml::from_str(content).context("Failed to parse config")?;
        Ok(settings)
    }

    /// Load settings from a file path
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        Self::parse(&content)
    }

    /// Resolve settings: the given file, which must exist, or else the global
    /// config file when present, or else defaults. Always validated.
    pub fn resolve(path: Option<&str>) -> Result<Self> {
        let settings = match path {
            Some(p) => {
                let expanded = shellexpand::tilde(p);
                let path = Path::new(expanded.as_ref());
                if !path.exists() {
                    bail!("Config file not found: {}", path.display());
                }
                Self::load(path)?
            }
            None => {
                let global = super::global_config_path()?;
                if global.exists() {
                    Self::load(&global)?
                } else {
                    Settings::default()
                }
            }
        };
        settings.validate()?;
        Ok(settings)
    }

    /// Validate settings, returning errors for invalid configuration
    pub fn validate(&self) -> Result<()> {
        if self.spawner.port_range_start > self.spawner.port_range_end {
            bail!(
                "spawner.port_range_start ({}) must not exceed spawner.port_range_end ({})",
                self.spawner.port_range_start,
                self.spawner.port_range_end
            );
        }
        if self.spawner.port_range_start == 0 {
            bail!("spawner.port_range_start must be a non-zero port");
        }
        if self.server.idle_timeout_secs == 0 {
            bail!("server.idle_timeout_secs must be greater than zero");
        }
        if self.spawner.sweep_interval_ms == 0
            || self.server.sweep_interval_ms == 0
            || self.client.title_poll_ms == 0
            || self.client.heartbeat_ms == 0
        {
            bail!("sweep, poll and heartbeat intervals must be greater than zero");
        }
        Ok(())
    }
}
