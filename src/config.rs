//! Layered configuration: `devplane.toml`, then `DEVPLANE_*` environment
//! variables, then command-line flags (applied by `main`).

use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::orchestrator::commands::{
    CommandResolver, PackageManagerResolver, ScriptNames, ShellResolver,
};
use crate::orchestrator::hub::HubConfig;
use crate::orchestrator::lifecycle::LifecycleConfig;
use crate::orchestrator::models::ProcessKind;
use crate::orchestrator::queue::QueueConfig;

pub const CONFIG_FILE_NAME: &str = "devplane.toml";
pub const CONFIG_DIR_NAME: &str = ".devplane";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerSection {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_server_port")]
    pub port: u16,
    /// Permissive CORS for a dashboard served from another origin.
    #[serde(default)]
    pub dev_mode: bool,
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_server_port() -> u16 {
    3141
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_server_port(),
            dev_mode: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BuildsSection {
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent: usize,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    /// Seconds between SIGTERM and SIGKILL.
    #[serde(default = "default_kill_grace_secs")]
    pub kill_grace_secs: u64,
}

fn default_max_concurrent() -> usize {
    2
}

fn default_timeout_secs() -> u64 {
    600
}

fn default_kill_grace_secs() -> u64 {
    5
}

impl Default for BuildsSection {
    fn default() -> Self {
        Self {
            max_concurrent: default_max_concurrent(),
            timeout_secs: default_timeout_secs(),
            kill_grace_secs: default_kill_grace_secs(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HubSection {
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
    #[serde(default = "default_heartbeat_interval_secs")]
    pub heartbeat_interval_secs: u64,
}

fn default_max_connections() -> usize {
    100
}

fn default_heartbeat_interval_secs() -> u64 {
    30
}

impl Default for HubSection {
    fn default() -> Self {
        Self {
            max_connections: default_max_connections(),
            heartbeat_interval_secs: default_heartbeat_interval_secs(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PortsSection {
    /// Interface dev-server ports are probed on.
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_base_port")]
    pub base_port: u16,
    #[serde(default = "default_window")]
    pub window: u16,
}

fn default_base_port() -> u16 {
    3000
}

fn default_window() -> u16 {
    100
}

impl Default for PortsSection {
    fn default() -> Self {
        Self {
            host: default_host(),
            base_port: default_base_port(),
            window: default_window(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoreSection {
    #[serde(default = "default_snapshot_path")]
    pub snapshot_path: PathBuf,
    #[serde(default = "default_debounce_ms")]
    pub debounce_ms: u64,
}

fn default_snapshot_path() -> PathBuf {
    PathBuf::from(CONFIG_DIR_NAME).join("projects.json")
}

fn default_debounce_ms() -> u64 {
    500
}

impl Default for StoreSection {
    fn default() -> Self {
        Self {
            snapshot_path: default_snapshot_path(),
            debounce_ms: default_debounce_ms(),
        }
    }
}

/// Command overrides. Shell lines win over package-manager scripts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandsSection {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dev: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub build: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deploy: Option<String>,
    #[serde(default = "default_dev_script")]
    pub dev_script: String,
    #[serde(default = "default_build_script")]
    pub build_script: String,
    #[serde(default = "default_deploy_script")]
    pub deploy_script: String,
}

fn default_dev_script() -> String {
    "dev".to_string()
}

fn default_build_script() -> String {
    "build".to_string()
}

fn default_deploy_script() -> String {
    "deploy".to_string()
}

impl Default for CommandsSection {
    fn default() -> Self {
        Self {
            dev: None,
            build: None,
            deploy: None,
            dev_script: default_dev_script(),
            build_script: default_build_script(),
            deploy_script: default_deploy_script(),
        }
    }
}

impl CommandsSection {
    /// Build the resolver chain: configured shell lines, then scripts.
    pub fn resolver(&self) -> Box<dyn CommandResolver> {
        let scripts = PackageManagerResolver::new(ScriptNames {
            dev: self.dev_script.clone(),
            build: self.build_script.clone(),
            deploy: self.deploy_script.clone(),
        });
        let mut shell = ShellResolver::new();
        for (kind, line) in [
            (ProcessKind::Dev, &self.dev),
            (ProcessKind::Build, &self.build),
            (ProcessKind::Deploy, &self.deploy),
        ] {
            if let Some(line) = line {
                shell = shell.with(kind, line.clone());
            }
        }
        if shell.is_empty() {
            Box::new(scripts)
        } else {
            Box::new(shell.with_fallback(scripts))
        }
    }
}

/// The complete `devplane.toml` structure.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PlaneConfig {
    #[serde(default)]
    pub server: ServerSection,
    #[serde(default)]
    pub builds: BuildsSection,
    #[serde(default)]
    pub hub: HubSection,
    #[serde(default)]
    pub ports: PortsSection,
    #[serde(default)]
    pub store: StoreSection,
    #[serde(default)]
    pub commands: CommandsSection,
}

impl PlaneConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        Self::parse(&content).with_context(|| format!("Invalid config file: {}", path.display()))
    }

    pub fn parse(content: &str) -> Result<Self> {
        toml::from_str(content).context("Failed to parse devplane.toml")
    }

    /// Where to look for a config file when none is given explicitly:
    /// `./.devplane/devplane.toml`, then the user config directory.
    pub fn discover(cwd: &Path) -> Option<PathBuf> {
        let local = cwd.join(CONFIG_DIR_NAME).join(CONFIG_FILE_NAME);
        if local.exists() {
            return Some(local);
        }
        dirs::config_dir()
            .map(|dir| dir.join("devplane").join(CONFIG_FILE_NAME))
            .filter(|path| path.exists())
    }

    /// Load the explicit file, or a discovered one, or defaults; then apply
    /// the process environment.
    pub fn resolve(explicit: Option<&Path>, cwd: &Path) -> Result<(Self, Option<PathBuf>)> {
        let source = match explicit {
            Some(path) => Some(path.to_path_buf()),
            None => Self::discover(cwd),
        };
        let mut config = match source {
            Some(ref path) => Self::load(path)?,
            None => Self::default(),
        };
        config.apply_env(|key| std::env::var(key).ok())?;
        Ok((config, source))
    }

    /// Apply `DEVPLANE_*` overrides read through `lookup`.
    pub fn apply_env<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(host) = lookup("DEVPLANE_HOST") {
            self.server.host = host;
        }
        if let Some(port) = env_number(&lookup, "DEVPLANE_PORT")? {
            self.server.port = port;
        }
        if let Some(max) = env_number(&lookup, "DEVPLANE_MAX_CONCURRENT_BUILDS")? {
            self.builds.max_concurrent = max;
        }
        if let Some(secs) = env_number(&lookup, "DEVPLANE_BUILD_TIMEOUT_SECS")? {
            self.builds.timeout_secs = secs;
        }
        if let Some(max) = env_number(&lookup, "DEVPLANE_MAX_CONNECTIONS")? {
            self.hub.max_connections = max;
        }
        if let Some(port) = env_number(&lookup, "DEVPLANE_BASE_PORT")? {
            self.ports.base_port = port;
        }
        Ok(())
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
        std::fs::write(path, self.to_toml()?)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;
        Ok(())
    }

    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).context("Failed to serialize devplane.toml")
    }

    /// Returns every problem found; empty means valid.
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();
        if self.server.host.parse::<IpAddr>().is_err() {
            errors.push(format!("server.host '{}' is not an IP address", self.server.host));
        }
        if self.ports.host.parse::<IpAddr>().is_err() {
            errors.push(format!("ports.host '{}' is not an IP address", self.ports.host));
        }
        if self.builds.max_concurrent == 0 {
            errors.push("builds.max_concurrent must be at least 1".to_string());
        }
        if self.builds.timeout_secs == 0 {
            errors.push("builds.timeout_secs must be at least 1".to_string());
        }
        if self.hub.max_connections == 0 {
            errors.push("hub.max_connections must be at least 1".to_string());
        }
        if self.hub.heartbeat_interval_secs == 0 {
            errors.push("hub.heartbeat_interval_secs must be at least 1".to_string());
        }
        if self.ports.window == 0 {
            errors.push("ports.window must be at least 1".to_string());
        }
        if u32::from(self.ports.base_port) + u32::from(self.ports.window) > u32::from(u16::MAX) + 1 {
            errors.push(format!(
                "ports.base_port {} + ports.window {} exceeds the port range",
                self.ports.base_port, self.ports.window
            ));
        }
        errors
    }

    pub fn queue_config(&self) -> QueueConfig {
        QueueConfig {
            max_concurrent: self.builds.max_concurrent,
            job_timeout: Duration::from_secs(self.builds.timeout_secs),
            kill_grace: self.kill_grace(),
        }
    }

    pub fn hub_config(&self) -> HubConfig {
        HubConfig {
            max_connections: self.hub.max_connections,
            heartbeat_interval: Duration::from_secs(self.hub.heartbeat_interval_secs),
        }
    }

    pub fn lifecycle_config(&self) -> LifecycleConfig {
        LifecycleConfig {
            base_port: self.ports.base_port,
            port_window: self.ports.window,
            kill_grace: self.kill_grace(),
        }
    }

    pub fn kill_grace(&self) -> Duration {
        Duration::from_secs(self.builds.kill_grace_secs)
    }

    pub fn debounce(&self) -> Duration {
        Duration::from_millis(self.store.debounce_ms)
    }
}

fn env_number<T, F>(lookup: &F, key: &str) -> Result<Option<T>>
where
    T: std::str::FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
    F: Fn(&str) -> Option<String>,
{
    match lookup(key) {
        Some(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .with_context(|| format!("Invalid value for {}: '{}'", key, raw)),
        None => Ok(None),
    }
}
