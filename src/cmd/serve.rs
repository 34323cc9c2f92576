//! Control plane server command: `devplane serve`.

use std::path::Path;
use std::sync::Arc;

use anyhow::{Result, bail};
use tracing::info;

use devplane::config::PlaneConfig;
use devplane::orchestrator::ControlPlane;
use devplane::server::{ServerConfig, start_server};

pub struct ServeArgs {
    pub host: Option<String>,
    pub port: Option<u16>,
    pub dev: bool,
}

pub async fn cmd_serve(cwd: &Path, explicit: Option<&Path>, args: ServeArgs) -> Result<()> {
    let (mut config, source) = PlaneConfig::resolve(explicit, cwd)?;
    if let Some(host) = args.host {
        config.server.host = host;
    }
    if let Some(port) = args.port {
        config.server.port = port;
    }
    config.server.dev_mode |= args.dev;

    let errors = config.validate();
    if !errors.is_empty() {
        bail!("Invalid configuration:\n  - {}", errors.join("\n  - "));
    }

    if !config.store.snapshot_path.is_absolute() {
        config.store.snapshot_path = cwd.join(&config.store.snapshot_path);
    }
    info!(
        config = ?source,
        snapshot = %config.store.snapshot_path.display(),
        max_concurrent = config.builds.max_concurrent,
        "Starting control plane"
    );

    let plane = Arc::new(ControlPlane::from_config(&config)?);
    start_server(
        ServerConfig {
            host: config.server.host.clone(),
            port: config.server.port,
            dev_mode: config.server.dev_mode,
            shutdown_grace: config.kill_grace() * 2,
        },
        plane,
    )
    .await
}
