use sidecar_harness::config::HarnessConfig;
use sidecar_harness::process::Role;
use sidecar_harness::setup::TestSetup;
use sidecar_harness::{PKG_NAME, VERSION};
use std::path::PathBuf;
use tracing::{error, info};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("sidecar_harness=debug".parse()?),
        )
        .init();

    // Configuration file is optional; defaults plus environment otherwise
    let config = match std::env::args().nth(1).map(PathBuf::from) {
        Some(path) => {
            let config = HarnessConfig::load(&path).map_err(|e| {
                error!(path = %path.display(), error = %e, "Failed to load configuration");
                e
            })?;
            info!(path = %path.display(), "Configuration loaded");
            config
        }
        None => {
            let mut config = HarnessConfig::default();
            config.apply_env();
            config.validate()?;
            config
        }
    };

    print_startup_banner(&config);

    let setup = TestSetup::new(config);
    let outcome = setup
        .run(|ctx| async move {
            for (role, poller) in [(Role::Client, ctx.client()), (Role::Server, ctx.server())] {
                let stats = poller.fetch_stats().await?;
                info!(%role, admin_port = poller.admin().port(), stats = stats.len(), "Proxy stats fetched");
            }
            Ok(())
        })
        .await?;

    info!(
        scenario = %outcome.id,
        ports = %outcome.ports,
        killed = ?outcome.killed(),
        teardown_errors = outcome.teardown_errors.len(),
        "Smoke scenario finished"
    );

    if !outcome.is_clean() {
        anyhow::bail!("smoke scenario did not shut down cleanly");
    }
    Ok(())
}

fn print_startup_banner(config: &HarnessConfig) {
    info!(name = PKG_NAME, version = VERSION, "Starting smoke scenario");
    info!(
        binary = %config.proxy.binary_path().display(),
        log_level = %config.proxy.log_level,
        hot_restart = !config.proxy.disable_hot_restart,
        stress = config.proxy.stress,
        "Proxy settings"
    );
    info!(
        port_base = config.ports.base,
        block_size = config.ports.block_size,
        poll_interval_ms = config.timing.poll_interval_ms,
        poll_budget_ms = config.timing.poll_budget_ms,
        stop_grace_ms = config.timing.stop_grace_ms,
        "Timing and ports"
    );
}
