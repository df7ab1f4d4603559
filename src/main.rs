use std::process::exit;
use std::sync::Arc;

use clap::Parser;
use consul_alerting::graceful_shutdown;
use consul_alerting::metrics;
use consul_alerting::Agent;
use consul_alerting::ConsulRegistry;
use consul_alerting::HandlerRegistry;
use consul_alerting::Result;
use consul_alerting::Settings;
use tokio::sync::watch;
use tracing::error;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "consul-alerting", version, about = "Health alerting agent for Consul clusters")]
struct Cli {
    /// Path to a TOML configuration file
    #[arg(short, long)]
    config: Option<String>,
}

#[tokio::main(flavor = "multi_thread", worker_threads = 2)]
async fn main() {
    let cli = Cli::parse();

    // Load config
    let settings = match Settings::load(cli.config.as_deref()) {
        Ok(settings) => settings,
        Err(e) => {
            eprintln!("Error loading configuration: {}", e);
            exit(2);
        }
    };

    // Initializing Logs
    init_observability(&settings.agent.log_level);

    if let Err(e) = run(settings).await {
        error!("agent stopped: {}", e);
        exit(1);
    }

    info!("Exiting program.");
}

async fn run(settings: Settings) -> Result<()> {
    let registry = Arc::new(ConsulRegistry::from_settings(&settings)?);
    let handlers = HandlerRegistry::from_config(&settings.handlers)?;

    // Initializing Shutdown Signal
    let (graceful_tx, graceful_rx) = watch::channel(());

    let agent = Agent::new(settings, registry, handlers);
    agent.wait_for_registry().await?;

    let monitoring = agent.settings().monitoring.clone();
    if monitoring.prometheus_enabled {
        let rx = graceful_rx.clone();
        tokio::spawn(async move {
            if let Err(e) = metrics::start_server(monitoring.prometheus_port, rx).await {
                error!("{}", e);
            }
        });
    }

    // Listen on Shutdown Signal
    tokio::spawn(async move {
        if let Err(e) = graceful_shutdown(graceful_tx).await {
            error!("Failed to shutdown: {:?}", e);
        }
    });

    let report = agent.run(graceful_rx).await?;
    info!(
        stopped = report.stopped,
        locks_released = report.locks_released,
        timed_out = report.timed_out.len(),
        "shutdown complete"
    );
    Ok(())
}

/// `RUST_LOG` wins over the configured level. The level was validated when
/// the settings were loaded.
fn init_observability(log_level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(false).init();
}
