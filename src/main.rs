//! port-relay: managed TCP/UDP port forwarder
//!
//! This is the main entry point for the standalone forwarder.
//!
//! # Usage
//!
//! ```bash
//! # Run with the default configuration path
//! port-relay
//!
//! # Run with a custom configuration
//! port-relay -c /path/to/config.json
//!
//! # Validate a configuration without starting anything
//! port-relay -c config.json --check
//! ```

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use tokio::signal;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use port_relay::config::load_config;
use port_relay::geo::NoGeo;
use port_relay::hub::TelemetryHub;
use port_relay::relay::RelayManager;
use port_relay::store::NoopStore;

/// Command-line arguments
struct Args {
    /// Configuration file path
    config_path: PathBuf,
    /// Check configuration only
    check_config: bool,
}

impl Args {
    fn parse() -> Self {
        let mut args = std::env::args().skip(1);
        let mut config_path = PathBuf::from("/etc/port-relay/config.json");
        let mut check_config = false;

        while let Some(arg) = args.next() {
            match arg.as_str() {
                "-c" | "--config" => {
                    if let Some(path) = args.next() {
                        config_path = PathBuf::from(path);
                    }
                }
                "--check" => {
                    check_config = true;
                }
                "-h" | "--help" => {
                    print_help();
                    std::process::exit(0);
                }
                "-v" | "--version" => {
                    println!("port-relay v{}", port_relay::VERSION);
                    std::process::exit(0);
                }
                _ => {
                    eprintln!("Unknown argument: {}", arg);
                    print_help();
                    std::process::exit(1);
                }
            }
        }

        Self {
            config_path,
            check_config,
        }
    }
}

fn print_help() {
    println!(
        r#"port-relay v{}

Managed TCP/UDP port forwarder with live per-flow telemetry.

USAGE:
    port-relay [OPTIONS]

OPTIONS:
    -c, --config <PATH>    Configuration file [default: /etc/port-relay/config.json]
        --check            Validate the configuration and exit
    -h, --help             Print help
    -v, --version          Print version
"#,
        port_relay::VERSION
    );
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let config = load_config(&args.config_path).map_err(|e| {
        anyhow::anyhow!(
            "Failed to load configuration from {:?}: {}",
            args.config_path,
            e
        )
    })?;

    if args.check_config {
        println!("Configuration OK: {} rules", config.rules.len());
        return Ok(());
    }

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.log.level.clone()));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    info!("port-relay v{} starting", port_relay::VERSION);

    let hub = Arc::new(TelemetryHub::new());
    let manager = Arc::new(RelayManager::new(
        Arc::new(NoopStore),
        Arc::new(NoGeo),
        Arc::clone(&hub) as Arc<dyn port_relay::hub::Broadcaster>,
    ));

    let mut started = 0usize;
    for rule in config.rules.iter().filter(|r| r.enabled) {
        match manager.start(rule).await {
            Ok(()) => started += 1,
            Err(e) => error!(rule = %rule.id, "Failed to start rule: {}", e),
        }
    }
    info!(
        "{}/{} enabled rules started",
        started,
        config.rules.iter().filter(|r| r.enabled).count()
    );

    signal::ctrl_c().await?;
    warn!("Shutdown signal received, stopping all rules");
    manager.stop_all();

    Ok(())
}
