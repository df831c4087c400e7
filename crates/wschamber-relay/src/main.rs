//! wschamber relay server.
//!
//! Usage: `server [<port> [<origins>]]`
//! - `port` defaults to 8080
//! - `origins` is comma-separated; empty allows any origin
//!
//! An optional `wschamber.yaml` beside the binary provides the full config
//! (families, limits); CLI arguments override the port and origin list.

use std::path::Path;
use std::sync::Arc;

use tracing_subscriber::{fmt, EnvFilter};

use wschamber_relay::config;
use wschamber_relay::obs::RelayMetrics;
use wschamber_relay::relay::ChamberDirectory;
use wschamber_relay::transport::{Listener, UpgradeHandler};

const CONFIG_FILE: &str = "wschamber.yaml";

#[tokio::main]
async fn main() {
    fmt().with_env_filter(EnvFilter::from_default_env()).init();

    let mut cfg = if Path::new(CONFIG_FILE).exists() {
        config::load_from_file(CONFIG_FILE).expect("config load failed")
    } else {
        config::RelayConfig::default()
    };

    let args: Vec<String> = std::env::args().skip(1).collect();
    config::apply_cli_overrides(&mut cfg, &args).expect("invalid arguments");
    cfg.validate().expect("invalid config");

    let metrics = Arc::new(RelayMetrics::new());
    let origins = Arc::new(cfg.permitted_origins.clone());

    // Families are tested in config order; the first match wins.
    let handlers: Vec<Arc<dyn UpgradeHandler>> = cfg
        .families
        .iter()
        .map(|f| {
            Arc::new(ChamberDirectory::new(f, Arc::clone(&origins), Arc::clone(&metrics)))
                as Arc<dyn UpgradeHandler>
        })
        .collect();

    let socket = tokio::net::TcpListener::bind(&cfg.listen)
        .await
        .expect("failed to bind");
    tracing::info!(
        listen = %cfg.listen,
        families = cfg.families.len(),
        origins = cfg.permitted_origins.len(),
        "wschamber relay starting"
    );

    let listener = Listener::new(handlers, metrics);
    listener
        .run(socket, async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await;
}
