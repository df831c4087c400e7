//! Relay config loader (strict parsing) and CLI overrides.

pub mod schema;

use std::fs;

use wschamber_core::error::{RelayError, Result};

pub use schema::{FamilyConfig, RelayConfig};

pub fn load_from_file(path: &str) -> Result<RelayConfig> {
    let s = fs::read_to_string(path)
        .map_err(|e| RelayError::Internal(format!("read config failed: {e}")))?;
    load_from_str(&s)
}

pub fn load_from_str(s: &str) -> Result<RelayConfig> {
    let cfg: RelayConfig = serde_yaml::from_str(s)
        .map_err(|e| RelayError::BadRequest(format!("invalid yaml: {e}")))?;
    cfg.validate()?;
    Ok(cfg)
}

/// Apply `server [<port> [<origins>]]` overrides on top of the loaded
/// config. `origins` is comma-separated; an empty string allows any origin.
pub fn apply_cli_overrides(cfg: &mut RelayConfig, args: &[String]) -> Result<()> {
    if let Some(port) = args.first() {
        let port: u16 = port
            .parse()
            .map_err(|_| RelayError::BadRequest(format!("invalid port: {port}")))?;
        cfg.set_port(port);
    }
    if let Some(origins) = args.get(1) {
        cfg.permitted_origins = origins
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect();
    }
    if args.len() > 2 {
        return Err(RelayError::BadRequest(
            "usage: server [<port> [<origins>]]".into(),
        ));
    }
    Ok(())
}
