use serde::Deserialize;
use wschamber_core::error::{RelayError, Result};

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RelayConfig {
    #[serde(default = "default_version")]
    pub version: u32,

    /// Listen address, `host:port`.
    #[serde(default = "default_listen")]
    pub listen: String,

    /// Allowed `Origin` values. Empty list = allow any.
    #[serde(default)]
    pub permitted_origins: Vec<String>,

    /// Chamber families, tested in order against the request path.
    #[serde(default = "default_families")]
    pub families: Vec<FamilyConfig>,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            version: default_version(),
            listen: default_listen(),
            permitted_origins: Vec::new(),
            families: default_families(),
        }
    }
}

impl RelayConfig {
    pub fn validate(&self) -> Result<()> {
        if self.version != 1 {
            return Err(RelayError::BadRequest(format!(
                "unsupported config version: {}",
                self.version
            )));
        }
        if self.listen.parse::<std::net::SocketAddr>().is_err() {
            return Err(RelayError::BadRequest(format!(
                "listen must be a socket address: {}",
                self.listen
            )));
        }
        if self.families.is_empty() {
            return Err(RelayError::BadRequest("families must not be empty".into()));
        }

        {
            use std::collections::HashSet;
            let mut seen = HashSet::new();
            for f in &self.families {
                f.validate()?;
                if !seen.insert(f.base_url.clone()) {
                    return Err(RelayError::BadRequest(format!(
                        "duplicate family base_url: {}",
                        f.base_url
                    )));
                }
            }
        }
        Ok(())
    }

    /// Rewrite the port component of `listen` (CLI override).
    pub fn set_port(&mut self, port: u16) {
        let host = self
            .listen
            .rsplit_once(':')
            .map(|(h, _)| h)
            .unwrap_or("0.0.0.0");
        self.listen = format!("{host}:{port}");
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(deny_unknown_fields)]
pub struct FamilyConfig {
    /// Path prefix this family claims. First matching family wins, so more
    /// specific prefixes must be listed first.
    pub base_url: String,

    #[serde(default = "default_max_chambers")]
    pub max_chambers: usize,

    #[serde(default = "default_max_connections")]
    pub max_connections: usize,

    /// Cross-sender queue caps per receiver. Zero disables queueing: a
    /// frame that cannot be sent immediately truncates the queued message.
    #[serde(default = "default_max_queue_items")]
    pub max_queue_items: usize,

    #[serde(default = "default_max_queue_data")]
    pub max_queue_data: usize,

    #[serde(default = "default_headers_max_length")]
    pub headers_max_length: usize,
}

impl FamilyConfig {
    pub fn validate(&self) -> Result<()> {
        if !self.base_url.starts_with('/') {
            return Err(RelayError::BadRequest(format!(
                "family base_url must start with '/': {}",
                self.base_url
            )));
        }
        if self.max_chambers == 0 {
            return Err(RelayError::BadRequest(
                "family max_chambers must be at least 1".into(),
            ));
        }
        if self.max_connections == 0 {
            return Err(RelayError::BadRequest(
                "family max_connections must be at least 1".into(),
            ));
        }
        if !(16..=65536).contains(&self.headers_max_length) {
            return Err(RelayError::BadRequest(
                "family headers_max_length must be between 16 and 65536".into(),
            ));
        }
        Ok(())
    }
}

fn default_version() -> u32 {
    1
}

fn default_listen() -> String {
    "0.0.0.0:8080".into()
}

/// Two built-in families: `/2` caps chambers at two peers (no cross-sender
/// queueing is ever needed there), `/` is the open family. `/2` comes
/// first so the more specific prefix wins the first-match dispatch.
fn default_families() -> Vec<FamilyConfig> {
    vec![
        FamilyConfig {
            base_url: "/2".into(),
            max_chambers: default_max_chambers(),
            max_connections: 2,
            max_queue_items: 0,
            max_queue_data: 0,
            headers_max_length: default_headers_max_length(),
        },
        FamilyConfig {
            base_url: "/".into(),
            max_chambers: default_max_chambers(),
            max_connections: default_max_connections(),
            max_queue_items: default_max_queue_items(),
            max_queue_data: default_max_queue_data(),
            headers_max_length: default_headers_max_length(),
        },
    ]
}

fn default_max_chambers() -> usize {
    256
}

fn default_max_connections() -> usize {
    64
}

fn default_max_queue_items() -> usize {
    64
}

fn default_max_queue_data() -> usize {
    1024 * 1024
}

fn default_headers_max_length() -> usize {
    512
}
