use std::net::SocketAddr;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Top-level server configuration.
///
/// Loaded via the `config` crate: a JSON file, if given, layered under
/// environment variables prefixed `SWITCHBOARD__` (double underscore as
/// the nesting separator, e.g. `SWITCHBOARD__HTTP__PORT=9000`). The file
/// takes precedence when both set the same key.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct AppConfig {
    #[serde(default)]
    pub http: HttpConfig,
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub websocket: WebSocketConfig,
}

impl AppConfig {
    pub fn listen_addr(&self) -> eyre::Result<SocketAddr> {
        Ok(format!("{}:{}", self.http.host, self.http.port).parse()?)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_read_timeout")]
    pub read_timeout: u64,
    #[serde(default = "default_write_timeout")]
    pub write_timeout: u64,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            read_timeout: default_read_timeout(),
            write_timeout: default_write_timeout(),
        }
    }
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    8080
}

fn default_read_timeout() -> u64 {
    30
}

fn default_write_timeout() -> u64 {
    5
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    #[serde(default = "default_database_path")]
    pub path: PathBuf,
    #[serde(default = "default_database_timeout")]
    pub timeout: u64,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_database_path(),
            timeout: default_database_timeout(),
        }
    }
}

fn default_database_path() -> PathBuf {
    PathBuf::from("switchboard.sqlite3")
}

fn default_database_timeout() -> u64 {
    5
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebSocketConfig {
    #[serde(default = "default_ping_interval")]
    pub ping_interval: u64,
    #[serde(default = "default_ws_read_timeout")]
    pub read_timeout: u64,
    #[serde(default = "default_ws_write_timeout")]
    pub write_timeout: u64,
    #[serde(default = "default_buffer_size")]
    pub buffer_size: usize,
}

impl Default for WebSocketConfig {
    fn default() -> Self {
        Self {
            ping_interval: default_ping_interval(),
            read_timeout: default_ws_read_timeout(),
            write_timeout: default_ws_write_timeout(),
            buffer_size: default_buffer_size(),
        }
    }
}

fn default_ping_interval() -> u64 {
    30
}

fn default_ws_read_timeout() -> u64 {
    60
}

fn default_ws_write_timeout() -> u64 {
    5
}

fn default_buffer_size() -> usize {
    100
}

/// Loads configuration from an optional JSON file layered under
/// environment variables, falling back to defaults when neither is
/// present.
pub fn load_config(path: Option<&str>) -> eyre::Result<AppConfig> {
    // Environment variables are added first so a later file source
    // overrides them on conflicting keys.
    let mut builder = config::Config::builder()
        .add_source(config::Environment::with_prefix("SWITCHBOARD").separator("__"));

    if let Some(path) = path {
        builder = builder.add_source(config::File::with_name(path));
    }

    let config = builder.build()?.try_deserialize()?;

    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_spec() {
        let cfg = AppConfig::default();
        assert_eq!(cfg.websocket.ping_interval, 30);
        assert_eq!(cfg.websocket.read_timeout, 60);
        assert_eq!(cfg.websocket.write_timeout, 5);
        assert_eq!(cfg.websocket.buffer_size, 100);
    }

    #[test]
    fn env_override_without_file() {
        std::env::set_var("SWITCHBOARD__HTTP__PORT", "9100");
        let cfg = load_config(None).unwrap();
        assert_eq!(cfg.http.port, 9100);
        std::env::remove_var("SWITCHBOARD__HTTP__PORT");
    }
}
