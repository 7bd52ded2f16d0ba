use crate::env;
use crate::server::{ServerOpts, DEFAULT_MAX_PAYLOAD};
use crate::{Error, Result};
use log::debug;
use serde::Deserialize;
use std::fs;
use std::time::Duration;

// This file describes how to parse
// enats.toml files.

pub const DEFAULT_HOST: &'static str = "localhost";
pub const DEFAULT_READY_TIMEOUT_MS: u64 = 60_000;
pub const DEFAULT_CLIENT_NAME: &'static str = "enats";

#[derive(Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct Config {
    // the host the server binds and the client dials
    pub host: String,
    // how long `start` waits for the server to accept connections
    pub ready_timeout_ms: u64,
    // largest PUB payload the server accepts
    pub max_payload: usize,
    // name advertised in the server INFO, defaults to the server id
    pub server_name: Option<String>,
    // connection name the harness client sends in CONNECT
    pub client_name: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: DEFAULT_HOST.to_owned(),
            ready_timeout_ms: DEFAULT_READY_TIMEOUT_MS,
            max_payload: DEFAULT_MAX_PAYLOAD,
            server_name: None,
            client_name: DEFAULT_CLIENT_NAME.to_owned(),
        }
    }
}

impl Config {
    pub fn load(file_path: &dyn AsRef<std::path::Path>) -> Result<Self> {
        let bytes = match fs::read(file_path) {
            Ok(v) => v,
            Err(err) => {
                return Err(Error::Config(format!(
                    "reading {:?}: {}",
                    file_path.as_ref(),
                    err
                )))
            }
        };
        let toml = match String::from_utf8(bytes) {
            Ok(toml) => toml,
            Err(err) => return Err(Error::Config(err.to_string())),
        };
        Self::parse(&toml)
    }

    pub fn parse(toml: &str) -> Result<Self> {
        match toml::from_str(toml) {
            Ok(cfg) => Ok(cfg),
            Err(err) => Err(Error::Config(err.to_string())),
        }
    }

    /// Builds a config from `ENATS_CONFIG` (or the defaults)
    /// and layers the individual `ENATS_*` overrides on top.
    pub fn from_env() -> Result<Self> {
        let mut cfg = match env::enats_config() {
            Some(path) => Self::load(&path)?,
            None => Self::default(),
        };
        if let Some(host) = env::enats_host() {
            cfg.host = host;
        }
        if let Some(ms) = env::enats_ready_timeout_ms()? {
            cfg.ready_timeout_ms = ms;
        }
        if let Some(bytes) = env::enats_max_payload()? {
            cfg.max_payload = bytes;
        }
        if let Some(name) = env::enats_server_name() {
            cfg.server_name = Some(name);
        }
        debug!("enats config from env: {:?}", &cfg);
        Ok(cfg)
    }

    pub fn ready_timeout(&self) -> Duration {
        Duration::from_millis(self.ready_timeout_ms)
    }

    pub(crate) fn server_opts(&self, port: u16) -> ServerOpts {
        ServerOpts {
            host: self.host.clone(),
            port,
            server_name: self.server_name.clone(),
            max_payload: self.max_payload,
            ..ServerOpts::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parser() {
        let toml = r#"
host = "127.0.0.1"
ready_timeout_ms = 5000
max_payload = 2048
server_name = "test-server"
client_name = "test-client""#;
        let config = Config::parse(toml).unwrap();
        assert_eq!(
            config,
            Config {
                host: "127.0.0.1".into(),
                ready_timeout_ms: 5000,
                max_payload: 2048,
                server_name: Some("test-server".into()),
                client_name: "test-client".into(),
            }
        );
        assert_eq!(config.ready_timeout(), Duration::from_secs(5));
    }

    #[test]
    fn test_parser_defaults() {
        let config = Config::parse(r#"ready_timeout_ms = 250"#).unwrap();
        assert_eq!(config.host, DEFAULT_HOST);
        assert_eq!(config.ready_timeout_ms, 250);
        assert_eq!(config.max_payload, DEFAULT_MAX_PAYLOAD);
        assert_eq!(config.server_name, None);
        assert_eq!(config.client_name, DEFAULT_CLIENT_NAME);
    }

    #[test]
    fn test_parser_rejects_bad_types() {
        let err = Config::parse(r#"ready_timeout_ms = "soon""#).unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn test_load_missing_file() {
        let err = Config::load(&"/nonexistent/enats.toml").unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn test_server_opts() {
        let opts = Config::default().server_opts(4333);
        assert_eq!(opts.host, DEFAULT_HOST);
        assert_eq!(opts.port, 4333);
        assert_eq!(opts.max_payload, DEFAULT_MAX_PAYLOAD);
    }
}
