use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::Path;

use figment::{
    Figment,
    providers::{Env, Format, Serialized, Toml},
};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::rpc::FaultPolicy;

/// Config file read when no path is given.
pub const DEFAULT_CONFIG_FILE: &str = "jrpcd.toml";

/// Environment variables with this prefix override the file.
pub const ENV_PREFIX: &str = "JRPCD_";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerConfig {
    pub host: IpAddr,
    pub port: u16,
    pub post_path: String,
    pub ws_path: String,
    pub fault_policy: FaultPolicy,
    pub max_body_bytes: usize,
    pub verbose: bool,
    pub json_logs: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: IpAddr::V4(Ipv4Addr::LOCALHOST),
            port: 8197,
            post_path: "/rpc".to_string(),
            ws_path: "/ws".to_string(),
            fault_policy: FaultPolicy::default(),
            max_body_bytes: 2 * 1024 * 1024,
            verbose: false,
            json_logs: false,
        }
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error(transparent)]
    Figment(#[from] Box<figment::Error>),
    #[error("{field} must start with '/', got {value:?}")]
    InvalidPath { field: &'static str, value: String },
    #[error("max_body_bytes must be greater than zero")]
    ZeroBodyLimit,
}

impl ServerConfig {
    /// Layer defaults, the TOML file, `JRPCD_*` variables and `overrides`
    /// (typically parsed CLI flags), later sources winning.
    pub fn load<T: Serialize>(
        path: Option<&Path>,
        overrides: Option<&T>,
    ) -> Result<Self, ConfigError> {
        let file = path.unwrap_or_else(|| Path::new(DEFAULT_CONFIG_FILE));

        let mut figment = Figment::from(Serialized::defaults(ServerConfig::default()))
            .merge(Toml::file(file))
            .merge(Env::prefixed(ENV_PREFIX));

        if let Some(overrides) = overrides {
            figment = figment.merge(Serialized::defaults(overrides));
        }

        let config: ServerConfig = figment.extract().map_err(Box::new)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        for (field, value) in [("post_path", &self.post_path), ("ws_path", &self.ws_path)] {
            if !value.starts_with('/') {
                return Err(ConfigError::InvalidPath {
                    field,
                    value: value.clone(),
                });
            }
        }
        if self.max_body_bytes == 0 {
            return Err(ConfigError::ZeroBodyLimit);
        }
        Ok(())
    }

    pub fn bind_addr(&self) -> SocketAddr {
        SocketAddr::new(self.host, self.port)
    }

    /// Base URL of the POST route.
    pub fn post_url(&self) -> String {
        format!("http://{}{}", self.bind_addr(), self.post_path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[derive(Serialize)]
    struct Overrides {
        #[serde(skip_serializing_if = "Option::is_none")]
        port: Option<u16>,
        #[serde(skip_serializing_if = "Option::is_none")]
        fault_policy: Option<FaultPolicy>,
    }

    fn write_config(contents: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        file
    }

    #[test]
    fn missing_file_yields_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("absent.toml");

        let config = ServerConfig::load::<Overrides>(Some(path.as_path()), None).unwrap();

        assert_eq!(config.port, 8197);
        assert_eq!(config.post_path, "/rpc");
        assert_eq!(config.fault_policy, FaultPolicy::Compatible);
    }

    #[test]
    fn file_then_overrides() {
        let file = write_config(
            r#"
            port = 9000
            ws_path = "/socket"
            fault_policy = "strict"
            "#,
        );

        let config = ServerConfig::load::<Overrides>(Some(file.path()), None).unwrap();
        assert_eq!(config.port, 9000);
        assert_eq!(config.ws_path, "/socket");
        assert_eq!(config.fault_policy, FaultPolicy::Strict);

        let overrides = Overrides {
            port: Some(9100),
            fault_policy: None,
        };
        let config = ServerConfig::load(Some(file.path()), Some(&overrides)).unwrap();
        assert_eq!(config.port, 9100);
        assert_eq!(config.fault_policy, FaultPolicy::Strict);
    }

    #[test]
    fn rejects_relative_paths() {
        let file = write_config(r#"post_path = "rpc""#);

        let err = ServerConfig::load::<Overrides>(Some(file.path()), None).unwrap_err();
        assert!(matches!(
            err,
            ConfigError::InvalidPath {
                field: "post_path",
                ..
            }
        ));
    }

    #[test]
    fn rejects_zero_body_limit() {
        let config = ServerConfig {
            max_body_bytes: 0,
            ..ServerConfig::default()
        };
        assert!(matches!(config.validate(), Err(ConfigError::ZeroBodyLimit)));
    }

    #[test]
    fn urls_follow_bind_address() {
        let config = ServerConfig::default();
        assert_eq!(config.bind_addr().to_string(), "127.0.0.1:8197");
        assert_eq!(config.post_url(), "http://127.0.0.1:8197/rpc");
    }
}
