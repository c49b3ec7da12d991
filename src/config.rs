use std::{
    fs, io,
    path::{Path, PathBuf},
};

use serde::{Deserialize, Serialize};

use crate::{host::HostConfig, ledger::Amount};

pub const DEFAULT_STATE_PATH: &str = "market-state.json";
pub const DEFAULT_LISTEN: &str = "127.0.0.1:7545";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("config file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("config file {path} is not valid: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

/// Runtime settings. Every field has a default so a config file may name
/// only what it changes.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct Config {
    pub state_path: PathBuf,
    pub listen: String,
    pub rpc: Option<String>,
    pub rpc_timeout_ms: u64,
    pub tx_fee: Amount,
    pub log: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            state_path: PathBuf::from(DEFAULT_STATE_PATH),
            listen: DEFAULT_LISTEN.to_string(),
            rpc: None,
            rpc_timeout_ms: 5_000,
            tx_fee: 0,
            log: "info".to_string(),
        }
    }
}

/// Values given on the command line or through the environment.
#[derive(Clone, Debug, Default)]
pub struct Overrides {
    pub state_path: Option<PathBuf>,
    pub listen: Option<String>,
    pub rpc: Option<String>,
    pub tx_fee: Option<Amount>,
    pub log: Option<String>,
}

impl Config {
    /// Reads `path` when given (it must exist), otherwise starts from
    /// defaults.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let Some(path) = path else {
            return Ok(Self::default());
        };
        let bytes = fs::read(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        serde_json::from_slice(&bytes).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn apply(mut self, overrides: Overrides) -> Self {
        if let Some(v) = overrides.state_path {
            self.state_path = v;
        }
        if let Some(v) = overrides.listen {
            self.listen = v;
        }
        if overrides.rpc.is_some() {
            self.rpc = overrides.rpc;
        }
        if let Some(v) = overrides.tx_fee {
            self.tx_fee = v;
        }
        if let Some(v) = overrides.log {
            self.log = v;
        }
        self
    }

    pub fn host_config(&self) -> HostConfig {
        HostConfig {
            tx_fee: self.tx_fee,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_file_keeps_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("market.json");
        fs::write(&path, br#"{ "tx_fee": 21, "listen": "0.0.0.0:9000" }"#).unwrap();

        let config = Config::load(Some(path.as_path())).unwrap();
        assert_eq!(config.tx_fee, 21);
        assert_eq!(config.listen, "0.0.0.0:9000");
        assert_eq!(config.state_path, PathBuf::from(DEFAULT_STATE_PATH));
        assert_eq!(config.rpc, None);
        assert_eq!(config.host_config().tx_fee, 21);
    }

    #[test]
    fn named_file_must_exist() {
        let dir = tempfile::tempdir().unwrap();
        let err = Config::load(Some(dir.path().join("missing.json").as_path())).unwrap_err();
        assert!(matches!(err, ConfigError::Io { .. }));
        assert_eq!(Config::load(None).unwrap(), Config::default());
    }

    #[test]
    fn overrides_win_over_file() {
        let config = Config {
            tx_fee: 5,
            rpc: Some("10.0.0.1:7545".into()),
            ..Config::default()
        }
        .apply(Overrides {
            tx_fee: Some(7),
            state_path: Some("other.json".into()),
            ..Overrides::default()
        });
        assert_eq!(config.tx_fee, 7);
        assert_eq!(config.state_path, PathBuf::from("other.json"));
        assert_eq!(config.rpc.as_deref(), Some("10.0.0.1:7545"));
    }
}
