use std::{
    fs, io,
    path::{Path, PathBuf},
};

use serde::{Deserialize, Serialize};
use tracing::debug;

pub const DEFAULT_PORT: u16 = 8388;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("The port must be a number, found {0:?}")]
    PortNotNumeric(String),
    #[error("The port must be between 1 and 65535, found {0}")]
    PortOutOfRange(u64),
    #[error("Could not access the config file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("Could not parse the config file {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
    #[error("Could not serialize the config: {0}")]
    Serialize(#[from] toml::ser::Error),
}

#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub port: u16,
    pub auto_start: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: DEFAULT_PORT,
            auto_start: false,
        }
    }
}

impl ServerConfig {
    /// `http://localhost:{port}`, the address other local tools should use.
    pub fn url(&self) -> String {
        format!("http://localhost:{}", self.port)
    }
}

impl Config {
    /// Loads `path`, falling back to the defaults when the file does not exist.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();

        let config: Self = match fs::read_to_string(path) {
            Ok(contents) => toml::from_str(&contents).map_err(|source| ConfigError::Parse {
                path: path.to_path_buf(),
                source,
            })?,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                debug!(path = %path.display(), "no config file, using defaults");
                Self::default()
            }
            Err(source) => {
                return Err(ConfigError::Io {
                    path: path.to_path_buf(),
                    source,
                })
            }
        };

        if config.server.port == 0 {
            return Err(ConfigError::PortOutOfRange(0));
        }

        Ok(config)
    }

    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), ConfigError> {
        let path = path.as_ref();
        let contents = toml::to_string(self)?;

        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(|source| ConfigError::Io {
                path: parent.to_path_buf(),
                source,
            })?;
        }

        fs::write(path, contents).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })
    }
}

/// Validates a port typed by the user.
pub fn parse_port(input: &str) -> Result<u16, ConfigError> {
    let trimmed = input.trim();
    let value: u64 = trimmed
        .parse()
        .map_err(|_| ConfigError::PortNotNumeric(trimmed.to_string()))?;

    match u16::try_from(value) {
        Ok(port) if port > 0 => Ok(port),
        _ => Err(ConfigError::PortOutOfRange(value)),
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use rstest::rstest;
    use tempfile::TempDir;

    use super::*;

    #[rstest]
    #[case("8388", 8388)]
    #[case(" 9999\n", 9999)]
    #[case("1", 1)]
    #[case("65535", 65535)]
    fn parse_port_accepts(#[case] input: &str, #[case] expected: u16) {
        assert_eq!(expected, parse_port(input).unwrap());
    }

    #[rstest]
    #[case("")]
    #[case("http")]
    #[case("-1")]
    #[case("80.5")]
    fn parse_port_rejects_non_numbers(#[case] input: &str) {
        assert!(matches!(
            parse_port(input),
            Err(ConfigError::PortNotNumeric(_))
        ));
    }

    #[rstest]
    #[case("0", 0)]
    #[case("65536", 65536)]
    fn parse_port_rejects_out_of_range(#[case] input: &str, #[case] value: u64) {
        assert!(matches!(
            parse_port(input),
            Err(ConfigError::PortOutOfRange(v)) if v == value
        ));
    }

    #[test]
    fn missing_file_uses_defaults() {
        let dir = TempDir::new().unwrap();
        let config = Config::load(dir.path().join("absent.toml")).unwrap();

        assert_eq!(Config::default(), config);
        assert_eq!("http://localhost:8388", config.server.url());
    }

    #[test]
    fn partial_file_fills_in_defaults() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.toml");
        fs::write(&path, "[server]\nauto_start = true\n").unwrap();

        let config = Config::load(&path).unwrap();
        assert_eq!(
            ServerConfig {
                port: DEFAULT_PORT,
                auto_start: true
            },
            config.server
        );
    }

    #[test]
    fn save_then_load() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested").join("config.toml");
        let config = Config {
            server: ServerConfig {
                port: 9999,
                auto_start: true,
            },
        };

        config.save(&path).unwrap();
        assert_eq!(config, Config::load(&path).unwrap());
    }

    #[rstest]
    #[case("[server]\nport = 0\n")]
    #[case("[server]\nport = \"eighty\"\n")]
    #[case("[server]\nport = 70000\n")]
    fn bad_files_are_rejected(#[case] contents: &str) {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.toml");
        fs::write(&path, contents).unwrap();

        assert!(Config::load(&path).is_err());
    }
}
