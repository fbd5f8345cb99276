//! On-disk JSON configuration: load, validate, and atomically rewrite.

use crate::error::ConfigError;
use crate::util::PermissiveId;
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::Write;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

fn default_poll_commands_seconds() -> u64 {
    3
}

fn default_push_snapshots_seconds() -> u64 {
    30
}

fn default_heartbeat_seconds() -> u64 {
    10
}

fn default_site_name() -> String {
    String::new()
}

fn default_state_dir() -> PathBuf {
    dirs_state_dir()
}

fn dirs_state_dir() -> PathBuf {
    std::env::temp_dir().join("printer-connector")
}

/// One configured printer: a stable binding to a local Moonraker instance.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PrinterBinding {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub printer_id: Option<PermissiveId>,
    pub name: String,
    pub base_url: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ui_port: Option<u16>,
}

/// The full on-disk configuration document.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Config {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cloud_url: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub pairing_token: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub connector_id: Option<PermissiveId>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub connector_secret: Option<String>,

    #[serde(default = "default_site_name")]
    pub site_name: String,

    #[serde(default = "default_poll_commands_seconds")]
    pub poll_commands_seconds: u64,

    #[serde(default = "default_push_snapshots_seconds")]
    pub push_snapshots_seconds: u64,

    #[serde(default = "default_heartbeat_seconds")]
    pub heartbeat_seconds: u64,

    #[serde(default = "default_state_dir")]
    pub state_dir: PathBuf,

    #[serde(default)]
    pub moonraker: Vec<PrinterBinding>,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            cloud_url: None,
            pairing_token: None,
            connector_id: None,
            connector_secret: None,
            site_name: default_site_name(),
            poll_commands_seconds: default_poll_commands_seconds(),
            push_snapshots_seconds: default_push_snapshots_seconds(),
            heartbeat_seconds: default_heartbeat_seconds(),
            state_dir: default_state_dir(),
            moonraker: Vec::new(),
        }
    }
}

impl Config {
    /// Loads the config file at `path`, applying the `CLOUD_URL` environment
    /// override on top of whatever the file contains.
    pub fn load(path: &Path) -> Result<Config, ConfigError> {
        let raw = fs::read_to_string(path).map_err(|source| ConfigError::ReadIO {
            path: path.to_path_buf(),
            source,
        })?;
        let mut config: Config =
            serde_json::from_str(&raw).map_err(|source| ConfigError::Parse {
                path: path.to_path_buf(),
                source,
            })?;
        if let Ok(env_url) = std::env::var("CLOUD_URL") {
            if !env_url.is_empty() {
                config.cloud_url = Some(env_url);
            }
        }
        Ok(config)
    }

    /// Validates the invariants this agent relies on: a usable cloud_url, a
    /// consistent credential state, and well-formed printer bindings.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let cloud_url = self
            .cloud_url
            .as_deref()
            .ok_or_else(|| ConfigError::InvalidCloudUrl {
                url: String::new(),
            })?;
        if !starts_with_http_scheme(cloud_url) {
            return Err(ConfigError::InvalidCloudUrl {
                url: cloud_url.to_string(),
            });
        }

        let has_pairing_token = self.pairing_token.is_some();
        let has_credentials = self.connector_id.is_some() && self.connector_secret.is_some();
        let partial_credentials =
            self.connector_id.is_some() != self.connector_secret.is_some();
        if partial_credentials {
            return Err(ConfigError::InconsistentCredentials {
                detail: "connector_id and connector_secret must be set together",
            });
        }
        if has_pairing_token && has_credentials {
            return Err(ConfigError::InconsistentCredentials {
                detail: "both pairing_token and connector credentials are present",
            });
        }
        if !has_pairing_token && !has_credentials {
            return Err(ConfigError::InconsistentCredentials {
                detail: "neither pairing_token nor connector credentials are present",
            });
        }

        let mut seen_ids = std::collections::HashSet::new();
        for binding in &self.moonraker {
            if !starts_with_http_scheme(&binding.base_url) {
                return Err(ConfigError::InvalidPrinterUrl {
                    printer_id: binding.name.clone(),
                    url: binding.base_url.clone(),
                });
            }
            if binding.base_url.contains("..") {
                return Err(ConfigError::PathTraversal {
                    url: binding.base_url.clone(),
                });
            }
            if let Some(id) = &binding.printer_id {
                if !seen_ids.insert(id.clone()) {
                    return Err(ConfigError::DuplicatePrinterId {
                        printer_id: id.0.clone(),
                    });
                }
            }
        }

        Ok(())
    }

    /// Atomically rewrites the config file at `path`: writes to a temp file
    /// in the same directory at owner-only permissions, then renames over
    /// the live path. The rename is the commit point — a crash before it
    /// leaves the previous file untouched.
    pub fn save_atomic(&self, path: &Path) -> Result<(), ConfigError> {
        let parent = path.parent().unwrap_or_else(|| Path::new("."));
        fs::create_dir_all(parent).map_err(|source| ConfigError::WriteIO {
            path: parent.to_path_buf(),
            source,
        })?;

        let body = serde_json::to_string_pretty(self).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;

        let mut tmp = tempfile::NamedTempFile::new_in(parent).map_err(|source| ConfigError::WriteIO {
            path: parent.to_path_buf(),
            source,
        })?;
        tmp.as_file()
            .set_permissions(fs::Permissions::from_mode(0o600))
            .map_err(|source| ConfigError::WriteIO {
                path: path.to_path_buf(),
                source,
            })?;
        tmp.write_all(body.as_bytes())
            .map_err(|source| ConfigError::WriteIO {
                path: path.to_path_buf(),
                source,
            })?;
        tmp.flush().map_err(|source| ConfigError::WriteIO {
            path: path.to_path_buf(),
            source,
        })?;
        tmp.persist(path)
            .map_err(|e| ConfigError::WriteIO {
                path: path.to_path_buf(),
                source: e.error,
            })?;
        Ok(())
    }
}

fn starts_with_http_scheme(url: &str) -> bool {
    url.starts_with("http://") || url.starts_with("https://")
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn sample_config() -> Config {
        Config {
            cloud_url: Some("https://cloud.example.com".to_string()),
            pairing_token: Some("PT".to_string()),
            moonraker: vec![PrinterBinding {
                printer_id: None,
                name: "K1".to_string(),
                base_url: "http://127.0.0.1:7125".to_string(),
                ui_port: None,
            }],
            ..Config::default()
        }
    }

    #[test]
    fn round_trips_through_save_and_load() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.json");
        let config = sample_config();
        config.save_atomic(&path).unwrap();
        let loaded = Config::load(&path).unwrap();
        assert_eq!(config, loaded);
        loaded.validate().unwrap();
    }

    #[test]
    fn save_atomic_sets_owner_only_permissions() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.json");
        sample_config().save_atomic(&path).unwrap();
        let perms = fs::metadata(&path).unwrap().permissions();
        assert_eq!(perms.mode() & 0o777, 0o600);
    }

    #[test]
    fn save_atomic_preserves_prior_file_if_interrupted_before_rename() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.json");
        let first = sample_config();
        first.save_atomic(&path).unwrap();
        let original_bytes = fs::read(&path).unwrap();

        // Simulate a crash between temp-write and rename: write a temp file
        // in the same directory but never persist it over the live path.
        let mut tmp = tempfile::NamedTempFile::new_in(dir.path()).unwrap();
        tmp.write_all(b"{\"incomplete\":true}").unwrap();
        drop(tmp);

        let bytes_after = fs::read(&path).unwrap();
        assert_eq!(original_bytes, bytes_after);
    }

    #[test]
    fn rejects_cloud_url_without_http_scheme() {
        let mut config = sample_config();
        config.cloud_url = Some("ftp://cloud.example.com".to_string());
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_both_pairing_token_and_credentials() {
        let mut config = sample_config();
        config.connector_id = Some(PermissiveId("7".to_string()));
        config.connector_secret = Some("S".to_string());
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_duplicate_printer_ids() {
        let mut config = sample_config();
        config.pairing_token = None;
        config.connector_id = Some(PermissiveId("7".to_string()));
        config.connector_secret = Some("S".to_string());
        config.moonraker = vec![
            PrinterBinding {
                printer_id: Some(PermissiveId("1".to_string())),
                name: "A".to_string(),
                base_url: "http://127.0.0.1:7125".to_string(),
                ui_port: None,
            },
            PrinterBinding {
                printer_id: Some(PermissiveId("1".to_string())),
                name: "B".to_string(),
                base_url: "http://127.0.0.1:7126".to_string(),
                ui_port: None,
            },
        ];
        assert!(config.validate().is_err());
    }

    #[test]
    fn env_override_takes_precedence_over_file_value() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.json");
        sample_config().save_atomic(&path).unwrap();
        std::env::set_var("CLOUD_URL", "https://override.example.com");
        let loaded = Config::load(&path).unwrap();
        std::env::remove_var("CLOUD_URL");
        assert_eq!(loaded.cloud_url.as_deref(), Some("https://override.example.com"));
    }
}
