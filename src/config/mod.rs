use lazy_static::lazy_static;
use log::{debug, error, info, warn};
use serde::{Deserialize, Serialize};
use serde_yml;
use thiserror::Error;
use utoipa::ToSchema;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{PoisonError, RwLock};

use crate::models::{Account, TicketClassifier};
use crate::readings::structs::IncrementalBase;
use crate::get_unix_ts;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Unable to access config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("Unable to parse config file: {0}")]
    Parse(#[from] serde_yml::Error),
    #[error("Invalid config: {0}")]
    Invalid(String),
}

fn httpd_enabled_default() -> bool { return true }
fn httpd_port_default() -> u16 { return 8241 }

#[derive(Deserialize, Serialize, Clone, Debug, ToSchema)]
pub struct HttpdConfig {
    #[serde(default="httpd_enabled_default")]
    pub enabled: bool,
    #[serde(default="httpd_port_default")]
    pub port: u16
}

fn mqtt_host_default() -> String { return "localhost".to_string() }
fn mqtt_port_default() -> u16 { return 1883 }
fn mqtt_ha_enabled_default() -> bool { return true }
fn mqtt_client_name_default() -> String { return "pikcomfort2mqtt".to_string() }

#[derive(Deserialize, Serialize, Clone, Debug, ToSchema)]
pub struct MqttConfig {
    #[serde(default="mqtt_host_default")]
    pub host: String,
    #[serde(default="mqtt_port_default")]
    pub port: u16,
    #[serde(default)]
    pub user: String,
    #[serde(default)]
    pub pass: String,
    #[serde(default="mqtt_ha_enabled_default")]
    pub ha_enabled: bool,
    #[serde(default="mqtt_client_name_default")]
    pub client_name: String,
}

fn pik_name_default() -> String { return "PIK Comfort".to_string() }

#[derive(Deserialize, Serialize, Clone, Debug)]
pub struct PikConfig {
    #[serde(default="pik_name_default")]
    pub name: String,
    #[serde(default)]
    pub phone_number: String,
    #[serde(default)]
    pub accounts: Vec<Account>,
    #[serde(default)]
    pub classifiers: Vec<TicketClassifier>,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, ToSchema)]
pub struct ReadingsConfig {
    #[serde(default)]
    pub incremental_base: IncrementalBase,
    /// Send a notification for push_readings calls that do not say otherwise
    #[serde(default)]
    pub default_notification: bool,
}

fn httpd_default() -> HttpdConfig { return HttpdConfig { enabled: httpd_enabled_default(), port: httpd_port_default() } }
fn mqtt_default() -> MqttConfig {
    return MqttConfig {
        host: mqtt_host_default(),
        port: mqtt_port_default(),
        user: String::new(),
        pass: String::new(),
        ha_enabled: mqtt_ha_enabled_default(),
        client_name: mqtt_client_name_default(),
    }
}
fn pik_default() -> PikConfig {
    return PikConfig { name: pik_name_default(), phone_number: String::new(), accounts: Vec::new(), classifiers: Vec::new() }
}

#[derive(Deserialize, Serialize, Clone, Debug)]
pub struct Config {
    #[serde(default="httpd_default")]
    pub httpd: HttpdConfig,
    #[serde(default="mqtt_default")]
    pub mqtt: MqttConfig,
    #[serde(default="pik_default")]
    pub pik: PikConfig,
    #[serde(default)]
    pub readings: ReadingsConfig,
}

impl Default for Config {
    fn default() -> Self {
        return Config {
            httpd: httpd_default(),
            mqtt: mqtt_default(),
            pik: pik_default(),
            readings: ReadingsConfig::default(),
        };
    }
}

impl Config {
    pub fn validate(&self) -> Result<(), ConfigError> {
        for account in self.pik.accounts.iter() {
            account.validate().map_err(ConfigError::Invalid)?;
        }
        Ok(())
    }
}

/// Sent to every change receiver whenever a config section is replaced at runtime
#[derive(Deserialize, Serialize, Clone, Debug)]
pub struct ConfigChange {
    pub base: String, /* httpd, mqtt, pik or readings */
    pub timestamp: u64,
}

#[derive(Clone)]
pub struct Callbacks {
    sender: tokio::sync::broadcast::Sender<ConfigChange>,
}

pub struct ConfigHolder {
    pub config: Config,
    pub callbacks: Callbacks,
    pub dirty: bool,
    pub path: Option<PathBuf>,
}

/// Where to look for the config file, first hit wins
fn config_candidates() -> Vec<PathBuf> {
    if let Ok(path) = std::env::var("PIK_CONFIG") {
        return vec![PathBuf::from(path)];
    }
    return vec![PathBuf::from("config/pik.yaml"), PathBuf::from("pik.yaml")];
}

impl ConfigHolder {
    fn with_config(config: Config, path: Option<PathBuf>) -> Self {
        let (s, _) = tokio::sync::broadcast::channel(100);
        return ConfigHolder {
            config,
            callbacks: Callbacks { sender: s },
            dirty: false,
            path,
        };
    }

    /// Loads the first config file found, falls back to defaults if none can be used
    pub fn load() -> Self {
        for candidate in config_candidates() {
            if !candidate.exists() {
                debug!("No config at {}", candidate.display());
                continue;
            }

            match ConfigHolder::load_from(&candidate) {
                Ok(holder) => return holder,
                Err(e) => {
                    error!("{e}, using defaults");
                    return ConfigHolder::with_config(Config::default(), Some(candidate));
                }
            }
        }

        error!("Unable to find the config on config/pik.yaml or pik.yaml, using defaults");
        return ConfigHolder::with_config(Config::default(), None);
    }

    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        let contents = fs::read_to_string(path)?;
        let c: Config = serde_yml::from_str(&contents)?;
        c.validate()?;
        info!("Config loaded from {} with {} account(s)", path.display(), c.pik.accounts.len());
        return Ok(ConfigHolder::with_config(c, Some(path.to_path_buf())));
    }

    pub fn save(&mut self) -> Result<(), ConfigError> {
        /* No need to write config if it's not dirty */
        if !self.dirty {
            debug!("Who ever called me, the config is not dirty");
            return Ok(());
        }

        let Some(config_path) = self.path.clone() else {
            warn!("Config was not loaded from a file, not saving it");
            return Ok(());
        };

        let backup_path = config_path.with_file_name("backup.yaml");
        if config_path.exists() {
            if let Err(e) = fs::copy(&config_path, &backup_path) {
                error!("Backing up config failed, not replacing it");
                return Err(ConfigError::Io(e));
            }
        }

        let x = serde_yml::to_string(&self.config)?;
        fs::write(&config_path, x.as_bytes())?;
        info!("New Config written");
        self.dirty = false;
        Ok(())
    }

    pub fn get_change_receiver(&self) -> tokio::sync::broadcast::Receiver<ConfigChange> {
        return self.callbacks.sender.subscribe();
    }

    pub fn is_dirty(&self) -> bool {
        return self.dirty;
    }

    /// Stores the current account snapshots, marks the config dirty only on changes
    pub fn update_accounts(&mut self, accounts: Vec<Account>) {
        if self.config.pik.accounts == accounts {
            return;
        }

        self.config.pik.accounts = accounts;
        self.dirty = true;
        let _ = self.callbacks.sender.send(ConfigChange { base: "pik".to_string(), timestamp: get_unix_ts() });
    }

    pub fn get_complete_config(&self) -> Config {
        return self.config.clone();
    }
}

lazy_static! {
    pub static ref CONFIG: RwLock<ConfigHolder> = RwLock::new(ConfigHolder::load());
}

/// Copy of the running config, usable even if a writer panicked
pub fn config_snapshot() -> Config {
    return CONFIG.read().unwrap_or_else(PoisonError::into_inner).get_complete_config();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Meter, TariffZone, Zone};
    use std::io::Write;

    const SAMPLE: &str = r#"
mqtt:
  host: broker.local
  port: 1884
pik:
  phone_number: "79001234567"
  accounts:
    - id: 0a1b2c3d-0000-4000-8000-000000000001
      number: "1001"
      meters:
        - uid: m1
          code: "555"
          tariffs:
            - zone: T1
              value: 100.0
readings:
  incremental_base: max
"#;

    fn write_config(dir: &tempfile::TempDir, contents: &str) -> PathBuf {
        let path = dir.path().join("pik.yaml");
        let mut file = fs::File::create(&path).unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        path
    }

    #[test]
    fn test_load_with_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let holder = ConfigHolder::load_from(&write_config(&dir, SAMPLE)).unwrap();
        let c = holder.get_complete_config();
        assert_eq!(c.mqtt.host, "broker.local");
        assert_eq!(c.mqtt.client_name, "pikcomfort2mqtt");
        assert!(c.httpd.enabled);
        assert_eq!(c.httpd.port, 8241);
        assert_eq!(c.pik.name, "PIK Comfort");
        assert_eq!(c.readings.incremental_base, IncrementalBase::Max);
        assert!(!c.readings.default_notification);
        assert_eq!(c.pik.accounts[0].meters[0].window.start_day, 15);
    }

    #[test]
    fn test_load_errors() {
        let dir = tempfile::tempdir().unwrap();
        assert!(matches!(ConfigHolder::load_from(&dir.path().join("missing.yaml")), Err(ConfigError::Io(_))));
        assert!(matches!(ConfigHolder::load_from(&write_config(&dir, "mqtt: [")), Err(ConfigError::Parse(_))));

        let broken_window = SAMPLE.replace("code: \"555\"", "code: \"555\"\n          window:\n            start_day: 25\n            end_day: 15");
        assert!(matches!(ConfigHolder::load_from(&write_config(&dir, &broken_window)), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_update_accounts_and_save() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_config(&dir, SAMPLE);
        let mut holder = ConfigHolder::load_from(&path).unwrap();
        let mut changes = holder.get_change_receiver();

        let same = holder.config.pik.accounts.clone();
        holder.update_accounts(same);
        assert!(!holder.is_dirty());

        let mut accounts = holder.config.pik.accounts.clone();
        accounts[0].meters.push(Meter::new("m2", vec![TariffZone::new(Zone::T1, 5.0)]));
        holder.update_accounts(accounts);
        assert!(holder.is_dirty());
        let change = changes.try_recv().unwrap();
        assert_eq!(change.base, "pik");
        assert!(change.timestamp > 1_600_000_000);

        holder.save().unwrap();
        assert!(!holder.is_dirty());
        assert!(dir.path().join("backup.yaml").exists());

        let reloaded = ConfigHolder::load_from(&path).unwrap();
        assert_eq!(reloaded.config.pik.accounts[0].meters.len(), 2);
        assert_eq!(reloaded.config.readings.incremental_base, IncrementalBase::Max);
    }

    #[test]
    fn test_save_without_file_is_noop() {
        let mut holder = ConfigHolder::with_config(Config::default(), None);
        holder.update_accounts(vec![]);
        assert!(!holder.is_dirty());
        holder.dirty = true;
        assert!(holder.save().is_ok());
    }
}
