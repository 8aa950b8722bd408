//! Producer configuration.
//!
//! Values are layered with `figment`: an optional TOML file first, then the
//! process environment, which wins. Only the keys listed in [`ENV_KEYS`] are
//! read from the environment; everything else is ignored.
//!
//! Keys are the lower-cased environment variable names, so a TOML file uses
//! `eventhub_name = "readings"` where the environment uses `EVENTHUB_NAME`.

use std::net::{Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;

use figment::providers::{Env, Format, Toml};
use figment::Figment;
use serde::Deserialize;
use thiserror::Error;

use simulator::ProducerSettings;

/// Environment variables read by the producer.
pub const ENV_KEYS: &[&str] = &[
    "KEY_VAULT_URL",
    "EVENTHUB_NAME",
    "EVENTHUB_NAMESPACE",
    "NUM_SENSORS",
    "SIMULATION_INTERVAL_MS",
    "SENSOR_DATA_FILE",
    "STORAGE_CONTAINER",
    "STORAGE_ACCOUNT_URL",
    "EVENTHUB_CONNECTION_SECRET",
    "AZURE_CLIENT_ID",
    "HEALTH_PORT",
    "METRICS_PORT",
    "PUBLISH_BATCH_SIZE",
    "PUBLISH_MAX_RETRIES",
    "MAX_CONSECUTIVE_FAILURES",
    "LOOP_DATASET",
    "LOG_FORMAT",
    "OTEL_EXPORTER_OTLP_ENDPOINT",
];

/// Default TOML file consulted when `--config` is not given.
pub const DEFAULT_CONFIG_FILE: &str = "producer.toml";

/// Errors raised while loading or validating the configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The TOML file or an environment value could not be parsed.
    #[error("failed to load configuration: {0}")]
    Load(#[from] Box<figment::Error>),

    /// A required key has no value.
    #[error("{0} must be set")]
    Missing(&'static str),

    /// A key has a value outside its allowed range.
    #[error("{key}: {reason}")]
    Invalid {
        /// Environment variable name of the key.
        key: &'static str,
        /// What is wrong with the value.
        reason: String,
    },
}

/// Log output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Json,
    Pretty,
}

/// Everything the producer reads at start-up. Never mutated afterwards.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct ProducerConfig {
    #[serde(deserialize_with = "scalar::optional_string")]
    pub key_vault_url: Option<String>,
    #[serde(deserialize_with = "scalar::string")]
    pub eventhub_name: String,
    #[serde(deserialize_with = "scalar::string")]
    pub eventhub_namespace: String,
    pub num_sensors: u32,
    pub simulation_interval_ms: u64,
    #[serde(deserialize_with = "scalar::path")]
    pub sensor_data_file: PathBuf,
    #[serde(deserialize_with = "scalar::optional_string")]
    pub storage_container: Option<String>,
    #[serde(deserialize_with = "scalar::optional_string")]
    pub storage_account_url: Option<String>,
    #[serde(deserialize_with = "scalar::string")]
    pub eventhub_connection_secret: String,
    #[serde(deserialize_with = "scalar::optional_string")]
    pub azure_client_id: Option<String>,
    pub health_port: u16,
    pub metrics_port: u16,
    pub publish_batch_size: usize,
    pub publish_max_retries: u32,
    pub max_consecutive_failures: u32,
    pub loop_dataset: bool,
    pub log_format: LogFormat,
    #[serde(deserialize_with = "scalar::optional_string")]
    pub otel_exporter_otlp_endpoint: Option<String>,
}

impl Default for ProducerConfig {
    fn default() -> Self {
        Self {
            key_vault_url: None,
            eventhub_name: String::new(),
            eventhub_namespace: String::new(),
            num_sensors: 10,
            simulation_interval_ms: 1000,
            sensor_data_file: PathBuf::from("data/sensor.csv"),
            storage_container: None,
            storage_account_url: None,
            eventhub_connection_secret: "eventhub-connection-string".to_owned(),
            azure_client_id: None,
            health_port: 8080,
            metrics_port: 8000,
            publish_batch_size: 100,
            publish_max_retries: 3,
            max_consecutive_failures: 5,
            loop_dataset: true,
            log_format: LogFormat::Json,
            otel_exporter_otlp_endpoint: None,
        }
    }
}

impl ProducerConfig {
    /// Loads from `file` (if it exists) and the environment, then validates.
    pub fn load(file: &Path) -> Result<Self, ConfigError> {
        let config: Self = Figment::new()
            .merge(Toml::file(file))
            .merge(Env::raw().only(ENV_KEYS))
            .extract()
            .map_err(Box::new)?;
        let config = config.normalized();
        config.validate()?;
        Ok(config)
    }

    /// Treats blank optional values as unset.
    fn normalized(mut self) -> Self {
        for value in [
            &mut self.key_vault_url,
            &mut self.storage_container,
            &mut self.storage_account_url,
            &mut self.azure_client_id,
            &mut self.otel_exporter_otlp_endpoint,
        ] {
            if value.as_deref().is_some_and(|v| v.trim().is_empty()) {
                *value = None;
            }
        }
        self
    }

    /// Checks the invariants the rest of the producer relies on.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.eventhub_name.trim().is_empty() {
            return Err(ConfigError::Missing("EVENTHUB_NAME"));
        }
        if self.eventhub_namespace.trim().is_empty() {
            return Err(ConfigError::Missing("EVENTHUB_NAMESPACE"));
        }
        let at_least_one = |key: &'static str, value: u64| {
            if value == 0 {
                Err(ConfigError::Invalid {
                    key,
                    reason: "must be at least 1".to_owned(),
                })
            } else {
                Ok(())
            }
        };
        at_least_one("NUM_SENSORS", self.num_sensors.into())?;
        at_least_one("SIMULATION_INTERVAL_MS", self.simulation_interval_ms)?;
        at_least_one("PUBLISH_BATCH_SIZE", self.publish_batch_size as u64)?;
        at_least_one("MAX_CONSECUTIVE_FAILURES", self.max_consecutive_failures.into())?;

        match (&self.storage_container, &self.storage_account_url) {
            (Some(_), None) => Err(ConfigError::Invalid {
                key: "STORAGE_CONTAINER",
                reason: "requires STORAGE_ACCOUNT_URL".to_owned(),
            }),
            (None, Some(_)) => Err(ConfigError::Invalid {
                key: "STORAGE_ACCOUNT_URL",
                reason: "requires STORAGE_CONTAINER".to_owned(),
            }),
            _ => Ok(()),
        }
    }

    /// Emission loop settings derived from this configuration.
    pub fn producer_settings(&self) -> ProducerSettings {
        ProducerSettings {
            interval: Duration::from_millis(self.simulation_interval_ms),
            max_retries: self.publish_max_retries,
            max_consecutive_failures: self.max_consecutive_failures,
            ..ProducerSettings::default()
        }
    }

    pub fn health_addr(&self) -> SocketAddr {
        SocketAddr::from((Ipv4Addr::UNSPECIFIED, self.health_port))
    }

    pub fn metrics_addr(&self) -> SocketAddr {
        SocketAddr::from((Ipv4Addr::UNSPECIFIED, self.metrics_port))
    }

    /// Blob name of the dataset inside `STORAGE_CONTAINER`.
    pub fn dataset_blob_name(&self) -> Option<String> {
        self.sensor_data_file
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
    }
}

// ---------------------------------------------------------------------------
// String fields from untyped sources
// ---------------------------------------------------------------------------

/// `Env::raw()` reads `EVENTHUB_NAME=2024` as an integer. Fields that are
/// plain strings accept any scalar and keep its textual form.
mod scalar {
    use std::fmt;
    use std::path::PathBuf;

    use serde::de::{self, Deserializer, Visitor};
    use serde::Deserialize;

    struct Scalar(String);

    impl<'de> Deserialize<'de> for Scalar {
        fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
            deserializer.deserialize_any(ScalarVisitor).map(Scalar)
        }
    }

    struct ScalarVisitor;

    impl Visitor<'_> for ScalarVisitor {
        type Value = String;

        fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            f.write_str("a string, number or boolean")
        }

        fn visit_str<E: de::Error>(self, v: &str) -> Result<String, E> {
            Ok(v.to_owned())
        }

        fn visit_string<E: de::Error>(self, v: String) -> Result<String, E> {
            Ok(v)
        }

        fn visit_bool<E: de::Error>(self, v: bool) -> Result<String, E> {
            Ok(v.to_string())
        }

        fn visit_i64<E: de::Error>(self, v: i64) -> Result<String, E> {
            Ok(v.to_string())
        }

        fn visit_u64<E: de::Error>(self, v: u64) -> Result<String, E> {
            Ok(v.to_string())
        }

        fn visit_i128<E: de::Error>(self, v: i128) -> Result<String, E> {
            Ok(v.to_string())
        }

        fn visit_u128<E: de::Error>(self, v: u128) -> Result<String, E> {
            Ok(v.to_string())
        }

        fn visit_f64<E: de::Error>(self, v: f64) -> Result<String, E> {
            Ok(v.to_string())
        }
    }

    pub fn string<'de, D: Deserializer<'de>>(deserializer: D) -> Result<String, D::Error> {
        Scalar::deserialize(deserializer).map(|s| s.0)
    }

    pub fn optional_string<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<String>, D::Error> {
        Option::<Scalar>::deserialize(deserializer).map(|s| s.map(|s| s.0))
    }

    pub fn path<'de, D: Deserializer<'de>>(deserializer: D) -> Result<PathBuf, D::Error> {
        string(deserializer).map(PathBuf::from)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use figment::Jail;

    fn required(jail: &mut Jail) {
        jail.set_env("EVENTHUB_NAME", "readings");
        jail.set_env("EVENTHUB_NAMESPACE", "sensors-ns");
    }

    #[test]
    fn defaults_apply_when_only_required_keys_are_set() {
        Jail::expect_with(|jail| {
            required(jail);
            let config = ProducerConfig::load(Path::new(DEFAULT_CONFIG_FILE)).unwrap();
            assert_eq!(config.eventhub_name, "readings");
            assert_eq!(config.num_sensors, 10);
            assert_eq!(config.simulation_interval_ms, 1000);
            assert_eq!(config.sensor_data_file, PathBuf::from("data/sensor.csv"));
            assert_eq!(config.health_addr().port(), 8080);
            assert_eq!(config.metrics_addr().port(), 8000);
            assert_eq!(config.eventhub_connection_secret, "eventhub-connection-string");
            assert!(config.loop_dataset);
            assert_eq!(config.log_format, LogFormat::Json);
            assert!(config.key_vault_url.is_none());
            Ok(())
        });
    }

    #[test]
    fn environment_overrides_toml_file() {
        Jail::expect_with(|jail| {
            jail.create_file(
                "producer.toml",
                r#"
                    eventhub_name = "from-file"
                    eventhub_namespace = "file-ns"
                    num_sensors = 3
                    log_format = "pretty"
                "#,
            )?;
            jail.set_env("EVENTHUB_NAME", "from-env");
            jail.set_env("SIMULATION_INTERVAL_MS", "250");
            jail.set_env("LOOP_DATASET", "false");

            let config = ProducerConfig::load(Path::new("producer.toml")).unwrap();
            assert_eq!(config.eventhub_name, "from-env");
            assert_eq!(config.eventhub_namespace, "file-ns");
            assert_eq!(config.num_sensors, 3);
            assert_eq!(config.log_format, LogFormat::Pretty);
            assert!(!config.loop_dataset);
            assert_eq!(
                config.producer_settings().interval,
                Duration::from_millis(250)
            );
            Ok(())
        });
    }

    #[test]
    fn unrelated_environment_is_ignored() {
        Jail::expect_with(|jail| {
            required(jail);
            jail.set_env("NUM_SENSORS_EXTRA", "not a number");
            jail.set_env("HOME_SWEET_HOME", "x");
            assert!(ProducerConfig::load(Path::new(DEFAULT_CONFIG_FILE)).is_ok());
            Ok(())
        });
    }

    #[test]
    fn missing_hub_is_rejected() {
        Jail::expect_with(|jail| {
            jail.set_env("EVENTHUB_NAMESPACE", "sensors-ns");
            let err = ProducerConfig::load(Path::new(DEFAULT_CONFIG_FILE)).unwrap_err();
            assert!(matches!(err, ConfigError::Missing("EVENTHUB_NAME")));
            Ok(())
        });
    }

    #[test]
    fn zero_counts_are_rejected() {
        Jail::expect_with(|jail| {
            required(jail);
            jail.set_env("NUM_SENSORS", "0");
            let err = ProducerConfig::load(Path::new(DEFAULT_CONFIG_FILE)).unwrap_err();
            assert!(matches!(err, ConfigError::Invalid { key: "NUM_SENSORS", .. }));
            Ok(())
        });
    }

    #[test]
    fn storage_settings_must_come_together() {
        Jail::expect_with(|jail| {
            required(jail);
            jail.set_env("STORAGE_CONTAINER", "datasets");
            let err = ProducerConfig::load(Path::new(DEFAULT_CONFIG_FILE)).unwrap_err();
            assert!(matches!(err, ConfigError::Invalid { key: "STORAGE_CONTAINER", .. }));

            jail.set_env("STORAGE_ACCOUNT_URL", "https://acct.blob.core.windows.net");
            let config = ProducerConfig::load(Path::new(DEFAULT_CONFIG_FILE)).unwrap();
            assert_eq!(config.dataset_blob_name().as_deref(), Some("sensor.csv"));
            Ok(())
        });
    }

    #[test]
    fn blank_optional_values_are_unset() {
        Jail::expect_with(|jail| {
            required(jail);
            jail.set_env("KEY_VAULT_URL", "");
            let config = ProducerConfig::load(Path::new(DEFAULT_CONFIG_FILE)).unwrap();
            assert!(config.key_vault_url.is_none());
            Ok(())
        });
    }

    #[test]
    fn numeric_looking_names_stay_strings() {
        Jail::expect_with(|jail| {
            jail.set_env("EVENTHUB_NAME", "2024");
            jail.set_env("EVENTHUB_NAMESPACE", "sensors-ns");
            jail.set_env("STORAGE_CONTAINER", "42");
            jail.set_env("STORAGE_ACCOUNT_URL", "https://acct.blob.core.windows.net");
            jail.set_env("AZURE_CLIENT_ID", "12345");
            jail.set_env("EVENTHUB_CONNECTION_SECRET", "7");

            let config = ProducerConfig::load(Path::new(DEFAULT_CONFIG_FILE)).unwrap();
            assert_eq!(config.eventhub_name, "2024");
            assert_eq!(config.storage_container.as_deref(), Some("42"));
            assert_eq!(config.azure_client_id.as_deref(), Some("12345"));
            assert_eq!(config.eventhub_connection_secret, "7");
            Ok(())
        });
    }

    #[test]
    fn malformed_numbers_fail_to_load() {
        Jail::expect_with(|jail| {
            required(jail);
            jail.set_env("NUM_SENSORS", "many");
            let err = ProducerConfig::load(Path::new(DEFAULT_CONFIG_FILE)).unwrap_err();
            assert!(matches!(err, ConfigError::Load(_)));
            Ok(())
        });
    }
}
