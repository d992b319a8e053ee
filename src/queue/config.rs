use std::path::Path;
use std::time::Duration;

use figment::providers::{Env, Format, Serialized, Yaml};
use figment::Figment;
use serde::{Deserialize, Serialize};

use super::QueueError;

/// Settings for the queue client layer.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
   /// Storage account connection string. Required.
   pub connection_string: String,
   /// Settings for the shared HTTP transport.
   pub transport: TransportOptions,
}

/// Settings for the one HTTP transport shared by all queue clients.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportOptions {
   pub pooled_connection_lifetime_secs: u64,
   pub max_connections_per_server: usize,
   pub timeout_secs: u64,
}

impl Default for TransportOptions {
   fn default() -> Self {
      Self {
         pooled_connection_lifetime_secs: 600,
         max_connections_per_server: 20,
         timeout_secs: 30,
      }
   }
}

impl TransportOptions {
   pub fn pooled_connection_lifetime(&self) -> Duration {
      Duration::from_secs(self.pooled_connection_lifetime_secs)
   }

   pub fn timeout(&self) -> Duration {
      Duration::from_secs(self.timeout_secs)
   }
}

impl QueueConfig {
   /// Creates a config with default transport settings.
   pub fn new(connection_string: impl Into<String>) -> Self {
      Self {
         connection_string: connection_string.into(),
         ..Self::default()
      }
   }

   /// Loads configuration with hierarchical merging.
   ///
   /// Precedence (lowest to highest):
   /// 1. Programmatic defaults
   /// 2. `queue.yaml` in the working directory (optional)
   /// 3. Environment variables with the `QUEUE_` prefix, `__` as separator
   ///    (`QUEUE_CONNECTION_STRING`, `QUEUE_TRANSPORT__TIMEOUT_SECS`)
   pub fn load() -> Result<Self, QueueError> {
      Self::extract(
         Figment::new()
            .merge(Serialized::defaults(Self::default()))
            .merge(Yaml::file("queue.yaml"))
            .merge(Env::prefixed("QUEUE_").split("__")),
      )
   }

   /// Loads configuration from a specific YAML file on top of the defaults.
   pub fn load_from_file(path: impl AsRef<Path>) -> Result<Self, QueueError> {
      Self::extract(
         Figment::new()
            .merge(Serialized::defaults(Self::default()))
            .merge(Yaml::file(path.as_ref())),
      )
   }

   fn extract(figment: Figment) -> Result<Self, QueueError> {
      let config: Self = figment.extract().map_err(Box::new)?;
      config.validate()?;
      Ok(config)
   }

   /// Checks the settings that have no usable default.
   pub fn validate(&self) -> Result<(), QueueError> {
      if self.connection_string.trim().is_empty() {
         return Err(QueueError::MissingConnectionString);
      }
      if self.transport.max_connections_per_server == 0 {
         return Err(QueueError::InvalidConfig(
            "transport.max_connections_per_server must be at least 1",
         ));
      }
      Ok(())
   }
}

#[cfg(test)]
mod tests {
   use std::io::Write;

   use super::*;

   #[test]
   fn test_defaults_match_transport_policy() {
      let options = TransportOptions::default();
      assert_eq!(options.pooled_connection_lifetime(), Duration::from_secs(600));
      assert_eq!(options.max_connections_per_server, 20);
      assert_eq!(options.timeout(), Duration::from_secs(30));
   }

   #[test]
   fn test_missing_connection_string_is_rejected() {
      let err = QueueConfig::default().validate().unwrap_err();
      assert!(matches!(err, QueueError::MissingConnectionString));
   }

   #[test]
   fn test_load_from_file_merges_over_defaults() {
      let mut file = tempfile::NamedTempFile::with_suffix(".yaml").unwrap();
      writeln!(
         file,
         "connection_string: \"UseDevelopmentStorage=true\"\ntransport:\n  timeout_secs: 5"
      )
      .unwrap();

      let config = QueueConfig::load_from_file(file.path()).unwrap();
      assert_eq!(config.connection_string, "UseDevelopmentStorage=true");
      assert_eq!(config.transport.timeout_secs, 5);
      assert_eq!(config.transport.max_connections_per_server, 20);
   }

   #[test]
   fn test_load_from_file_without_connection_string_fails() {
      let mut file = tempfile::NamedTempFile::with_suffix(".yaml").unwrap();
      writeln!(file, "transport:\n  timeout_secs: 5").unwrap();

      let err = QueueConfig::load_from_file(file.path()).unwrap_err();
      assert!(matches!(err, QueueError::MissingConnectionString));
   }

   #[test]
   fn test_zero_connections_is_rejected() {
      let mut config = QueueConfig::new("UseDevelopmentStorage=true");
      config.transport.max_connections_per_server = 0;
      assert!(matches!(config.validate(), Err(QueueError::InvalidConfig(_))));
   }
}
