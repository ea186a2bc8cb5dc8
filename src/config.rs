use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::pgwire::connection::ConnectConfig;

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    pub postgres: PostgresConfig,
    pub server: ServerConfig,
    pub replication: ReplicationConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct PostgresConfig {
    pub host: String,
    pub port: u16,
    pub database: String,
    pub username: String,
    pub slot_name: String,
    #[serde(default = "default_output_plugin")]
    pub output_plugin: String,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ServerConfig {
    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ReplicationConfig {
    /// How long stored changes are kept before the purge ticker removes
    /// them. Zero disables purging.
    #[serde(default = "default_max_age_secs")]
    pub max_age_secs: u64,
    #[serde(default = "default_purge_interval_secs")]
    pub purge_interval_secs: u64,
}

impl Config {
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, config::ConfigError> {
        let settings = config::Config::builder()
            .add_source(config::File::from(path.as_ref()))
            .add_source(
                config::Environment::with_prefix("CHANGERELAY")
                    .prefix_separator("_")
                    .separator("__"),
            )
            .build()?;

        settings.try_deserialize()
    }

    pub fn connect_config(&self) -> ConnectConfig {
        ConnectConfig::new(
            &self.postgres.host,
            self.postgres.port,
            &self.postgres.username,
            &self.postgres.database,
        )
    }
}

fn default_output_plugin() -> String {
    "changerelay_output".to_string()
}

fn default_listen_addr() -> String {
    "0.0.0.0:9000".to_string()
}

fn default_max_age_secs() -> u64 {
    3600
}

fn default_purge_interval_secs() -> u64 {
    60
}
