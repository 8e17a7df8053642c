mod settings;

use std::path::Path;

use config::{Config, Environment, File};

use crate::config::settings::PartialSettings;
use crate::utils::Error;

pub use settings::{
    ConsumerSettings, DEFAULT_TOPIC, LocalSettings, ProducerSettings, Settings, split_brokers,
};

/// Environment variable read for the broker list when no other source sets it.
pub const BROKERS_ENV_FALLBACK: &str = "KAFKA_PEERS";

/// Loads the configuration from `config/default.*` and the environment.
pub fn load_config() -> Result<Settings, Error> {
    load_config_from(None)
}

/// Loads the configuration, reading `file` instead of `config/default.*`
/// when given. Later sources win:
///
/// 1. built-in defaults
/// 2. the configuration file (`config/default.*` is optional, an explicit file is not)
/// 3. `PARTLOG_*` environment variables, `__` separating sections
///    (`PARTLOG_PRODUCER__ACKS=leader`)
/// 4. `KAFKA_PEERS` for the broker list, only if nothing above set one
///
/// The result is not validated; callers apply command line overrides first
/// and then call `Settings::validate`.
pub fn load_config_from(file: Option<&Path>) -> Result<Settings, Error> {
    let file_source = match file {
        Some(path) => File::from(path).required(true),
        None => File::with_name("config/default").required(false),
    };
    let builder = Config::builder()
        .add_source(file_source)
        .add_source(
            Environment::with_prefix("PARTLOG")
                .prefix_separator("_")
                .separator("__"),
        );

    let config = builder
        .build()
        .map_err(|e| Error::Configuration(e.to_string()))?;

    // Try to deserialize what is available
    let partial: PartialSettings = config
        .try_deserialize()
        .map_err(|e| Error::Configuration(e.to_string()))?;

    // Merge with defaults
    let default = Settings::default();

    let brokers = partial
        .brokers
        .or_else(|| std::env::var(BROKERS_ENV_FALLBACK).ok())
        .map(|list| split_brokers(&list))
        .unwrap_or(default.brokers);

    Ok(Settings {
        brokers,
        topic: partial.topic.unwrap_or(default.topic),
        client_id: partial.client_id.unwrap_or(default.client_id),
        log_level: partial.log_level.unwrap_or(default.log_level),
        producer: partial.producer,
        consumer: partial.consumer,
        local: partial.local,
    })
}
