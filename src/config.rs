use std::time::Duration;

use taskq_database::DatabaseConfiguration;
use taskq_graceful_shutdown::{GracefulShutdown, GracefulShutdownConsumer};

fn env_duration_seconds(name: &str, default_seconds: u64) -> Result<Duration, taskq_database::Error> {
    let seconds = envoption::with_default::<u64, u64>(name, default_seconds)
        .map_err(|e| taskq_database::Error::ConfigError(e.to_string()))?;
    Ok(Duration::from_secs(seconds))
}

/// Resolved from the environment once at binary startup, mirroring the rest of the environment
/// variable conventions used by the database and test-support layers: required values are
/// explicit, optional ones carry a development-friendly default.
#[derive(Clone)]
pub struct Config {
    pub database: DatabaseConfiguration,
    pub reaper_interval: Duration,
    pub reaper_heartbeat_timeout: Duration,
    pub shutdown: GracefulShutdownConsumer,
}

impl Config {
    pub fn from_env(shutdown: &GracefulShutdown) -> Result<Self, taskq_database::Error> {
        Ok(Config {
            database: DatabaseConfiguration::from_env()?,
            reaper_interval: env_duration_seconds("REAPER_INTERVAL_SECONDS", 30)?,
            reaper_heartbeat_timeout: env_duration_seconds("REAPER_HEARTBEAT_TIMEOUT_SECONDS", 60)?,
            shutdown: shutdown.consumer(),
        })
    }
}
