use itertools::Itertools;
use sqlx::postgres::{PgConnectOptions, PgPoolOptions};
use std::env;

use crate::error::Error;

pub type PostgresPool = sqlx::PgPool;

/// Database connection settings resolved from the environment.
///
/// Mirrors the small env-var-with-default idiom used throughout this codebase's
/// binaries: required values produce a `ConfigError` instead of a panic, optional
/// ones fall back to a sane local-development default.
#[derive(Clone, Debug)]
pub struct DatabaseConfiguration {
    pub host: String,
    pub port: u16,
    pub database: String,
    pub username: String,
    pub password: String,
}

fn env_or_default(name: &str, default: &str) -> String {
    env::var(name).unwrap_or_else(|_| default.to_string())
}

impl DatabaseConfiguration {
    pub fn from_env() -> Result<Self, Error> {
        let port = env_or_default("DATABASE_PORT", "5432")
            .parse::<u16>()
            .map_err(|e| Error::ConfigError(format!("DATABASE_PORT: {}", e)))?;

        Ok(DatabaseConfiguration {
            host: env_or_default("DATABASE_HOST", "localhost"),
            port,
            database: env::var("DATABASE_NAME")
                .map_err(|_| Error::ConfigError("DATABASE_NAME is required".to_string()))?,
            username: env_or_default("DATABASE_USER", "postgres"),
            password: env::var("DATABASE_PASSWORD").unwrap_or_default(),
        })
    }

    pub fn connect_options(&self) -> PgConnectOptions {
        PgConnectOptions::new()
            .host(&self.host)
            .port(self.port)
            .database(&self.database)
            .username(&self.username)
            .password(&self.password)
    }

    pub async fn create_pool(&self) -> Result<PostgresPool, Error> {
        PgPoolOptions::new()
            .max_connections(10)
            .connect_with(self.connect_options())
            .await
            .map_err(Error::from)
    }
}

/// Render `num_rows` groups of `NCOL` positional parameters for a bulk `INSERT ... VALUES`,
/// e.g. `sql_insert_parameters::<2>(3)` yields `($1,$2),($3,$4),($5,$6)`.
pub fn sql_insert_parameters<const NCOL: usize>(num_rows: usize) -> String {
    (0..num_rows)
        .into_iter()
        .map(|i| {
            let base = i * NCOL + 1;
            let mut output = String::with_capacity(2 + NCOL * 4);

            output.push('(');
            output.push('$');
            output.push_str(base.to_string().as_str());
            for i in 1..NCOL {
                output.push_str(",$");
                output.push_str((base + i).to_string().as_str());
            }
            output.push(')');

            output
        })
        .join(",\n")
}
