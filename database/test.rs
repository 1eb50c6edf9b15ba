//! Per-test ephemeral database support, mirroring the pattern used for the rest of this
//! codebase's integration tests: create a uniquely-named database, run migrations against it,
//! hand the caller a pool, then drop the database on the way out (even if the test panics).

use futures::{future::FutureExt, Future};
use once_cell::sync::Lazy;
use sqlx::{postgres::PgConnectOptions, ConnectOptions, Executor};
use tracing::subscriber::set_global_default;
use tracing_bunyan_formatter::{BunyanFormattingLayer, JsonStorageLayer};
use tracing_log::LogTracer;
use tracing_subscriber::{fmt::MakeWriter, layer::SubscriberExt, EnvFilter, Registry};

use crate::{DatabaseConfiguration, Error, PostgresPool};

fn configure_tracing(name: impl Into<String>, sink: impl MakeWriter + Send + Sync + 'static) {
    LogTracer::builder()
        .with_max_level(log::LevelFilter::Debug)
        .init()
        .expect("Failed to create logger");

    let env_filter = EnvFilter::try_from_env("LOG").unwrap_or_else(|_| EnvFilter::new("info"));

    let formatting_layer = BunyanFormattingLayer::new(name.into(), sink);
    let subscriber = Registry::default()
        .with(env_filter)
        .with(JsonStorageLayer)
        .with(formatting_layer);
    set_global_default(subscriber).expect("Setting subscriber");
}

/// Force tracing initialization once per test binary. Silent unless `TEST_LOG` is set, so that
/// a single test's output can be inspected without flooding every run.
pub static TRACING: Lazy<()> = Lazy::new(|| {
    if std::env::var("TEST_LOG").is_ok() {
        configure_tracing("test", std::io::stdout);
    } else {
        configure_tracing("test", std::io::sink);
    }
});

#[derive(Clone)]
pub struct TestDatabase {
    pub config: DatabaseConfiguration,
    pub pool: PostgresPool,
    admin_connect_options: PgConnectOptions,
}

impl TestDatabase {
    pub async fn drop_db(&self) -> Result<(), Error> {
        self.pool.close().await;

        let mut conn = self.admin_connect_options.clone().connect().await?;
        sqlx::query(&format!(
            r##"DROP DATABASE "{}" (FORCE)"##,
            self.config.database
        ))
        .execute(&mut conn)
        .await?;
        Ok(())
    }
}

/// Run `f` against a freshly migrated, uniquely-named database, then tear the database down
/// whether or not `f` panicked.
pub async fn run_database_test<F, Fut>(f: F)
where
    F: FnOnce(TestDatabase) -> Fut,
    Fut: Future<Output = Result<(), anyhow::Error>>,
{
    Lazy::force(&TRACING);

    let database = create_database().await.expect("creating test database");

    let result = std::panic::AssertUnwindSafe(f(database.clone()))
        .catch_unwind()
        .await;

    database.drop_db().await.expect("dropping test database");

    result.expect("test panicked").expect("test returned an error");
}

async fn create_database() -> Result<TestDatabase, anyhow::Error> {
    dotenv::dotenv().ok();

    let host = std::env::var("TEST_DATABASE_HOST")
        .or_else(|_| std::env::var("DATABASE_HOST"))
        .unwrap_or_else(|_| "localhost".to_string());
    let port = std::env::var("TEST_DATABASE_PORT")
        .or_else(|_| std::env::var("DATABASE_PORT"))
        .ok()
        .and_then(|v| v.parse::<u16>().ok())
        .unwrap_or(5432);
    let username = std::env::var("TEST_DATABASE_USER").unwrap_or_else(|_| "postgres".to_string());
    let password = std::env::var("TEST_DATABASE_PASSWORD").unwrap_or_default();

    let database_name = format!("taskq_test_{}", crate::new_uuid().to_simple());

    let admin_connect_options = PgConnectOptions::new()
        .host(&host)
        .port(port)
        .username(&username)
        .password(&password);

    let mut admin_conn = admin_connect_options.clone().connect().await?;
    sqlx::query(&format!(r##"CREATE DATABASE "{}""##, database_name))
        .execute(&mut admin_conn)
        .await?;
    drop(admin_conn);

    let config = DatabaseConfiguration {
        host,
        port,
        database: database_name,
        username,
        password,
    };

    let pool = config.create_pool().await?;

    sqlx::migrate!("../migrations").run(&pool).await?;

    Ok(TestDatabase {
        config,
        pool,
        admin_connect_options,
    })
}
