//! SeaORM durable storage backend
//!
//! The sole source of truth: the `links` table and the append-only `visits`
//! ledger. Supports SQLite, MySQL/MariaDB and PostgreSQL. The connection
//! pool is bounded with a fixed acquire timeout — pool exhaustion surfaces
//! as an error to the caller, which is the system's backpressure mechanism.

mod converters;
mod links;
mod visits;

pub use visits::{CodeStats, DateCount, GroupStats};

use std::time::Duration;

use sea_orm::{ConnectOptions, Database, DatabaseConnection};
use tracing::info;

use crate::errors::{Result, SnaplinkError};
use migration::{Migrator, MigratorTrait};

/// Infer the database backend from the connection URL
pub fn infer_backend_from_url(database_url: &str) -> Result<&'static str> {
    if database_url.starts_with("sqlite://")
        || database_url.ends_with(".db")
        || database_url.ends_with(".sqlite")
        || database_url == ":memory:"
    {
        Ok("sqlite")
    } else if database_url.starts_with("mysql://") || database_url.starts_with("mariadb://") {
        Ok("mysql")
    } else if database_url.starts_with("postgres://") || database_url.starts_with("postgresql://") {
        Ok("postgres")
    } else {
        Err(SnaplinkError::database_config(format!(
            "cannot infer database backend from URL: {}. Supported: sqlite://, mysql://, mariadb://, postgres://",
            database_url
        )))
    }
}

#[derive(Clone)]
pub struct DurableStorage {
    db: DatabaseConnection,
    backend_name: String,
}

impl DurableStorage {
    pub async fn new(database_url: &str, pool_size: u32, acquire_timeout: Duration) -> Result<Self> {
        if database_url.is_empty() {
            return Err(SnaplinkError::database_config("DATABASE_URL not set"));
        }

        let backend_name = infer_backend_from_url(database_url)?;

        let db = if backend_name == "sqlite" {
            connect_sqlite(database_url).await?
        } else {
            connect_generic(database_url, backend_name, pool_size, acquire_timeout).await?
        };

        let storage = DurableStorage {
            db,
            backend_name: backend_name.to_string(),
        };

        storage.run_migrations().await?;

        info!("{} storage initialized", storage.backend_name.to_uppercase());
        Ok(storage)
    }

    pub async fn run_migrations(&self) -> Result<()> {
        Migrator::up(&self.db, None)
            .await
            .map_err(|e| SnaplinkError::database_operation(format!("migration failed: {e}")))?;
        info!("Database migrations completed");
        Ok(())
    }

    pub fn backend_name(&self) -> &str {
        &self.backend_name
    }

    pub fn get_db(&self) -> &DatabaseConnection {
        &self.db
    }
}

/// Connect SQLite with auto-create and the usual pragmas
async fn connect_sqlite(database_url: &str) -> Result<DatabaseConnection> {
    use sea_orm::SqlxSqliteConnector;
    use sea_orm::sqlx::SqlitePool;
    use sea_orm::sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqliteSynchronous};
    use std::str::FromStr;

    let opt = SqliteConnectOptions::from_str(database_url)
        .map_err(|e| SnaplinkError::database_config(format!("bad SQLite URL: {e}")))?
        .create_if_missing(true)
        .journal_mode(SqliteJournalMode::Wal)
        .synchronous(SqliteSynchronous::Normal)
        .busy_timeout(Duration::from_secs(5));

    let pool = SqlitePool::connect_with(opt)
        .await
        .map_err(|e| SnaplinkError::database_connection(format!("cannot connect to SQLite: {e}")))?;

    Ok(SqlxSqliteConnector::from_sqlx_sqlite_pool(pool))
}

/// Connect MySQL/PostgreSQL with a bounded pool
async fn connect_generic(
    database_url: &str,
    backend_name: &str,
    pool_size: u32,
    acquire_timeout: Duration,
) -> Result<DatabaseConnection> {
    let mut opt = ConnectOptions::new(database_url.to_owned());
    opt.max_connections(pool_size)
        .min_connections(pool_size.min(5))
        .connect_timeout(Duration::from_secs(8))
        .acquire_timeout(acquire_timeout)
        .idle_timeout(Duration::from_secs(300))
        .max_lifetime(Duration::from_secs(3600))
        .sqlx_logging(false);

    Database::connect(opt).await.map_err(|e| {
        SnaplinkError::database_connection(format!(
            "cannot connect to {} database: {}",
            backend_name.to_uppercase(),
            e
        ))
    })
}
