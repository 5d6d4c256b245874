use anyhow::{Context, Result};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{Pool, Sqlite, SqliteConnection, Transaction};
use std::path::Path;
use tracing::{debug, info};

use crate::schema::SchemaRegistry;


pub mod models;
pub mod queries;

pub type DbPool = Pool<Sqlite>;

#[derive(Debug, Clone)]
pub struct Database {
    pool: DbPool,
}

impl Database {
    pub async fn new<P: AsRef<Path>>(database_path: P) -> Result<Self> {
        let path = database_path.as_ref();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).with_context(|| {
                format!("Failed to create database directory: {}", parent.display())
            })?;
        }

        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .foreign_keys(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(10)
            .connect_with(options)
            .await
            .context("Failed to create database connection pool")?;

        debug!("Opened database at {}", path.display());
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &DbPool {
        &self.pool
    }

    /// Create every registered table (and synonym indexes) that does not exist yet
    pub async fn ensure_schema(&self, registry: &SchemaRegistry) -> Result<()> {
        info!("Ensuring database schema");

        let mut tx = self
            .pool
            .begin()
            .await
            .context("Failed to begin schema transaction")?;

        for statement in registry.schema_sql() {
            debug!("Executing: {}", statement);
            sqlx::query(&statement)
                .execute(&mut *tx)
                .await
                .with_context(|| format!("Failed to execute schema statement: {}", statement))?;
        }

        tx.commit().await.context("Failed to commit schema")?;
        debug!("Database schema is up to date");
        Ok(())
    }

    /// Start a unit of work. Dropping the session without committing rolls it back.
    pub async fn session(&self) -> Result<Session> {
        let tx = self
            .pool
            .begin()
            .await
            .context("Failed to begin transaction")?;
        Ok(Session { tx })
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }
}

/// Transaction scope owning one pooled connection.
#[derive(Debug)]
pub struct Session {
    tx: Transaction<'static, Sqlite>,
}

impl Session {
    #[inline]
    pub fn conn(&mut self) -> &mut SqliteConnection {
        &mut *self.tx
    }

    pub async fn commit(self) -> Result<()> {
        self.tx.commit().await.context("Failed to commit transaction")
    }

    pub async fn rollback(self) -> Result<()> {
        self.tx
            .rollback()
            .await
            .context("Failed to roll back transaction")
    }
}
