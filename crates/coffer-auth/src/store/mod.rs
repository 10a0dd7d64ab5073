//! Auth record storage using SQLite
//!
//! Holds users, MFA devices, and password-reset challenges. Mutating
//! sequences that must not interleave (device verification, challenge
//! attempt decrement) run inside a transaction whose first statement is a
//! write, which takes the sqlite write lock up front and serializes
//! concurrent verifiers.

mod migrations;
mod queries;


use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{Pool, Sqlite};
use std::path::Path;
use std::str::FromStr;

use crate::error::Result;

/// A transaction over the auth store.
pub type StoreTx = sqlx::Transaction<'static, Sqlite>;

/// SQLite-backed auth store.
pub struct AuthStore {
    pool: Pool<Sqlite>,
}

impl AuthStore {
    /// Create a store from a database path.
    pub async fn from_path(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                crate::error::AuthError::Internal(format!("failed to create data directory: {}", e))
            })?;
        }

        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .foreign_keys(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await?;

        let store = Self { pool };
        store.migrate().await?;
        Ok(store)
    }

    /// Create an in-memory store (tests and ephemeral dev runs).
    ///
    /// Capped at one connection: each sqlite `:memory:` connection is its
    /// own database.
    pub async fn in_memory() -> Result<Self> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")
            .map_err(sqlx::Error::from)?
            .foreign_keys(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await?;

        let store = Self { pool };
        store.migrate().await?;
        Ok(store)
    }

    /// Begin a transaction.
    pub async fn begin(&self) -> Result<StoreTx> {
        Ok(self.pool.begin().await?)
    }
}
