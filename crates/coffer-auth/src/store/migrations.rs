use super::AuthStore;
use crate::error::{AuthError, Result};

impl AuthStore {
    /// Run database migrations
    pub(super) async fn migrate(&self) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS users (
                id TEXT PRIMARY KEY,
                email TEXT NOT NULL UNIQUE,
                role TEXT NOT NULL,
                provider TEXT NOT NULL,
                password_hash TEXT,
                created_at TIMESTAMP NOT NULL
            )
            "#,
        )
        .execute(&mut *tx)
        .await
        .map_err(|e| AuthError::Internal(format!("migration failed (users): {}", e)))?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS mfa_devices (
                id TEXT PRIMARY KEY,
                user_id TEXT NOT NULL,
                name TEXT NOT NULL,
                kind TEXT NOT NULL,
                encrypted_secret TEXT NOT NULL,
                is_verified BOOLEAN NOT NULL DEFAULT FALSE,
                is_default BOOLEAN NOT NULL DEFAULT FALSE,
                created_at TIMESTAMP NOT NULL,
                verified_at TIMESTAMP,
                last_used_at TIMESTAMP,
                UNIQUE (user_id, name),
                FOREIGN KEY (user_id) REFERENCES users(id) ON DELETE CASCADE
            )
            "#,
        )
        .execute(&mut *tx)
        .await
        .map_err(|e| AuthError::Internal(format!("migration failed (mfa_devices): {}", e)))?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS challenges (
                id TEXT PRIMARY KEY,
                kind TEXT NOT NULL,
                user_id TEXT NOT NULL,
                secret_hash TEXT NOT NULL,
                expires_at TIMESTAMP NOT NULL,
                attempts_left INTEGER NOT NULL,
                FOREIGN KEY (user_id) REFERENCES users(id) ON DELETE CASCADE
            )
            "#,
        )
        .execute(&mut *tx)
        .await
        .map_err(|e| AuthError::Internal(format!("migration failed (challenges): {}", e)))?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_devices_user ON mfa_devices(user_id)")
            .execute(&mut *tx)
            .await
            .map_err(|e| AuthError::Internal(format!("migration failed (idx_devices_user): {}", e)))?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_challenges_user ON challenges(user_id, kind)")
            .execute(&mut *tx)
            .await
            .map_err(|e| {
                AuthError::Internal(format!("migration failed (idx_challenges_user): {}", e))
            })?;

        tx.commit().await?;

        Ok(())
    }
}
