use super::{AuthStore, StoreTx};
use crate::error::{AuthError, Result};
use crate::types::{Challenge, ChallengeKind, DeviceKind, MfaDevice, Role, User};
use chrono::{DateTime, Utc};
use sqlx::FromRow;
use uuid::Uuid;

#[derive(FromRow)]
struct UserRow {
    id: String,
    email: String,
    role: String,
    provider: String,
    password_hash: Option<String>,
    created_at: DateTime<Utc>,
}

impl TryFrom<UserRow> for User {
    type Error = AuthError;

    fn try_from(row: UserRow) -> Result<Self> {
        Ok(User {
            id: parse_uuid(&row.id)?,
            role: Role::parse(&row.role)
                .ok_or_else(|| AuthError::Internal(format!("unknown role: {}", row.role)))?,
            email: row.email,
            provider: row.provider,
            password_hash: row.password_hash,
            created_at: row.created_at,
        })
    }
}

#[derive(FromRow)]
struct DeviceRow {
    id: String,
    user_id: String,
    name: String,
    kind: String,
    encrypted_secret: String,
    is_verified: bool,
    is_default: bool,
    created_at: DateTime<Utc>,
    verified_at: Option<DateTime<Utc>>,
    last_used_at: Option<DateTime<Utc>>,
}

impl TryFrom<DeviceRow> for MfaDevice {
    type Error = AuthError;

    fn try_from(row: DeviceRow) -> Result<Self> {
        Ok(MfaDevice {
            id: parse_uuid(&row.id)?,
            user_id: parse_uuid(&row.user_id)?,
            kind: DeviceKind::parse(&row.kind)
                .ok_or_else(|| AuthError::Internal(format!("unknown device kind: {}", row.kind)))?,
            name: row.name,
            encrypted_secret: row.encrypted_secret,
            is_verified: row.is_verified,
            is_default: row.is_default,
            created_at: row.created_at,
            verified_at: row.verified_at,
            last_used_at: row.last_used_at,
        })
    }
}

#[derive(FromRow)]
struct ChallengeRow {
    id: String,
    kind: String,
    user_id: String,
    secret_hash: String,
    expires_at: DateTime<Utc>,
    attempts_left: i32,
}

impl TryFrom<ChallengeRow> for Challenge {
    type Error = AuthError;

    fn try_from(row: ChallengeRow) -> Result<Self> {
        Ok(Challenge {
            id: parse_uuid(&row.id)?,
            kind: ChallengeKind::parse(&row.kind).ok_or_else(|| {
                AuthError::Internal(format!("unknown challenge kind: {}", row.kind))
            })?,
            user_id: parse_uuid(&row.user_id)?,
            secret_hash: row.secret_hash,
            expires_at: row.expires_at,
            attempts_left: row.attempts_left,
        })
    }
}

fn parse_uuid(s: &str) -> Result<Uuid> {
    Uuid::parse_str(s).map_err(|e| AuthError::Internal(format!("malformed uuid in store: {}", e)))
}

impl AuthStore {
    // ------------------------------------------------------------------
    // Users
    // ------------------------------------------------------------------

    /// Insert a user. Accounts are provisioned externally; this exists for
    /// seeding and tests.
    pub async fn create_user(&self, user: &User) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO users (id, email, role, provider, password_hash, created_at)
            VALUES (?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(user.id.to_string())
        .bind(&user.email)
        .bind(user.role.as_str())
        .bind(&user.provider)
        .bind(&user.password_hash)
        .bind(user.created_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Look up a user by id.
    pub async fn find_user(&self, id: Uuid) -> Result<Option<User>> {
        let row: Option<UserRow> = sqlx::query_as("SELECT * FROM users WHERE id = ?")
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await?;

        row.map(User::try_from).transpose()
    }

    /// Look up a user by email.
    pub async fn find_user_by_email(&self, email: &str) -> Result<Option<User>> {
        let row: Option<UserRow> = sqlx::query_as("SELECT * FROM users WHERE email = ?")
            .bind(email)
            .fetch_optional(&self.pool)
            .await?;

        row.map(User::try_from).transpose()
    }

    /// Replace a user's password hash inside a caller-held transaction.
    pub async fn update_password(
        &self,
        tx: &mut StoreTx,
        user_id: Uuid,
        password_hash: &str,
    ) -> Result<()> {
        let result = sqlx::query("UPDATE users SET password_hash = ? WHERE id = ?")
            .bind(password_hash)
            .bind(user_id.to_string())
            .execute(&mut **tx)
            .await?;

        if result.rows_affected() == 0 {
            return Err(AuthError::Internal(format!(
                "password update for absent user {}",
                user_id
            )));
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // MFA devices
    // ------------------------------------------------------------------

    /// Insert a device in its initial pending state.
    pub async fn insert_device(&self, device: &MfaDevice) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO mfa_devices (
                id, user_id, name, kind, encrypted_secret,
                is_verified, is_default, created_at, verified_at, last_used_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(device.id.to_string())
        .bind(device.user_id.to_string())
        .bind(&device.name)
        .bind(device.kind.as_str())
        .bind(&device.encrypted_secret)
        .bind(device.is_verified)
        .bind(device.is_default)
        .bind(device.created_at)
        .bind(device.verified_at)
        .bind(device.last_used_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// All devices for a user, oldest first.
    pub async fn list_devices(&self, user_id: Uuid) -> Result<Vec<MfaDevice>> {
        let rows: Vec<DeviceRow> =
            sqlx::query_as("SELECT * FROM mfa_devices WHERE user_id = ? ORDER BY created_at")
                .bind(user_id.to_string())
                .fetch_all(&self.pool)
                .await?;

        rows.into_iter().map(MfaDevice::try_from).collect()
    }

    /// Verified (active) devices for a user, oldest first.
    pub async fn verified_devices(&self, user_id: Uuid) -> Result<Vec<MfaDevice>> {
        let rows: Vec<DeviceRow> = sqlx::query_as(
            "SELECT * FROM mfa_devices WHERE user_id = ? AND is_verified = TRUE ORDER BY created_at",
        )
        .bind(user_id.to_string())
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(MfaDevice::try_from).collect()
    }

    /// Look up a device owned by a user.
    pub async fn find_device(&self, user_id: Uuid, device_id: Uuid) -> Result<Option<MfaDevice>> {
        let row: Option<DeviceRow> =
            sqlx::query_as("SELECT * FROM mfa_devices WHERE id = ? AND user_id = ?")
                .bind(device_id.to_string())
                .bind(user_id.to_string())
                .fetch_optional(&self.pool)
                .await?;

        row.map(MfaDevice::try_from).transpose()
    }

    /// Device count for a user.
    pub async fn count_devices(&self, user_id: Uuid) -> Result<u32> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM mfa_devices WHERE user_id = ?")
            .bind(user_id.to_string())
            .fetch_one(&self.pool)
            .await?;
        Ok(count as u32)
    }

    /// Whether a device name is taken for this user (case-sensitive),
    /// optionally excluding one device.
    pub async fn device_name_exists(
        &self,
        user_id: Uuid,
        name: &str,
        exclude: Option<Uuid>,
    ) -> Result<bool> {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM mfa_devices WHERE user_id = ? AND name = ? AND id != ?",
        )
        .bind(user_id.to_string())
        .bind(name)
        .bind(exclude.map(|id| id.to_string()).unwrap_or_default())
        .fetch_one(&self.pool)
        .await?;
        Ok(count > 0)
    }

    /// Fetch a device under the transaction's write lock.
    ///
    /// The leading no-op UPDATE upgrades the transaction to a writer before
    /// the read, so two concurrent verifiers cannot both observe the
    /// pre-transition row.
    pub async fn device_for_update(
        &self,
        tx: &mut StoreTx,
        user_id: Uuid,
        device_id: Uuid,
    ) -> Result<Option<MfaDevice>> {
        sqlx::query("UPDATE mfa_devices SET id = id WHERE id = ?")
            .bind(device_id.to_string())
            .execute(&mut **tx)
            .await?;

        let row: Option<DeviceRow> =
            sqlx::query_as("SELECT * FROM mfa_devices WHERE id = ? AND user_id = ?")
                .bind(device_id.to_string())
                .bind(user_id.to_string())
                .fetch_optional(&mut **tx)
                .await?;

        row.map(MfaDevice::try_from).transpose()
    }

    /// Count verified default devices for a user, excluding one device.
    pub async fn count_other_active_defaults(
        &self,
        tx: &mut StoreTx,
        user_id: Uuid,
        exclude_device: Uuid,
    ) -> Result<u32> {
        let count: i64 = sqlx::query_scalar(
            r#"
            SELECT COUNT(*) FROM mfa_devices
            WHERE user_id = ? AND is_verified = TRUE AND is_default = TRUE AND id != ?
            "#,
        )
        .bind(user_id.to_string())
        .bind(exclude_device.to_string())
        .fetch_one(&mut **tx)
        .await?;
        Ok(count as u32)
    }

    /// Transition a device to verified, optionally making it the default.
    pub async fn mark_device_verified(
        &self,
        tx: &mut StoreTx,
        device_id: Uuid,
        make_default: bool,
        now: DateTime<Utc>,
    ) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE mfa_devices
            SET is_verified = TRUE, is_default = ?, verified_at = ?, last_used_at = ?
            WHERE id = ?
            "#,
        )
        .bind(make_default)
        .bind(now)
        .bind(now)
        .bind(device_id.to_string())
        .execute(&mut **tx)
        .await?;

        Ok(())
    }

    /// Record a successful use of a device.
    pub async fn touch_device_last_used(
        &self,
        device_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<()> {
        sqlx::query("UPDATE mfa_devices SET last_used_at = ? WHERE id = ?")
            .bind(now)
            .bind(device_id.to_string())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Rename a device inside a caller-held transaction.
    pub async fn rename_device(
        &self,
        tx: &mut StoreTx,
        device_id: Uuid,
        name: &str,
    ) -> Result<()> {
        sqlx::query("UPDATE mfa_devices SET name = ? WHERE id = ?")
            .bind(name)
            .bind(device_id.to_string())
            .execute(&mut **tx)
            .await?;
        Ok(())
    }

    /// Clear the default flag on every device of a user.
    pub async fn clear_default_flags(&self, tx: &mut StoreTx, user_id: Uuid) -> Result<()> {
        sqlx::query("UPDATE mfa_devices SET is_default = FALSE WHERE user_id = ?")
            .bind(user_id.to_string())
            .execute(&mut **tx)
            .await?;
        Ok(())
    }

    /// Set or clear the default flag on one device.
    pub async fn set_default_flag(
        &self,
        tx: &mut StoreTx,
        device_id: Uuid,
        is_default: bool,
    ) -> Result<()> {
        sqlx::query("UPDATE mfa_devices SET is_default = ? WHERE id = ?")
            .bind(is_default)
            .bind(device_id.to_string())
            .execute(&mut **tx)
            .await?;
        Ok(())
    }

    /// Delete a device inside a caller-held transaction.
    pub async fn delete_device(&self, tx: &mut StoreTx, device_id: Uuid) -> Result<()> {
        sqlx::query("DELETE FROM mfa_devices WHERE id = ?")
            .bind(device_id.to_string())
            .execute(&mut **tx)
            .await?;
        Ok(())
    }

    /// The oldest verified device of a user, if any.
    pub async fn oldest_active_device(
        &self,
        tx: &mut StoreTx,
        user_id: Uuid,
    ) -> Result<Option<MfaDevice>> {
        let row: Option<DeviceRow> = sqlx::query_as(
            r#"
            SELECT * FROM mfa_devices
            WHERE user_id = ? AND is_verified = TRUE
            ORDER BY created_at LIMIT 1
            "#,
        )
        .bind(user_id.to_string())
        .fetch_optional(&mut **tx)
        .await?;

        row.map(MfaDevice::try_from).transpose()
    }

    // ------------------------------------------------------------------
    // Challenges
    // ------------------------------------------------------------------

    /// Insert a challenge, deleting any prior ones of the same (user, kind).
    pub async fn replace_challenge(&self, challenge: &Challenge) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        sqlx::query("DELETE FROM challenges WHERE user_id = ? AND kind = ?")
            .bind(challenge.user_id.to_string())
            .bind(challenge.kind.as_str())
            .execute(&mut *tx)
            .await?;

        sqlx::query(
            r#"
            INSERT INTO challenges (id, kind, user_id, secret_hash, expires_at, attempts_left)
            VALUES (?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(challenge.id.to_string())
        .bind(challenge.kind.as_str())
        .bind(challenge.user_id.to_string())
        .bind(&challenge.secret_hash)
        .bind(challenge.expires_at)
        .bind(challenge.attempts_left)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(())
    }

    /// Fetch a challenge under the transaction's write lock (same no-op
    /// UPDATE trick as [`device_for_update`](Self::device_for_update)), so
    /// two concurrent submitters cannot both observe `attempts_left = 1`.
    pub async fn challenge_for_update(
        &self,
        tx: &mut StoreTx,
        kind: ChallengeKind,
        id: Uuid,
    ) -> Result<Option<Challenge>> {
        sqlx::query("UPDATE challenges SET attempts_left = attempts_left WHERE id = ?")
            .bind(id.to_string())
            .execute(&mut **tx)
            .await?;

        let row: Option<ChallengeRow> =
            sqlx::query_as("SELECT * FROM challenges WHERE id = ? AND kind = ?")
                .bind(id.to_string())
                .bind(kind.as_str())
                .fetch_optional(&mut **tx)
                .await?;

        row.map(Challenge::try_from).transpose()
    }

    /// Plain challenge read (no lock).
    pub async fn get_challenge(&self, kind: ChallengeKind, id: Uuid) -> Result<Option<Challenge>> {
        let row: Option<ChallengeRow> =
            sqlx::query_as("SELECT * FROM challenges WHERE id = ? AND kind = ?")
                .bind(id.to_string())
                .bind(kind.as_str())
                .fetch_optional(&self.pool)
                .await?;

        row.map(Challenge::try_from).transpose()
    }

    /// Persist a decremented attempt count inside a caller-held transaction.
    pub async fn set_challenge_attempts(
        &self,
        tx: &mut StoreTx,
        id: Uuid,
        attempts_left: i32,
    ) -> Result<()> {
        sqlx::query("UPDATE challenges SET attempts_left = ? WHERE id = ?")
            .bind(attempts_left)
            .bind(id.to_string())
            .execute(&mut **tx)
            .await?;
        Ok(())
    }

    /// Delete a challenge inside a caller-held transaction.
    pub async fn delete_challenge(&self, tx: &mut StoreTx, id: Uuid) -> Result<()> {
        sqlx::query("DELETE FROM challenges WHERE id = ?")
            .bind(id.to_string())
            .execute(&mut **tx)
            .await?;
        Ok(())
    }
}
