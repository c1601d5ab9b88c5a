use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{FromRow, PgPool};
use uuid::Uuid;

/// Composite key of a device registration
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RegistrationKey {
    pub device_library_id: String,
    pub pass_type_id: String,
    pub card_id: Uuid,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
pub struct DeviceRegistration {
    pub device_library_id: String,
    pub pass_type_id: String,
    pub card_id: Uuid,
    pub push_token: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Whether a registration call created the row or found it already present
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegistrationOutcome {
    Created,
    Confirmed,
}

/// A registered pass whose tag is newer than the device's checkpoint
#[derive(Debug, Clone, PartialEq, Eq, FromRow)]
pub struct ChangedPass {
    pub card_id: Uuid,
    pub update_tag: i64,
}

impl DeviceRegistration {
    pub fn key(&self) -> RegistrationKey {
        RegistrationKey {
            device_library_id: self.device_library_id.clone(),
            pass_type_id: self.pass_type_id.clone(),
            card_id: self.card_id,
        }
    }

    /// Creates the registration or confirms an existing one, refreshing its push token
    pub async fn upsert(
        pool: &PgPool,
        registration: &DeviceRegistration,
    ) -> Result<RegistrationOutcome, sqlx::Error> {
        // xmax is zero only for freshly inserted tuples
        let inserted: bool = sqlx::query_scalar(
            r#"
            INSERT INTO wallet_device_regs (
                device_library_id, pass_type_id, card_id, push_token, created_at, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $5)
            ON CONFLICT (device_library_id, pass_type_id, card_id)
            DO UPDATE SET push_token = EXCLUDED.push_token, updated_at = EXCLUDED.updated_at
            RETURNING (xmax = 0)
            "#,
        )
        .bind(&registration.device_library_id)
        .bind(&registration.pass_type_id)
        .bind(registration.card_id)
        .bind(&registration.push_token)
        .bind(registration.updated_at)
        .fetch_one(pool)
        .await?;

        Ok(if inserted {
            RegistrationOutcome::Created
        } else {
            RegistrationOutcome::Confirmed
        })
    }

    /// Removes a registration; returns whether a row existed
    pub async fn delete(pool: &PgPool, key: &RegistrationKey) -> Result<bool, sqlx::Error> {
        let result = sqlx::query(
            r#"
            DELETE FROM wallet_device_regs
            WHERE device_library_id = $1 AND pass_type_id = $2 AND card_id = $3
            "#,
        )
        .bind(&key.device_library_id)
        .bind(&key.pass_type_id)
        .bind(key.card_id)
        .execute(pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    pub async fn exists(pool: &PgPool, key: &RegistrationKey) -> Result<bool, sqlx::Error> {
        let exists: bool = sqlx::query_scalar(
            r#"
            SELECT EXISTS (
                SELECT 1 FROM wallet_device_regs
                WHERE device_library_id = $1 AND pass_type_id = $2 AND card_id = $3
            )
            "#,
        )
        .bind(&key.device_library_id)
        .bind(&key.pass_type_id)
        .bind(key.card_id)
        .fetch_one(pool)
        .await?;

        Ok(exists)
    }

    /// Lists every device registered for a pass
    pub async fn list_for_pass(
        pool: &PgPool,
        pass_type_id: &str,
        card_id: Uuid,
    ) -> Result<Vec<Self>, sqlx::Error> {
        let registrations = sqlx::query_as::<_, Self>(
            r#"
            SELECT device_library_id, pass_type_id, card_id, push_token, created_at, updated_at
            FROM wallet_device_regs
            WHERE pass_type_id = $1 AND card_id = $2
            ORDER BY device_library_id
            "#,
        )
        .bind(pass_type_id)
        .bind(card_id)
        .fetch_all(pool)
        .await?;

        Ok(registrations)
    }

    /// Registered passes of a device whose tag is newer than `since`, oldest change first
    pub async fn changed_for_device(
        pool: &PgPool,
        device_library_id: &str,
        pass_type_id: &str,
        since: Option<i64>,
    ) -> Result<Vec<ChangedPass>, sqlx::Error> {
        let changed = sqlx::query_as::<_, ChangedPass>(
            r#"
            SELECT c.id AS card_id, c.update_tag
            FROM wallet_device_regs r
            JOIN wallet_cards c ON c.id = r.card_id
            WHERE r.device_library_id = $1
              AND r.pass_type_id = $2
              AND ($3::BIGINT IS NULL OR c.update_tag > $3)
            ORDER BY c.update_tag ASC, c.id ASC
            "#,
        )
        .bind(device_library_id)
        .bind(pass_type_id)
        .bind(since)
        .fetch_all(pool)
        .await?;

        Ok(changed)
    }

    /// Deletes registrations that point at cards which no longer exist
    pub async fn prune_orphaned(pool: &PgPool) -> Result<u64, sqlx::Error> {
        let result = sqlx::query(
            r#"
            DELETE FROM wallet_device_regs r
            WHERE NOT EXISTS (SELECT 1 FROM wallet_cards c WHERE c.id = r.card_id)
            "#,
        )
        .execute(pool)
        .await?;

        Ok(result.rows_affected())
    }
}
