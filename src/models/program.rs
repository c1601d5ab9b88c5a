use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{FromRow, PgPool};
use uuid::Uuid;

use crate::models::card::WalletCard;

#[derive(thiserror::Error, Debug)]
#[error("Unknown expiration type: {0}")]
pub struct UnknownExpirationType(String);

/// How a program's cards expire
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExpirationType {
    /// Fixed lifetime counted from card creation
    Fixed,
    /// Every activity pushes expiry out by the extension window
    Rolling,
    /// Rolling, capped at a maximum lifetime from creation
    Hybrid,
}

impl TryFrom<String> for ExpirationType {
    type Error = UnknownExpirationType;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        match value.as_str() {
            "fixed" => Ok(ExpirationType::Fixed),
            "rolling" => Ok(ExpirationType::Rolling),
            "hybrid" => Ok(ExpirationType::Hybrid),
            _ => Err(UnknownExpirationType(value)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
pub struct PunchProgram {
    pub id: Uuid,
    pub merchant_id: Uuid,
    pub name: String,
    pub punches_required: i32,
    pub active: bool,
    pub terms_and_conditions: Option<String>,
    pub expiration_enabled: bool,
    #[sqlx(try_from = "String")]
    pub expiration_type: ExpirationType,
    pub expiration_months: i32,
    pub expiration_extension_days: i32,
    pub expiration_max_months: Option<i32>,
    /// Days before expiry at which holders are warned
    pub expiration_warning_days: i32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

// Months are counted as 30 days throughout.
fn months(count: i32) -> Duration {
    Duration::days(30 * i64::from(count))
}

impl PunchProgram {
    /// Expiry assigned to a card created at `now`
    pub fn initial_expiration(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        if !self.expiration_enabled {
            return None;
        }

        match self.expiration_type {
            ExpirationType::Fixed => Some(now + months(self.expiration_months)),
            ExpirationType::Rolling => {
                Some(now + Duration::days(i64::from(self.expiration_extension_days)))
            }
            ExpirationType::Hybrid => {
                let rolling = now + Duration::days(i64::from(self.expiration_extension_days));
                Some(match self.expiration_max_months {
                    Some(max) => rolling.min(now + months(max)),
                    None => rolling,
                })
            }
        }
    }

    /// Expiry after activity on `card` at `now`. Fixed programs never move.
    pub fn extended_expiration(
        &self,
        card: &WalletCard,
        now: DateTime<Utc>,
    ) -> Option<DateTime<Utc>> {
        if !self.expiration_enabled {
            return card.expires_at;
        }

        let rolling = now + Duration::days(i64::from(self.expiration_extension_days));
        match self.expiration_type {
            ExpirationType::Fixed => card.expires_at,
            ExpirationType::Rolling => Some(rolling),
            ExpirationType::Hybrid => Some(match self.expiration_max_months {
                Some(max) => rolling.min(card.created_at + months(max)),
                None => rolling,
            }),
        }
    }

    /// Whether `card` expires within this program's warning window
    pub fn in_warning_window(&self, card: &WalletCard, now: DateTime<Utc>) -> bool {
        if !(self.active && self.expiration_enabled) {
            return false;
        }
        let window_end = now + Duration::days(i64::from(self.expiration_warning_days));
        matches!(card.expires_at, Some(expires_at) if expires_at > now && expires_at <= window_end)
    }

    /// Finds a program by ID
    pub async fn find_by_id(pool: &PgPool, id: Uuid) -> Result<Option<Self>, sqlx::Error> {
        let program = sqlx::query_as::<_, Self>(
            r#"
            SELECT * FROM punch_programs WHERE id = $1
            "#,
        )
        .bind(id)
        .fetch_optional(pool)
        .await?;

        Ok(program)
    }
}
