use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{FromRow, PgPool};
use uuid::Uuid;

use crate::models::program::PunchProgram;
use crate::store::{StoreError, TagClock};

const WARNING_REARM_DAYS: i64 = 7;

#[derive(thiserror::Error, Debug)]
#[error("Unknown card status: {0}")]
pub struct UnknownCardStatus(String);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CardStatus {
    Active,
    Expired,
}

impl CardStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CardStatus::Active => "active",
            CardStatus::Expired => "expired",
        }
    }
}

impl TryFrom<String> for CardStatus {
    type Error = UnknownCardStatus;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        match value.as_str() {
            "active" => Ok(CardStatus::Active),
            "expired" => Ok(CardStatus::Expired),
            _ => Err(UnknownCardStatus(value)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
pub struct WalletCard {
    pub id: Uuid,
    pub program_id: Uuid,
    pub user_id: Uuid,
    pub current_punches: i32,
    pub reward_credits: i32,
    pub lifetime_punches: i32,
    pub lifetime_rewards: i32,
    #[sqlx(try_from = "String")]
    pub status: CardStatus,
    #[serde(skip_serializing)]
    pub auth_token: String,
    pub update_tag: i64,
    pub expires_at: Option<DateTime<Utc>>,
    /// Pre-expiry warning already sent for the current expiry date
    #[serde(default)]
    pub expiration_notified: bool,
    pub last_activity_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Punch/credit balance of a card. All arithmetic on balances goes through here so
/// both storage backends apply identical rules.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Balance {
    pub current_punches: i32,
    pub reward_credits: i32,
}

#[derive(thiserror::Error, Debug, PartialEq, Eq)]
pub enum BalanceError {
    #[error("Punch amount must be positive (got {0})")]
    NonPositivePunch(i32),

    #[error("Redeemed credits must be positive (got {0})")]
    NonPositiveRedeem(i32),

    #[error("Program requires a positive number of punches (got {0})")]
    InvalidRequirement(i32),

    #[error("Insufficient reward credits: {available} available, {requested} requested")]
    InsufficientCredits { available: i32, requested: i32 },

    #[error("Balance arithmetic overflow")]
    Overflow,
}

/// Result of adding punches to a balance
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PunchTally {
    pub balance: Balance,
    pub rewards_earned: i32,
}

impl Balance {
    pub fn punched(self, amount: i32, punches_required: i32) -> Result<PunchTally, BalanceError> {
        if amount < 1 {
            return Err(BalanceError::NonPositivePunch(amount));
        }
        if punches_required < 1 {
            return Err(BalanceError::InvalidRequirement(punches_required));
        }

        let total = self
            .current_punches
            .checked_add(amount)
            .ok_or(BalanceError::Overflow)?;
        let rewards_earned = total / punches_required;
        let reward_credits = self
            .reward_credits
            .checked_add(rewards_earned)
            .ok_or(BalanceError::Overflow)?;

        Ok(PunchTally {
            balance: Balance {
                current_punches: total % punches_required,
                reward_credits,
            },
            rewards_earned,
        })
    }

    pub fn redeemed(self, credits: i32) -> Result<Balance, BalanceError> {
        if credits < 1 {
            return Err(BalanceError::NonPositiveRedeem(credits));
        }
        if self.reward_credits < credits {
            return Err(BalanceError::InsufficientCredits {
                available: self.reward_credits,
                requested: credits,
            });
        }

        Ok(Balance {
            current_punches: self.current_punches,
            reward_credits: self.reward_credits - credits,
        })
    }
}

/// Request to add punches to a card
#[derive(Debug, Clone)]
pub struct PunchRequest {
    pub amount: i32,
    pub source: String,
    pub created_by: Option<String>,
}

/// Request to spend reward credits
#[derive(Debug, Clone)]
pub struct RedeemRequest {
    pub credits: i32,
    pub created_by: Option<String>,
}

/// Card state after a committed punch
#[derive(Debug, Clone)]
pub struct PunchOutcome {
    pub card: WalletCard,
    pub rewards_earned: i32,
}

/// Result of the join flow
#[derive(Debug, Clone)]
pub struct JoinOutcome {
    pub card: WalletCard,
    pub created: bool,
    /// Active card past its expiry date that this join retired
    pub retired: Option<WalletCard>,
}

#[derive(Debug, Clone)]
pub struct NewCardData {
    pub user_id: Uuid,
    pub program_id: Uuid,
    pub auth_token: String,
}

impl WalletCard {
    pub fn balance(&self) -> Balance {
        Balance {
            current_punches: self.current_punches,
            reward_credits: self.reward_credits,
        }
    }

    /// Serial number used on the pass (stable for the card's lifetime)
    pub fn serial_number(&self) -> String {
        self.id.to_string()
    }

    /// Expiry date has passed, whether or not the sweep has marked it yet
    pub fn is_overdue(&self, now: DateTime<Utc>) -> bool {
        matches!(self.expires_at, Some(expires_at) if expires_at <= now)
    }

    /// Warning flag once expiry moves to `expires_at`. Pushing expiry out by more
    /// than a week re-arms the warning.
    pub fn expiration_notified_after(&self, expires_at: Option<DateTime<Utc>>) -> bool {
        match (self.expires_at, expires_at) {
            (Some(old), Some(new)) if new > old + Duration::days(WARNING_REARM_DAYS) => false,
            _ => self.expiration_notified,
        }
    }

    /// Rejects mutations of cards that are expired or past their expiry date
    pub fn ensure_active(&self, now: DateTime<Utc>) -> Result<(), StoreError> {
        if self.status != CardStatus::Active {
            return Err(StoreError::CardNotActive {
                card_id: self.id,
                status: self.status.as_str().to_string(),
            });
        }
        if self.is_overdue(now) {
            return Err(StoreError::CardNotActive {
                card_id: self.id,
                status: "expired".to_string(),
            });
        }
        Ok(())
    }

    /// Builds a fresh card row for the join flow
    pub fn new_for_program(
        data: NewCardData,
        program: &PunchProgram,
        clock: &TagClock,
        now: DateTime<Utc>,
    ) -> Self {
        WalletCard {
            id: Uuid::new_v4(),
            program_id: data.program_id,
            user_id: data.user_id,
            current_punches: 0,
            reward_credits: 0,
            lifetime_punches: 0,
            lifetime_rewards: 0,
            status: CardStatus::Active,
            auth_token: data.auth_token,
            update_tag: clock.next_tag(0),
            expires_at: program.initial_expiration(now),
            expiration_notified: false,
            last_activity_at: now,
            created_at: now,
            updated_at: now,
        }
    }

    /// Finds a card by its ID
    pub async fn find_by_id(pool: &PgPool, id: Uuid) -> Result<Option<Self>, sqlx::Error> {
        let card = sqlx::query_as::<_, Self>(
            r#"
            SELECT * FROM wallet_cards WHERE id = $1
            "#,
        )
        .bind(id)
        .fetch_optional(pool)
        .await?;

        Ok(card)
    }

    /// Inserts a card unless the user already holds an active one for the program.
    /// An active card already past its expiry date is expired first, in the same
    /// transaction, so the join issues a replacement instead of returning a card that
    /// rejects every punch.
    pub async fn find_or_create(
        pool: &PgPool,
        card: &WalletCard,
        clock: &TagClock,
        now: DateTime<Utc>,
    ) -> Result<JoinOutcome, sqlx::Error> {
        let mut tx = pool.begin().await?;

        let overdue = sqlx::query_as::<_, Self>(
            r#"
            SELECT * FROM wallet_cards
            WHERE user_id = $1 AND program_id = $2 AND status = 'active'
              AND expires_at IS NOT NULL AND expires_at <= $3
            FOR UPDATE
            "#,
        )
        .bind(card.user_id)
        .bind(card.program_id)
        .bind(now)
        .fetch_optional(&mut *tx)
        .await?;

        let retired = match overdue {
            Some(stale) => Some(
                sqlx::query_as::<_, Self>(
                    r#"
                    UPDATE wallet_cards
                    SET status = 'expired', update_tag = $2, updated_at = $3
                    WHERE id = $1
                    RETURNING *
                    "#,
                )
                .bind(stale.id)
                .bind(clock.next_tag(stale.update_tag))
                .bind(now)
                .fetch_one(&mut *tx)
                .await?,
            ),
            None => None,
        };

        let inserted = sqlx::query_as::<_, Self>(
            r#"
            INSERT INTO wallet_cards (
                id, program_id, user_id, current_punches, reward_credits,
                lifetime_punches, lifetime_rewards, status, auth_token, update_tag,
                expires_at, last_activity_at, created_at, updated_at
            )
            VALUES ($1, $2, $3, 0, 0, 0, 0, 'active', $4, $5, $6, $7, $7, $7)
            ON CONFLICT (user_id, program_id) WHERE status = 'active' DO NOTHING
            RETURNING *
            "#,
        )
        .bind(card.id)
        .bind(card.program_id)
        .bind(card.user_id)
        .bind(&card.auth_token)
        .bind(card.update_tag)
        .bind(card.expires_at)
        .bind(card.created_at)
        .fetch_optional(&mut *tx)
        .await?;

        let outcome = match inserted {
            Some(created) => JoinOutcome {
                card: created,
                created: true,
                retired,
            },
            None => {
                let existing = sqlx::query_as::<_, Self>(
                    r#"
                    SELECT * FROM wallet_cards
                    WHERE user_id = $1 AND program_id = $2 AND status = 'active'
                    "#,
                )
                .bind(card.user_id)
                .bind(card.program_id)
                .fetch_one(&mut *tx)
                .await?;

                JoinOutcome {
                    card: existing,
                    created: false,
                    retired,
                }
            }
        };

        tx.commit().await?;

        Ok(outcome)
    }

    /// Adds punches in one transaction: row lock, balance update, history row, tag bump
    pub async fn apply_punch(
        pool: &PgPool,
        card_id: Uuid,
        request: &PunchRequest,
        clock: &TagClock,
        now: DateTime<Utc>,
    ) -> Result<PunchOutcome, StoreError> {
        let mut tx = pool.begin().await?;

        let card = sqlx::query_as::<_, Self>(
            r#"
            SELECT * FROM wallet_cards WHERE id = $1 FOR UPDATE
            "#,
        )
        .bind(card_id)
        .fetch_optional(&mut *tx)
        .await?
        .ok_or_else(|| StoreError::NotFound(format!("card {}", card_id)))?;

        card.ensure_active(now)?;

        let program = sqlx::query_as::<_, PunchProgram>(
            r#"
            SELECT * FROM punch_programs WHERE id = $1
            "#,
        )
        .bind(card.program_id)
        .fetch_optional(&mut *tx)
        .await?
        .ok_or_else(|| StoreError::NotFound(format!("program {}", card.program_id)))?;

        let tally = card.balance().punched(request.amount, program.punches_required)?;
        let update_tag = clock.next_tag(card.update_tag);
        let expires_at = program.extended_expiration(&card, now);
        let expiration_notified = card.expiration_notified_after(expires_at);

        sqlx::query(
            r#"
            INSERT INTO punches (wallet_card_id, amount, source, created_by, update_tag)
            VALUES ($1, $2, $3, $4, $5)
            "#,
        )
        .bind(card_id)
        .bind(request.amount)
        .bind(&request.source)
        .bind(&request.created_by)
        .bind(update_tag)
        .execute(&mut *tx)
        .await?;

        let updated = sqlx::query_as::<_, Self>(
            r#"
            UPDATE wallet_cards
            SET
                current_punches = $2,
                reward_credits = $3,
                lifetime_punches = lifetime_punches + $4,
                lifetime_rewards = lifetime_rewards + $5,
                update_tag = $6,
                expires_at = $7,
                expiration_notified = $9,
                last_activity_at = $8,
                updated_at = $8
            WHERE id = $1
            RETURNING *
            "#,
        )
        .bind(card_id)
        .bind(tally.balance.current_punches)
        .bind(tally.balance.reward_credits)
        .bind(request.amount)
        .bind(tally.rewards_earned)
        .bind(update_tag)
        .bind(expires_at)
        .bind(now)
        .bind(expiration_notified)
        .fetch_one(&mut *tx)
        .await?;

        tx.commit().await?;

        Ok(PunchOutcome {
            card: updated,
            rewards_earned: tally.rewards_earned,
        })
    }

    /// Spends reward credits in one transaction; fails without side effects when the
    /// balance is short
    pub async fn apply_redeem(
        pool: &PgPool,
        card_id: Uuid,
        request: &RedeemRequest,
        clock: &TagClock,
        now: DateTime<Utc>,
    ) -> Result<Self, StoreError> {
        let mut tx = pool.begin().await?;

        let card = sqlx::query_as::<_, Self>(
            r#"
            SELECT * FROM wallet_cards WHERE id = $1 FOR UPDATE
            "#,
        )
        .bind(card_id)
        .fetch_optional(&mut *tx)
        .await?
        .ok_or_else(|| StoreError::NotFound(format!("card {}", card_id)))?;

        card.ensure_active(now)?;

        let balance = card.balance().redeemed(request.credits)?;

        let program = sqlx::query_as::<_, PunchProgram>(
            r#"
            SELECT * FROM punch_programs WHERE id = $1
            "#,
        )
        .bind(card.program_id)
        .fetch_optional(&mut *tx)
        .await?
        .ok_or_else(|| StoreError::NotFound(format!("program {}", card.program_id)))?;

        let update_tag = clock.next_tag(card.update_tag);
        let expires_at = program.extended_expiration(&card, now);
        let expiration_notified = card.expiration_notified_after(expires_at);

        sqlx::query(
            r#"
            INSERT INTO redemptions (wallet_card_id, credits, created_by, update_tag)
            VALUES ($1, $2, $3, $4)
            "#,
        )
        .bind(card_id)
        .bind(request.credits)
        .bind(&request.created_by)
        .bind(update_tag)
        .execute(&mut *tx)
        .await?;

        let updated = sqlx::query_as::<_, Self>(
            r#"
            UPDATE wallet_cards
            SET
                reward_credits = $2,
                update_tag = $3,
                expires_at = $4,
                expiration_notified = $6,
                last_activity_at = $5,
                updated_at = $5
            WHERE id = $1
            RETURNING *
            "#,
        )
        .bind(card_id)
        .bind(balance.reward_credits)
        .bind(update_tag)
        .bind(expires_at)
        .bind(now)
        .bind(expiration_notified)
        .fetch_one(&mut *tx)
        .await?;

        tx.commit().await?;

        Ok(updated)
    }

    /// Marks every active card whose expiry has passed as expired, bumping each tag so
    /// devices fetch the voided pass
    pub async fn expire_due(
        pool: &PgPool,
        clock: &TagClock,
        now: DateTime<Utc>,
    ) -> Result<Vec<Self>, StoreError> {
        let mut tx = pool.begin().await?;

        let due = sqlx::query_as::<_, Self>(
            r#"
            SELECT * FROM wallet_cards
            WHERE status = 'active' AND expires_at IS NOT NULL AND expires_at <= $1
            FOR UPDATE SKIP LOCKED
            "#,
        )
        .bind(now)
        .fetch_all(&mut *tx)
        .await?;

        let mut expired = Vec::with_capacity(due.len());
        for card in due {
            let updated = sqlx::query_as::<_, Self>(
                r#"
                UPDATE wallet_cards
                SET status = 'expired', update_tag = $2, updated_at = $3
                WHERE id = $1
                RETURNING *
                "#,
            )
            .bind(card.id)
            .bind(clock.next_tag(card.update_tag))
            .bind(now)
            .fetch_one(&mut *tx)
            .await?;
            expired.push(updated);
        }

        tx.commit().await?;

        Ok(expired)
    }

    /// Flags and returns active cards that entered their program's warning window
    /// and have not been warned for the current expiry date
    pub async fn claim_expiration_warnings(
        pool: &PgPool,
        now: DateTime<Utc>,
    ) -> Result<Vec<Self>, sqlx::Error> {
        let cards = sqlx::query_as::<_, Self>(
            r#"
            UPDATE wallet_cards c
            SET expiration_notified = TRUE
            FROM punch_programs p
            WHERE c.program_id = p.id
              AND p.active AND p.expiration_enabled
              AND c.status = 'active'
              AND NOT c.expiration_notified
              AND c.expires_at > $1
              AND c.expires_at <= $1 + make_interval(days => p.expiration_warning_days)
            RETURNING c.*
            "#,
        )
        .bind(now)
        .fetch_all(pool)
        .await?;

        Ok(cards)
    }
}
