//! Storage abstraction for card state and device registrations
//!
//! Two backends implement the same traits: PostgreSQL for deployments and an
//! in-memory store for development and tests. Balance arithmetic and tag generation
//! live outside the backends (`models::card::Balance`, [`TagClock`]) so both apply
//! identical rules.

pub mod memory;
pub mod postgres;

pub use memory::MemoryStore;
pub use postgres::PostgresStore;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::fmt::Debug;
use uuid::Uuid;

use crate::models::{
    card::{BalanceError, JoinOutcome, NewCardData, PunchOutcome, PunchRequest, RedeemRequest},
    registration::ChangedPass,
    DeviceRegistration, PassContext, RegistrationKey, RegistrationOutcome, WalletCard,
};

/// Error type for storage operations
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Insufficient reward credits: {available} available, {requested} requested")]
    InsufficientBalance { available: i32, requested: i32 },

    #[error("Card {card_id} is not active (status: {status})")]
    CardNotActive { card_id: Uuid, status: String },

    #[error("Invalid amount: {0}")]
    InvalidAmount(String),

    #[error("Program {0} is not accepting new cards")]
    ProgramInactive(Uuid),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),
}

impl From<BalanceError> for StoreError {
    fn from(err: BalanceError) -> Self {
        match err {
            BalanceError::InsufficientCredits {
                available,
                requested,
            } => StoreError::InsufficientBalance {
                available,
                requested,
            },
            other => StoreError::InvalidAmount(other.to_string()),
        }
    }
}

/// Source of per-card update tags.
///
/// `next_tag(previous)` is always strictly greater than `previous`. The wall clock
/// variant keeps tags close to epoch milliseconds so a device's single
/// `passesUpdatedSince` checkpoint stays meaningful across all of its passes.
///
/// In Postgres the tag is read before the writing transaction commits, so a slow
/// transaction can commit a tag lower than one a device has already been handed
/// as `lastUpdated`. That device skips the change until the card's next bump.
/// The row lock on the card serializes writers per card, so this only affects
/// the cross-card checkpoint, and the gap is bounded by transaction latency.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TagClock {
    WallClock,
    Logical,
}

impl TagClock {
    pub fn next_tag(&self, previous: i64) -> i64 {
        let floor = match self {
            TagClock::WallClock => Utc::now().timestamp_millis(),
            TagClock::Logical => 0,
        };
        floor.max(previous.saturating_add(1))
    }
}

/// Authoritative card balances, tags and history
#[async_trait]
pub trait CardStore: Send + Sync + Debug {
    /// Get a card by ID
    async fn get_card(&self, card_id: Uuid) -> Result<Option<WalletCard>, StoreError>;

    /// Read card, program and merchant as one consistent snapshot
    async fn load_pass_context(&self, card_id: Uuid) -> Result<Option<PassContext>, StoreError>;

    /// Get the user's active card for a program, creating it if absent. An active
    /// card already past its expiry date is expired in the same step and replaced.
    async fn find_or_create_card(
        &self,
        data: NewCardData,
        now: DateTime<Utc>,
    ) -> Result<JoinOutcome, StoreError>;

    /// Add punches atomically (balance, history row, tag bump)
    async fn apply_punch(
        &self,
        card_id: Uuid,
        request: PunchRequest,
        now: DateTime<Utc>,
    ) -> Result<PunchOutcome, StoreError>;

    /// Spend reward credits atomically
    async fn apply_redeem(
        &self,
        card_id: Uuid,
        request: RedeemRequest,
        now: DateTime<Utc>,
    ) -> Result<WalletCard, StoreError>;

    /// Expire every active card whose expiry is at or before `now`
    async fn expire_due_cards(&self, now: DateTime<Utc>) -> Result<Vec<WalletCard>, StoreError>;

    /// Flag and return active cards inside their program's pre-expiry warning window
    /// that have not been warned yet. Each card is returned at most once per expiry date.
    async fn claim_expiration_warnings(
        &self,
        now: DateTime<Utc>,
    ) -> Result<Vec<WalletCard>, StoreError>;

    /// Cheap liveness check
    async fn ping(&self) -> Result<(), StoreError>;
}

/// Relation of (device, pass type, serial) keys to push tokens
#[async_trait]
pub trait RegistrationStore: Send + Sync + Debug {
    /// Create or confirm a registration
    async fn upsert_registration(
        &self,
        registration: DeviceRegistration,
    ) -> Result<RegistrationOutcome, StoreError>;

    /// Remove a registration; returns whether it existed
    async fn delete_registration(&self, key: &RegistrationKey) -> Result<bool, StoreError>;

    async fn registration_exists(&self, key: &RegistrationKey) -> Result<bool, StoreError>;

    async fn registrations_for_pass(
        &self,
        pass_type_id: &str,
        card_id: Uuid,
    ) -> Result<Vec<DeviceRegistration>, StoreError>;

    /// Registered passes of a device with tag > `since` (all when `None`),
    /// ordered by tag then card ID
    async fn changed_passes_for_device(
        &self,
        device_library_id: &str,
        pass_type_id: &str,
        since: Option<i64>,
    ) -> Result<Vec<ChangedPass>, StoreError>;

    /// Delete registrations whose card no longer exists
    async fn prune_orphaned_registrations(&self) -> Result<u64, StoreError>;
}

/// Everything the pass service needs from storage
pub trait PassStore: CardStore + RegistrationStore {}

impl<T: CardStore + RegistrationStore> PassStore for T {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_logical_clock_increments_by_one() {
        assert_eq!(TagClock::Logical.next_tag(100), 101);
        assert_eq!(TagClock::Logical.next_tag(0), 1);
    }

    #[test]
    fn test_wall_clock_never_goes_backwards() {
        let far_future = Utc::now().timestamp_millis() + 1_000_000;
        assert_eq!(TagClock::WallClock.next_tag(far_future), far_future + 1);

        let previous = 5;
        assert!(TagClock::WallClock.next_tag(previous) > previous);
    }

    #[test]
    fn test_balance_error_mapping() {
        let err: StoreError = BalanceError::InsufficientCredits {
            available: 0,
            requested: 1,
        }
        .into();
        assert!(matches!(
            err,
            StoreError::InsufficientBalance {
                available: 0,
                requested: 1
            }
        ));

        let err: StoreError = BalanceError::NonPositivePunch(0).into();
        assert!(matches!(err, StoreError::InvalidAmount(_)));
    }
}
