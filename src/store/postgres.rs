//! PostgreSQL storage backend
//!
//! Thin adapter over the query functions on the model types. Card mutations run
//! inside a transaction that holds the card's row lock.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use uuid::Uuid;

use super::{CardStore, RegistrationStore, StoreError, TagClock};
use crate::models::{
    card::{JoinOutcome, NewCardData, PunchOutcome, PunchRequest, RedeemRequest},
    registration::ChangedPass,
    DeviceRegistration, Merchant, PassContext, PunchProgram, RegistrationKey, RegistrationOutcome,
    WalletCard,
};

#[derive(Debug, Clone)]
pub struct PostgresStore {
    pool: PgPool,
    clock: TagClock,
}

impl PostgresStore {
    pub fn from_pool(pool: PgPool, clock: TagClock) -> Self {
        Self { pool, clock }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl CardStore for PostgresStore {
    async fn get_card(&self, card_id: Uuid) -> Result<Option<WalletCard>, StoreError> {
        Ok(WalletCard::find_by_id(&self.pool, card_id).await?)
    }

    async fn load_pass_context(&self, card_id: Uuid) -> Result<Option<PassContext>, StoreError> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("SET TRANSACTION ISOLATION LEVEL REPEATABLE READ, READ ONLY")
            .execute(&mut *tx)
            .await?;

        let Some(card) = sqlx::query_as::<_, WalletCard>("SELECT * FROM wallet_cards WHERE id = $1")
            .bind(card_id)
            .fetch_optional(&mut *tx)
            .await?
        else {
            return Ok(None);
        };

        let program =
            sqlx::query_as::<_, PunchProgram>("SELECT * FROM punch_programs WHERE id = $1")
                .bind(card.program_id)
                .fetch_optional(&mut *tx)
                .await?
                .ok_or_else(|| StoreError::NotFound(format!("program {}", card.program_id)))?;

        let merchant = sqlx::query_as::<_, Merchant>("SELECT * FROM merchants WHERE id = $1")
            .bind(program.merchant_id)
            .fetch_optional(&mut *tx)
            .await?
            .ok_or_else(|| StoreError::NotFound(format!("merchant {}", program.merchant_id)))?;

        tx.commit().await?;

        Ok(Some(PassContext {
            card,
            program,
            merchant,
        }))
    }

    async fn find_or_create_card(
        &self,
        data: NewCardData,
        now: DateTime<Utc>,
    ) -> Result<JoinOutcome, StoreError> {
        let program = PunchProgram::find_by_id(&self.pool, data.program_id)
            .await?
            .ok_or_else(|| StoreError::NotFound(format!("program {}", data.program_id)))?;
        if !program.active {
            return Err(StoreError::ProgramInactive(program.id));
        }

        let candidate = WalletCard::new_for_program(data, &program, &self.clock, now);
        let outcome =
            WalletCard::find_or_create(&self.pool, &candidate, &self.clock, now).await?;
        if let Some(retired) = &outcome.retired {
            tracing::info!(card_id = %retired.id, "Expired overdue card on join");
        }
        if outcome.created {
            tracing::info!(card_id = %outcome.card.id, "Created wallet card");
        }
        Ok(outcome)
    }

    async fn apply_punch(
        &self,
        card_id: Uuid,
        request: PunchRequest,
        now: DateTime<Utc>,
    ) -> Result<PunchOutcome, StoreError> {
        WalletCard::apply_punch(&self.pool, card_id, &request, &self.clock, now).await
    }

    async fn apply_redeem(
        &self,
        card_id: Uuid,
        request: RedeemRequest,
        now: DateTime<Utc>,
    ) -> Result<WalletCard, StoreError> {
        WalletCard::apply_redeem(&self.pool, card_id, &request, &self.clock, now).await
    }

    async fn expire_due_cards(&self, now: DateTime<Utc>) -> Result<Vec<WalletCard>, StoreError> {
        let expired = WalletCard::expire_due(&self.pool, &self.clock, now).await?;
        if !expired.is_empty() {
            tracing::info!(count = expired.len(), "Expired wallet cards");
        }
        Ok(expired)
    }

    async fn claim_expiration_warnings(
        &self,
        now: DateTime<Utc>,
    ) -> Result<Vec<WalletCard>, StoreError> {
        Ok(WalletCard::claim_expiration_warnings(&self.pool, now).await?)
    }

    async fn ping(&self) -> Result<(), StoreError> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }
}

#[async_trait]
impl RegistrationStore for PostgresStore {
    async fn upsert_registration(
        &self,
        registration: DeviceRegistration,
    ) -> Result<RegistrationOutcome, StoreError> {
        Ok(DeviceRegistration::upsert(&self.pool, &registration).await?)
    }

    async fn delete_registration(&self, key: &RegistrationKey) -> Result<bool, StoreError> {
        Ok(DeviceRegistration::delete(&self.pool, key).await?)
    }

    async fn registration_exists(&self, key: &RegistrationKey) -> Result<bool, StoreError> {
        Ok(DeviceRegistration::exists(&self.pool, key).await?)
    }

    async fn registrations_for_pass(
        &self,
        pass_type_id: &str,
        card_id: Uuid,
    ) -> Result<Vec<DeviceRegistration>, StoreError> {
        Ok(DeviceRegistration::list_for_pass(&self.pool, pass_type_id, card_id).await?)
    }

    async fn changed_passes_for_device(
        &self,
        device_library_id: &str,
        pass_type_id: &str,
        since: Option<i64>,
    ) -> Result<Vec<ChangedPass>, StoreError> {
        Ok(
            DeviceRegistration::changed_for_device(
                &self.pool,
                device_library_id,
                pass_type_id,
                since,
            )
            .await?,
        )
    }

    async fn prune_orphaned_registrations(&self) -> Result<u64, StoreError> {
        Ok(DeviceRegistration::prune_orphaned(&self.pool).await?)
    }
}
