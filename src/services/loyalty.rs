use chrono::Utc;
use std::sync::Arc;
use uuid::Uuid;

use crate::models::card::{NewCardData, PunchOutcome, PunchRequest, RedeemRequest};
use crate::models::WalletCard;
use crate::services::notifier::UpdateNotifier;
use crate::services::{tokens, PassServiceError};
use crate::store::PassStore;

/// Entry points used by the surrounding application: join, punch, redeem, expire.
/// Every committed change is followed by a notification for the pass's devices.
#[derive(Debug, Clone)]
pub struct LoyaltyService {
    store: Arc<dyn PassStore>,
    notifier: Arc<dyn UpdateNotifier>,
    pass_type_id: String,
}

impl LoyaltyService {
    pub fn new(
        store: Arc<dyn PassStore>,
        notifier: Arc<dyn UpdateNotifier>,
        pass_type_id: impl Into<String>,
    ) -> Self {
        Self {
            store,
            notifier,
            pass_type_id: pass_type_id.into(),
        }
    }

    /// Returns the user's active card for the program, creating it on first join
    #[tracing::instrument(skip(self))]
    pub async fn create_card(
        &self,
        user_id: Uuid,
        program_id: Uuid,
    ) -> Result<(WalletCard, bool), PassServiceError> {
        let auth_token = tokens::generate_auth_token()?;
        let outcome = self
            .store
            .find_or_create_card(
                NewCardData {
                    user_id,
                    program_id,
                    auth_token,
                },
                Utc::now(),
            )
            .await?;

        if let Some(retired) = &outcome.retired {
            self.notify(retired).await;
        }

        tracing::info!(card_id = %outcome.card.id, created = outcome.created, "Card ready");
        Ok((outcome.card, outcome.created))
    }

    pub async fn get_card(&self, card_id: Uuid) -> Result<WalletCard, PassServiceError> {
        self.store
            .get_card(card_id)
            .await?
            .ok_or_else(|| PassServiceError::NotFound(format!("card {}", card_id)))
    }

    #[tracing::instrument(skip(self, request), fields(amount = request.amount))]
    pub async fn record_punch(
        &self,
        card_id: Uuid,
        request: PunchRequest,
    ) -> Result<PunchOutcome, PassServiceError> {
        let outcome = self.store.apply_punch(card_id, request, Utc::now()).await?;

        tracing::info!(
            update_tag = outcome.card.update_tag,
            current_punches = outcome.card.current_punches,
            reward_credits = outcome.card.reward_credits,
            rewards_earned = outcome.rewards_earned,
            "Punch recorded"
        );
        self.notify(&outcome.card).await;
        Ok(outcome)
    }

    #[tracing::instrument(skip(self, request), fields(credits = request.credits))]
    pub async fn record_redemption(
        &self,
        card_id: Uuid,
        request: RedeemRequest,
    ) -> Result<WalletCard, PassServiceError> {
        let card = self.store.apply_redeem(card_id, request, Utc::now()).await?;

        tracing::info!(
            update_tag = card.update_tag,
            reward_credits = card.reward_credits,
            "Redemption recorded"
        );
        self.notify(&card).await;
        Ok(card)
    }

    /// Expires every card past its expiry date
    pub async fn expire_due_cards(&self) -> Result<Vec<WalletCard>, PassServiceError> {
        let expired = self.store.expire_due_cards(Utc::now()).await?;
        for card in &expired {
            self.notify(card).await;
        }
        Ok(expired)
    }

    /// Warns the devices of cards about to expire. Each card is warned once per
    /// expiry date; returns how many cards were warned.
    pub async fn send_expiration_warnings(&self) -> Result<usize, PassServiceError> {
        let now = Utc::now();
        let cards = self.store.claim_expiration_warnings(now).await?;

        for card in &cards {
            let days_left = card
                .expires_at
                .map(|expires_at| (expires_at - now).num_days())
                .unwrap_or_default();
            match self
                .store
                .registrations_for_pass(&self.pass_type_id, card.id)
                .await
            {
                Ok(registrations) => {
                    self.notifier
                        .expiration_warning(card, &registrations, days_left)
                        .await
                }
                Err(e) => {
                    tracing::warn!(card_id = %card.id, error = %e, "Skipped expiration warning");
                }
            }
        }

        if !cards.is_empty() {
            tracing::info!(count = cards.len(), "Expiration warnings sent");
        }
        Ok(cards.len())
    }

    // The mutation is already committed; a failed lookup only delays the device
    // until its next poll.
    async fn notify(&self, card: &WalletCard) {
        match self
            .store
            .registrations_for_pass(&self.pass_type_id, card.id)
            .await
        {
            Ok(registrations) => self.notifier.passes_updated(card, &registrations).await,
            Err(e) => {
                tracing::warn!(
                    card_id = %card.id,
                    error = %e,
                    "Failed to load registrations for notification"
                );
            }
        }
    }
}
