//! In-memory storage backend
//!
//! Used when no database is configured and throughout the test suite. Card
//! mutations run under the card's `DashMap` entry lock, so two writers on the same
//! card serialize while different cards proceed independently. Data is lost on
//! restart.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::{mapref::entry::Entry, DashMap};
use tracing::info;
use uuid::Uuid;

use super::{CardStore, RegistrationStore, StoreError, TagClock};
use crate::models::{
    card::{JoinOutcome, NewCardData, PunchOutcome, PunchRequest, RedeemRequest},
    registration::ChangedPass,
    CardStatus, DeviceRegistration, Merchant, PassContext, PunchProgram, RegistrationKey,
    RegistrationOutcome, WalletCard,
};

/// History row appended alongside every balance mutation
#[derive(Debug, Clone, PartialEq)]
pub enum CardEvent {
    Punch {
        amount: i32,
        source: String,
        created_by: Option<String>,
        update_tag: i64,
        at: DateTime<Utc>,
    },
    Redemption {
        credits: i32,
        created_by: Option<String>,
        update_tag: i64,
        at: DateTime<Utc>,
    },
}

#[derive(Debug)]
struct CardEntry {
    card: WalletCard,
    history: Vec<CardEvent>,
}

/// In-memory pass store implementation
#[derive(Debug)]
pub struct MemoryStore {
    clock: TagClock,
    merchants: DashMap<Uuid, Merchant>,
    programs: DashMap<Uuid, PunchProgram>,
    cards: DashMap<Uuid, CardEntry>,
    // (user_id, program_id) -> active card
    active_cards: DashMap<(Uuid, Uuid), Uuid>,
    registrations: DashMap<RegistrationKey, DeviceRegistration>,
}

impl MemoryStore {
    /// Create a new in-memory store
    pub fn new(clock: TagClock) -> Self {
        Self {
            clock,
            merchants: DashMap::new(),
            programs: DashMap::new(),
            cards: DashMap::new(),
            active_cards: DashMap::new(),
            registrations: DashMap::new(),
        }
    }

    pub fn insert_merchant(&self, merchant: Merchant) {
        self.merchants.insert(merchant.id, merchant);
    }

    pub fn insert_program(&self, program: PunchProgram) {
        self.programs.insert(program.id, program);
    }

    /// Imports an existing card as-is (balances and tag are not validated)
    pub fn insert_card(&self, card: WalletCard) {
        if card.status == CardStatus::Active {
            self.active_cards
                .insert((card.user_id, card.program_id), card.id);
        }
        self.cards.insert(
            card.id,
            CardEntry {
                card,
                history: Vec::new(),
            },
        );
    }

    /// Removes a card; its registrations are left behind until pruned
    pub fn remove_card(&self, card_id: Uuid) -> Option<WalletCard> {
        let (_, entry) = self.cards.remove(&card_id)?;
        self.active_cards
            .remove_if(&(entry.card.user_id, entry.card.program_id), |_, id| {
                *id == card_id
            });
        Some(entry.card)
    }

    /// History rows recorded for a card, oldest first
    pub fn history(&self, card_id: Uuid) -> Vec<CardEvent> {
        self.cards
            .get(&card_id)
            .map(|entry| entry.history.clone())
            .unwrap_or_default()
    }

    fn program_for(&self, program_id: Uuid) -> Result<PunchProgram, StoreError> {
        self.programs
            .get(&program_id)
            .map(|p| p.clone())
            .ok_or_else(|| StoreError::NotFound(format!("program {}", program_id)))
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new(TagClock::WallClock)
    }
}

#[async_trait]
impl CardStore for MemoryStore {
    async fn get_card(&self, card_id: Uuid) -> Result<Option<WalletCard>, StoreError> {
        Ok(self.cards.get(&card_id).map(|entry| entry.card.clone()))
    }

    async fn load_pass_context(&self, card_id: Uuid) -> Result<Option<PassContext>, StoreError> {
        let Some(card) = self.cards.get(&card_id).map(|entry| entry.card.clone()) else {
            return Ok(None);
        };
        let program = self.program_for(card.program_id)?;
        let merchant = self
            .merchants
            .get(&program.merchant_id)
            .map(|m| m.clone())
            .ok_or_else(|| StoreError::NotFound(format!("merchant {}", program.merchant_id)))?;

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
        let program = self.program_for(data.program_id)?;
        if !program.active {
            return Err(StoreError::ProgramInactive(program.id));
        }

        // The active-card slot stays locked until the replacement is indexed
        let slot = self.active_cards.entry((data.user_id, data.program_id));
        let retired = match &slot {
            Entry::Occupied(occupied) => match self.cards.get_mut(occupied.get()) {
                Some(mut entry) if entry.card.status == CardStatus::Active => {
                    if !entry.card.is_overdue(now) {
                        return Ok(JoinOutcome {
                            card: entry.card.clone(),
                            created: false,
                            retired: None,
                        });
                    }
                    let card = &mut entry.card;
                    card.status = CardStatus::Expired;
                    card.update_tag = self.clock.next_tag(card.update_tag);
                    card.updated_at = now;
                    info!(card_id = %card.id, "Expired overdue card on join");
                    Some(card.clone())
                }
                _ => None,
            },
            Entry::Vacant(_) => None,
        };

        let card = WalletCard::new_for_program(data, &program, &self.clock, now);
        drop(slot.insert(card.id));
        self.cards.insert(
            card.id,
            CardEntry {
                card: card.clone(),
                history: Vec::new(),
            },
        );
        info!(card_id = %card.id, "Created wallet card");

        Ok(JoinOutcome {
            card,
            created: true,
            retired,
        })
    }

    async fn apply_punch(
        &self,
        card_id: Uuid,
        request: PunchRequest,
        now: DateTime<Utc>,
    ) -> Result<PunchOutcome, StoreError> {
        let mut entry = self
            .cards
            .get_mut(&card_id)
            .ok_or_else(|| StoreError::NotFound(format!("card {}", card_id)))?;

        entry.card.ensure_active(now)?;
        let program = self.program_for(entry.card.program_id)?;

        // Everything fallible happens before the first write
        let tally = entry
            .card
            .balance()
            .punched(request.amount, program.punches_required)?;
        let update_tag = self.clock.next_tag(entry.card.update_tag);
        let expires_at = program.extended_expiration(&entry.card, now);
        let expiration_notified = entry.card.expiration_notified_after(expires_at);

        let card = &mut entry.card;
        card.current_punches = tally.balance.current_punches;
        card.reward_credits = tally.balance.reward_credits;
        card.lifetime_punches = card.lifetime_punches.saturating_add(request.amount);
        card.lifetime_rewards = card.lifetime_rewards.saturating_add(tally.rewards_earned);
        card.update_tag = update_tag;
        card.expires_at = expires_at;
        card.expiration_notified = expiration_notified;
        card.last_activity_at = now;
        card.updated_at = now;
        let card = card.clone();

        entry.history.push(CardEvent::Punch {
            amount: request.amount,
            source: request.source,
            created_by: request.created_by,
            update_tag,
            at: now,
        });

        Ok(PunchOutcome {
            card,
            rewards_earned: tally.rewards_earned,
        })
    }

    async fn apply_redeem(
        &self,
        card_id: Uuid,
        request: RedeemRequest,
        now: DateTime<Utc>,
    ) -> Result<WalletCard, StoreError> {
        let mut entry = self
            .cards
            .get_mut(&card_id)
            .ok_or_else(|| StoreError::NotFound(format!("card {}", card_id)))?;

        entry.card.ensure_active(now)?;
        let balance = entry.card.balance().redeemed(request.credits)?;
        let program = self.program_for(entry.card.program_id)?;
        let update_tag = self.clock.next_tag(entry.card.update_tag);
        let expires_at = program.extended_expiration(&entry.card, now);
        let expiration_notified = entry.card.expiration_notified_after(expires_at);

        let card = &mut entry.card;
        card.reward_credits = balance.reward_credits;
        card.update_tag = update_tag;
        card.expires_at = expires_at;
        card.expiration_notified = expiration_notified;
        card.last_activity_at = now;
        card.updated_at = now;
        let card = card.clone();

        entry.history.push(CardEvent::Redemption {
            credits: request.credits,
            created_by: request.created_by,
            update_tag,
            at: now,
        });

        Ok(card)
    }

    async fn expire_due_cards(&self, now: DateTime<Utc>) -> Result<Vec<WalletCard>, StoreError> {
        let mut expired = Vec::new();

        for mut entry in self.cards.iter_mut() {
            let card = &mut entry.card;
            let due = card.status == CardStatus::Active
                && matches!(card.expires_at, Some(expires_at) if expires_at <= now);
            if !due {
                continue;
            }

            card.status = CardStatus::Expired;
            card.update_tag = self.clock.next_tag(card.update_tag);
            card.updated_at = now;
            expired.push(card.clone());
        }

        if !expired.is_empty() {
            info!(count = expired.len(), "Expired wallet cards");
        }

        Ok(expired)
    }

    async fn claim_expiration_warnings(
        &self,
        now: DateTime<Utc>,
    ) -> Result<Vec<WalletCard>, StoreError> {
        let mut warned = Vec::new();

        for mut entry in self.cards.iter_mut() {
            let card = &mut entry.card;
            if card.status != CardStatus::Active || card.expiration_notified {
                continue;
            }
            let Some(program) = self.programs.get(&card.program_id) else {
                continue;
            };
            if !program.in_warning_window(card, now) {
                continue;
            }

            card.expiration_notified = true;
            warned.push(card.clone());
        }

        Ok(warned)
    }

    async fn ping(&self) -> Result<(), StoreError> {
        Ok(())
    }
}

#[async_trait]
impl RegistrationStore for MemoryStore {
    async fn upsert_registration(
        &self,
        registration: DeviceRegistration,
    ) -> Result<RegistrationOutcome, StoreError> {
        match self.registrations.entry(registration.key()) {
            Entry::Occupied(mut slot) => {
                let existing = slot.get_mut();
                existing.push_token = registration.push_token;
                existing.updated_at = registration.updated_at;
                Ok(RegistrationOutcome::Confirmed)
            }
            Entry::Vacant(slot) => {
                info!(
                    device_id = %registration.device_library_id,
                    card_id = %registration.card_id,
                    "Registered device"
                );
                slot.insert(registration);
                Ok(RegistrationOutcome::Created)
            }
        }
    }

    async fn delete_registration(&self, key: &RegistrationKey) -> Result<bool, StoreError> {
        let removed = self.registrations.remove(key).is_some();
        if removed {
            info!(
                device_id = %key.device_library_id,
                card_id = %key.card_id,
                "Unregistered device"
            );
        }
        Ok(removed)
    }

    async fn registration_exists(&self, key: &RegistrationKey) -> Result<bool, StoreError> {
        Ok(self.registrations.contains_key(key))
    }

    async fn registrations_for_pass(
        &self,
        pass_type_id: &str,
        card_id: Uuid,
    ) -> Result<Vec<DeviceRegistration>, StoreError> {
        let mut found: Vec<DeviceRegistration> = self
            .registrations
            .iter()
            .filter(|r| r.pass_type_id == pass_type_id && r.card_id == card_id)
            .map(|r| r.value().clone())
            .collect();
        found.sort_by(|a, b| a.device_library_id.cmp(&b.device_library_id));
        Ok(found)
    }

    async fn changed_passes_for_device(
        &self,
        device_library_id: &str,
        pass_type_id: &str,
        since: Option<i64>,
    ) -> Result<Vec<ChangedPass>, StoreError> {
        let card_ids: Vec<Uuid> = self
            .registrations
            .iter()
            .filter(|r| r.device_library_id == device_library_id && r.pass_type_id == pass_type_id)
            .map(|r| r.card_id)
            .collect();

        let mut changed: Vec<ChangedPass> = card_ids
            .into_iter()
            .filter_map(|card_id| {
                self.cards.get(&card_id).map(|entry| ChangedPass {
                    card_id,
                    update_tag: entry.card.update_tag,
                })
            })
            .filter(|pass| since.map_or(true, |since| pass.update_tag > since))
            .collect();

        changed.sort_by(|a, b| {
            a.update_tag
                .cmp(&b.update_tag)
                .then_with(|| a.card_id.cmp(&b.card_id))
        });
        Ok(changed)
    }

    async fn prune_orphaned_registrations(&self) -> Result<u64, StoreError> {
        let before = self.registrations.len();
        self.registrations
            .retain(|key, _| self.cards.contains_key(&key.card_id));
        let pruned = (before - self.registrations.len()) as u64;
        if pruned > 0 {
            info!(pruned, "Pruned orphaned registrations");
        }
        Ok(pruned)
    }
}
