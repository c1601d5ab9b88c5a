//! Device registration ledger
//!
//! A registration is keyed by (device library ID, pass type, serial) and lives in one
//! of two states, absent or registered. Registering an existing key confirms it and
//! refreshes the push token. Unregistering an absent key is a no-op.

use chrono::Utc;
use std::sync::Arc;

use crate::models::{DeviceRegistration, RegistrationKey, RegistrationOutcome};
use crate::services::{parse_serial, tokens, PassServiceError};
use crate::store::PassStore;

#[derive(Debug, Clone)]
pub struct RegisterRequest {
    pub device_library_id: String,
    pub pass_type_id: String,
    pub serial: String,
    pub push_token: String,
    pub auth_token: String,
}

#[derive(Debug, Clone)]
pub struct RegistrationLedger {
    store: Arc<dyn PassStore>,
    pass_type_id: String,
}

impl RegistrationLedger {
    pub fn new(store: Arc<dyn PassStore>, pass_type_id: impl Into<String>) -> Self {
        Self {
            store,
            pass_type_id: pass_type_id.into(),
        }
    }

    /// Resolves a protocol path to a registration key; unknown pass types and
    /// malformed serials are reported as not found
    fn key(
        &self,
        device_library_id: &str,
        pass_type_id: &str,
        serial: &str,
    ) -> Result<RegistrationKey, PassServiceError> {
        if pass_type_id != self.pass_type_id {
            return Err(PassServiceError::NotFound(format!(
                "pass type {}",
                pass_type_id
            )));
        }

        Ok(RegistrationKey {
            device_library_id: device_library_id.to_string(),
            pass_type_id: pass_type_id.to_string(),
            card_id: parse_serial(serial)?,
        })
    }

    async fn authorize(&self, key: &RegistrationKey, auth_token: &str) -> Result<(), PassServiceError> {
        let card = self
            .store
            .get_card(key.card_id)
            .await?
            .ok_or_else(|| PassServiceError::NotFound(format!("pass {}", key.card_id)))?;

        if !tokens::tokens_match(auth_token, &card.auth_token) {
            tracing::warn!(card_id = %key.card_id, "Authentication token mismatch");
            return Err(PassServiceError::Unauthorized);
        }
        Ok(())
    }

    #[tracing::instrument(
        skip_all,
        fields(device_id = %request.device_library_id, serial = %request.serial)
    )]
    pub async fn register(
        &self,
        request: RegisterRequest,
    ) -> Result<RegistrationOutcome, PassServiceError> {
        let key = self.key(
            &request.device_library_id,
            &request.pass_type_id,
            &request.serial,
        )?;
        if request.push_token.trim().is_empty() {
            return Err(PassServiceError::Validation(
                "pushToken is required".to_string(),
            ));
        }
        self.authorize(&key, &request.auth_token).await?;

        let now = Utc::now();
        let outcome = self
            .store
            .upsert_registration(DeviceRegistration {
                device_library_id: key.device_library_id,
                pass_type_id: key.pass_type_id,
                card_id: key.card_id,
                push_token: request.push_token,
                created_at: now,
                updated_at: now,
            })
            .await?;

        tracing::info!(?outcome, "Device registration stored");
        Ok(outcome)
    }

    /// Removes a registration. Succeeds whether or not it existed.
    #[tracing::instrument(skip(self, auth_token))]
    pub async fn unregister(
        &self,
        device_library_id: &str,
        pass_type_id: &str,
        serial: &str,
        auth_token: &str,
    ) -> Result<(), PassServiceError> {
        let key = self.key(device_library_id, pass_type_id, serial)?;

        match self.authorize(&key, auth_token).await {
            Ok(()) => {}
            // The card is gone; drop whatever registration is left behind
            Err(PassServiceError::NotFound(_)) => {}
            Err(e) => return Err(e),
        }

        let removed = self.store.delete_registration(&key).await?;
        tracing::info!(removed, "Device unregistered");
        Ok(())
    }

    pub async fn is_registered(
        &self,
        device_library_id: &str,
        pass_type_id: &str,
        serial: &str,
    ) -> Result<bool, PassServiceError> {
        let key = match self.key(device_library_id, pass_type_id, serial) {
            Ok(key) => key,
            Err(PassServiceError::NotFound(_)) => return Ok(false),
            Err(e) => return Err(e),
        };
        Ok(self.store.registration_exists(&key).await?)
    }

    pub async fn registrations_for_pass(
        &self,
        pass_type_id: &str,
        serial: &str,
    ) -> Result<Vec<DeviceRegistration>, PassServiceError> {
        if pass_type_id != self.pass_type_id {
            return Ok(Vec::new());
        }
        let card_id = parse_serial(serial)?;
        Ok(self.store.registrations_for_pass(pass_type_id, card_id).await?)
    }

    pub async fn prune_orphaned(&self) -> Result<u64, PassServiceError> {
        Ok(self.store.prune_orphaned_registrations().await?)
    }
}
