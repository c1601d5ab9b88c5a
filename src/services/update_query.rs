use std::sync::Arc;

use crate::services::packager::SignedArtifact;
use crate::services::pass_builder::PassBuilder;
use crate::services::{parse_serial, tokens, PassServiceError};
use crate::store::PassStore;

/// Result of a pass fetch
#[derive(Debug, Clone)]
pub enum PassFetch {
    Fresh(Arc<SignedArtifact>),
    NotModified { update_tag: i64 },
}

/// Serials that changed since a device's checkpoint
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangedSerials {
    pub serials: Vec<String>,
    /// Greatest tag among `serials`; `None` when nothing changed
    pub last_updated: Option<i64>,
}

impl ChangedSerials {
    pub fn is_empty(&self) -> bool {
        self.serials.is_empty()
    }
}

#[derive(Debug, Clone)]
pub struct UpdateQueryService {
    store: Arc<dyn PassStore>,
    builder: Arc<PassBuilder>,
    pass_type_id: String,
}

impl UpdateQueryService {
    pub fn new(
        store: Arc<dyn PassStore>,
        builder: Arc<PassBuilder>,
        pass_type_id: impl Into<String>,
    ) -> Self {
        Self {
            store,
            builder,
            pass_type_id: pass_type_id.into(),
        }
    }

    pub fn pass_type_id(&self) -> &str {
        &self.pass_type_id
    }

    /// Fetches the latest pass for a device holding `auth_token`
    #[tracing::instrument(skip(self, auth_token))]
    pub async fn get_pass(
        &self,
        pass_type_id: &str,
        serial: &str,
        auth_token: &str,
        if_modified_since: Option<i64>,
    ) -> Result<PassFetch, PassServiceError> {
        if pass_type_id != self.pass_type_id {
            return Err(PassServiceError::NotFound(format!(
                "pass type {}",
                pass_type_id
            )));
        }
        let card_id = parse_serial(serial)?;

        let snapshot = self
            .store
            .load_pass_context(card_id)
            .await?
            .ok_or_else(|| PassServiceError::NotFound(format!("pass {}", serial)))?;

        if !tokens::tokens_match(auth_token, &snapshot.card.auth_token) {
            tracing::warn!("Authentication token mismatch");
            return Err(PassServiceError::Unauthorized);
        }

        if if_modified_since == Some(snapshot.card.update_tag) {
            return Ok(PassFetch::NotModified {
                update_tag: snapshot.card.update_tag,
            });
        }

        let artifact = self.builder.build(&snapshot).await?;
        Ok(PassFetch::Fresh(artifact))
    }

    /// Builds the pass for the collaborator API, bypassing device authentication
    pub async fn current_pass(&self, card_id: uuid::Uuid) -> Result<Arc<SignedArtifact>, PassServiceError> {
        let snapshot = self
            .store
            .load_pass_context(card_id)
            .await?
            .ok_or_else(|| PassServiceError::NotFound(format!("card {}", card_id)))?;

        self.builder.build(&snapshot).await
    }

    /// Serials registered to a device whose tag is newer than `since`, oldest change
    /// first. Unknown devices and other pass types yield an empty result.
    #[tracing::instrument(skip(self))]
    pub async fn changed_serials_since(
        &self,
        device_library_id: &str,
        pass_type_id: &str,
        since: Option<i64>,
    ) -> Result<ChangedSerials, PassServiceError> {
        if pass_type_id != self.pass_type_id {
            return Ok(ChangedSerials {
                serials: Vec::new(),
                last_updated: None,
            });
        }

        let changed = self
            .store
            .changed_passes_for_device(device_library_id, pass_type_id, since)
            .await?;

        let last_updated = changed.iter().map(|pass| pass.update_tag).max();
        let mut serials: Vec<String> = Vec::with_capacity(changed.len());
        for pass in changed {
            let serial = pass.card_id.to_string();
            if !serials.contains(&serial) {
                serials.push(serial);
            }
        }

        tracing::debug!(count = serials.len(), ?last_updated, "Changed serials");
        Ok(ChangedSerials {
            serials,
            last_updated,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::card::{NewCardData, PunchRequest};
    use crate::models::{merchant, program, DeviceRegistration, WalletCard};
    use crate::services::pass_builder::fixtures as builder_fixtures;
    use crate::store::{CardStore, MemoryStore, RegistrationStore, TagClock};
    use chrono::Utc;
    use uuid::Uuid;

    const PASS_TYPE: &str = "pass.com.example.punch";

    struct Harness {
        service: UpdateQueryService,
        store: Arc<MemoryStore>,
        program_id: Uuid,
        _assets: tempfile::TempDir,
    }

    fn harness() -> Harness {
        let store = Arc::new(MemoryStore::new(TagClock::Logical));
        let merchant = merchant::fixtures::merchant();
        let program = program::fixtures::program(merchant.id, 5);
        let program_id = program.id;
        store.insert_merchant(merchant);
        store.insert_program(program);

        let (builder, assets) = builder_fixtures::builder();
        Harness {
            service: UpdateQueryService::new(store.clone(), Arc::new(builder), PASS_TYPE),
            store,
            program_id,
            _assets: assets,
        }
    }

    fn card_at(h: &Harness, update_tag: i64) -> WalletCard {
        let program = program::fixtures::program(Uuid::new_v4(), 5);
        let mut card = WalletCard::new_for_program(
            NewCardData {
                user_id: Uuid::new_v4(),
                program_id: h.program_id,
                auth_token: "token".to_string(),
            },
            &program,
            &TagClock::Logical,
            Utc::now(),
        );
        card.update_tag = update_tag;
        h.store.insert_card(card.clone());
        card
    }

    async fn register(h: &Harness, device: &str, card: &WalletCard) {
        h.store
            .upsert_registration(DeviceRegistration {
                device_library_id: device.to_string(),
                pass_type_id: PASS_TYPE.to_string(),
                card_id: card.id,
                push_token: "push".to_string(),
                created_at: Utc::now(),
                updated_at: Utc::now(),
            })
            .await
            .unwrap();
    }

    fn punch() -> PunchRequest {
        PunchRequest {
            amount: 1,
            source: "test".to_string(),
            created_by: None,
        }
    }

    #[tokio::test]
    async fn test_get_pass_not_modified_for_current_tag() {
        let h = harness();
        let card = card_at(&h, 100);
        let serial = card.serial_number();

        let fetch = h
            .service
            .get_pass(PASS_TYPE, &serial, "token", Some(100))
            .await
            .unwrap();
        assert!(matches!(fetch, PassFetch::NotModified { update_tag: 100 }));

        let fetch = h
            .service
            .get_pass(PASS_TYPE, &serial, "token", Some(99))
            .await
            .unwrap();
        match fetch {
            PassFetch::Fresh(artifact) => {
                assert_eq!(artifact.update_tag, 100);
                assert_eq!(artifact.serial, serial);
            }
            other => panic!("expected fresh pass, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_get_pass_after_mutation_returns_new_tag() {
        let h = harness();
        let card = card_at(&h, 100);
        h.store.apply_punch(card.id, punch(), Utc::now()).await.unwrap();

        let fetch = h
            .service
            .get_pass(PASS_TYPE, &card.serial_number(), "token", Some(100))
            .await
            .unwrap();
        assert!(matches!(fetch, PassFetch::Fresh(a) if a.update_tag == 101));
    }

    #[tokio::test]
    async fn test_get_pass_rejects_bad_token_and_unknown_pass() {
        let h = harness();
        let card = card_at(&h, 1);

        assert!(matches!(
            h.service
                .get_pass(PASS_TYPE, &card.serial_number(), "nope", None)
                .await,
            Err(PassServiceError::Unauthorized)
        ));
        assert!(matches!(
            h.service
                .get_pass(PASS_TYPE, &Uuid::new_v4().to_string(), "token", None)
                .await,
            Err(PassServiceError::NotFound(_))
        ));
        assert!(matches!(
            h.service
                .get_pass("pass.other", &card.serial_number(), "token", None)
                .await,
            Err(PassServiceError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_poll_after_punch() {
        let h = harness();
        let card = card_at(&h, 100);
        register(&h, "device-1", &card).await;
        h.store.apply_punch(card.id, punch(), Utc::now()).await.unwrap();

        let changed = h
            .service
            .changed_serials_since("device-1", PASS_TYPE, Some(100))
            .await
            .unwrap();
        assert_eq!(changed.serials, vec![card.serial_number()]);
        assert_eq!(changed.last_updated, Some(101));

        let changed = h
            .service
            .changed_serials_since("device-1", PASS_TYPE, Some(101))
            .await
            .unwrap();
        assert!(changed.is_empty());
        assert_eq!(changed.last_updated, None);
    }

    #[tokio::test]
    async fn test_changed_serials_ordered_by_tag() {
        let h = harness();
        let newest = card_at(&h, 30);
        let oldest = card_at(&h, 10);
        let middle = card_at(&h, 20);
        let unregistered = card_at(&h, 40);
        for card in [&newest, &oldest, &middle] {
            register(&h, "device-1", card).await;
        }
        register(&h, "device-2", &unregistered).await;

        let changed = h
            .service
            .changed_serials_since("device-1", PASS_TYPE, None)
            .await
            .unwrap();
        assert_eq!(
            changed.serials,
            vec![
                oldest.serial_number(),
                middle.serial_number(),
                newest.serial_number()
            ]
        );
        assert_eq!(changed.last_updated, Some(30));

        let changed = h
            .service
            .changed_serials_since("device-1", PASS_TYPE, Some(15))
            .await
            .unwrap();
        assert_eq!(
            changed.serials,
            vec![middle.serial_number(), newest.serial_number()]
        );

        let unknown = h
            .service
            .changed_serials_since("device-9", PASS_TYPE, None)
            .await
            .unwrap();
        assert!(unknown.is_empty());
    }
}
