use std::sync::Arc;

use crate::config::Config;
use crate::services::{
    assets::AssetStore,
    ledger::RegistrationLedger,
    loyalty::LoyaltyService,
    notifier::UpdateNotifier,
    pass_builder::PassBuilder,
    renderer::RenderContext,
    signer::SigningCredentialStore,
    update_query::UpdateQueryService,
};
use crate::store::PassStore;

/// Shared application state handed to every handler
#[derive(Clone)]
pub struct AppState {
    pub config: Config,
    pub store: Arc<dyn PassStore>,
    pub builder: Arc<PassBuilder>,
    pub ledger: RegistrationLedger,
    pub updates: UpdateQueryService,
    pub loyalty: LoyaltyService,
}

impl AppState {
    pub fn new(
        config: Config,
        store: Arc<dyn PassStore>,
        credentials: SigningCredentialStore,
        notifier: Arc<dyn UpdateNotifier>,
    ) -> Self {
        let context = RenderContext {
            pass_type_id: config.pass_type_id.clone(),
            team_id: config.team_id.clone(),
            organization_name: config.organization_name.clone(),
            web_service_url: config.base_url.trim_end_matches('/').to_string(),
        };
        let builder = Arc::new(PassBuilder::new(
            context,
            AssetStore::new(&config.assets_dir),
            Arc::new(credentials),
        ));

        Self {
            ledger: RegistrationLedger::new(store.clone(), config.pass_type_id.clone()),
            updates: UpdateQueryService::new(
                store.clone(),
                builder.clone(),
                config.pass_type_id.clone(),
            ),
            loyalty: LoyaltyService::new(store.clone(), notifier, config.pass_type_id.clone()),
            builder,
            store,
            config,
        }
    }
}
