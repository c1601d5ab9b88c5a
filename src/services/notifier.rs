use async_trait::async_trait;
use std::fmt::Debug;

use crate::models::{DeviceRegistration, WalletCard};

/// Receives the devices that hold a stale copy of a pass after it changed.
/// Delivering the actual push is up to the implementation.
#[async_trait]
pub trait UpdateNotifier: Send + Sync + Debug {
    async fn passes_updated(&self, card: &WalletCard, registrations: &[DeviceRegistration]);

    /// The card expires in `days_left` days; its holder should be reminded to visit
    async fn expiration_warning(
        &self,
        card: &WalletCard,
        registrations: &[DeviceRegistration],
        days_left: i64,
    );
}

/// Records pending pushes in the log
#[derive(Debug, Default)]
pub struct TracingNotifier;

#[async_trait]
impl UpdateNotifier for TracingNotifier {
    async fn passes_updated(&self, card: &WalletCard, registrations: &[DeviceRegistration]) {
        if registrations.is_empty() {
            tracing::debug!(card_id = %card.id, update_tag = card.update_tag, "No devices to notify");
            return;
        }

        for registration in registrations {
            tracing::info!(
                card_id = %card.id,
                update_tag = card.update_tag,
                device_id = %registration.device_library_id,
                "Pass update pending push"
            );
        }
    }

    async fn expiration_warning(
        &self,
        card: &WalletCard,
        registrations: &[DeviceRegistration],
        days_left: i64,
    ) {
        for registration in registrations {
            tracing::info!(
                card_id = %card.id,
                days_left,
                device_id = %registration.device_library_id,
                "Expiration warning pending push"
            );
        }
    }
}
