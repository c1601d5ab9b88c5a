// Models module - Database entity representations

pub mod card;
pub mod merchant;
pub mod program;
pub mod registration;

pub use card::{Balance, CardStatus, WalletCard};
pub use merchant::Merchant;
pub use program::{ExpirationType, PunchProgram};
pub use registration::{DeviceRegistration, RegistrationKey, RegistrationOutcome};

/// Card, program and merchant read together as one snapshot
#[derive(Debug, Clone)]
pub struct PassContext {
    pub card: WalletCard,
    pub program: PunchProgram,
    pub merchant: Merchant,
}
