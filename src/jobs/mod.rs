// Background jobs

pub mod expiration_sweep;
