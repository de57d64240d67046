//! Token models shared by the acquirer, cache, and stores.

pub mod record;
pub mod secret;
