pub mod capture;
pub mod delivery;
pub mod destination;
pub mod event;
pub mod filter;
pub mod health;
pub mod metrics;
pub mod retry;
pub mod store;
pub mod transport;

/// Client identifier sent with every outbound call.
pub const USER_AGENT: &str = "Hookshot/1.0";
