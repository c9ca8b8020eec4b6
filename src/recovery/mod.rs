pub mod classify;
pub mod idempotency;
pub mod manager;
