pub mod backend;
pub mod cache;
pub mod discovery;
pub mod fingerprint;
pub mod models;
pub mod schema;
pub mod sqlite;
