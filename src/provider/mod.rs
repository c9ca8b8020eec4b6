pub mod database;
pub mod memory;
pub mod registry;
pub mod service;
