pub mod drift;
pub mod manager;
pub mod rules;
