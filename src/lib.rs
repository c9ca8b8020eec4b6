pub mod config;
pub mod dag;
pub mod engine;
pub mod executor;
pub mod output;
pub mod planner;
pub mod provider;
pub mod reconcile;
pub mod recovery;
pub mod state;
