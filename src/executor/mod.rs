pub mod engine;
pub mod enhanced;
pub mod progress;
pub mod result;
pub mod retry;
