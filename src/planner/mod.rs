pub mod diff;
pub mod plan;
