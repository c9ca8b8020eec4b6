pub mod builder;
pub mod resolver;
