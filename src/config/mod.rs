pub mod loader;
pub mod manifest;
pub mod types;
pub mod validator;
