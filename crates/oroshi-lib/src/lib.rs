pub mod models;
pub mod prelude;
pub mod traits;

/// This is used to ensure both application and adapter crates use the same version
pub static LIB_VERSION: &str = env!("CARGO_PKG_VERSION");
