pub mod check;
pub mod serve;

// Re-export command functions for convenience
pub use check::check_config;
pub use serve::{serve, ServeParams};
