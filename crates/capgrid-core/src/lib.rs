pub mod config;
pub mod types;

pub use config::CapgridConfig;
pub use types::*;
