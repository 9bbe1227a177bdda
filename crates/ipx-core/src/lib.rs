pub mod config;
pub mod tables;

pub use config::*;
pub use tables::*;
