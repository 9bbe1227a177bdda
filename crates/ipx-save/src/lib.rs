pub mod command;
pub mod counters;
pub mod error;
pub mod parser;
pub mod rule;

pub use command::SaveCommand;
pub use error::*;
pub use parser::{Parser, parse_dump, parse_iptables_save, parse_iptables_save_async};
