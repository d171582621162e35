pub mod hash;
pub mod parse;
pub mod ts;
pub mod types;

pub use parse::{extract_command, parse_entry, ParseFailure};
pub use types::*;
