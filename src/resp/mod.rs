pub mod parser;
pub mod types;

pub use parser::{parse, parse_slice};
pub use types::RespValue;
