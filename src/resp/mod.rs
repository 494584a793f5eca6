//! RESP (Redis Serialization Protocol) subset used by pub/sub traffic.
//!
//! Only arrays, bulk strings and integers are understood. Any other type
//! byte is a fatal parse error.

pub mod frame;
pub mod parser;

pub use frame::Frame;
pub use parser::{parse, ParseResult};
