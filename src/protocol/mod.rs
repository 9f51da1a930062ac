//! RESP protocol implementation

pub mod reply;
pub mod resp;

pub use reply::{Reply, ReplyWriter};
pub use resp::read_command;
