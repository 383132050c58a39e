//! SSH session upkeep.
//!
//! - Keep-alive heartbeat (preventing idle timeouts)

pub mod keepalive;

pub use keepalive::{ignore_message, Keepalive, KEEPALIVE_DATA_LEN};
