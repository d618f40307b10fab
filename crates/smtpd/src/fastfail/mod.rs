//! Built-in policy hooks that reject early, before a message is
//! transferred.
pub mod log_delivery;
pub mod max_rcpt;
pub mod message_size;
pub mod resolvable_helo;
