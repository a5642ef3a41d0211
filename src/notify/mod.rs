//! Notification Module
//!
//! Persistent-connection pub/sub endpoint. Watchers authenticate with a
//! shared secret, fetch the current value with `Echo`, then subscribe to
//! the topic derived from their config key and receive every subsequent
//! publish as a pushed frame.

mod protocol;
mod server;

pub use protocol::{read_frame, write_frame, Frame, FrameHeader};
pub use server::{NotifyHub, NotifyServer};
