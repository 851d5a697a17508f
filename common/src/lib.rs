//! Shared building blocks for the flash-sync hub, its device clients, and
//! the offline validator.

pub mod backoff;
pub mod client;
pub mod config;
pub mod discovery;
pub mod error;
pub mod framing;
pub mod protocol;
pub mod session;
pub mod timesync;

pub use error::{SyncError, SyncResult};
