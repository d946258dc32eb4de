//! beast-core: Beast protocol framing and Mode S message plumbing.
//!
//! No async, no I/O — just algorithms. This crate is the shared core used by
//! the `beast-splitter` daemon: the frame decoder, the CRC/FEC machinery,
//! the tri-state receiver settings model, and the client filter fan-out.

pub mod crc;
pub mod filter;
pub mod framer;
pub mod message;
pub mod settings;

// Re-export commonly used types at crate root
pub use filter::{Filter, FilterDistributor, Handle};
pub use framer::Framer;
pub use message::{Message, MessageKind, TimestampDomain};
pub use settings::{Settings, SettingsError, TriState};
