//! tetiresd - Tire-wear acquisition daemon
//!
//! Loads a [`TetiresConfig`], starts the connection manager, the USB
//! hot-plug watcher and the acquisition session, and drives them from a
//! line-oriented [`Console`].

pub mod config;
pub mod console;
pub mod daemon;
pub mod processor;
pub mod store;

pub use config::{ConfigError, TetiresConfig};
pub use console::{Console, ConsoleCommand, ConsoleError, Reply};
pub use daemon::Daemon;
pub use processor::CommandProcessor;
pub use store::{JsonLinesStore, StoredRecord};
