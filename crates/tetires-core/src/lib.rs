//! tetires-core - Core types for the tire-wear acquisition stack
//!
//! This crate holds the pieces shared by every layer: the data model for
//! devices, records and scan results, the failure taxonomy, the newline
//! framer that turns serial byte chunks into records, and the single-writer
//! state holder used to publish observable state.

pub mod error;
pub mod framing;
pub mod models;
pub mod state;

pub use error::FailureKind;
pub use framing::{FramerStats, LineFramer, DEFAULT_MAX_LINE_LEN};
pub use models::*;
pub use state::{StatePublisher, StateView};
