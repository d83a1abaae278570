//! tetires-session - Tire-position acquisition
//!
//! The [`AcquisitionSession`] consumes records from the connection manager,
//! collects one batch per tire position and hands it to a
//! [`ProcessingBackend`]. Results are kept per position until
//! [`SessionHandle::save_all`] writes them through a [`PersistenceBackend`].
//! Records that are not part of a scan go to the [`TerminalLog`].

pub mod backend;
pub mod config;
pub mod error;
pub mod link;
pub mod processing;
pub mod session;
pub mod terminal;

pub use backend::{
    CheckSummary, PersistenceBackend, PersistenceError, ProcessingBackend, ProcessingError,
};
pub use config::{SessionConfig, SessionConfigError};
pub use error::SessionError;
pub use link::DeviceLink;
pub use processing::{Measurement, ProcessingResponse};
pub use session::{AcquisitionSession, Backends, SessionHandle, SessionSnapshot, Selection};
pub use terminal::TerminalLog;
