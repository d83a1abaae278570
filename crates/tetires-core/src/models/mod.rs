//! Shared data models for the acquisition stack

mod device;
mod record;
mod scan;
mod tire;

pub mod wear;

pub use device::*;
pub use record::*;
pub use scan::*;
pub use tire::*;
