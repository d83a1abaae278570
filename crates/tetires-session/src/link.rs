//! The session's view of the connection manager

use async_trait::async_trait;
use tetires_core::{ConnectionSnapshot, LinkEvent};
use tetires_link::{ConnectionHandle, LinkError};
use tokio::sync::broadcast;

/// What the session needs from the device link
#[async_trait]
pub trait DeviceLink: Send + Sync {
    async fn send_command(&self, line: &str) -> Result<(), LinkError>;

    /// Ask for an arbitration pass
    async fn auto_detect(&self) -> Result<(), LinkError>;

    fn subscribe(&self) -> broadcast::Receiver<LinkEvent>;

    fn snapshot(&self) -> ConnectionSnapshot;
}

#[async_trait]
impl DeviceLink for ConnectionHandle {
    async fn send_command(&self, line: &str) -> Result<(), LinkError> {
        ConnectionHandle::send_command(self, line).await
    }

    async fn auto_detect(&self) -> Result<(), LinkError> {
        ConnectionHandle::auto_detect(self).await
    }

    fn subscribe(&self) -> broadcast::Receiver<LinkEvent> {
        ConnectionHandle::subscribe(self)
    }

    fn snapshot(&self) -> ConnectionSnapshot {
        ConnectionHandle::snapshot(self)
    }
}
