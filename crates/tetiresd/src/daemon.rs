//! Wiring of manager, watcher and session

use std::sync::Arc;

use tetires_link::config::UsbBackend;
use tetires_link::{spawn_usb_watcher, ConnectionHandle, ConnectionManager, Probes};
use tetires_session::{
    AcquisitionSession, Backends, ProcessingBackend, SessionHandle, TerminalLog,
};
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::config::TetiresConfig;
use crate::console::Console;
use crate::processor::{CommandProcessor, UnconfiguredProcessor};
use crate::store::JsonLinesStore;

/// A running acquisition stack
pub struct Daemon {
    pub link: ConnectionHandle,
    pub session: SessionHandle,
    watcher: Option<JoinHandle<()>>,
}

impl Daemon {
    /// Start with the collaborators named in `config`
    pub fn start(config: &TetiresConfig) -> Self {
        let processing: Arc<dyn ProcessingBackend> =
            match CommandProcessor::from_config(&config.processing) {
                Some(processor) => Arc::new(processor),
                None => {
                    warn!("No processing program configured; scans will fail to process");
                    Arc::new(UnconfiguredProcessor)
                }
            };
        let backends = Backends {
            processing,
            persistence: Arc::new(JsonLinesStore::new(config.persistence.path.clone())),
        };
        Self::start_with(config, backends)
    }

    pub fn start_with(config: &TetiresConfig, backends: Backends) -> Self {
        let probes = Probes::from_config(&config.link, config.session.batch_capacity);
        let link = ConnectionManager::spawn(config.link.clone(), probes.clone());

        // Mock devices never come and go on their own
        let watcher = match config.link.usb.backend {
            UsbBackend::Serial => Some(spawn_usb_watcher(
                probes.usb.clone(),
                config.link.hotplug.poll_interval(),
                link.clone(),
            )),
            UsbBackend::Mock => None,
        };

        let log = TerminalLog::new(config.session.log_capacity);
        let session = AcquisitionSession::spawn(
            config.session.clone(),
            Arc::new(link.clone()),
            backends,
            log,
        );

        info!(
            usb = ?config.link.usb.backend,
            bluetooth = ?config.link.bluetooth.backend,
            batch = config.session.batch_capacity,
            "Acquisition stack started"
        );
        Self {
            link,
            session,
            watcher,
        }
    }

    pub fn console(&self) -> Console {
        Console::new(self.link.clone(), self.session.clone())
    }

    pub async fn shutdown(mut self) {
        if let Some(watcher) = self.watcher.take() {
            watcher.abort();
        }
        if let Err(e) = self.session.shutdown().await {
            warn!(error = %e, "Session shutdown");
        }
        if let Err(e) = self.link.shutdown().await {
            warn!(error = %e, "Connection manager shutdown");
        }
        info!("Acquisition stack stopped");
    }
}
