//! USB hot-plug watcher
//!
//! Polls USB-serial enumeration and turns set differences into attach and
//! detach notifications for the connection manager.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use tetires_core::HotplugEvent;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::manager::ConnectionHandle;
use crate::transport::UsbProbe;

/// Spawn the watcher; it stops once the manager is gone
pub fn spawn_usb_watcher(
    probe: Arc<dyn UsbProbe>,
    interval: Duration,
    handle: ConnectionHandle,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut known = match enumerate(&probe).await {
            Some(ports) => ports,
            None => BTreeSet::new(),
        };
        debug!(ports = known.len(), "USB watcher started");

        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        ticker.tick().await;

        loop {
            ticker.tick().await;
            let Some(current) = enumerate(&probe).await else {
                continue;
            };

            for event in diff(&known, &current) {
                info!(?event, "USB hot-plug");
                if handle.hotplug(event).await.is_err() {
                    debug!("Connection manager gone, USB watcher exiting");
                    return;
                }
            }
            known = current;
        }
    })
}

async fn enumerate(probe: &Arc<dyn UsbProbe>) -> Option<BTreeSet<String>> {
    let probe = probe.clone();
    match tokio::task::spawn_blocking(move || probe.list_devices()).await {
        Ok(Ok(devices)) => Some(devices.into_iter().map(|d| d.port_name).collect()),
        Ok(Err(e)) => {
            warn!(error = %e, "USB enumeration failed");
            None
        }
        Err(e) => {
            warn!(error = %e, "USB enumeration task failed");
            None
        }
    }
}

/// Detaches first, so a port that was swapped is released before reuse
fn diff(before: &BTreeSet<String>, after: &BTreeSet<String>) -> Vec<HotplugEvent> {
    let detached = before.difference(after).map(|p| HotplugEvent::Detached {
        port: Some(p.clone()),
    });
    let attached = after.difference(before).map(|p| HotplugEvent::Attached {
        port: Some(p.clone()),
    });
    detached.chain(attached).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::LinkConfig;
    use crate::manager::ConnectionManager;
    use crate::transport::mock::{MockBluetoothProbe, MockUsbProbe};
    use crate::transport::Probes;
    use tetires_core::{ConnectionState, DeviceType};

    fn set(ports: &[&str]) -> BTreeSet<String> {
        ports.iter().map(|p| p.to_string()).collect()
    }

    #[test]
    fn test_diff_orders_detach_before_attach() {
        let events = diff(&set(&["/dev/ttyUSB0"]), &set(&["/dev/ttyUSB1"]));
        assert_eq!(
            events,
            vec![
                HotplugEvent::Detached {
                    port: Some("/dev/ttyUSB0".to_string())
                },
                HotplugEvent::Attached {
                    port: Some("/dev/ttyUSB1".to_string())
                },
            ]
        );
        assert!(diff(&set(&["a"]), &set(&["a"])).is_empty());
    }

    #[tokio::test]
    async fn test_watcher_reports_attach_to_manager() {
        let usb = MockUsbProbe::new();
        let mut config = LinkConfig::default();
        config.hotplug.attach_settle_ms = 10;
        let probes = Probes {
            usb: Arc::new(usb.clone()),
            bluetooth: Arc::new(MockBluetoothProbe::new()),
        };
        let handle = ConnectionManager::spawn(config, probes);
        let watcher = spawn_usb_watcher(
            Arc::new(usb.clone()),
            Duration::from_millis(20),
            handle.clone(),
        );

        tokio::time::sleep(Duration::from_millis(50)).await;
        usb.add_device(MockUsbProbe::ftdi_info("/dev/ttyUSB0"));

        let mut state = handle.state();
        let snapshot = state
            .wait_for(Duration::from_secs(2), |s| s.is_connected())
            .await
            .expect("USB never connected");
        assert_eq!(snapshot.device_type, DeviceType::Usb);
        assert_eq!(snapshot.state, ConnectionState::Connected);

        watcher.abort();
    }
}
