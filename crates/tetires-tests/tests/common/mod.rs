//! Shared fixtures for scenario tests
#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tetires_core::{ConnectionSnapshot, DeviceType, TirePosition, TireScanResult};
use tetires_link::transport::mock::{MockBluetoothProbe, MockDevice, MockUsbProbe};
use tetires_link::transport::PairedDevice;
use tetires_link::{ConnectionHandle, ConnectionManager, LinkConfig, Probes};
use tetires_session::{
    AcquisitionSession, Backends, CheckSummary, Measurement, PersistenceBackend,
    PersistenceError, ProcessingBackend, ProcessingError, SessionConfig, SessionHandle,
    SessionSnapshot, TerminalLog,
};

pub const WAIT: Duration = Duration::from_secs(5);

/// Batch size the sensor firmware streams per scan
pub const BATCH: usize = 1110;

pub fn fast_link_config() -> LinkConfig {
    let mut config = LinkConfig::default();
    config.usb.read_timeout_ms = 10;
    config.bluetooth.read_timeout_ms = 10;
    config.reconnect.bluetooth_retry_interval_ms = 30;
    config.hotplug.attach_settle_ms = 10;
    config.hotplug.detach_settle_ms = 10;
    config.hotplug.usb_fallback_settle_ms = 10;
    config.hotplug.manual_connect_settle_ms = 10;
    config
}

/// Mock probes a test adds devices to before spawning the manager
#[derive(Default)]
pub struct Bench {
    pub usb: MockUsbProbe,
    pub bluetooth: MockBluetoothProbe,
}

impl Bench {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn hc05(&self) -> MockDevice {
        self.bluetooth
            .add_device(PairedDevice::new("HC-05", "98:D3:31:F5:2A:10"))
    }

    pub fn ftdi(&self, port: &str) -> MockDevice {
        self.usb.add_device(MockUsbProbe::ftdi_info(port))
    }

    pub fn spawn_link(&self) -> ConnectionHandle {
        ConnectionManager::spawn(
            fast_link_config(),
            Probes {
                usb: Arc::new(self.usb.clone()),
                bluetooth: Arc::new(self.bluetooth.clone()),
            },
        )
    }
}

pub fn spawn_session(
    link: &ConnectionHandle,
    batch_capacity: usize,
    processing: Arc<dyn ProcessingBackend>,
    persistence: Arc<dyn PersistenceBackend>,
) -> SessionHandle {
    AcquisitionSession::spawn(
        SessionConfig {
            batch_capacity,
            ..Default::default()
        },
        Arc::new(link.clone()),
        Backends {
            processing,
            persistence,
        },
        TerminalLog::default(),
    )
}

pub async fn wait_link(
    link: &ConnectionHandle,
    pred: impl FnMut(&ConnectionSnapshot) -> bool,
) -> ConnectionSnapshot {
    link.state()
        .wait_for(WAIT, pred)
        .await
        .unwrap_or_else(|| panic!("link never matched, last: {:?}", link.snapshot()))
}

pub fn connected(kind: DeviceType) -> impl FnMut(&ConnectionSnapshot) -> bool {
    move |s| s.is_connected() && s.device_type == kind
}

pub async fn wait_session(
    session: &SessionHandle,
    pred: impl FnMut(&SessionSnapshot) -> bool,
) -> SessionSnapshot {
    session
        .state()
        .wait_for(WAIT, pred)
        .await
        .unwrap_or_else(|| panic!("session never matched, last: {:?}", session.snapshot()))
}

pub fn measurement(samples: usize) -> Measurement {
    Measurement {
        grooves: [3.2, 2.9, 1.5, 3.0],
        thickness_mm: 2.6,
        adc_mean: 1875.0,
        adc_std: 15.2,
        voltage_mv: 1511.0,
        is_worn: true,
        sample_count: samples,
    }
}

/// Records every batch size; fails the calls listed in `fail_calls`
#[derive(Default)]
pub struct RecordingProcessor {
    batches: Mutex<Vec<usize>>,
    fail_calls: Vec<usize>,
}

impl RecordingProcessor {
    pub fn failing_on(calls: &[usize]) -> Self {
        Self {
            batches: Mutex::new(Vec::new()),
            fail_calls: calls.to_vec(),
        }
    }

    pub fn batches(&self) -> Vec<usize> {
        self.batches.lock().clone()
    }
}

#[async_trait]
impl ProcessingBackend for RecordingProcessor {
    async fn process(&self, samples: Vec<String>) -> Result<Measurement, ProcessingError> {
        let call = {
            let mut batches = self.batches.lock();
            batches.push(samples.len());
            batches.len() - 1
        };
        if self.fail_calls.contains(&call) {
            return Err(ProcessingError::Failed(
                "Groove profile not found".to_string(),
            ));
        }
        Ok(measurement(samples.len()))
    }
}

/// In-memory store; saving `fail_on` fails while `failing` is set
#[derive(Default)]
pub struct MemoryStore {
    pub saved: Mutex<Vec<(i64, TireScanResult)>>,
    pub summaries: Mutex<Vec<CheckSummary>>,
    fail_on: Mutex<Option<TirePosition>>,
}

impl MemoryStore {
    pub fn fail_on(&self, position: Option<TirePosition>) {
        *self.fail_on.lock() = position;
    }

    pub fn saved_positions(&self) -> Vec<TirePosition> {
        self.saved.lock().iter().map(|(_, r)| r.position).collect()
    }
}

#[async_trait]
impl PersistenceBackend for MemoryStore {
    async fn save_position(
        &self,
        check_id: i64,
        result: TireScanResult,
    ) -> Result<(), PersistenceError> {
        if *self.fail_on.lock() == Some(result.position) {
            return Err(PersistenceError::Storage(format!(
                "constraint failed for {}",
                result.position
            )));
        }
        self.saved.lock().push((check_id, result));
        Ok(())
    }

    async fn finalize_check(&self, summary: CheckSummary) -> Result<(), PersistenceError> {
        self.summaries.lock().push(summary);
        Ok(())
    }
}
