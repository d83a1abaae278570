//! Mock probes and devices for testing
//!
//! A [`MockDevice`] stands in for the sensor on the far end of a link: tests
//! push bytes into its read side, inspect the lines written to it, unplug it
//! or make the next open fail. [`MockUsbProbe`] and [`MockBluetoothProbe`]
//! expose a set of such devices through the regular probe traits.

use std::collections::VecDeque;
use std::io::{self, Read, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use super::{BluetoothProbe, LinkIo, PairedDevice, TransportError, UsbDeviceInfo, UsbProbe};
use crate::config::SerialParams;

enum Chunk {
    Bytes(Vec<u8>),
    /// Make the reader panic, to exercise reader failure handling
    Crash,
}

#[derive(Default)]
struct DeviceState {
    present: bool,
    fail_next_open: Option<TransportError>,
    fail_opens: Option<TransportError>,
    opens: usize,
    link: Option<mpsc::Sender<Chunk>>,
    written: Vec<String>,
    fail_writes: bool,
    samples_on_start: usize,
}

/// Simulated sensor end of a serial link
#[derive(Clone)]
pub struct MockDevice {
    state: Arc<Mutex<DeviceState>>,
}

impl Default for MockDevice {
    fn default() -> Self {
        Self::new()
    }
}

impl MockDevice {
    /// A present (attached or paired) device
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(DeviceState {
                present: true,
                ..Default::default()
            })),
        }
    }

    /// Open the device end; fails when absent or when a failure is queued
    pub fn open_link(&self, read_timeout: Duration) -> Result<LinkIo, TransportError> {
        let mut state = self.state.lock();
        if !state.present {
            return Err(TransportError::NotAvailable("mock device absent".to_string()));
        }
        if let Some(err) = state.fail_next_open.take() {
            return Err(err);
        }
        if let Some(err) = &state.fail_opens {
            return Err(err.clone());
        }

        let (tx, rx) = mpsc::channel();
        state.link = Some(tx);
        state.opens += 1;

        Ok(LinkIo {
            reader: Box::new(MockReader {
                rx,
                pending: VecDeque::new(),
                timeout: read_timeout,
            }),
            writer: Box::new(MockWriter {
                device: self.clone(),
                partial: Vec::new(),
            }),
        })
    }

    pub fn set_present(&self, present: bool) {
        self.state.lock().present = present;
    }

    pub fn is_present(&self) -> bool {
        self.state.lock().present
    }

    /// Remove the device: absent from now on and the open link hangs up
    pub fn unplug(&self) {
        self.set_present(false);
        self.hang_up();
    }

    /// Drop the link from the device side; the reader sees a broken pipe
    pub fn hang_up(&self) {
        self.state.lock().link = None;
    }

    pub fn crash_reader(&self) {
        self.push(Chunk::Crash);
    }

    pub fn fail_next_open(&self, err: TransportError) {
        self.state.lock().fail_next_open = Some(err);
    }

    /// Fail every open with `err` until cleared with `None`
    pub fn set_fail_opens(&self, err: Option<TransportError>) {
        self.state.lock().fail_opens = err;
    }

    pub fn set_fail_writes(&self, fail: bool) {
        self.state.lock().fail_writes = fail;
    }

    /// Times the device has been opened
    pub fn open_count(&self) -> usize {
        self.state.lock().opens
    }

    pub fn is_linked(&self) -> bool {
        self.state.lock().link.is_some()
    }

    pub fn inject_bytes(&self, bytes: &[u8]) {
        // An empty read means end of stream to the reader
        if bytes.is_empty() {
            return;
        }
        self.push(Chunk::Bytes(bytes.to_vec()));
    }

    pub fn inject_line(&self, line: &str) {
        self.inject_bytes(format!("{}\n", line).as_bytes());
    }

    /// Lines written to the device, without delimiters
    pub fn written(&self) -> Vec<String> {
        self.state.lock().written.clone()
    }

    /// Stream `samples` readings whenever `START` is written
    pub fn respond_to_start(&self, samples: usize) -> &Self {
        self.state.lock().samples_on_start = samples;
        self
    }

    fn push(&self, chunk: Chunk) {
        if let Some(tx) = &self.state.lock().link {
            let _ = tx.send(chunk);
        }
    }

    fn on_line(&self, line: String) {
        let samples = {
            let mut state = self.state.lock();
            let samples = if line == "START" { state.samples_on_start } else { 0 };
            state.written.push(line);
            samples
        };
        if samples > 0 {
            self.inject_bytes(demo_samples(samples).as_bytes());
        }
    }
}

/// Plausible-looking "index,adc,millivolts" lines
fn demo_samples(count: usize) -> String {
    let mut out = String::with_capacity(count * 16);
    for i in 0..count {
        let adc = 1800 + (i * 37 % 400);
        let mv = adc * 3300 / 4095;
        out.push_str(&format!("{},{},{}\n", i, adc, mv));
    }
    out
}

struct MockReader {
    rx: mpsc::Receiver<Chunk>,
    pending: VecDeque<u8>,
    timeout: Duration,
}

impl Read for MockReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.pending.is_empty() {
            match self.rx.recv_timeout(self.timeout) {
                Ok(Chunk::Bytes(bytes)) => self.pending.extend(bytes),
                Ok(Chunk::Crash) => panic!("mock device crashed the reader"),
                Err(mpsc::RecvTimeoutError::Timeout) => {
                    return Err(io::Error::new(io::ErrorKind::TimedOut, "read timed out"))
                }
                Err(mpsc::RecvTimeoutError::Disconnected) => {
                    return Err(io::Error::new(io::ErrorKind::BrokenPipe, "device hung up"))
                }
            }
        }

        let n = buf.len().min(self.pending.len());
        for (slot, byte) in buf.iter_mut().zip(self.pending.drain(..n)) {
            *slot = byte;
        }
        Ok(n)
    }
}

struct MockWriter {
    device: MockDevice,
    partial: Vec<u8>,
}

impl Write for MockWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if self.device.state.lock().fail_writes {
            return Err(io::Error::new(io::ErrorKind::BrokenPipe, "write rejected"));
        }
        for &byte in buf {
            if byte == b'\n' {
                let line = String::from_utf8_lossy(&self.partial).to_string();
                self.partial.clear();
                self.device.on_line(line);
            } else {
                self.partial.push(byte);
            }
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// USB probe over a set of mock devices
#[derive(Clone, Default)]
pub struct MockUsbProbe {
    devices: Arc<Mutex<Vec<(UsbDeviceInfo, MockDevice)>>>,
    enumeration_delay: Arc<Mutex<Duration>>,
}

impl MockUsbProbe {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach a device; returns its handle
    pub fn add_device(&self, info: UsbDeviceInfo) -> MockDevice {
        let device = MockDevice::new();
        self.devices.lock().push((info, device.clone()));
        device
    }

    /// Make every enumeration block the calling thread this long
    pub fn set_enumeration_delay(&self, delay: Duration) {
        *self.enumeration_delay.lock() = delay;
    }

    pub fn ftdi_info(port: &str) -> UsbDeviceInfo {
        UsbDeviceInfo {
            port_name: port.to_string(),
            vid: 0x0403,
            pid: 0x6001,
            manufacturer: Some("FTDI".to_string()),
            product: Some("FT232R USB UART".to_string()),
        }
    }

    pub fn ch340_info(port: &str) -> UsbDeviceInfo {
        UsbDeviceInfo {
            port_name: port.to_string(),
            vid: 0x1A86,
            pid: 0x7523,
            manufacturer: Some("QinHeng Electronics".to_string()),
            product: Some("CH340 serial converter".to_string()),
        }
    }
}

impl UsbProbe for MockUsbProbe {
    fn list_devices(&self) -> Result<Vec<UsbDeviceInfo>, TransportError> {
        block_for(*self.enumeration_delay.lock());
        Ok(self
            .devices
            .lock()
            .iter()
            .filter(|(_, d)| d.is_present())
            .map(|(info, _)| info.clone())
            .collect())
    }

    fn open(&self, device: &UsbDeviceInfo, params: &SerialParams) -> Result<LinkIo, TransportError> {
        let found = self
            .devices
            .lock()
            .iter()
            .find(|(info, _)| info.port_name == device.port_name)
            .map(|(_, d)| d.clone());
        found
            .ok_or_else(|| TransportError::NotAvailable(device.port_name.clone()))?
            .open_link(params.read_timeout)
    }
}

/// Bluetooth probe over a set of mock paired devices
#[derive(Clone)]
pub struct MockBluetoothProbe {
    devices: Arc<Mutex<Vec<(PairedDevice, MockDevice)>>>,
    enabled: Arc<AtomicBool>,
    permission_denied: Arc<AtomicBool>,
    lookup_delay: Arc<Mutex<Duration>>,
}

impl Default for MockBluetoothProbe {
    fn default() -> Self {
        Self::new()
    }
}

impl MockBluetoothProbe {
    pub fn new() -> Self {
        Self {
            devices: Arc::new(Mutex::new(Vec::new())),
            enabled: Arc::new(AtomicBool::new(true)),
            permission_denied: Arc::new(AtomicBool::new(false)),
            lookup_delay: Arc::new(Mutex::new(Duration::ZERO)),
        }
    }

    /// Pair a device; returns its handle
    pub fn add_device(&self, paired: PairedDevice) -> MockDevice {
        let device = MockDevice::new();
        self.devices.lock().push((paired, device.clone()));
        device
    }

    pub fn set_adapter_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::SeqCst);
    }

    /// Make the pairing list unreadable
    pub fn set_permission_denied(&self, denied: bool) {
        self.permission_denied.store(denied, Ordering::SeqCst);
    }

    /// Make every pairing lookup block the calling thread this long
    pub fn set_lookup_delay(&self, delay: Duration) {
        *self.lookup_delay.lock() = delay;
    }
}

impl BluetoothProbe for MockBluetoothProbe {
    fn adapter_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    fn paired_devices(&self) -> Result<Vec<PairedDevice>, TransportError> {
        block_for(*self.lookup_delay.lock());
        if self.permission_denied.load(Ordering::SeqCst) {
            return Err(TransportError::PermissionDenied(
                "Bluetooth permission not granted".to_string(),
            ));
        }
        Ok(self
            .devices
            .lock()
            .iter()
            .filter(|(_, d)| d.is_present())
            .map(|(p, _)| p.clone())
            .collect())
    }

    fn open(
        &self,
        device: &PairedDevice,
        _service_uuid: &str,
        params: &SerialParams,
    ) -> Result<LinkIo, TransportError> {
        let found = self
            .devices
            .lock()
            .iter()
            .find(|(p, _)| p.address.eq_ignore_ascii_case(&device.address))
            .map(|(_, d)| d.clone());
        found
            .ok_or_else(|| TransportError::NotAvailable(device.address.clone()))?
            .open_link(params.read_timeout)
    }
}

/// Stand-in for a slow host query
fn block_for(delay: Duration) {
    if !delay.is_zero() {
        std::thread::sleep(delay);
    }
}
