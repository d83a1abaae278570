//! USB-serial transport
//!
//! Device discovery goes through a [`UsbProbe`] so arbitration can ask
//! "is anything attached?" without opening a port. When several adapters
//! are attached the configured chip priority decides which one is used.

use std::sync::Arc;

use async_trait::async_trait;
use tetires_core::DeviceType;
use tokio::sync::broadcast;
use tracing::{debug, info};

use super::reader::SerialLink;
use super::serial::open_serial;
use super::{DisconnectReason, LinkIo, Transport, TransportError, TransportEvent};
use crate::config::{FramingConfig, SerialParams, UsbConfig};
use crate::gauge::TaskGauge;

/// One enumerated USB-serial port
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UsbDeviceInfo {
    /// OS port name, e.g. `/dev/ttyUSB0`
    pub port_name: String,
    pub vid: u16,
    pub pid: u16,
    pub manufacturer: Option<String>,
    pub product: Option<String>,
}

impl UsbDeviceInfo {
    pub fn descriptor(&self) -> String {
        format!(
            "USB: {} {}",
            self.manufacturer.as_deref().unwrap_or("Unknown"),
            self.product.as_deref().unwrap_or("Serial")
        )
    }

    pub fn family(&self) -> Option<ChipFamily> {
        ChipFamily::from_vid(self.vid)
    }

    fn matches_pattern(&self, pattern: &str) -> bool {
        let pattern = pattern.to_ascii_uppercase();
        let name_hit = [
            Some(self.port_name.as_str()),
            self.product.as_deref(),
            self.manufacturer.as_deref(),
        ]
        .into_iter()
        .flatten()
        .any(|s| s.to_ascii_uppercase().contains(&pattern));

        name_hit || ChipFamily::from_pattern(&pattern).is_some_and(|f| f.vid() == self.vid)
    }
}

/// USB-serial bridge chips the sensor ships with
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChipFamily {
    Ch34x,
    Ftdi,
    Cp210x,
    Pl2303,
}

impl ChipFamily {
    pub fn vid(self) -> u16 {
        match self {
            ChipFamily::Ch34x => 0x1A86,
            ChipFamily::Ftdi => 0x0403,
            ChipFamily::Cp210x => 0x10C4,
            ChipFamily::Pl2303 => 0x067B,
        }
    }

    pub fn from_vid(vid: u16) -> Option<Self> {
        [
            ChipFamily::Ch34x,
            ChipFamily::Ftdi,
            ChipFamily::Cp210x,
            ChipFamily::Pl2303,
        ]
        .into_iter()
        .find(|f| f.vid() == vid)
    }

    /// Family named by a priority pattern such as "CH34" or "FTDI"
    pub fn from_pattern(pattern: &str) -> Option<Self> {
        let pattern = pattern.to_ascii_uppercase();
        if pattern.starts_with("CH34") {
            Some(ChipFamily::Ch34x)
        } else if pattern.starts_with("FTDI") || pattern.starts_with("FT232") {
            Some(ChipFamily::Ftdi)
        } else if pattern.starts_with("CP210") {
            Some(ChipFamily::Cp210x)
        } else if pattern.starts_with("PL2303") {
            Some(ChipFamily::Pl2303)
        } else {
            None
        }
    }
}

/// Pick the device to use: first priority pattern with a match wins,
/// otherwise the first enumerated device
pub fn select_device<'a>(
    devices: &'a [UsbDeviceInfo],
    priority: &[String],
) -> Option<&'a UsbDeviceInfo> {
    priority
        .iter()
        .find_map(|pattern| devices.iter().find(|d| d.matches_pattern(pattern)))
        .or_else(|| devices.first())
}

/// Host-side USB-serial discovery and opening
pub trait UsbProbe: Send + Sync {
    fn list_devices(&self) -> Result<Vec<UsbDeviceInfo>, TransportError>;

    /// Open the port; may block
    fn open(&self, device: &UsbDeviceInfo, params: &SerialParams) -> Result<LinkIo, TransportError>;
}

/// [`UsbProbe`] over the host's serial ports
#[derive(Debug, Default)]
pub struct SerialPortProbe;

impl SerialPortProbe {
    pub fn new() -> Self {
        Self
    }
}

impl UsbProbe for SerialPortProbe {
    fn list_devices(&self) -> Result<Vec<UsbDeviceInfo>, TransportError> {
        let ports = serialport::available_ports()?;
        Ok(ports
            .into_iter()
            .filter_map(|port| match port.port_type {
                serialport::SerialPortType::UsbPort(usb) => Some(UsbDeviceInfo {
                    port_name: port.port_name,
                    vid: usb.vid,
                    pid: usb.pid,
                    manufacturer: usb.manufacturer,
                    product: usb.product,
                }),
                _ => None,
            })
            .collect())
    }

    fn open(&self, device: &UsbDeviceInfo, params: &SerialParams) -> Result<LinkIo, TransportError> {
        open_serial(&device.port_name, params)
    }
}

pub struct UsbTransport {
    probe: Arc<dyn UsbProbe>,
    config: UsbConfig,
    device: Option<UsbDeviceInfo>,
    link: SerialLink,
}

impl UsbTransport {
    pub fn new(
        probe: Arc<dyn UsbProbe>,
        config: &UsbConfig,
        framing: &FramingConfig,
        readers: TaskGauge,
    ) -> Self {
        let write_timeout = config.serial_params().write_timeout;
        Self {
            probe,
            config: config.clone(),
            device: None,
            link: SerialLink::new(DeviceType::Usb, framing, write_timeout, readers),
        }
    }

    /// The device `connect` would open; enumeration runs on the blocking pool
    pub async fn find_device(&self) -> Result<UsbDeviceInfo, TransportError> {
        let probe = self.probe.clone();
        let devices = tokio::task::spawn_blocking(move || probe.list_devices())
            .await
            .map_err(|e| TransportError::IoFailure(format!("enumeration task failed: {}", e)))??;
        select_device(&devices, &self.config.chip_priority)
            .cloned()
            .ok_or_else(|| TransportError::NotAvailable("no USB serial device attached".to_string()))
    }

    pub async fn has_device(&self) -> bool {
        self.find_device().await.is_ok()
    }

    pub fn device(&self) -> Option<&UsbDeviceInfo> {
        self.device.as_ref()
    }
}

#[async_trait]
impl Transport for UsbTransport {
    fn kind(&self) -> DeviceType {
        DeviceType::Usb
    }

    fn descriptor(&self) -> String {
        self.device
            .as_ref()
            .map(UsbDeviceInfo::descriptor)
            .unwrap_or_else(|| "USB".to_string())
    }

    fn endpoint(&self) -> Option<String> {
        self.device.as_ref().map(|d| d.port_name.clone())
    }

    fn subscribe(&self) -> broadcast::Receiver<TransportEvent> {
        self.link.subscribe()
    }

    async fn connect(&mut self) -> Result<(), TransportError> {
        if self.link.is_open() {
            return Ok(());
        }

        let device = self.find_device().await?;
        debug!(port = %device.port_name, vid = device.vid, pid = device.pid, "Opening USB device");

        let probe = self.probe.clone();
        let params = self.config.serial_params();
        let target = device.clone();
        let io = tokio::task::spawn_blocking(move || probe.open(&target, &params))
            .await
            .map_err(|e| TransportError::IoFailure(format!("open task failed: {}", e)))??;

        info!(device = %device.descriptor(), port = %device.port_name, "USB link open");
        self.device = Some(device);
        self.link.start(io);
        Ok(())
    }

    async fn close(&mut self, reason: DisconnectReason) {
        self.link.stop(reason).await;
    }

    async fn send(&self, line: &str) -> Result<(), TransportError> {
        self.link.send(line).await
    }

    fn is_open(&self) -> bool {
        self.link.is_open()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::mock::MockUsbProbe;
    use pretty_assertions::assert_eq;
    use rstest::rstest;
    use std::time::Duration;

    fn info(port: &str, vid: u16, product: &str) -> UsbDeviceInfo {
        UsbDeviceInfo {
            port_name: port.to_string(),
            vid,
            pid: 0x6001,
            manufacturer: None,
            product: Some(product.to_string()),
        }
    }

    fn priority() -> Vec<String> {
        UsbConfig::default().chip_priority
    }

    #[rstest]
    #[case::ch34_beats_ftdi(vec![info("/dev/ttyUSB0", 0x0403, "FT232R"), info("/dev/ttyUSB1", 0x1A86, "USB2.0-Ser!")], "/dev/ttyUSB1")]
    #[case::ftdi_beats_cp210(vec![info("/dev/ttyUSB0", 0x10C4, "CP2102"), info("/dev/ttyUSB1", 0x0403, "FT232R")], "/dev/ttyUSB1")]
    #[case::name_match_without_vid(vec![info("/dev/ttyUSB0", 0x9999, "Generic"), info("/dev/ttyUSB1", 0x9999, "PL2303 bridge")], "/dev/ttyUSB1")]
    #[case::fallback_to_first(vec![info("/dev/ttyACM0", 0x2341, "Arduino"), info("/dev/ttyACM1", 0x2341, "Arduino")], "/dev/ttyACM0")]
    fn test_select_device_priority(#[case] devices: Vec<UsbDeviceInfo>, #[case] expected: &str) {
        let selected = select_device(&devices, &priority()).map(|d| d.port_name.as_str());
        assert_eq!(selected, Some(expected));
    }

    #[test]
    fn test_select_device_empty() {
        assert_eq!(select_device(&[], &priority()), None);
    }

    #[test]
    fn test_descriptor_defaults() {
        let mut device = info("/dev/ttyUSB0", 0x0403, "FT232R USB UART");
        device.manufacturer = Some("FTDI".to_string());
        assert_eq!(device.descriptor(), "USB: FTDI FT232R USB UART");
        assert_eq!(device.family(), Some(ChipFamily::Ftdi));

        device.manufacturer = None;
        device.product = None;
        assert_eq!(device.descriptor(), "USB: Unknown Serial");
    }

    #[tokio::test]
    async fn test_connect_opens_selected_device() {
        let probe = MockUsbProbe::new();
        let device = probe.add_device(MockUsbProbe::ch340_info("/dev/ttyUSB3"));
        let mut transport = UsbTransport::new(
            Arc::new(probe.clone()),
            &UsbConfig::default(),
            &FramingConfig::default(),
            TaskGauge::new(),
        );
        let mut rx = transport.subscribe();

        assert!(transport.has_device().await);
        transport.connect().await.unwrap();
        assert_eq!(transport.endpoint().as_deref(), Some("/dev/ttyUSB3"));
        assert_eq!(rx.recv().await.unwrap(), TransportEvent::Connected);

        device.inject_line("1023");
        let event = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(event, TransportEvent::Record(r) if r.text == "1023"));

        transport.disconnect().await;
        transport.disconnect().await;
        assert!(!transport.is_open());
    }

    #[tokio::test]
    async fn test_connect_without_device_is_not_available() {
        let probe = MockUsbProbe::new();
        let mut transport = UsbTransport::new(
            Arc::new(probe),
            &UsbConfig::default(),
            &FramingConfig::default(),
            TaskGauge::new(),
        );
        assert!(!transport.has_device().await);
        assert!(matches!(
            transport.connect().await,
            Err(TransportError::NotAvailable(_))
        ));
    }

    #[tokio::test]
    async fn test_permission_denied_open_is_reported() {
        let probe = MockUsbProbe::new();
        let device = probe.add_device(MockUsbProbe::ftdi_info("/dev/ttyUSB0"));
        device.fail_next_open(TransportError::PermissionDenied("/dev/ttyUSB0".to_string()));

        let mut transport = UsbTransport::new(
            Arc::new(probe),
            &UsbConfig::default(),
            &FramingConfig::default(),
            TaskGauge::new(),
        );
        assert_eq!(
            transport.connect().await.unwrap_err().kind(),
            tetires_core::FailureKind::PermissionDenied
        );
        assert!(!transport.is_open());
    }
}
