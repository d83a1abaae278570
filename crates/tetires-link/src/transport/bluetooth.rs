//! Bluetooth serial (SPP) transport
//!
//! On Linux the paired device list comes from the BlueZ pairing store and
//! the serial channel is an RFCOMM tty bound to the device
//! (`rfcomm bind`). Opening that tty performs the baseband connection and
//! can block for seconds, so it runs on the blocking pool under a timeout.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use tetires_core::DeviceType;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use super::reader::SerialLink;
use super::serial::open_serial;
use super::{DisconnectReason, LinkIo, Transport, TransportError, TransportEvent};
use crate::config::{BluetoothConfig, FramingConfig, SerialParams};
use crate::gauge::TaskGauge;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PairedDevice {
    pub name: String,
    /// `AA:BB:CC:DD:EE:FF`
    pub address: String,
}

impl PairedDevice {
    pub fn new(name: impl Into<String>, address: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            address: address.into(),
        }
    }
}

/// Host-side Bluetooth adapter state, pairing list and channel setup
pub trait BluetoothProbe: Send + Sync {
    fn adapter_enabled(&self) -> bool;

    fn paired_devices(&self) -> Result<Vec<PairedDevice>, TransportError>;

    /// Establish the serial channel; blocks for the whole handshake
    fn open(
        &self,
        device: &PairedDevice,
        service_uuid: &str,
        params: &SerialParams,
    ) -> Result<LinkIo, TransportError>;
}

/// [`BluetoothProbe`] over BlueZ storage and a bound RFCOMM tty
#[derive(Debug, Clone)]
pub struct RfcommProbe {
    sysfs_root: PathBuf,
    storage: PathBuf,
    rfcomm_device: String,
    tty_class_root: PathBuf,
}

impl RfcommProbe {
    pub fn new(
        sysfs_root: impl Into<PathBuf>,
        storage: impl Into<PathBuf>,
        rfcomm_device: impl Into<String>,
    ) -> Self {
        Self {
            sysfs_root: sysfs_root.into(),
            storage: storage.into(),
            rfcomm_device: rfcomm_device.into(),
            tty_class_root: PathBuf::from("/sys/class/tty"),
        }
    }

    pub fn with_tty_class_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.tty_class_root = root.into();
        self
    }

    pub fn from_config(config: &BluetoothConfig) -> Self {
        Self::new(
            &config.sysfs_root,
            &config.bluez_storage,
            &config.rfcomm_device,
        )
        .with_tty_class_root(&config.tty_class_root)
    }

    /// Peer address the RFCOMM tty is bound to (`rfcomm bind`)
    pub fn bound_address(&self) -> Result<String, TransportError> {
        let tty = Path::new(&self.rfcomm_device)
            .file_name()
            .ok_or_else(|| {
                TransportError::NotAvailable(format!("{} is not a tty path", self.rfcomm_device))
            })?;
        let path = self.tty_class_root.join(tty).join("address");
        match fs::read_to_string(&path) {
            Ok(address) => Ok(address.trim().to_string()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Err(TransportError::NotAvailable(
                format!("{} is not bound", self.rfcomm_device),
            )),
            Err(e) => Err(TransportError::from_io(&path.display().to_string(), &e)),
        }
    }

    /// The tty must lead to `device`, not to whatever peer it was bound to
    fn check_binding(&self, device: &PairedDevice) -> Result<(), TransportError> {
        let bound = self.bound_address()?;
        if bound.eq_ignore_ascii_case(&device.address) {
            return Ok(());
        }
        warn!(
            tty = %self.rfcomm_device,
            bound = %bound,
            wanted = %device.address,
            "RFCOMM tty bound to another device"
        );
        Err(TransportError::NotAvailable(format!(
            "{} is bound to {}, not {} ({})",
            self.rfcomm_device, bound, device.name, device.address
        )))
    }

    fn read_dir(path: &Path) -> Result<Option<fs::ReadDir>, TransportError> {
        match fs::read_dir(path) {
            Ok(entries) => Ok(Some(entries)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(TransportError::from_io(&path.display().to_string(), &e)),
        }
    }
}

impl BluetoothProbe for RfcommProbe {
    /// An adapter is registered with the kernel (`hci*`)
    fn adapter_enabled(&self) -> bool {
        fs::read_dir(&self.sysfs_root)
            .map(|entries| {
                entries
                    .flatten()
                    .any(|e| e.file_name().to_string_lossy().starts_with("hci"))
            })
            .unwrap_or(false)
    }

    fn paired_devices(&self) -> Result<Vec<PairedDevice>, TransportError> {
        let Some(adapters) = Self::read_dir(&self.storage)? else {
            return Ok(Vec::new());
        };

        let mut paired = Vec::new();
        for adapter in adapters.flatten() {
            if !is_address(&adapter.file_name().to_string_lossy()) {
                continue;
            }
            let Some(devices) = Self::read_dir(&adapter.path())? else {
                continue;
            };
            for device in devices.flatten() {
                let address = device.file_name().to_string_lossy().to_string();
                if !is_address(&address) {
                    continue;
                }
                let info_path = device.path().join("info");
                let info = match fs::read_to_string(&info_path) {
                    Ok(info) => info,
                    Err(e) if e.kind() == io::ErrorKind::PermissionDenied => {
                        return Err(TransportError::from_io(
                            &info_path.display().to_string(),
                            &e,
                        ));
                    }
                    Err(_) => continue,
                };
                if let Some(name) = bonded_name(&info) {
                    paired.push(PairedDevice { name, address });
                }
            }
        }
        Ok(paired)
    }

    fn open(
        &self,
        device: &PairedDevice,
        service_uuid: &str,
        params: &SerialParams,
    ) -> Result<LinkIo, TransportError> {
        debug!(
            address = %device.address,
            uuid = service_uuid,
            tty = %self.rfcomm_device,
            "Opening RFCOMM channel"
        );
        self.check_binding(device)?;
        open_serial(&self.rfcomm_device, params)
    }
}

fn is_address(s: &str) -> bool {
    let parts: Vec<&str> = s.split(':').collect();
    parts.len() == 6
        && parts
            .iter()
            .all(|p| p.len() == 2 && p.chars().all(|c| c.is_ascii_hexdigit()))
}

/// `Name=` of a BlueZ device info file that carries a link key
fn bonded_name(info: &str) -> Option<String> {
    let mut name = None;
    let mut bonded = false;
    let mut section = "";

    for line in info.lines().map(str::trim) {
        if let Some(s) = line.strip_prefix('[').and_then(|l| l.strip_suffix(']')) {
            section = s;
            bonded |= section == "LinkKey";
            continue;
        }
        if section == "General" {
            if let Some(value) = line.strip_prefix("Name=") {
                name = Some(value.to_string());
            }
        }
    }

    if bonded {
        name
    } else {
        None
    }
}

pub struct BluetoothTransport {
    probe: Arc<dyn BluetoothProbe>,
    config: BluetoothConfig,
    target: Option<PairedDevice>,
    link: SerialLink,
}

impl BluetoothTransport {
    pub fn new(
        probe: Arc<dyn BluetoothProbe>,
        config: &BluetoothConfig,
        framing: &FramingConfig,
        readers: TaskGauge,
    ) -> Self {
        let write_timeout = config.serial_params().write_timeout;
        Self {
            probe,
            config: config.clone(),
            target: None,
            link: SerialLink::new(DeviceType::Bluetooth, framing, write_timeout, readers),
        }
    }

    /// The paired device `connect` would use
    ///
    /// An explicit address wins over the name substring. The pairing store is
    /// read on the blocking pool.
    pub async fn find_target(&self) -> Result<PairedDevice, TransportError> {
        let probe = self.probe.clone();
        let paired = tokio::task::spawn_blocking(move || {
            if !probe.adapter_enabled() {
                return Err(TransportError::NotAvailable(
                    "Bluetooth adapter is disabled".to_string(),
                ));
            }
            probe.paired_devices()
        })
        .await
        .map_err(|e| TransportError::IoFailure(format!("pairing lookup failed: {}", e)))??;

        let found = match &self.config.address {
            Some(address) => paired
                .into_iter()
                .find(|d| d.address.eq_ignore_ascii_case(address)),
            None => {
                let wanted = self.config.device_name.to_lowercase();
                paired
                    .into_iter()
                    .find(|d| d.name.to_lowercase().contains(&wanted))
            }
        };

        found.ok_or_else(|| {
            TransportError::NotAvailable(format!(
                "no paired device matching {}",
                self.config
                    .address
                    .as_deref()
                    .unwrap_or(&self.config.device_name)
            ))
        })
    }

    pub async fn is_paired_and_enabled(&self) -> bool {
        self.find_target().await.is_ok()
    }

    pub fn target(&self) -> Option<&PairedDevice> {
        self.target.as_ref()
    }
}

#[async_trait]
impl Transport for BluetoothTransport {
    fn kind(&self) -> DeviceType {
        DeviceType::Bluetooth
    }

    fn descriptor(&self) -> String {
        let name = self
            .target
            .as_ref()
            .map(|d| d.name.as_str())
            .unwrap_or(&self.config.device_name);
        format!("Bluetooth: {}", name)
    }

    fn endpoint(&self) -> Option<String> {
        self.target.as_ref().map(|d| d.address.clone())
    }

    fn subscribe(&self) -> broadcast::Receiver<TransportEvent> {
        self.link.subscribe()
    }

    async fn connect(&mut self) -> Result<(), TransportError> {
        if self.link.is_open() {
            return Ok(());
        }

        let device = self.find_target().await?;
        self.target = Some(device.clone());

        let probe = self.probe.clone();
        let params = self.config.serial_params();
        let uuid = self.config.service_uuid.clone();
        let target = device.clone();
        let handshake = tokio::task::spawn_blocking(move || probe.open(&target, &uuid, &params));

        let timeout = self.config.connect_timeout();
        let io = match tokio::time::timeout(timeout, handshake).await {
            Ok(Ok(result)) => result?,
            Ok(Err(e)) => {
                return Err(TransportError::IoFailure(format!(
                    "handshake task failed: {}",
                    e
                )))
            }
            Err(_) => {
                return Err(TransportError::IoFailure(format!(
                    "handshake with {} timed out after {:?}",
                    device.address, timeout
                )))
            }
        };

        info!(device = %device.name, address = %device.address, "Bluetooth link open");
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
