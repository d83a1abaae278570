//! Connection manager
//!
//! A single task owns the active transport and the connection state. Every
//! lifecycle decision (arbitration, hot-plug, reconnect, send routing) is a
//! message to that task, so the state has exactly one writer and the
//! transport is never aliased.
//!
//! Priority: USB always wins over Bluetooth. Bluetooth drops are retried
//! forever at a fixed interval; USB drops are never retried, the next
//! attach event brings USB back.

use std::time::Duration;

use tetires_core::{
    ConnectionSnapshot, ConnectionState, DeviceType, HotplugEvent, LinkEvent, StatePublisher,
    StateView,
};
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::LinkConfig;
use crate::error::{LinkError, Result};
use crate::gauge::TaskGauge;
use crate::transport::{
    BluetoothTransport, DisconnectReason, Probes, Transport, TransportError, TransportEvent,
    UsbTransport,
};

const COMMAND_CAPACITY: usize = 64;
const EVENT_CAPACITY: usize = 4096;

const NO_DEVICE: &str = "No device connected";
const NO_DEVICE_AVAILABLE: &str = "No device available. Please connect USB or Bluetooth.";

/// Counters for tests and status displays
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Diagnostics {
    /// Reader tasks currently alive
    pub live_readers: usize,
    /// Reconnect loops currently alive
    pub live_reconnect_loops: usize,
    /// Reconnect attempts since start
    pub reconnect_attempts: u64,
    /// Arbitration passes since start
    pub arbitrations: u64,
    /// Framer overflows reported by transports
    pub overflows: u64,
    /// Times transport events were dropped before the manager saw them
    pub gaps: u64,
}

enum Command {
    AutoDetect,
    ManualConnect,
    Disconnect,
    Hotplug(HotplugEvent),
    Send {
        line: String,
        reply: oneshot::Sender<Result<()>>,
    },
    Sync(oneshot::Sender<()>),
    Diagnostics(oneshot::Sender<Diagnostics>),
    Shutdown(oneshot::Sender<()>),
    ReconnectTick {
        loop_id: u64,
    },
    Settled {
        timer_id: u64,
        exclude_usb: bool,
    },
}

enum Wake {
    Command(Command),
    Transport(Option<TransportEvent>),
    Lagged(u64),
}

struct ActiveLink {
    transport: Box<dyn Transport>,
    events: broadcast::Receiver<TransportEvent>,
}

/// A spawned reconnect loop or settle timer
struct TimerTask {
    id: u64,
    handle: JoinHandle<()>,
}

impl TimerTask {
    /// Abort and wait until the task is gone
    async fn cancel(self) {
        self.handle.abort();
        let _ = self.handle.await;
    }
}

/// Cloneable handle to a running [`ConnectionManager`]
#[derive(Clone)]
pub struct ConnectionHandle {
    commands: mpsc::Sender<Command>,
    events: broadcast::Sender<LinkEvent>,
    state: StateView<ConnectionSnapshot>,
}

impl ConnectionHandle {
    async fn post(&self, command: Command) -> Result<()> {
        self.commands
            .send(command)
            .await
            .map_err(|_| LinkError::ManagerUnavailable)
    }

    /// Run arbitration now
    pub async fn auto_detect(&self) -> Result<()> {
        self.post(Command::AutoDetect).await
    }

    /// Disconnect, wait for the settle delay, then arbitrate
    pub async fn manual_connect(&self) -> Result<()> {
        self.post(Command::ManualConnect).await
    }

    /// Close the active link and stop any reconnect loop
    pub async fn disconnect(&self) -> Result<()> {
        self.post(Command::Disconnect).await
    }

    pub async fn hotplug(&self, event: HotplugEvent) -> Result<()> {
        self.post(Command::Hotplug(event)).await
    }

    /// Send one command line through the active transport
    pub async fn send_command(&self, text: &str) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        self.post(Command::Send {
            line: text.to_string(),
            reply,
        })
        .await?;
        rx.await.map_err(|_| LinkError::ManagerUnavailable)?
    }

    /// Returns once every command posted before it has been handled
    pub async fn sync(&self) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        self.post(Command::Sync(reply)).await?;
        rx.await.map_err(|_| LinkError::ManagerUnavailable)
    }

    pub async fn diagnostics(&self) -> Result<Diagnostics> {
        let (reply, rx) = oneshot::channel();
        self.post(Command::Diagnostics(reply)).await?;
        rx.await.map_err(|_| LinkError::ManagerUnavailable)
    }

    /// Close everything and stop the manager task
    pub async fn shutdown(&self) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        self.post(Command::Shutdown(reply)).await?;
        rx.await.map_err(|_| LinkError::ManagerUnavailable)
    }

    /// Records, status changes and notices, in order
    pub fn subscribe(&self) -> broadcast::Receiver<LinkEvent> {
        self.events.subscribe()
    }

    pub fn state(&self) -> StateView<ConnectionSnapshot> {
        self.state.clone()
    }

    pub fn snapshot(&self) -> ConnectionSnapshot {
        self.state.current()
    }

    pub fn is_connected(&self) -> bool {
        self.snapshot().is_connected()
    }
}

pub struct ConnectionManager {
    config: LinkConfig,
    probes: Probes,
    commands: mpsc::Receiver<Command>,
    /// Weak so timers never keep the manager alive
    timer_tx: mpsc::WeakSender<Command>,
    state: StatePublisher<ConnectionSnapshot>,
    events: broadcast::Sender<LinkEvent>,
    active: Option<ActiveLink>,
    reconnect: Option<TimerTask>,
    settle: Option<TimerTask>,
    next_task_id: u64,
    readers: TaskGauge,
    loops: TaskGauge,
    reconnect_attempts: u64,
    arbitrations: u64,
    overflows: u64,
    gaps: u64,
}

impl ConnectionManager {
    /// Start the manager task; it arbitrates once immediately
    pub fn spawn(config: LinkConfig, probes: Probes) -> ConnectionHandle {
        let (tx, rx) = mpsc::channel(COMMAND_CAPACITY);
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let state = StatePublisher::new(ConnectionSnapshot::default());

        let handle = ConnectionHandle {
            commands: tx.clone(),
            events: events.clone(),
            state: state.view(),
        };

        let manager = Self {
            config,
            probes,
            commands: rx,
            timer_tx: tx.downgrade(),
            state,
            events,
            active: None,
            reconnect: None,
            settle: None,
            next_task_id: 0,
            readers: TaskGauge::new(),
            loops: TaskGauge::new(),
            reconnect_attempts: 0,
            arbitrations: 0,
            overflows: 0,
            gaps: 0,
        };
        tokio::spawn(manager.run());

        handle
    }

    async fn run(mut self) {
        info!("Connection manager started");
        self.arbitrate(false).await;

        loop {
            let wake = tokio::select! {
                command = self.commands.recv() => match command {
                    Some(command) => Wake::Command(command),
                    None => break,
                },
                event = next_event(self.active.as_mut()) => match event {
                    Err(skipped) => Wake::Lagged(skipped),
                    Ok(event) => Wake::Transport(event),
                },
            };

            match wake {
                Wake::Command(command) => {
                    if !self.handle_command(command).await {
                        return;
                    }
                }
                Wake::Transport(event) => self.handle_transport_event(event).await,
                Wake::Lagged(skipped) => {
                    warn!(skipped, "Manager fell behind transport events");
                    self.gaps += 1;
                    let _ = self.events.send(LinkEvent::Gap(skipped));
                }
            }
        }

        self.shutdown().await;
    }

    /// Returns false once the manager should stop
    async fn handle_command(&mut self, command: Command) -> bool {
        match command {
            Command::AutoDetect => self.arbitrate(false).await,
            Command::ManualConnect => {
                self.cancel_reconnect().await;
                self.close_active(DisconnectReason::Requested).await;
                self.publish(
                    DeviceType::None,
                    ConnectionState::Disconnected,
                    NO_DEVICE,
                    "Reconnecting...",
                );
                self.schedule_settle(self.config.hotplug.manual_connect_settle(), false)
                    .await;
            }
            Command::Disconnect => {
                self.cancel_reconnect().await;
                self.cancel_settle().await;
                self.close_active(DisconnectReason::Requested).await;
                self.publish(
                    DeviceType::None,
                    ConnectionState::Disconnected,
                    NO_DEVICE,
                    "Disconnected",
                );
            }
            Command::Hotplug(event) => self.on_hotplug(event).await,
            Command::Send { line, reply } => {
                let result = match self.active.as_ref() {
                    Some(link) if link.transport.is_open() => link
                        .transport
                        .send(&line)
                        .await
                        .map_err(LinkError::from),
                    _ => Err(LinkError::NoActiveTransport),
                };
                match &result {
                    Ok(()) => debug!(command = %line, "Command sent"),
                    Err(e) => warn!(command = %line, error = %e, "Command not sent"),
                }
                let _ = reply.send(result);
            }
            Command::Sync(reply) => {
                let _ = reply.send(());
            }
            Command::Diagnostics(reply) => {
                let _ = reply.send(self.diagnostics());
            }
            Command::Shutdown(reply) => {
                self.shutdown().await;
                let _ = reply.send(());
                return false;
            }
            Command::ReconnectTick { loop_id } => self.on_reconnect_tick(loop_id).await,
            Command::Settled {
                timer_id,
                exclude_usb,
            } => {
                if self.settle.as_ref().map(|t| t.id) != Some(timer_id) {
                    debug!(timer_id, "Ignoring stale settle timer");
                } else {
                    self.settle = None;
                    self.arbitrate(exclude_usb).await;
                }
            }
        }
        true
    }

    async fn handle_transport_event(&mut self, event: Option<TransportEvent>) {
        match event {
            Some(TransportEvent::Connected) => debug!("Transport reported connected"),
            Some(TransportEvent::Record(record)) => {
                let _ = self.events.send(LinkEvent::Record(record));
            }
            Some(TransportEvent::Overflow(stats)) => {
                self.overflows += 1;
                self.notice(format!(
                    "Receive buffer overflow, {} bytes discarded so far",
                    stats.discarded_bytes
                ));
            }
            Some(TransportEvent::Disconnected(reason)) => self.on_link_lost(reason).await,
            None => {
                self.on_link_lost(DisconnectReason::Io("event stream closed".to_string()))
                    .await
            }
        }
    }

    // =========================================================================
    // Arbitration
    // =========================================================================

    /// Pick and open the authoritative transport
    ///
    /// USB first (unless excluded), then Bluetooth, else disconnected. Any
    /// reconnect loop or pending settle timer is cancelled first.
    async fn arbitrate(&mut self, exclude_usb: bool) {
        self.arbitrations += 1;
        self.cancel_reconnect().await;
        self.cancel_settle().await;
        debug!(pass = self.arbitrations, exclude_usb, "Arbitrating");

        if !exclude_usb {
            let usb = self.usb_transport();
            match usb.find_device().await {
                Ok(device) => {
                    if self.active_kind() == Some(DeviceType::Usb) {
                        debug!("USB already active");
                        return;
                    }
                    if self.close_active(DisconnectReason::Superseded).await
                        == Some(DeviceType::Bluetooth)
                    {
                        self.notice("USB device detected, switching from Bluetooth");
                    }
                    let descriptor = device.descriptor();
                    self.publish(
                        DeviceType::Usb,
                        ConnectionState::Connecting,
                        &descriptor,
                        format!("Connecting to {}...", descriptor),
                    );
                    match self.open(Box::new(usb)).await {
                        Ok(()) => return,
                        Err(e) => {
                            warn!(error = %e, "USB connect failed, falling back to Bluetooth");
                            self.notice(format!("USB connection failed: {}", e));
                        }
                    }
                }
                Err(e) => debug!(reason = %e, "USB not available"),
            }
        }

        let bluetooth = self.bluetooth_transport();
        match bluetooth.find_target().await {
            Ok(device) => {
                if self.active_kind() == Some(DeviceType::Bluetooth) {
                    debug!("Bluetooth already active");
                    return;
                }
                self.close_active(DisconnectReason::Superseded).await;
                let descriptor = format!("Bluetooth: {}", device.name);
                self.publish(
                    DeviceType::Bluetooth,
                    ConnectionState::Connecting,
                    &descriptor,
                    format!("Connecting to {}...", device.name),
                );
                match self.open(Box::new(bluetooth)).await {
                    Ok(()) => {}
                    Err(e) if e.kind().auto_retry(DeviceType::Bluetooth) => {
                        self.publish(
                            DeviceType::Bluetooth,
                            ConnectionState::Reconnecting,
                            &descriptor,
                            format!("Bluetooth connection failed: {}. Retrying...", e),
                        );
                        self.start_reconnect_loop().await;
                    }
                    Err(e) => self.publish(
                        DeviceType::None,
                        ConnectionState::Disconnected,
                        NO_DEVICE,
                        format!("Bluetooth connection failed: {}", e),
                    ),
                }
                return;
            }
            Err(TransportError::PermissionDenied(msg)) => {
                self.close_active(DisconnectReason::Superseded).await;
                self.publish(
                    DeviceType::None,
                    ConnectionState::Disconnected,
                    NO_DEVICE,
                    format!("Bluetooth permission denied: {}", msg),
                );
                return;
            }
            Err(e) => debug!(reason = %e, "Bluetooth not available"),
        }

        self.close_active(DisconnectReason::Requested).await;
        self.publish(
            DeviceType::None,
            ConnectionState::Disconnected,
            NO_DEVICE,
            NO_DEVICE_AVAILABLE,
        );
    }

    async fn open(
        &mut self,
        mut transport: Box<dyn Transport>,
    ) -> std::result::Result<(), TransportError> {
        let events = transport.subscribe();
        transport.connect().await?;

        let kind = transport.kind();
        let descriptor = transport.descriptor();
        self.active = Some(ActiveLink { transport, events });
        self.publish(
            kind,
            ConnectionState::Connected,
            &descriptor,
            format!("Connected to {}", descriptor),
        );
        Ok(())
    }

    /// Close and drop the active transport; returns what it was
    ///
    /// The receiver is dropped with it, so nothing the old reader published
    /// after this point is forwarded.
    async fn close_active(&mut self, reason: DisconnectReason) -> Option<DeviceType> {
        let mut link = self.active.take()?;
        let kind = link.transport.kind();
        info!(device = %link.transport.descriptor(), %reason, "Closing transport");
        link.transport.close(reason).await;
        Some(kind)
    }

    fn active_kind(&self) -> Option<DeviceType> {
        self.active
            .as_ref()
            .filter(|link| link.transport.is_open())
            .map(|link| link.transport.kind())
    }

    fn usb_transport(&self) -> UsbTransport {
        UsbTransport::new(
            self.probes.usb.clone(),
            &self.config.usb,
            &self.config.framing,
            self.readers.clone(),
        )
    }

    fn bluetooth_transport(&self) -> BluetoothTransport {
        BluetoothTransport::new(
            self.probes.bluetooth.clone(),
            &self.config.bluetooth,
            &self.config.framing,
            self.readers.clone(),
        )
    }

    // =========================================================================
    // Link loss and hot-plug
    // =========================================================================

    async fn on_link_lost(&mut self, reason: DisconnectReason) {
        let Some(mut link) = self.active.take() else {
            return;
        };
        let kind = link.transport.kind();
        let descriptor = link.transport.descriptor();
        // Reader already reported; this only releases the port
        link.transport.close(reason.clone()).await;
        drop(link);
        warn!(device = %descriptor, %reason, "Link lost");

        if kind == DeviceType::Bluetooth {
            if self.usb_transport().has_device().await {
                self.notice("Bluetooth lost while USB is present, re-arbitrating");
                self.arbitrate(false).await;
            } else {
                self.publish(
                    DeviceType::Bluetooth,
                    ConnectionState::Reconnecting,
                    &descriptor,
                    "Bluetooth connection lost. Reconnecting...",
                );
                self.start_reconnect_loop().await;
            }
        } else {
            self.publish(
                DeviceType::None,
                ConnectionState::Disconnected,
                NO_DEVICE,
                format!("USB disconnected: {}", reason),
            );
            // Same device is not retried; fall back to Bluetooth
            self.schedule_settle(self.config.hotplug.usb_fallback_settle(), true)
                .await;
        }
    }

    async fn on_hotplug(&mut self, event: HotplugEvent) {
        match event {
            HotplugEvent::Attached { port } => {
                self.notice(match &port {
                    Some(port) => format!("USB device attached on {}", port),
                    None => "USB device attached".to_string(),
                });
                self.cancel_reconnect().await;
                self.schedule_settle(self.config.hotplug.attach_settle(), false)
                    .await;
            }
            HotplugEvent::Detached { port } => {
                let active_endpoint = self
                    .active
                    .as_ref()
                    .filter(|link| link.transport.kind() == DeviceType::Usb)
                    .map(|link| link.transport.endpoint());

                match active_endpoint {
                    Some(endpoint)
                        if port.is_none() || endpoint.is_none() || endpoint == port =>
                    {
                        self.close_active(DisconnectReason::Detached).await;
                        self.publish(
                            DeviceType::None,
                            ConnectionState::Disconnected,
                            NO_DEVICE,
                            "USB device detached",
                        );
                        self.schedule_settle(self.config.hotplug.detach_settle(), false)
                            .await;
                    }
                    _ => debug!(?port, "Detach of an inactive device ignored"),
                }
            }
        }
    }

    // =========================================================================
    // Reconnect loop and settle timers
    // =========================================================================

    fn next_id(&mut self) -> u64 {
        self.next_task_id += 1;
        self.next_task_id
    }

    /// Replace any running loop with a fresh one
    async fn start_reconnect_loop(&mut self) {
        self.cancel_reconnect().await;

        let id = self.next_id();
        let interval = self.config.reconnect.interval();
        let commands = self.timer_tx.clone();
        let guard = self.loops.enter();

        let handle = tokio::spawn(async move {
            let _guard = guard;
            loop {
                tokio::time::sleep(interval).await;
                let Some(commands) = commands.upgrade() else {
                    break;
                };
                if commands
                    .send(Command::ReconnectTick { loop_id: id })
                    .await
                    .is_err()
                {
                    break;
                }
            }
        });

        debug!(loop_id = id, ?interval, "Reconnect loop started");
        self.reconnect = Some(TimerTask { id, handle });
    }

    async fn cancel_reconnect(&mut self) {
        if let Some(task) = self.reconnect.take() {
            debug!(loop_id = task.id, "Reconnect loop cancelled");
            task.cancel().await;
        }
    }

    async fn on_reconnect_tick(&mut self, loop_id: u64) {
        if self.reconnect.as_ref().map(|t| t.id) != Some(loop_id) {
            debug!(loop_id, "Ignoring stale reconnect tick");
            return;
        }

        self.reconnect_attempts += 1;
        let attempt = self.reconnect_attempts;

        if self.usb_transport().has_device().await {
            self.notice("USB device present, re-arbitrating");
            self.arbitrate(false).await;
            return;
        }

        let bluetooth = self.bluetooth_transport();
        let descriptor = bluetooth.descriptor();
        info!(attempt, "Bluetooth reconnect attempt");

        let failure = match bluetooth.find_target().await {
            Ok(_) => match self.open(Box::new(bluetooth)).await {
                Ok(()) => {
                    self.cancel_reconnect().await;
                    self.notice(format!("Bluetooth reconnected after {} attempt(s)", attempt));
                    return;
                }
                Err(e) => e,
            },
            Err(e) => e,
        };

        if failure.kind().auto_retry(DeviceType::Bluetooth)
            || matches!(failure, TransportError::NotAvailable(_))
        {
            self.publish(
                DeviceType::Bluetooth,
                ConnectionState::Reconnecting,
                &descriptor,
                format!("Reconnect attempt {} failed: {}", attempt, failure),
            );
        } else {
            self.cancel_reconnect().await;
            self.publish(
                DeviceType::None,
                ConnectionState::Disconnected,
                NO_DEVICE,
                format!("Bluetooth reconnect stopped: {}", failure),
            );
        }
    }

    /// Arbitrate after `delay`, replacing any pending timer
    async fn schedule_settle(&mut self, delay: Duration, exclude_usb: bool) {
        self.cancel_settle().await;

        let id = self.next_id();
        let commands = self.timer_tx.clone();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if let Some(commands) = commands.upgrade() {
                let _ = commands
                    .send(Command::Settled {
                        timer_id: id,
                        exclude_usb,
                    })
                    .await;
            }
        });

        debug!(timer_id = id, ?delay, exclude_usb, "Arbitration scheduled");
        self.settle = Some(TimerTask { id, handle });
    }

    async fn cancel_settle(&mut self) {
        if let Some(task) = self.settle.take() {
            task.cancel().await;
        }
    }

    // =========================================================================
    // State publication
    // =========================================================================

    fn publish(
        &self,
        device_type: DeviceType,
        state: ConnectionState,
        descriptor: &str,
        status: impl Into<String>,
    ) {
        let snapshot = ConnectionSnapshot {
            device_type,
            state,
            descriptor: descriptor.to_string(),
            status: status.into(),
        };
        if self.state.publish(snapshot.clone()) {
            info!(
                device = %snapshot.device_type,
                state = %snapshot.state,
                status = %snapshot.status,
                "Connection state changed"
            );
            let _ = self.events.send(LinkEvent::Status(snapshot));
        }
    }

    fn notice(&self, message: impl Into<String>) {
        let message = message.into();
        info!("{}", message);
        let _ = self.events.send(LinkEvent::Notice(message));
    }

    fn diagnostics(&self) -> Diagnostics {
        Diagnostics {
            live_readers: self.readers.live(),
            live_reconnect_loops: self.loops.live(),
            reconnect_attempts: self.reconnect_attempts,
            arbitrations: self.arbitrations,
            overflows: self.overflows,
            gaps: self.gaps,
        }
    }

    async fn shutdown(&mut self) {
        // Refuse further commands before reporting back
        self.commands.close();
        self.cancel_reconnect().await;
        self.cancel_settle().await;
        self.close_active(DisconnectReason::Requested).await;
        self.publish(
            DeviceType::None,
            ConnectionState::Disconnected,
            NO_DEVICE,
            "Stopped",
        );
        info!("Connection manager stopped");
    }
}

/// Next event of the active transport; pending forever when there is none
///
/// `Err` carries the number of events dropped because the manager fell behind.
async fn next_event(
    active: Option<&mut ActiveLink>,
) -> std::result::Result<Option<TransportEvent>, u64> {
    let Some(active) = active else {
        return std::future::pending().await;
    };
    match active.events.recv().await {
        Ok(event) => Ok(Some(event)),
        Err(broadcast::error::RecvError::Lagged(skipped)) => Err(skipped),
        Err(broadcast::error::RecvError::Closed) => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::mock::{MockBluetoothProbe, MockDevice, MockUsbProbe};
    use crate::transport::PairedDevice;
    use pretty_assertions::assert_eq;
    use std::sync::Arc;

    const WAIT: Duration = Duration::from_secs(3);

    struct Rig {
        usb: MockUsbProbe,
        bluetooth: MockBluetoothProbe,
    }

    impl Rig {
        fn new() -> Self {
            Self {
                usb: MockUsbProbe::new(),
                bluetooth: MockBluetoothProbe::new(),
            }
        }

        fn hc05(&self) -> MockDevice {
            self.bluetooth
                .add_device(PairedDevice::new("HC-05", "98:D3:31:F5:2A:10"))
        }

        fn spawn(&self) -> ConnectionHandle {
            ConnectionManager::spawn(
                fast_config(),
                Probes {
                    usb: Arc::new(self.usb.clone()),
                    bluetooth: Arc::new(self.bluetooth.clone()),
                },
            )
        }
    }

    fn fast_config() -> LinkConfig {
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

    async fn wait_for(
        handle: &ConnectionHandle,
        pred: impl FnMut(&ConnectionSnapshot) -> bool,
    ) -> ConnectionSnapshot {
        handle
            .state()
            .wait_for(WAIT, pred)
            .await
            .unwrap_or_else(|| panic!("state never matched, last: {:?}", handle.snapshot()))
    }

    fn connected(kind: DeviceType) -> impl FnMut(&ConnectionSnapshot) -> bool {
        move |s| s.is_connected() && s.device_type == kind
    }

    #[tokio::test]
    async fn test_usb_wins_when_both_available() {
        let rig = Rig::new();
        rig.usb.add_device(MockUsbProbe::ftdi_info("/dev/ttyUSB0"));
        let bt = rig.hc05();

        let handle = rig.spawn();
        let snapshot = wait_for(&handle, connected(DeviceType::Usb)).await;
        assert_eq!(snapshot.descriptor, "USB: FTDI FT232R USB UART");
        assert_eq!(bt.open_count(), 0);
    }

    #[tokio::test]
    async fn test_bluetooth_selected_without_usb() {
        let rig = Rig::new();
        rig.hc05();

        let handle = rig.spawn();
        let snapshot = wait_for(&handle, connected(DeviceType::Bluetooth)).await;
        assert_eq!(snapshot.descriptor, "Bluetooth: HC-05");
    }

    #[tokio::test]
    async fn test_nothing_available_is_disconnected() {
        let rig = Rig::new();
        let handle = rig.spawn();
        handle.sync().await.unwrap();

        let snapshot = handle.snapshot();
        assert_eq!(snapshot.state, ConnectionState::Disconnected);
        assert_eq!(snapshot.device_type, DeviceType::None);
        assert_eq!(snapshot.status, NO_DEVICE_AVAILABLE);
        assert!(!handle.is_connected());
    }

    #[tokio::test]
    async fn test_send_routes_to_active_transport() {
        let rig = Rig::new();
        let handle = rig.spawn();
        handle.sync().await.unwrap();
        assert_eq!(
            handle.send_command("START").await,
            Err(LinkError::NoActiveTransport)
        );

        let device = rig.usb.add_device(MockUsbProbe::ch340_info("/dev/ttyUSB0"));
        handle.auto_detect().await.unwrap();
        wait_for(&handle, connected(DeviceType::Usb)).await;

        handle.send_command("START").await.unwrap();
        assert_eq!(device.written(), vec!["START".to_string()]);
    }

    #[tokio::test]
    async fn test_records_are_forwarded() {
        let rig = Rig::new();
        let device = rig.hc05();
        let handle = rig.spawn();
        let mut events = handle.subscribe();
        wait_for(&handle, connected(DeviceType::Bluetooth)).await;

        device.inject_line("512,0.41");
        let record = loop {
            let event = tokio::time::timeout(WAIT, events.recv()).await.unwrap().unwrap();
            if let LinkEvent::Record(record) = event {
                break record;
            }
        };
        assert_eq!(record.text, "512,0.41");
    }

    #[tokio::test]
    async fn test_dropped_transport_events_are_reported_as_gap() {
        let rig = Rig::new();
        let device = rig.usb.add_device(MockUsbProbe::ftdi_info("/dev/ttyUSB0"));
        let mut config = fast_config();
        config.framing.event_capacity = 4;
        let handle = ConnectionManager::spawn(
            config,
            Probes {
                usb: Arc::new(rig.usb.clone()),
                bluetooth: Arc::new(rig.bluetooth.clone()),
            },
        );
        wait_for(&handle, connected(DeviceType::Usb)).await;
        let mut events = handle.subscribe();

        let burst: String = (0..100).map(|i| format!("{}\n", i)).collect();
        device.inject_bytes(burst.as_bytes());
        // Hold the runtime so the reader outruns the manager
        std::thread::sleep(Duration::from_millis(300));

        let skipped = loop {
            let event = tokio::time::timeout(WAIT, events.recv()).await.unwrap().unwrap();
            if let LinkEvent::Gap(skipped) = event {
                break skipped;
            }
        };
        assert!(skipped > 0);
        assert!(handle.diagnostics().await.unwrap().gaps >= 1);
        assert!(handle.is_connected());
    }

    #[tokio::test]
    async fn test_slow_device_lookups_leave_the_runtime_free() {
        let rig = Rig::new();
        rig.usb.set_enumeration_delay(Duration::from_millis(250));
        rig.bluetooth.set_lookup_delay(Duration::from_millis(250));
        rig.hc05();

        let ticks = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let ticker = {
            let ticks = ticks.clone();
            tokio::spawn(async move {
                loop {
                    tokio::time::sleep(Duration::from_millis(10)).await;
                    ticks.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
                }
            })
        };

        let handle = rig.spawn();
        wait_for(&handle, connected(DeviceType::Bluetooth)).await;
        ticker.abort();

        // Both lookups took 500 ms between them; a blocked runtime ticks a handful of times
        assert!(ticks.load(std::sync::atomic::Ordering::SeqCst) >= 15);
    }

    #[tokio::test]
    async fn test_bluetooth_drop_reconnects() {
        let rig = Rig::new();
        let device = rig.hc05();
        let handle = rig.spawn();
        wait_for(&handle, connected(DeviceType::Bluetooth)).await;

        device.set_fail_opens(Some(TransportError::IoFailure("page timeout".to_string())));
        device.hang_up();
        wait_for(&handle, |s| s.state == ConnectionState::Reconnecting).await;
        assert_eq!(handle.diagnostics().await.unwrap().live_reconnect_loops, 1);

        device.set_fail_opens(None);
        wait_for(&handle, connected(DeviceType::Bluetooth)).await;
        handle.sync().await.unwrap();

        let diagnostics = handle.diagnostics().await.unwrap();
        assert_eq!(diagnostics.live_reconnect_loops, 0);
        assert_eq!(diagnostics.live_readers, 1);
        assert!(diagnostics.reconnect_attempts >= 1);
    }

    #[tokio::test]
    async fn test_repeated_arbitration_keeps_one_reconnect_loop() {
        let rig = Rig::new();
        let device = rig.hc05();
        device.set_fail_opens(Some(TransportError::IoFailure("page timeout".to_string())));

        let handle = rig.spawn();
        wait_for(&handle, |s| s.state == ConnectionState::Reconnecting).await;

        handle.auto_detect().await.unwrap();
        handle.auto_detect().await.unwrap();
        handle.sync().await.unwrap();

        let diagnostics = handle.diagnostics().await.unwrap();
        assert_eq!(diagnostics.live_reconnect_loops, 1);
        assert_eq!(diagnostics.live_readers, 0);
        assert!(diagnostics.arbitrations >= 3);
    }

    #[tokio::test]
    async fn test_disconnect_cancels_reconnect_loop() {
        let rig = Rig::new();
        let device = rig.hc05();
        device.set_fail_opens(Some(TransportError::IoFailure("page timeout".to_string())));

        let handle = rig.spawn();
        wait_for(&handle, |s| s.state == ConnectionState::Reconnecting).await;

        handle.disconnect().await.unwrap();
        let diagnostics = handle.diagnostics().await.unwrap();
        assert_eq!(diagnostics.live_reconnect_loops, 0);

        let attempts = diagnostics.reconnect_attempts;
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(
            handle.diagnostics().await.unwrap().reconnect_attempts,
            attempts
        );
        assert_eq!(handle.snapshot().state, ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn test_permission_denied_is_not_retried() {
        let rig = Rig::new();
        rig.hc05();
        rig.bluetooth.set_permission_denied(true);

        let handle = rig.spawn();
        handle.sync().await.unwrap();

        let snapshot = handle.snapshot();
        assert_eq!(snapshot.state, ConnectionState::Disconnected);
        assert!(snapshot.status.contains("permission denied"));
        assert_eq!(handle.diagnostics().await.unwrap().live_reconnect_loops, 0);
    }

    #[tokio::test]
    async fn test_attach_preempts_bluetooth() {
        let rig = Rig::new();
        let bt = rig.hc05();
        let handle = rig.spawn();
        wait_for(&handle, connected(DeviceType::Bluetooth)).await;

        rig.usb.add_device(MockUsbProbe::ftdi_info("/dev/ttyUSB0"));
        handle
            .hotplug(HotplugEvent::Attached {
                port: Some("/dev/ttyUSB0".to_string()),
            })
            .await
            .unwrap();

        wait_for(&handle, connected(DeviceType::Usb)).await;
        handle.sync().await.unwrap();
        let diagnostics = handle.diagnostics().await.unwrap();
        assert_eq!(diagnostics.live_reconnect_loops, 0);
        assert_eq!(diagnostics.live_readers, 1);
        assert_eq!(bt.open_count(), 1);
    }

    #[tokio::test]
    async fn test_usb_failure_falls_back_to_bluetooth() {
        let rig = Rig::new();
        let usb = rig.usb.add_device(MockUsbProbe::ftdi_info("/dev/ttyUSB0"));
        rig.hc05();
        let handle = rig.spawn();
        wait_for(&handle, connected(DeviceType::Usb)).await;

        // Link breaks while the device still enumerates
        usb.hang_up();
        wait_for(&handle, connected(DeviceType::Bluetooth)).await;
        assert_eq!(usb.open_count(), 1);
    }

    #[tokio::test]
    async fn test_detach_of_active_usb_disconnects_then_rearbitrates() {
        let rig = Rig::new();
        let usb = rig.usb.add_device(MockUsbProbe::ftdi_info("/dev/ttyUSB0"));
        let handle = rig.spawn();
        wait_for(&handle, connected(DeviceType::Usb)).await;

        let mut events = handle.subscribe();
        usb.set_present(false);
        handle
            .hotplug(HotplugEvent::Detached {
                port: Some("/dev/ttyUSB0".to_string()),
            })
            .await
            .unwrap();

        let first_status = loop {
            if let LinkEvent::Status(s) = events.recv().await.unwrap() {
                break s;
            }
        };
        assert_eq!(first_status.state, ConnectionState::Disconnected);
        assert_eq!(first_status.status, "USB device detached");

        wait_for(&handle, |s| s.status == NO_DEVICE_AVAILABLE).await;
        assert_eq!(handle.diagnostics().await.unwrap().live_readers, 0);
    }

    #[tokio::test]
    async fn test_detach_of_other_port_is_ignored() {
        let rig = Rig::new();
        rig.usb.add_device(MockUsbProbe::ftdi_info("/dev/ttyUSB0"));
        let handle = rig.spawn();
        wait_for(&handle, connected(DeviceType::Usb)).await;

        handle
            .hotplug(HotplugEvent::Detached {
                port: Some("/dev/ttyUSB7".to_string()),
            })
            .await
            .unwrap();
        handle.sync().await.unwrap();
        assert!(handle.is_connected());
    }

    #[tokio::test]
    async fn test_manual_connect_reopens() {
        let rig = Rig::new();
        let device = rig.hc05();
        let handle = rig.spawn();
        wait_for(&handle, connected(DeviceType::Bluetooth)).await;

        handle.manual_connect().await.unwrap();
        let reopened = device.clone();
        wait_for(&handle, move |s| s.is_connected() && reopened.open_count() == 2).await;
    }

    #[tokio::test]
    async fn test_shutdown_closes_link() {
        let rig = Rig::new();
        let device = rig.hc05();
        let handle = rig.spawn();
        wait_for(&handle, connected(DeviceType::Bluetooth)).await;

        handle.shutdown().await.unwrap();
        assert!(!handle.is_connected());
        assert_eq!(
            handle.auto_detect().await,
            Err(LinkError::ManagerUnavailable)
        );
        // The device end notices the reader is gone
        device.inject_line("ignored");
    }
}
