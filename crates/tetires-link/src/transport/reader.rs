//! Shared open-link plumbing: one blocking reader, one writer
//!
//! Both transports are byte streams with the same lifecycle, so they share
//! [`SerialLink`]. The reader runs on the blocking pool, feeds a
//! [`LineFramer`] and publishes through the transport's broadcast channel.

use std::io::{self, Read, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tetires_core::{DeviceType, LineFramer};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

use super::{DisconnectReason, LinkIo, TransportError, TransportEvent};
use crate::config::FramingConfig;
use crate::gauge::TaskGauge;

const READ_CHUNK: usize = 1024;

type SharedWriter = Arc<Mutex<Option<Box<dyn Write + Send>>>>;

pub(crate) struct SerialLink {
    kind: DeviceType,
    events_tx: broadcast::Sender<TransportEvent>,
    /// Cleared exactly once per open, by whoever reports the disconnect
    open: Arc<AtomicBool>,
    writer: SharedWriter,
    reader: Option<JoinHandle<()>>,
    max_line_len: usize,
    write_timeout: Duration,
    readers: TaskGauge,
}

impl SerialLink {
    pub fn new(
        kind: DeviceType,
        framing: &FramingConfig,
        write_timeout: Duration,
        readers: TaskGauge,
    ) -> Self {
        let (events_tx, _) = broadcast::channel(framing.event_capacity.max(1));
        Self {
            kind,
            events_tx,
            open: Arc::new(AtomicBool::new(false)),
            writer: Arc::new(Mutex::new(None)),
            reader: None,
            max_line_len: framing.max_line_len,
            write_timeout,
            readers,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<TransportEvent> {
        self.events_tx.subscribe()
    }

    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    /// Take ownership of an opened stream and start reading it
    pub fn start(&mut self, io: LinkIo) {
        let LinkIo { reader, writer } = io;

        self.writer = Arc::new(Mutex::new(Some(writer)));
        self.open = Arc::new(AtomicBool::new(true));
        // Connected goes out before the reader can publish anything
        let _ = self.events_tx.send(TransportEvent::Connected);

        let open = self.open.clone();
        let tx = self.events_tx.clone();
        let framer = LineFramer::with_max_line_len(self.max_line_len);
        let guard = self.readers.enter();
        let kind = self.kind;

        let blocking = tokio::task::spawn_blocking(move || {
            let _guard = guard;
            read_loop(kind, reader, framer, &open, &tx);
        });

        let open = self.open.clone();
        let tx = self.events_tx.clone();
        self.reader = Some(tokio::spawn(async move {
            if let Err(e) = blocking.await {
                error!(link = %kind, error = %e, "Reader task failed");
                if open.swap(false, Ordering::SeqCst) {
                    let _ = tx.send(TransportEvent::Disconnected(
                        DisconnectReason::ReaderPanicked,
                    ));
                }
            }
        }));
    }

    /// Stop the reader and wait for it to exit, then report `reason`
    pub async fn stop(&mut self, reason: DisconnectReason) {
        let was_open = self.open.swap(false, Ordering::SeqCst);

        if let Some(handle) = self.reader.take() {
            // Bounded by the port read timeout
            let _ = handle.await;
        }
        // A write stuck past its timeout still holds the old writer; let it
        // go when that write returns.
        self.writer = Arc::new(Mutex::new(None));

        if was_open {
            debug!(link = %self.kind, %reason, "Link closed");
            let _ = self.events_tx.send(TransportEvent::Disconnected(reason));
        }
    }

    pub async fn send(&self, line: &str) -> Result<(), TransportError> {
        if !self.is_open() {
            return Err(TransportError::IoFailure("link not open".to_string()));
        }

        let writer = self.writer.clone();
        let mut payload = String::with_capacity(line.len() + 1);
        payload.push_str(line);
        payload.push('\n');

        let write = tokio::task::spawn_blocking(move || -> io::Result<()> {
            let mut guard = writer.lock();
            let writer = guard
                .as_mut()
                .ok_or_else(|| io::Error::new(io::ErrorKind::NotConnected, "link not open"))?;
            writer.write_all(payload.as_bytes())?;
            writer.flush()
        });

        match tokio::time::timeout(self.write_timeout, write).await {
            Ok(Ok(Ok(()))) => Ok(()),
            Ok(Ok(Err(e))) => Err(TransportError::IoFailure(format!("write failed: {}", e))),
            Ok(Err(e)) => Err(TransportError::IoFailure(format!("write task failed: {}", e))),
            Err(_) => Err(TransportError::IoFailure(format!(
                "write timed out after {:?}",
                self.write_timeout
            ))),
        }
    }
}

fn read_loop(
    kind: DeviceType,
    mut reader: Box<dyn Read + Send>,
    mut framer: LineFramer,
    open: &AtomicBool,
    tx: &broadcast::Sender<TransportEvent>,
) {
    let mut buf = [0u8; READ_CHUNK];
    let mut overflows = 0;

    while open.load(Ordering::SeqCst) {
        match reader.read(&mut buf) {
            Ok(0) => {
                report_loss(open, tx, DisconnectReason::Io("end of stream".to_string()));
                break;
            }
            Ok(n) => {
                for record in framer.feed(&buf[..n]) {
                    if !open.load(Ordering::SeqCst) {
                        debug!(link = %kind, "Reader cancelled mid-chunk");
                        return;
                    }
                    let _ = tx.send(TransportEvent::Record(record));
                }

                let stats = framer.stats();
                if stats.overflows > overflows && open.load(Ordering::SeqCst) {
                    overflows = stats.overflows;
                    let _ = tx.send(TransportEvent::Overflow(stats));
                }
            }
            Err(e)
                if matches!(
                    e.kind(),
                    io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted
                ) =>
            {
                continue;
            }
            Err(e) => {
                warn!(link = %kind, error = %e, "Read failed");
                report_loss(open, tx, DisconnectReason::Io(e.to_string()));
                break;
            }
        }
    }

    debug!(link = %kind, records = framer.stats().records, "Reader stopped");
}

fn report_loss(open: &AtomicBool, tx: &broadcast::Sender<TransportEvent>, reason: DisconnectReason) {
    if open.swap(false, Ordering::SeqCst) {
        let _ = tx.send(TransportEvent::Disconnected(reason));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::mock::MockDevice;
    use tetires_core::RawRecord;

    fn link(gauge: &TaskGauge) -> SerialLink {
        let framing = FramingConfig {
            max_line_len: 64,
            event_capacity: 64,
        };
        SerialLink::new(
            DeviceType::Usb,
            &framing,
            Duration::from_millis(200),
            gauge.clone(),
        )
    }

    async fn next(rx: &mut broadcast::Receiver<TransportEvent>) -> TransportEvent {
        tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("event timeout")
            .expect("channel closed")
    }

    fn record_text(event: TransportEvent) -> String {
        match event {
            TransportEvent::Record(RawRecord { text, .. }) => text,
            other => panic!("expected record, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_records_arrive_in_order_after_connected() {
        let gauge = TaskGauge::new();
        let device = MockDevice::new();
        let mut link = link(&gauge);
        let mut rx = link.subscribe();

        link.start(device.open_link(Duration::from_millis(20)).unwrap());
        device.inject_bytes(b"one\ntw");
        device.inject_bytes(b"o\n");

        assert_eq!(next(&mut rx).await, TransportEvent::Connected);
        assert_eq!(record_text(next(&mut rx).await), "one");
        assert_eq!(record_text(next(&mut rx).await), "two");
        assert_eq!(gauge.live(), 1);

        link.stop(DisconnectReason::Requested).await;
        assert_eq!(
            next(&mut rx).await,
            TransportEvent::Disconnected(DisconnectReason::Requested)
        );
        assert_eq!(gauge.live(), 0);
    }

    #[tokio::test]
    async fn test_stop_is_idempotent_and_silences_reader() {
        let gauge = TaskGauge::new();
        let device = MockDevice::new();
        let mut link = link(&gauge);
        let mut rx = link.subscribe();

        link.start(device.open_link(Duration::from_millis(20)).unwrap());
        link.stop(DisconnectReason::Requested).await;
        link.stop(DisconnectReason::Requested).await;
        device.inject_line("late");

        assert_eq!(next(&mut rx).await, TransportEvent::Connected);
        assert_eq!(
            next(&mut rx).await,
            TransportEvent::Disconnected(DisconnectReason::Requested)
        );
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_hangup_reports_io_loss_once() {
        let gauge = TaskGauge::new();
        let device = MockDevice::new();
        let mut link = link(&gauge);
        let mut rx = link.subscribe();

        link.start(device.open_link(Duration::from_millis(20)).unwrap());
        device.hang_up();

        assert_eq!(next(&mut rx).await, TransportEvent::Connected);
        assert!(matches!(
            next(&mut rx).await,
            TransportEvent::Disconnected(DisconnectReason::Io(_))
        ));
        assert!(!link.is_open());

        // Cleanup after a reader-reported loss publishes nothing further
        link.stop(DisconnectReason::Requested).await;
        assert!(rx.try_recv().is_err());
        assert_eq!(gauge.live(), 0);
    }

    #[tokio::test]
    async fn test_reader_panic_becomes_disconnect() {
        let gauge = TaskGauge::new();
        let device = MockDevice::new();
        let mut link = link(&gauge);
        let mut rx = link.subscribe();

        link.start(device.open_link(Duration::from_millis(20)).unwrap());
        device.crash_reader();

        assert_eq!(next(&mut rx).await, TransportEvent::Connected);
        assert_eq!(
            next(&mut rx).await,
            TransportEvent::Disconnected(DisconnectReason::ReaderPanicked)
        );
        link.stop(DisconnectReason::Requested).await;
        assert_eq!(gauge.live(), 0);
    }

    #[tokio::test]
    async fn test_overflow_is_reported_and_stream_continues() {
        let gauge = TaskGauge::new();
        let device = MockDevice::new();
        let mut link = link(&gauge);
        let mut rx = link.subscribe();

        link.start(device.open_link(Duration::from_millis(20)).unwrap());
        device.inject_bytes(&[b'x'; 100]);
        device.inject_line("ok");

        assert_eq!(next(&mut rx).await, TransportEvent::Connected);
        assert!(matches!(next(&mut rx).await, TransportEvent::Overflow(s) if s.overflows == 1));
        assert_eq!(record_text(next(&mut rx).await), "ok");
        link.stop(DisconnectReason::Requested).await;
    }

    #[tokio::test]
    async fn test_send_appends_delimiter_and_fails_when_closed() {
        let gauge = TaskGauge::new();
        let device = MockDevice::new();
        let mut link = link(&gauge);

        assert!(matches!(
            link.send("START").await,
            Err(TransportError::IoFailure(_))
        ));

        link.start(device.open_link(Duration::from_millis(20)).unwrap());
        link.send("START").await.unwrap();
        assert_eq!(device.written(), vec!["START".to_string()]);

        link.stop(DisconnectReason::Requested).await;
        assert!(link.send("STOP").await.is_err());
    }
}
