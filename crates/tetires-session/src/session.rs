//! Acquisition session
//!
//! One task owns the scan buffer, the result map and the scan state. Operator
//! requests, link events and collaborator completions are all handled on
//! that task, one at a time, so none of them needs a lock.
//!
//! ```text
//!  Idle ──select──▶ WaitingScan ──start──▶ Scanning ──N records / stop──▶ Processing
//!   ▲                                        │                             │      │
//!   │                                   link lost                      success  failure
//!   │                                        ▼                             ▼      ▼
//!   └──────────── acknowledge ──────────── Error ◀──────────────── ResultReady  Error
//!   └─────────────────────────── confirm ───────────────────────────────┘
//! ```

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::Serialize;
use tetires_core::{
    AppMode, ConnectionSnapshot, DeviceType, LinkEvent, ScanState, StatePublisher, StateView,
    TirePosition, TireScanResult,
};
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::{JoinError, JoinHandle};
use tracing::{debug, error, info, warn};

use crate::backend::{
    CheckSummary, PersistenceBackend, PersistenceError, ProcessingBackend, ProcessingError,
};
use crate::config::SessionConfig;
use crate::error::{Result, SessionError};
use crate::link::DeviceLink;
use crate::processing::Measurement;
use crate::terminal::TerminalLog;

const REQUEST_CAPACITY: usize = 32;

const CMD_START: &str = "START";
const CMD_STOP: &str = "STOP";

/// Everything an observer may know about the session
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SessionSnapshot {
    pub mode: AppMode,
    pub state: ScanState,
    /// Position being selected, scanned or shown
    pub current_position: Option<TirePosition>,
    /// Records in the scan buffer
    pub buffered: usize,
    pub results: BTreeMap<TirePosition, TireScanResult>,
    /// Every stored result has been written
    pub saved: bool,
    /// A save is in flight
    pub saving: bool,
    pub message: String,
    pub warning: Option<String>,
}

impl Default for SessionSnapshot {
    fn default() -> Self {
        Self {
            mode: AppMode::Terminal,
            state: ScanState::Idle,
            current_position: None,
            buffered: 0,
            results: BTreeMap::new(),
            saved: false,
            saving: false,
            message: "Terminal mode active".to_string(),
            warning: None,
        }
    }
}

/// Outcome of selecting a position
#[derive(Debug, Clone, PartialEq)]
pub enum Selection {
    Ready,
    /// The position already has a result; scanning again replaces it
    Rescan { previous: TireScanResult },
}

/// External collaborators of a session
#[derive(Clone)]
pub struct Backends {
    pub processing: Arc<dyn ProcessingBackend>,
    pub persistence: Arc<dyn PersistenceBackend>,
}

type Reply<T> = oneshot::Sender<Result<T>>;

enum Request {
    EnterInspection {
        bus_id: i64,
        check_id: i64,
        reply: Reply<()>,
    },
    LeaveInspection(Reply<()>),
    Select {
        position: TirePosition,
        reply: Reply<Selection>,
    },
    Start(Reply<()>),
    Stop(Reply<()>),
    Confirm(Reply<()>),
    Acknowledge(Reply<()>),
    /// Answered when the save completes
    Save(Reply<()>),
    Send {
        line: String,
        reply: Reply<()>,
    },
    Shutdown(oneshot::Sender<()>),
}

enum Job {
    Processing {
        position: TirePosition,
        task: JoinHandle<std::result::Result<Measurement, ProcessingError>>,
    },
    Saving {
        task: JoinHandle<std::result::Result<(), PersistenceError>>,
        reply: Reply<()>,
    },
}

enum JobOutcome {
    Processed(std::result::Result<std::result::Result<Measurement, ProcessingError>, JoinError>),
    Saved(std::result::Result<std::result::Result<(), PersistenceError>, JoinError>),
}

enum Wake {
    Request(Request),
    Job(JobOutcome),
    Link(std::result::Result<LinkEvent, broadcast::error::RecvError>),
}

/// Cloneable handle to a running [`AcquisitionSession`]
#[derive(Clone)]
pub struct SessionHandle {
    requests: mpsc::Sender<Request>,
    state: StateView<SessionSnapshot>,
    log: TerminalLog,
}

impl SessionHandle {
    async fn call<T>(&self, make: impl FnOnce(Reply<T>) -> Request) -> Result<T> {
        let (reply, rx) = oneshot::channel();
        self.requests
            .send(make(reply))
            .await
            .map_err(|_| SessionError::SessionClosed)?;
        rx.await.map_err(|_| SessionError::SessionClosed)?
    }

    /// Start inspecting one bus check; clears previous results
    pub async fn enter_inspection(&self, bus_id: i64, check_id: i64) -> Result<()> {
        self.call(|reply| Request::EnterInspection {
            bus_id,
            check_id,
            reply,
        })
        .await
    }

    /// Back to terminal mode; the inspection context is dropped
    pub async fn leave_inspection(&self) -> Result<()> {
        self.call(Request::LeaveInspection).await
    }

    pub async fn select_position(&self, position: TirePosition) -> Result<Selection> {
        self.call(|reply| Request::Select { position, reply }).await
    }

    pub async fn start_scan(&self) -> Result<()> {
        self.call(Request::Start).await
    }

    /// Send STOP and process what was buffered
    pub async fn stop_scan(&self) -> Result<()> {
        self.call(Request::Stop).await
    }

    pub async fn confirm(&self) -> Result<()> {
        self.call(Request::Confirm).await
    }

    pub async fn acknowledge_error(&self) -> Result<()> {
        self.call(Request::Acknowledge).await
    }

    /// Write all results; returns once the save has finished
    pub async fn save_all(&self) -> Result<()> {
        self.call(Request::Save).await
    }

    /// Send a free-form command line to the device
    pub async fn send_command(&self, line: &str) -> Result<()> {
        let line = line.to_string();
        self.call(|reply| Request::Send { line, reply }).await
    }

    pub async fn shutdown(&self) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        self.requests
            .send(Request::Shutdown(reply))
            .await
            .map_err(|_| SessionError::SessionClosed)?;
        rx.await.map_err(|_| SessionError::SessionClosed)
    }

    pub fn state(&self) -> StateView<SessionSnapshot> {
        self.state.clone()
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        self.state.current()
    }

    pub fn log(&self) -> &TerminalLog {
        &self.log
    }
}

pub struct AcquisitionSession {
    config: SessionConfig,
    link: Arc<dyn DeviceLink>,
    backends: Backends,
    log: TerminalLog,
    requests: mpsc::Receiver<Request>,
    events: Option<broadcast::Receiver<LinkEvent>>,
    state: StatePublisher<SessionSnapshot>,
    snap: SessionSnapshot,
    buffer: Vec<String>,
    /// Transport the running scan started on
    scan_device: Option<DeviceType>,
    job: Option<Job>,
}

impl AcquisitionSession {
    /// Start the session task
    ///
    /// The session subscribes to the link before returning, so no record
    /// sent after `spawn` is missed.
    pub fn spawn(
        config: SessionConfig,
        link: Arc<dyn DeviceLink>,
        backends: Backends,
        log: TerminalLog,
    ) -> SessionHandle {
        let (tx, rx) = mpsc::channel(REQUEST_CAPACITY);
        let snap = SessionSnapshot::default();
        let state = StatePublisher::new(snap.clone());

        let handle = SessionHandle {
            requests: tx,
            state: state.view(),
            log: log.clone(),
        };

        let session = Self {
            config,
            events: Some(link.subscribe()),
            link,
            backends,
            log,
            requests: rx,
            state,
            snap,
            buffer: Vec::new(),
            scan_device: None,
            job: None,
        };
        tokio::spawn(session.run());

        handle
    }

    async fn run(mut self) {
        info!(capacity = self.config.batch_capacity, "Acquisition session started");

        loop {
            let wake = tokio::select! {
                request = self.requests.recv() => match request {
                    Some(request) => Wake::Request(request),
                    None => break,
                },
                outcome = next_outcome(self.job.as_mut()) => Wake::Job(outcome),
                event = next_link_event(self.events.as_mut()) => Wake::Link(event),
            };

            match wake {
                Wake::Request(request) => {
                    if !self.handle_request(request).await {
                        return;
                    }
                }
                Wake::Job(outcome) => self.on_job_done(outcome),
                Wake::Link(event) => self.on_link_event(event),
            }
        }

        self.abort_job();
        info!("Acquisition session stopped");
    }

    /// Returns false once the session should stop
    async fn handle_request(&mut self, request: Request) -> bool {
        match request {
            Request::EnterInspection {
                bus_id,
                check_id,
                reply,
            } => {
                let result = self.enter_inspection(bus_id, check_id).await;
                let _ = reply.send(result);
            }
            Request::LeaveInspection(reply) => {
                let _ = reply.send(self.leave_inspection());
            }
            Request::Select { position, reply } => {
                let result = self.select_position(position);
                if let Err(e) = &result {
                    self.fail_request(e);
                }
                let _ = reply.send(result);
            }
            Request::Start(reply) => {
                let result = self.start_scan().await;
                let _ = reply.send(result);
            }
            Request::Stop(reply) => {
                let result = self.stop_scan().await;
                let _ = reply.send(result);
            }
            Request::Confirm(reply) => {
                let _ = reply.send(self.confirm());
            }
            Request::Acknowledge(reply) => {
                let _ = reply.send(self.acknowledge_error());
            }
            Request::Save(reply) => self.save_all(reply),
            Request::Send { line, reply } => {
                let result = self.send(&line).await;
                let _ = reply.send(result);
            }
            Request::Shutdown(reply) => {
                self.requests.close();
                self.abort_job();
                info!("Acquisition session stopped");
                let _ = reply.send(());
                return false;
            }
        }
        true
    }

    // =========================================================================
    // Modes
    // =========================================================================

    async fn enter_inspection(&mut self, bus_id: i64, check_id: i64) -> Result<()> {
        self.ensure_not_saving()?;
        self.abort_job();
        self.reset_context();
        self.snap.mode = AppMode::Inspection { bus_id, check_id };

        self.log.append("=== INSPECTION MODE ===");
        self.log.append(&format!("Bus ID: {}", bus_id));
        self.log.append(&format!("Check ID: {}", check_id));
        info!(bus_id, check_id, "Inspection started");

        if self.link.snapshot().is_connected() {
            self.snap.message = "Select a tire position to scan".to_string();
            self.publish();
        } else {
            self.snap.message = "Connecting device...".to_string();
            self.publish();
            if let Err(e) = self.link.auto_detect().await {
                warn!(error = %e, "Could not request device detection");
            }
        }
        Ok(())
    }

    fn leave_inspection(&mut self) -> Result<()> {
        self.ensure_not_saving()?;
        if self.snap.mode != AppMode::Terminal {
            self.log.append("=== TERMINAL MODE ===");
        }
        self.abort_job();
        self.reset_context();
        self.snap.mode = AppMode::Terminal;
        self.snap.message = "Terminal mode active".to_string();
        self.publish();
        Ok(())
    }

    fn reset_context(&mut self) {
        self.buffer.clear();
        self.scan_device = None;
        self.snap.state = ScanState::Idle;
        self.snap.current_position = None;
        self.snap.buffered = 0;
        self.snap.results.clear();
        self.snap.saved = false;
        self.snap.warning = None;
    }

    // =========================================================================
    // Scan lifecycle
    // =========================================================================

    fn select_position(&mut self, position: TirePosition) -> Result<Selection> {
        if !matches!(self.snap.mode, AppMode::Inspection { .. }) {
            return Err(SessionError::NotInInspection);
        }
        self.ensure_idle_job()?;
        if !self.snap.state.accepts_selection() {
            return Err(SessionError::InvalidState(self.snap.state));
        }
        if !self.link.snapshot().is_connected() {
            return Err(SessionError::NotConnected);
        }

        let selection = match self.snap.results.get(&position) {
            Some(previous) => {
                let warning = format!("Position {} already scanned. Scan again?", position);
                warn!(%position, "Position already has a result");
                self.log.append(&warning);
                self.snap.warning = Some(warning);
                Selection::Rescan {
                    previous: previous.clone(),
                }
            }
            None => {
                self.snap.warning = None;
                Selection::Ready
            }
        };

        self.snap.current_position = Some(position);
        self.snap.state = ScanState::WaitingScan;
        self.snap.message = format!("Ready to scan {}. Press 'Start Scan'.", position);
        self.log.append(&format!("--- POSITION: {} ---", position));
        self.publish();
        Ok(selection)
    }

    async fn start_scan(&mut self) -> Result<()> {
        let Some(position) = self.snap.current_position else {
            let err = SessionError::NoPosition;
            self.fail_request(&err);
            return Err(err);
        };
        if self.snap.state != ScanState::WaitingScan {
            let err = SessionError::InvalidState(self.snap.state);
            self.fail_request(&err);
            return Err(err);
        }

        self.drain_stale_events();
        if self.snap.state != ScanState::WaitingScan {
            return Err(SessionError::InvalidState(self.snap.state));
        }

        if let Err(e) = self.send(CMD_START).await {
            self.snap.message = format!("Error: could not start scan: {}", e);
            self.publish();
            return Err(e);
        }

        self.buffer.clear();
        self.scan_device = Some(self.link.snapshot().device_type);
        self.snap.state = ScanState::Scanning;
        self.snap.buffered = 0;
        self.snap.warning = None;
        self.snap.message = format!("Scanning {}...", position);
        self.log.append(&format!(">>> START SCAN {}", position));
        info!(%position, "Scan started");
        self.publish();
        Ok(())
    }

    async fn stop_scan(&mut self) -> Result<()> {
        if self.snap.state != ScanState::Scanning {
            return Err(SessionError::InvalidState(self.snap.state));
        }
        if let Err(e) = self.send(CMD_STOP).await {
            warn!(error = %e, "STOP not delivered, processing buffered records anyway");
        }
        self.snap.message = "Stopping scan...".to_string();
        self.begin_processing()
    }

    fn on_record(&mut self, text: String) {
        if self.snap.state != ScanState::Scanning {
            self.log.append(&text);
            return;
        }

        self.buffer.push(text);
        self.snap.buffered = self.buffer.len();
        if self.buffer.len() >= self.config.batch_capacity {
            info!(records = self.buffer.len(), "Scan buffer full, processing");
            let _ = self.begin_processing();
        } else {
            self.publish();
        }
    }

    /// Hand the buffer to the processing collaborator
    fn begin_processing(&mut self) -> Result<()> {
        self.scan_device = None;
        if self.buffer.is_empty() {
            self.snap.state = ScanState::Error;
            self.snap.message = "No data to process".to_string();
            self.log.append("ERROR: no data to process");
            self.publish();
            return Err(SessionError::NoData);
        }
        let Some(position) = self.snap.current_position else {
            self.buffer.clear();
            self.snap.state = ScanState::Error;
            self.snap.message = "Error: invalid position".to_string();
            self.publish();
            return Err(SessionError::NoPosition);
        };

        let samples = std::mem::take(&mut self.buffer);
        let count = samples.len();
        self.snap.state = ScanState::Processing;
        self.snap.buffered = 0;
        self.snap.message = format!("Processing {} samples for {}...", count, position);
        self.log
            .append(&format!("Processing {} lines for {}", count, position));
        self.publish();

        let processing = self.backends.processing.clone();
        let task = tokio::spawn(async move { processing.process(samples).await });
        self.job = Some(Job::Processing { position, task });
        Ok(())
    }

    fn on_processed(
        &mut self,
        position: TirePosition,
        outcome: std::result::Result<std::result::Result<Measurement, ProcessingError>, JoinError>,
    ) {
        let failure = match outcome {
            Ok(Ok(measurement)) => {
                let result = measurement.into_result(position);
                self.log.append(&format!(
                    "=== RESULT {} ===\nMean ADC: {:.2}\nADC std: {:.2}\nVoltage: {:.1} mV\nThickness: {:.2} mm\nGrooves: {}\nStatus: {}",
                    position,
                    result.adc_mean,
                    result.adc_std,
                    result.voltage_mv,
                    result.thickness_mm,
                    result.grooves_formatted(),
                    if result.is_worn { "WORN" } else { "OK" },
                ));
                info!(%position, min_groove = result.min_groove(), worn = result.is_worn, "Scan processed");
                self.snap.message = result.summary();
                self.snap.results.insert(position, result);
                self.snap.saved = false;
                self.snap.state = ScanState::ResultReady;
                self.publish();
                return;
            }
            Ok(Err(e)) => e.to_string(),
            Err(e) => format!("processing task failed: {}", e),
        };

        error!(%position, error = %failure, "Processing failed");
        self.log.append(&format!("ERROR: {}", failure));
        self.snap.state = ScanState::Error;
        self.snap.message = format!("Error: {}", failure);
        self.publish();
    }

    fn confirm(&mut self) -> Result<()> {
        if self.snap.state != ScanState::ResultReady {
            return Err(SessionError::InvalidState(self.snap.state));
        }
        let label = self
            .snap
            .current_position
            .map(|p| p.label())
            .unwrap_or("Unknown");
        self.log.append(&format!("Result {} confirmed", label));
        self.to_idle("Select the next position or save all");
        Ok(())
    }

    fn acknowledge_error(&mut self) -> Result<()> {
        if self.snap.state != ScanState::Error {
            return Err(SessionError::InvalidState(self.snap.state));
        }
        self.to_idle("Select a tire position to scan");
        Ok(())
    }

    fn to_idle(&mut self, message: &str) {
        self.buffer.clear();
        self.scan_device = None;
        self.snap.current_position = None;
        self.snap.buffered = 0;
        self.snap.warning = None;
        self.snap.state = ScanState::Idle;
        self.snap.message = message.to_string();
        self.publish();
    }

    // =========================================================================
    // Saving
    // =========================================================================

    fn save_all(&mut self, reply: Reply<()>) {
        if let Err(e) = self.check_can_save() {
            self.fail_request(&e);
            let _ = reply.send(Err(e));
            return;
        }
        let AppMode::Inspection { bus_id, check_id } = self.snap.mode else {
            let _ = reply.send(Err(SessionError::NotInInspection));
            return;
        };

        let results: Vec<TireScanResult> = self.snap.results.values().cloned().collect();
        let summary = CheckSummary {
            bus_id,
            check_id,
            worn: results.iter().map(|r| (r.position, r.is_worn)).collect(),
        };

        self.snap.saving = true;
        self.snap.message = "Saving results...".to_string();
        self.log.append("=== SAVING RESULTS ===");
        self.publish();

        let persistence = self.backends.persistence.clone();
        let log = self.log.clone();
        let task = tokio::spawn(async move {
            for result in results {
                let position = result.position;
                persistence.save_position(check_id, result).await?;
                log.append(&format!("Saved result for {}", position));
            }
            persistence.finalize_check(summary).await?;
            log.append("Updated check summary");
            Ok::<(), PersistenceError>(())
        });
        self.job = Some(Job::Saving { task, reply });
    }

    fn check_can_save(&self) -> Result<()> {
        if !matches!(self.snap.mode, AppMode::Inspection { .. }) {
            return Err(SessionError::NotInInspection);
        }
        self.ensure_idle_job()?;
        if self.snap.results.is_empty() {
            return Err(SessionError::NothingToSave);
        }
        match self.snap.state {
            ScanState::Idle | ScanState::Saved => Ok(()),
            state => Err(SessionError::InvalidState(state)),
        }
    }

    fn on_saved(
        &mut self,
        reply: Reply<()>,
        outcome: std::result::Result<std::result::Result<(), PersistenceError>, JoinError>,
    ) {
        self.snap.saving = false;
        let result = match outcome {
            Ok(Ok(())) => {
                info!(positions = self.snap.results.len(), "Results saved");
                self.log.append("=== SAVE COMPLETE ===");
                self.buffer.clear();
                self.snap.current_position = None;
                self.snap.buffered = 0;
                self.snap.saved = true;
                self.snap.state = ScanState::Saved;
                self.snap.message = "All results saved".to_string();
                Ok(())
            }
            Ok(Err(e)) => Err(e),
            Err(e) => Err(PersistenceError::Storage(format!("save task failed: {}", e))),
        };

        // Saves start from Idle or Saved; a failed one leaves the scan at Idle
        let result = result.map_err(|e| {
            error!(error = %e, "Saving results failed");
            self.log.append(&format!("ERROR SAVE: {}", e));
            self.snap.saved = false;
            self.snap.state = ScanState::Idle;
            self.snap.message = format!("Failed to save: {}", e);
            SessionError::from(e)
        });
        self.publish();
        let _ = reply.send(result);
    }

    // =========================================================================
    // Jobs
    // =========================================================================

    fn on_job_done(&mut self, outcome: JobOutcome) {
        match (self.job.take(), outcome) {
            (Some(Job::Processing { position, .. }), JobOutcome::Processed(outcome)) => {
                self.on_processed(position, outcome)
            }
            (Some(Job::Saving { reply, .. }), JobOutcome::Saved(outcome)) => {
                self.on_saved(reply, outcome)
            }
            _ => debug!("Job outcome without a matching job"),
        }
    }

    fn abort_job(&mut self) {
        match self.job.take() {
            Some(Job::Processing { position, task }) => {
                debug!(%position, "Processing abandoned");
                task.abort();
            }
            Some(Job::Saving { task, reply }) => {
                task.abort();
                let _ = reply.send(Err(SessionError::SessionClosed));
            }
            None => {}
        }
    }

    fn ensure_idle_job(&self) -> Result<()> {
        match &self.job {
            Some(Job::Processing { .. }) => Err(SessionError::Busy("processing")),
            Some(Job::Saving { .. }) => Err(SessionError::Busy("save")),
            None => Ok(()),
        }
    }

    fn ensure_not_saving(&self) -> Result<()> {
        match &self.job {
            Some(Job::Saving { .. }) => Err(SessionError::Busy("save")),
            _ => Ok(()),
        }
    }

    // =========================================================================
    // Link events
    // =========================================================================

    fn on_link_event(&mut self, event: std::result::Result<LinkEvent, broadcast::error::RecvError>) {
        match event {
            Ok(LinkEvent::Record(record)) => self.on_record(record.text),
            Ok(LinkEvent::Status(snapshot)) => self.on_status(snapshot),
            Ok(LinkEvent::Notice(text)) => {
                if self.snap.mode == AppMode::Terminal {
                    self.log.append(&text);
                }
            }
            Ok(LinkEvent::Gap(skipped)) => {
                warn!(skipped, "Link dropped transport events");
                self.on_records_lost(skipped);
            }
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                warn!(skipped, "Session fell behind link events");
                self.on_records_lost(skipped);
            }
            Err(broadcast::error::RecvError::Closed) => {
                warn!("Link event stream closed");
                self.events = None;
                if self.snap.state == ScanState::Scanning {
                    self.scan_failed("Connection lost during scan".to_string());
                }
            }
        }
    }

    fn on_status(&mut self, snapshot: ConnectionSnapshot) {
        self.log.system(&snapshot.status);

        if self.snap.state == ScanState::Scanning {
            let same_link = snapshot.is_connected() && Some(snapshot.device_type) == self.scan_device;
            if !same_link {
                self.scan_failed("Connection lost during scan".to_string());
            }
            return;
        }

        if snapshot.is_connected()
            && self.snap.state == ScanState::Idle
            && matches!(self.snap.mode, AppMode::Inspection { .. })
        {
            self.snap.message = "Device connected! Select a tire position to scan.".to_string();
            self.publish();
        }
    }

    /// A scan batch with holes in it is never processed
    fn on_records_lost(&mut self, skipped: u64) {
        if self.snap.state == ScanState::Scanning {
            self.scan_failed(format!("Lost {} records during scan", skipped));
        }
    }

    /// Scan aborted by the link; nothing is processed
    fn scan_failed(&mut self, message: String) {
        warn!(records = self.buffer.len(), reason = %message, "Scan aborted");
        self.buffer.clear();
        self.scan_device = None;
        self.snap.buffered = 0;
        self.snap.state = ScanState::Error;
        self.log.append(&format!("ERROR: {}", message));
        self.snap.message = message;
        self.publish();
    }

    /// Consume everything already queued, before START is sent
    fn drain_stale_events(&mut self) {
        let mut drained = Vec::new();
        if let Some(events) = self.events.as_mut() {
            loop {
                match events.try_recv() {
                    Ok(event) => drained.push(Ok(event)),
                    Err(broadcast::error::TryRecvError::Empty) => break,
                    Err(broadcast::error::TryRecvError::Lagged(n)) => {
                        drained.push(Err(broadcast::error::RecvError::Lagged(n)))
                    }
                    Err(broadcast::error::TryRecvError::Closed) => {
                        drained.push(Err(broadcast::error::RecvError::Closed));
                        break;
                    }
                }
            }
        }
        if !drained.is_empty() {
            debug!(events = drained.len(), "Drained stale link events");
        }
        for event in drained {
            self.on_link_event(event);
        }
    }

    // =========================================================================
    // Helpers
    // =========================================================================

    async fn send(&mut self, line: &str) -> Result<()> {
        match self.link.send_command(line).await {
            Ok(()) => {
                self.log.sent(line);
                Ok(())
            }
            Err(e) => {
                warn!(command = %line, error = %e, "Send failed");
                self.log.append(&format!("ERROR: send {} failed: {}", line, e));
                Err(e.into())
            }
        }
    }

    fn fail_request(&mut self, err: &SessionError) {
        self.snap.message = match err {
            SessionError::NothingToSave => err.to_string(),
            _ => format!("Error: {}", err),
        };
        self.publish();
    }

    fn publish(&mut self) {
        if self.state.publish(self.snap.clone()) {
            debug!(state = %self.snap.state, buffered = self.snap.buffered, "Session state");
        }
    }
}

async fn next_outcome(job: Option<&mut Job>) -> JobOutcome {
    match job {
        Some(Job::Processing { task, .. }) => JobOutcome::Processed(task.await),
        Some(Job::Saving { task, .. }) => JobOutcome::Saved(task.await),
        None => std::future::pending().await,
    }
}

async fn next_link_event(
    events: Option<&mut broadcast::Receiver<LinkEvent>>,
) -> std::result::Result<LinkEvent, broadcast::error::RecvError> {
    match events {
        Some(events) => events.recv().await,
        None => std::future::pending().await,
    }
}
