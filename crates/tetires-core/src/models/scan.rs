//! Acquisition phases

use serde::{Deserialize, Serialize};

/// Phase of one tire-position acquisition
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScanState {
    #[default]
    Idle,
    WaitingScan,
    Scanning,
    Processing,
    ResultReady,
    Saved,
    Error,
}

impl ScanState {
    /// States from which a new position may be selected
    pub fn accepts_selection(self) -> bool {
        matches!(
            self,
            ScanState::Idle | ScanState::WaitingScan | ScanState::Saved
        )
    }
}

impl std::fmt::Display for ScanState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ScanState::Idle => "idle",
            ScanState::WaitingScan => "waiting_scan",
            ScanState::Scanning => "scanning",
            ScanState::Processing => "processing",
            ScanState::ResultReady => "result_ready",
            ScanState::Saved => "saved",
            ScanState::Error => "error",
        };
        f.write_str(s)
    }
}

/// What incoming records are used for
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum AppMode {
    /// Records only go to the passthrough log
    #[default]
    Terminal,
    /// Tire inspection for one bus check
    Inspection { bus_id: i64, check_id: i64 },
}
