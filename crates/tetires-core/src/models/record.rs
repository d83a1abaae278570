//! Records received from the measurement device

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One complete line received from the device
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawRecord {
    /// Line content, trimmed, without the delimiter
    pub text: String,
    /// When the chunk completing this line arrived
    pub received_at: DateTime<Utc>,
}

impl RawRecord {
    pub fn new(text: impl Into<String>) -> Self {
        Self::at(text, Utc::now())
    }

    pub fn at(text: impl Into<String>, received_at: DateTime<Utc>) -> Self {
        Self {
            text: text.into(),
            received_at,
        }
    }
}
