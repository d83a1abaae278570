//! Processing response decoding
//!
//! The processing program answers with a JSON envelope:
//!
//! ```json
//! { "success": true, "result": { "alur1": 3.1, "alur2": 2.9, "alur3": 3.0,
//!   "alur4": 2.7, "thickness_mm": 3.0, "adc_mean": 1830.2, "adc_std": 14.1,
//!   "voltage_mV": 1475.0, "is_worn": false, "pixel_count": 1110 } }
//! ```
//!
//! `success` defaults to true and the measurement fields may sit at the top
//! level instead of under `result`. Missing or non-numeric values read as
//! zero, and so do groove depths outside the plausible range. Without
//! `is_worn` the flag follows the shallowest groove left.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tetires_core::{wear, TirePosition, TireScanResult};
use tracing::warn;

use crate::backend::ProcessingError;

const DEFAULT_FAILURE: &str = "Processing failed";

/// Measurement for one scan, before it is tied to a position
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Measurement {
    pub grooves: [f32; 4],
    pub thickness_mm: f32,
    pub adc_mean: f32,
    pub adc_std: f32,
    pub voltage_mv: f32,
    pub is_worn: bool,
    pub sample_count: usize,
}

impl Measurement {
    pub fn into_result(self, position: TirePosition) -> TireScanResult {
        TireScanResult {
            position,
            grooves: self.grooves,
            adc_mean: self.adc_mean,
            adc_std: self.adc_std,
            voltage_mv: self.voltage_mv,
            thickness_mm: self.thickness_mm,
            is_worn: self.is_worn,
            sample_count: self.sample_count,
        }
    }
}

/// Decoded processing envelope
#[derive(Debug, Clone, PartialEq)]
pub enum ProcessingResponse {
    Success(Measurement),
    Failure(String),
}

impl ProcessingResponse {
    /// Decode `text`; `samples` is the pixel count used when the response
    /// does not carry one
    pub fn from_json(text: &str, samples: usize) -> Result<Self, ProcessingError> {
        let value: Value = serde_json::from_str(text.trim())
            .map_err(|e| ProcessingError::InvalidResponse(e.to_string()))?;
        let Value::Object(envelope) = value else {
            return Err(ProcessingError::InvalidResponse(
                "expected a JSON object".to_string(),
            ));
        };

        let success = envelope
            .get("success")
            .and_then(Value::as_bool)
            .unwrap_or(true);
        if !success {
            let message = envelope
                .get("message")
                .and_then(Value::as_str)
                .unwrap_or(DEFAULT_FAILURE);
            return Ok(ProcessingResponse::Failure(message.to_string()));
        }

        let data = match envelope.get("result") {
            Some(Value::Object(result)) => result,
            _ => &envelope,
        };

        let grooves = ["alur1", "alur2", "alur3", "alur4"].map(|key| groove(data, key));
        let is_worn = data
            .get("is_worn")
            .and_then(Value::as_bool)
            .unwrap_or_else(|| worn_from_grooves(&grooves));

        Ok(ProcessingResponse::Success(Measurement {
            grooves,
            thickness_mm: number(data, "thickness_mm"),
            adc_mean: number(data, "adc_mean"),
            adc_std: number(data, "adc_std"),
            voltage_mv: number(data, "voltage_mV"),
            is_worn,
            sample_count: data
                .get("pixel_count")
                .and_then(Value::as_u64)
                .map(|n| n as usize)
                .unwrap_or(samples),
        }))
    }

    pub fn into_result(self) -> Result<Measurement, ProcessingError> {
        match self {
            ProcessingResponse::Success(m) => Ok(m),
            ProcessingResponse::Failure(message) => Err(ProcessingError::Failed(message)),
        }
    }
}

fn number(data: &Map<String, Value>, key: &str) -> f32 {
    data.get(key)
        .and_then(Value::as_f64)
        .map(|v| v as f32)
        .filter(|v| v.is_finite())
        .unwrap_or(0.0)
}

fn groove(data: &Map<String, Value>, key: &str) -> f32 {
    let depth = number(data, key);
    if wear::is_plausible(Some(depth)) {
        depth
    } else {
        warn!(groove = key, depth, "Discarding implausible groove depth");
        0.0
    }
}

/// A tire with no readable groove counts as worn
fn worn_from_grooves(grooves: &[f32; 4]) -> bool {
    let shallowest = grooves.iter().copied().filter(|g| *g > 0.0).reduce(f32::min);
    wear::is_worn(shallowest).unwrap_or(true)
}
