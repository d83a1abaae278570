//! Tire positions and per-position scan results

use serde::{Deserialize, Serialize};

use super::wear;

/// Wheel position on the bus
///
/// Ordering is the order results are saved and displayed in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum TirePosition {
    /// Front right (D-KA)
    FrontRight,
    /// Front left (D-KI)
    FrontLeft,
    /// Rear right (B-KA)
    RearRight,
    /// Rear left (B-KI)
    RearLeft,
}

impl TirePosition {
    pub const ALL: [TirePosition; 4] = [
        TirePosition::FrontRight,
        TirePosition::FrontLeft,
        TirePosition::RearRight,
        TirePosition::RearLeft,
    ];

    /// Label printed on the inspection sheet
    pub fn label(self) -> &'static str {
        match self {
            TirePosition::FrontRight => "D-KA",
            TirePosition::FrontLeft => "D-KI",
            TirePosition::RearRight => "B-KA",
            TirePosition::RearLeft => "B-KI",
        }
    }

    /// Storage code (label without the dash)
    pub fn code(self) -> &'static str {
        match self {
            TirePosition::FrontRight => "DKA",
            TirePosition::FrontLeft => "DKI",
            TirePosition::RearRight => "BKA",
            TirePosition::RearLeft => "BKI",
        }
    }
}

impl std::fmt::Display for TirePosition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.label())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("Unknown tire position: {0}")]
pub struct UnknownPosition(pub String);

impl std::str::FromStr for TirePosition {
    type Err = UnknownPosition;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wanted = s.trim();
        Self::ALL
            .into_iter()
            .find(|p| p.label().eq_ignore_ascii_case(wanted) || p.code().eq_ignore_ascii_case(wanted))
            .ok_or_else(|| UnknownPosition(s.to_string()))
    }
}

/// Processed outcome for one tire position
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TireScanResult {
    pub position: TirePosition,
    /// Groove depths in millimetres, grooves 1..=4
    pub grooves: [f32; 4],
    pub adc_mean: f32,
    pub adc_std: f32,
    pub voltage_mv: f32,
    pub thickness_mm: f32,
    pub is_worn: bool,
    /// Number of samples the result was computed from
    pub sample_count: usize,
}

impl TireScanResult {
    /// Shallowest plausible groove, 0.0 when there is none
    pub fn min_groove(&self) -> f32 {
        self.grooves
            .iter()
            .copied()
            .filter(|g| wear::is_plausible(Some(*g)))
            .reduce(f32::min)
            .unwrap_or(0.0)
    }

    /// "a | b | c | d" with one decimal each
    pub fn grooves_formatted(&self) -> String {
        self.grooves
            .iter()
            .map(|g| format!("{:.1}", g))
            .collect::<Vec<_>>()
            .join(" | ")
    }

    /// One-line summary for status displays
    pub fn summary(&self) -> String {
        format!(
            "{}: Min {} - {}",
            self.position,
            wear::format_depth(Some(self.min_groove())),
            wear::format_status(Some(self.is_worn))
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn result(grooves: [f32; 4]) -> TireScanResult {
        TireScanResult {
            position: TirePosition::RearLeft,
            grooves,
            adc_mean: 1200.0,
            adc_std: 12.5,
            voltage_mv: 967.0,
            thickness_mm: 4.0,
            is_worn: false,
            sample_count: 1110,
        }
    }

    #[test]
    fn test_position_parsing() {
        assert_eq!("d-ka".parse::<TirePosition>(), Ok(TirePosition::FrontRight));
        assert_eq!("BKI".parse::<TirePosition>(), Ok(TirePosition::RearLeft));
        assert!("X-YZ".parse::<TirePosition>().is_err());
    }

    #[test]
    fn test_min_groove_ignores_nan() {
        assert_eq!(result([3.2, f32::NAN, 2.1, 4.0]).min_groove(), 2.1);
        assert_eq!(result([f32::NAN; 4]).min_groove(), 0.0);
    }

    #[test]
    fn test_min_groove_skips_out_of_range_depths() {
        assert_eq!(result([3.2, -1.0, 60.0, 2.5]).min_groove(), 2.5);
        assert_eq!(result([-0.5, 75.0, f32::INFINITY, -3.0]).min_groove(), 0.0);
    }

    #[test]
    fn test_summary() {
        let mut worn = result([1.54, 2.0, 1.9, 2.2]);
        worn.is_worn = true;
        assert_eq!(worn.summary(), "B-KI: Min 1.5 mm - Worn");
        assert_eq!(result([3.0, 3.1, 2.96, 4.0]).summary(), "B-KI: Min 3.0 mm - Not worn");
    }

    #[test]
    fn test_grooves_formatted() {
        assert_eq!(
            result([3.25, 2.0, 1.64, 4.0]).grooves_formatted(),
            "3.2 | 2.0 | 1.6 | 4.0"
        );
    }
}
