//! Tread-depth helpers
//!
//! A tire is worn once its tread is at or below 1.6 mm.

/// Worn threshold in millimetres (inclusive)
pub const WORN_THRESHOLD_MM: f32 = 1.6;

/// Upper bound for a plausible tread depth reading
pub const MAX_PLAUSIBLE_MM: f32 = 50.0;

/// `None` when no depth is known
pub fn is_worn(depth_mm: Option<f32>) -> Option<bool> {
    depth_mm.map(|d| d <= WORN_THRESHOLD_MM)
}

pub fn is_plausible(depth_mm: Option<f32>) -> bool {
    matches!(depth_mm, Some(d) if (0.0..=MAX_PLAUSIBLE_MM).contains(&d))
}

pub fn format_depth(depth_mm: Option<f32>) -> String {
    depth_mm
        .map(|d| format!("{:.1} mm", d))
        .unwrap_or_else(|| "-".to_string())
}

pub fn format_status(worn: Option<bool>) -> &'static str {
    match worn {
        Some(true) => "Worn",
        Some(false) => "Not worn",
        None => "Not checked",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_threshold_is_inclusive() {
        assert_eq!(is_worn(Some(1.6)), Some(true));
        assert_eq!(is_worn(Some(1.61)), Some(false));
        assert_eq!(is_worn(None), None);
    }

    #[test]
    fn test_plausibility_and_formatting() {
        assert!(is_plausible(Some(0.0)));
        assert!(!is_plausible(Some(-0.1)));
        assert!(!is_plausible(Some(50.5)));
        assert_eq!(format_depth(Some(2.345)), "2.3 mm");
        assert_eq!(format_depth(None), "-");
        assert_eq!(format_status(None), "Not checked");
    }
}
