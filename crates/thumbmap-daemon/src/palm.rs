//! Palm rejection by touch position

use crate::device::AxisRange;

/// Edge-zone heuristic for resting palms
///
/// The bottom band is where thumbs rest, so it is always accepted. Elsewhere
/// the side bands are rejected, as are the top corners.
#[derive(Debug, Clone, Copy)]
pub struct PalmDetection {
    x: (i32, i32),
    y: (i32, i32),
}

impl PalmDetection {
    pub fn new(x: AxisRange, y: AxisRange) -> Self {
        Self {
            x: (x.minimum, x.maximum),
            y: (y.minimum, y.maximum),
        }
    }

    pub fn from_bounds(x: (i32, i32), y: (i32, i32)) -> Self {
        Self { x, y }
    }

    /// Whether a touch first seen at (`x`, `y`) is a finger rather than a palm.
    pub fn is_valid(&self, x: i32, y: i32) -> bool {
        let fx = fraction(x, self.x);
        let fy = fraction(y, self.y);

        if fy > 0.8 {
            return true;
        }

        let side = !(0.2..=0.8).contains(&fx);
        let top = fy < 0.1;
        if top && side {
            return false;
        }
        !side
    }
}

fn fraction(value: i32, (min, max): (i32, i32)) -> f64 {
    if max <= min {
        return 0.5;
    }
    f64::from(value - min) / f64::from(max - min)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pad() -> PalmDetection {
        PalmDetection::from_bounds((0, 1000), (0, 1000))
    }

    #[test]
    fn test_center_is_valid() {
        assert!(pad().is_valid(500, 500));
    }

    #[test]
    fn test_side_bands_are_rejected() {
        assert!(!pad().is_valid(100, 500));
        assert!(!pad().is_valid(900, 500));
    }

    #[test]
    fn test_bottom_band_is_always_valid() {
        assert!(pad().is_valid(500, 900));
        assert!(pad().is_valid(50, 950));
    }

    #[test]
    fn test_top_corners_are_rejected() {
        assert!(!pad().is_valid(50, 50));
        assert!(pad().is_valid(500, 50));
    }

    #[test]
    fn test_offset_ranges() {
        let pad = PalmDetection::from_bounds((-500, 500), (100, 1100));
        assert!(pad.is_valid(0, 600));
        assert!(!pad.is_valid(-450, 600));
    }

    #[test]
    fn test_degenerate_range_does_not_reject() {
        let pad = PalmDetection::from_bounds((0, 0), (0, 0));
        assert!(pad.is_valid(0, 0));
    }
}
