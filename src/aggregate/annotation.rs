use std::fmt;

use serde::Serialize;

/// Axis-aligned box in frame pixel coordinates, `x2 >= x1`, `y2 >= y1`
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Region {
    pub x1: f32,
    pub y1: f32,
    pub x2: f32,
    pub y2: f32,
}

impl Region {
    pub fn new(x1: f32, y1: f32, x2: f32, y2: f32) -> Self {
        Self {
            x1: x1.min(x2),
            y1: y1.min(y2),
            x2: x1.max(x2),
            y2: y1.max(y2),
        }
    }

    /// The whole `width` x `height` frame
    pub fn full(width: u32, height: u32) -> Self {
        Self::new(0.0, 0.0, width as f32, height as f32)
    }

    pub fn width(&self) -> f32 {
        self.x2 - self.x1
    }

    pub fn height(&self) -> f32 {
        self.y2 - self.y1
    }

    pub fn area(&self) -> f32 {
        self.width() * self.height()
    }

    /// Intersection over union; 0 for disjoint or degenerate boxes
    pub fn iou(&self, other: &Region) -> f32 {
        let ix1 = self.x1.max(other.x1);
        let iy1 = self.y1.max(other.y1);
        let ix2 = self.x2.min(other.x2);
        let iy2 = self.y2.min(other.y2);
        let inter = (ix2 - ix1).max(0.0) * (iy2 - iy1).max(0.0);
        if inter == 0.0 {
            return 0.0;
        }
        let union = self.area() + other.area() - inter;
        if union <= 0.0 {
            return 0.0;
        }
        inter / union
    }
}

impl fmt::Display for Region {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[{:.0},{:.0} {:.0}x{:.0}]",
            self.x1,
            self.y1,
            self.width(),
            self.height()
        )
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Annotation {
    pub label: String,
    pub class_id: usize,
    /// Confidence in [0, 1]
    pub score: f32,
    pub region: Region,
}

impl fmt::Display for Annotation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {:.2} {}", self.label, self.score, self.region)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn iou_of_half_overlap() {
        let a = Region::new(0.0, 0.0, 2.0, 2.0);
        let b = Region::new(1.0, 0.0, 3.0, 2.0);
        // 2 / (4 + 4 - 2)
        assert!((a.iou(&b) - 1.0 / 3.0).abs() < 1e-6);
        assert_eq!(a.iou(&Region::new(5.0, 5.0, 6.0, 6.0)), 0.0);
    }

    #[test]
    fn corners_are_normalized() {
        let r = Region::new(4.0, 3.0, 1.0, 1.0);
        assert_eq!(r, Region::new(1.0, 1.0, 4.0, 3.0));
        assert_eq!(r.area(), 6.0);
    }
}
