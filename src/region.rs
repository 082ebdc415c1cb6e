use std::fmt;

use crate::geometry::{iou, Rect};

/// Label carried by gap-filling placeholders. Never a real detection.
pub const NO_OBJECT_LABEL: &str = "no obj";

/// Label that matches any other label in [`Region::is_same`].
pub const WILDCARD_LABEL: &str = "-1";

/// Origin used when the producing phase is unknown.
pub const GENERIC_ORIGIN: &str = "generic";

/// One detected object instance (or gap placeholder) on a single frame.
///
/// Coordinates are normalized to the unit frame. The core does not clamp them;
/// only [`Region::enlarge`] does.
#[derive(Clone, Debug, PartialEq)]
pub struct Region {
    pub frame_id: u32,
    pub x: f64,
    pub y: f64,
    pub w: f64,
    pub h: f64,
    pub confidence: f64,
    pub label: String,
    /// Encoding resolution factor the detection was produced under.
    pub resolution: f64,
    /// Tag of the producing phase ("low", "high", "tracking", ...).
    pub origin: String,
    /// Opaque identity payload. Cleared when the region absorbs a duplicate.
    pub feature: Option<Vec<f32>>,
}

impl Region {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        frame_id: u32,
        x: f64,
        y: f64,
        w: f64,
        h: f64,
        confidence: f64,
        label: impl Into<String>,
        resolution: f64,
        origin: impl Into<String>,
    ) -> Self {
        Self {
            frame_id,
            x,
            y,
            w,
            h,
            confidence,
            label: label.into(),
            resolution,
            origin: origin.into(),
            feature: None,
        }
    }

    /// Request covering the whole frame, used for low-phase uploads.
    pub fn whole_frame(frame_id: u32, resolution: f64, origin: impl Into<String>) -> Self {
        Self::new(
            frame_id,
            0.0,
            0.0,
            1.0,
            1.0,
            1.0,
            WILDCARD_LABEL,
            resolution,
            origin,
        )
    }

    /// Zero-box "no obj" marker for a frame without detections.
    pub fn placeholder(frame_id: u32, resolution: f64) -> Self {
        Self::new(
            frame_id,
            0.0,
            0.0,
            0.0,
            0.0,
            0.1,
            NO_OBJECT_LABEL,
            resolution,
            GENERIC_ORIGIN,
        )
    }

    pub fn with_feature(mut self, feature: Vec<f32>) -> Self {
        self.feature = Some(feature);
        self
    }

    pub fn rect(&self) -> Rect {
        Rect::new(self.x, self.y, self.w, self.h)
    }

    pub fn set_rect(&mut self, rect: Rect) {
        self.x = rect.x;
        self.y = rect.y;
        self.w = rect.w;
        self.h = rect.h;
    }

    pub fn area(&self) -> f64 {
        self.rect().area()
    }

    pub fn is_placeholder(&self) -> bool {
        self.label == NO_OBJECT_LABEL
    }

    pub fn origin_has(&self, tag: &str) -> bool {
        self.origin.contains(tag)
    }

    /// Same frame, compatible labels and IoU strictly above `threshold`.
    pub fn is_same(&self, other: &Region, threshold: f64) -> bool {
        if self.frame_id != other.frame_id {
            return false;
        }
        let wildcard = self.label == WILDCARD_LABEL || other.label == WILDCARD_LABEL;
        if !wildcard && self.label != other.label {
            return false;
        }
        iou(&self.rect(), &other.rect()) > threshold
    }

    /// Grows the box by `ratio` of its extent on every side, clamped to the unit frame.
    pub fn enlarge(&mut self, ratio: f64) {
        let x_min = (self.x - self.w * ratio).max(0.0);
        let y_min = (self.y - self.h * ratio).max(0.0);
        let x_max = (self.x + self.w * (1.0 + ratio)).min(1.0);
        let y_max = (self.y + self.h * (1.0 + ratio)).min(1.0);
        self.x = x_min;
        self.y = y_min;
        self.w = x_max - x_min;
        self.h = y_max - y_min;
    }
}

impl fmt::Display for Region {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}, {:.3}, {:.3}, {:.3}, {:.3}, {:.3}, {}, {}",
            self.frame_id, self.x, self.y, self.w, self.h, self.confidence, self.label, self.origin
        )
    }
}
