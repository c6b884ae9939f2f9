use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// Capture time in microseconds since the Unix epoch.
///
/// Rendezvous queues key on this value, so it must be totally ordered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Timestamp(i64);

impl Timestamp {
    /// Read the wall clock
    pub fn now() -> Self {
        Self(chrono::Utc::now().timestamp_micros())
    }

    pub fn from_micros(micros: i64) -> Self {
        Self(micros)
    }

    pub fn as_micros(&self) -> i64 {
        self.0
    }

    /// Time elapsed from `earlier` to `self`, zero if `earlier` is in the future
    pub fn since(&self, earlier: Timestamp) -> Duration {
        Duration::from_micros(self.0.saturating_sub(earlier.0).max(0) as u64)
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{:06}", self.0.div_euclid(1_000_000), self.0.rem_euclid(1_000_000))
    }
}

/// Decoded BGR24 image with its capture timestamp.
///
/// Pixel data sits behind an `Arc` so one sample can be fanned out to several
/// models without copying; annotation copies on write.
#[derive(Debug, Clone)]
pub struct Frame {
    pub timestamp: Timestamp,
    pub data: Arc<Vec<u8>>,
    pub width: u32,
    pub height: u32,
}

impl Frame {
    pub const BYTES_PER_PIXEL: usize = 3;

    pub fn new(timestamp: Timestamp, data: Vec<u8>, width: u32, height: u32) -> Self {
        Self {
            timestamp,
            data: Arc::new(data),
            width,
            height,
        }
    }

    /// Size in bytes of one BGR24 frame with the given geometry
    pub fn expected_len(width: u32, height: u32) -> usize {
        width as usize * height as usize * Self::BYTES_PER_PIXEL
    }

    pub fn validate_size(&self) -> bool {
        self.data.len() == Self::expected_len(self.width, self.height)
    }

    /// Mutable access to the pixels, cloning the buffer if it is shared
    pub fn pixels_mut(&mut self) -> &mut Vec<u8> {
        Arc::make_mut(&mut self.data)
    }
}

/// Axis-aligned box in pixel coordinates of the frame it was detected in.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x1: f32,
    pub y1: f32,
    pub x2: f32,
    pub y2: f32,
}

impl BoundingBox {
    pub fn width(&self) -> f32 {
        (self.x2 - self.x1).max(0.0)
    }

    pub fn height(&self) -> f32 {
        (self.y2 - self.y1).max(0.0)
    }
}

/// One detector output: box, class label and confidence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Detection {
    #[serde(flatten)]
    pub bbox: BoundingBox,
    pub label: String,
    pub confidence: f32,
}

/// Completed inference for one sampled frame.
#[derive(Debug, Clone)]
pub struct InferenceResult {
    pub frame: Frame,
    pub detections: Vec<Detection>,
}
