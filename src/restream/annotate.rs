use crate::config::AnnotationConfig;
use crate::error::Result;
use crate::frame::{Detection, Frame};
use std::sync::Arc;

/// Draws detections onto a frame before it is restreamed.
pub trait Annotator: Send + Sync {
    fn annotate(&self, frame: &mut Frame, detections: &[Detection]);
}

/// Leaves frames untouched.
pub struct PassthroughAnnotator;

impl Annotator for PassthroughAnnotator {
    fn annotate(&self, _frame: &mut Frame, _detections: &[Detection]) {}
}

/// Annotator used by the binary: boxes when the `annotation` feature is
/// enabled, passthrough otherwise.
pub fn build_annotator(config: &AnnotationConfig) -> Result<Arc<dyn Annotator>> {
    #[cfg(feature = "annotation")]
    {
        Ok(Arc::new(boxes::BoxAnnotator::from_config(config)?))
    }

    #[cfg(not(feature = "annotation"))]
    {
        let _ = config;
        Ok(Arc::new(PassthroughAnnotator))
    }
}

/// Line thickness scaled to the frame, at least one pixel
pub fn default_line_thickness(width: u32, height: u32) -> u32 {
    (0.002 * f64::from(width + height) / 2.0).round() as u32 + 1
}

#[cfg(feature = "annotation")]
pub use boxes::BoxAnnotator;

#[cfg(feature = "annotation")]
mod boxes {
    use super::{default_line_thickness, Annotator};
    use crate::config::AnnotationConfig;
    use crate::error::{PipelineError, Result};
    use crate::frame::{Detection, Frame};
    use image::{ImageBuffer, Rgb};
    use imageproc::drawing::{draw_filled_rect_mut, draw_hollow_rect_mut, draw_text_mut, text_size};
    use imageproc::rect::Rect;
    use rusttype::{Font, Scale};
    use std::fs;
    use tracing::{debug, warn};

    // Pure green and black/white read the same in BGR and RGB order
    const BOX_COLOR: Rgb<u8> = Rgb([0, 255, 0]);
    const TAB_COLOR: Rgb<u8> = Rgb([0, 0, 0]);
    const TEXT_COLOR: Rgb<u8> = Rgb([255, 255, 255]);

    type BgrCanvas<'a> = ImageBuffer<Rgb<u8>, &'a mut [u8]>;

    /// Green boxes with a `label confidence` tab above each one.
    pub struct BoxAnnotator {
        font: Option<Font<'static>>,
        line_thickness: Option<u32>,
        labels: Vec<String>,
    }

    impl BoxAnnotator {
        pub fn new(font: Option<Font<'static>>, line_thickness: Option<u32>, labels: Vec<String>) -> Self {
            Self {
                font,
                line_thickness,
                labels,
            }
        }

        pub fn from_config(config: &AnnotationConfig) -> Result<Self> {
            let font = match &config.font_path {
                Some(path) => {
                    let data = fs::read(path).map_err(|e| {
                        PipelineError::invalid_config(
                            "annotation.font_path",
                            format!("failed to read font file '{}': {}", path, e),
                        )
                    })?;
                    let font = Font::try_from_vec(data).ok_or_else(|| {
                        PipelineError::invalid_config(
                            "annotation.font_path",
                            format!("failed to parse font file '{}'", path),
                        )
                    })?;
                    debug!("Loaded label font from {}", path);
                    Some(font)
                }
                None => None,
            };

            Ok(Self::new(
                font,
                config.line_thickness,
                config.labels.clone(),
            ))
        }

        fn wants(&self, detection: &Detection) -> bool {
            self.labels.is_empty() || self.labels.iter().any(|l| *l == detection.label)
        }

        fn draw(&self, canvas: &mut BgrCanvas<'_>, detection: &Detection, thickness: u32) {
            let (width, height) = canvas.dimensions();
            let clamp_x = |v: f32| v.round().clamp(0.0, (width - 1) as f32) as i32;
            let clamp_y = |v: f32| v.round().clamp(0.0, (height - 1) as f32) as i32;

            let x1 = clamp_x(detection.bbox.x1);
            let y1 = clamp_y(detection.bbox.y1);
            let x2 = clamp_x(detection.bbox.x2);
            let y2 = clamp_y(detection.bbox.y2);
            if x2 <= x1 || y2 <= y1 {
                return;
            }

            // Grow inwards so thick lines stay inside the box
            for inset in 0..thickness as i32 {
                let w = x2 - x1 - 2 * inset;
                let h = y2 - y1 - 2 * inset;
                if w <= 0 || h <= 0 {
                    break;
                }
                draw_hollow_rect_mut(
                    canvas,
                    Rect::at(x1 + inset, y1 + inset).of_size(w as u32, h as u32),
                    BOX_COLOR,
                );
            }

            if let Some(font) = &self.font {
                let label = format!("{} {:.2}", detection.label, detection.confidence);
                let scale = Scale::uniform(thickness as f32 * 8.0 + 6.0);
                let (text_w, text_h) = text_size(scale, font, &label);
                if text_w <= 0 || text_h <= 0 {
                    return;
                }
                let tab_y = (y1 - text_h - 3).max(0);
                draw_filled_rect_mut(
                    canvas,
                    Rect::at(x1, tab_y).of_size(text_w as u32, text_h as u32 + 3),
                    TAB_COLOR,
                );
                draw_text_mut(canvas, TEXT_COLOR, x1, tab_y + 1, scale, font, &label);
            }
        }
    }

    impl Annotator for BoxAnnotator {
        fn annotate(&self, frame: &mut Frame, detections: &[Detection]) {
            if !detections.iter().any(|d| self.wants(d)) {
                return;
            }

            let (width, height) = (frame.width, frame.height);
            let thickness = self
                .line_thickness
                .unwrap_or_else(|| default_line_thickness(width, height));

            let pixels = frame.pixels_mut();
            let mut canvas: BgrCanvas<'_> = match ImageBuffer::from_raw(width, height, pixels.as_mut_slice()) {
                Some(canvas) => canvas,
                None => {
                    warn!("Frame buffer does not match {}x{}, not annotating", width, height);
                    return;
                }
            };

            for detection in detections.iter().filter(|d| self.wants(d)) {
                self.draw(&mut canvas, detection, thickness);
            }
        }
    }
}

#[cfg(all(test, feature = "annotation"))]
mod tests {
    use super::*;
    use crate::frame::{BoundingBox, Timestamp};

    fn blank(width: u32, height: u32) -> Frame {
        Frame::new(
            Timestamp::from_micros(0),
            vec![0u8; Frame::expected_len(width, height)],
            width,
            height,
        )
    }

    fn pixel(frame: &Frame, x: u32, y: u32) -> [u8; 3] {
        let i = ((y * frame.width + x) as usize) * Frame::BYTES_PER_PIXEL;
        [frame.data[i], frame.data[i + 1], frame.data[i + 2]]
    }

    fn person(x1: f32, y1: f32, x2: f32, y2: f32) -> Detection {
        Detection {
            bbox: BoundingBox { x1, y1, x2, y2 },
            label: "person".to_string(),
            confidence: 0.87,
        }
    }

    #[test]
    fn test_default_thickness() {
        assert_eq!(default_line_thickness(640, 360), 2);
        assert_eq!(default_line_thickness(1920, 1080), 4);
    }

    #[test]
    fn test_box_outline_drawn() {
        let annotator = BoxAnnotator::new(None, Some(1), Vec::new());
        let mut frame = blank(32, 32);
        annotator.annotate(&mut frame, &[person(4.0, 4.0, 20.0, 20.0)]);

        assert_eq!(pixel(&frame, 4, 4), [0, 255, 0]);
        assert_eq!(pixel(&frame, 4, 12), [0, 255, 0]);
        assert_eq!(pixel(&frame, 12, 12), [0, 0, 0]);
        assert_eq!(pixel(&frame, 30, 30), [0, 0, 0]);
    }

    #[test]
    fn test_shared_pixels_copied_on_annotate() {
        let annotator = BoxAnnotator::new(None, Some(1), Vec::new());
        let original = blank(16, 16);
        let mut annotated = original.clone();
        annotator.annotate(&mut annotated, &[person(1.0, 1.0, 10.0, 10.0)]);

        assert_eq!(pixel(&annotated, 1, 1), [0, 255, 0]);
        assert_eq!(pixel(&original, 1, 1), [0, 0, 0]);
    }

    #[test]
    fn test_label_filter_and_degenerate_boxes() {
        let annotator = BoxAnnotator::new(None, Some(1), vec!["helmet".to_string()]);
        let mut frame = blank(16, 16);
        annotator.annotate(&mut frame, &[person(1.0, 1.0, 10.0, 10.0)]);
        assert!(frame.data.iter().all(|b| *b == 0));

        let annotator = BoxAnnotator::new(None, Some(1), Vec::new());
        annotator.annotate(&mut frame, &[person(9.0, 9.0, 2.0, 2.0), person(-50.0, -5.0, -1.0, 0.0)]);
        assert!(frame.data.iter().all(|b| *b == 0));
    }

    #[test]
    fn test_missing_font_is_config_error() {
        let config = AnnotationConfig {
            font_path: Some("/nonexistent/font.ttf".to_string()),
            ..Default::default()
        };
        let err = BoxAnnotator::from_config(&config).err().unwrap();
        assert!(err.is_fatal());
    }
}
