//! Frame type and annotation of recognized regions.

use crate::matcher::FaceLabel;
use image::{GrayImage, Luma};

/// Stroke width of drawn bounding boxes, in pixels.
const BOX_THICKNESS: u32 = 2;
const BOX_INTENSITY: u8 = 255;

/// A captured grayscale camera frame.
#[derive(Clone, Debug)]
pub struct Frame {
    /// Grayscale pixel data (width * height bytes).
    pub data: Vec<u8>,
    pub width: u32,
    pub height: u32,
    pub timestamp: std::time::Instant,
    pub sequence: u32,
}

impl Frame {
    /// View the frame as an `image` buffer, if the data length is consistent.
    pub fn to_image(&self) -> Option<GrayImage> {
        GrayImage::from_raw(self.width, self.height, self.data.clone())
    }
}

/// A frame with recognized regions drawn in, ready for presentation.
#[derive(Clone, Debug)]
pub struct AnnotatedFrame {
    pub frame: Frame,
    pub labels: Vec<FaceLabel>,
}

impl AnnotatedFrame {
    /// Draw a rectangle outline for every label onto the frame pixels.
    ///
    /// Boxes are clipped to the frame; labels are carried alongside for the
    /// presentation layer to render as text.
    pub fn new(mut frame: Frame, labels: Vec<FaceLabel>) -> Self {
        if let Some(mut img) = frame.to_image() {
            for label in &labels {
                draw_outline(&mut img, label);
            }
            frame.data = img.into_raw();
        }
        Self { frame, labels }
    }
}

fn draw_outline(img: &mut GrayImage, label: &FaceLabel) {
    let (w, h) = img.dimensions();
    if w == 0 || h == 0 {
        return;
    }
    let clamp_x = |v: f32| (v.max(0.0) as u32).min(w - 1);
    let clamp_y = |v: f32| (v.max(0.0) as u32).min(h - 1);

    let left = clamp_x(label.bbox.x);
    let right = clamp_x(label.bbox.right());
    let top = clamp_y(label.bbox.y);
    let bottom = clamp_y(label.bbox.bottom());

    for t in 0..BOX_THICKNESS {
        for x in left..=right {
            img.put_pixel(x, (top + t).min(h - 1), Luma([BOX_INTENSITY]));
            img.put_pixel(x, bottom.saturating_sub(t), Luma([BOX_INTENSITY]));
        }
        for y in top..=bottom {
            img.put_pixel((left + t).min(w - 1), y, Luma([BOX_INTENSITY]));
            img.put_pixel(right.saturating_sub(t), y, Luma([BOX_INTENSITY]));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::BoundingBox;

    fn blank(width: u32, height: u32) -> Frame {
        Frame {
            data: vec![0; (width * height) as usize],
            width,
            height,
            timestamp: std::time::Instant::now(),
            sequence: 0,
        }
    }

    fn label(x: f32, y: f32, width: f32, height: f32) -> FaceLabel {
        FaceLabel {
            bbox: BoundingBox { x, y, width, height },
            name: "Alice".into(),
        }
    }

    #[test]
    fn test_annotate_draws_outline_only() {
        let annotated = AnnotatedFrame::new(blank(20, 20), vec![label(4.0, 4.0, 10.0, 10.0)]);
        let px = |x: u32, y: u32| annotated.frame.data[(y * 20 + x) as usize];
        assert_eq!(px(4, 4), 255);
        assert_eq!(px(14, 14), 255);
        assert_eq!(px(9, 4), 255);
        assert_eq!(px(9, 9), 0, "interior must stay untouched");
        assert_eq!(px(0, 0), 0);
        assert_eq!(annotated.labels.len(), 1);
    }

    #[test]
    fn test_annotate_clips_to_frame() {
        let annotated = AnnotatedFrame::new(blank(8, 8), vec![label(-5.0, -5.0, 100.0, 100.0)]);
        assert_eq!(annotated.frame.data.len(), 64);
        assert_eq!(annotated.frame.data[0], 255);
        assert_eq!(annotated.frame.data[63], 255);
    }

    #[test]
    fn test_annotate_inconsistent_frame_is_left_alone() {
        let mut frame = blank(4, 4);
        frame.data.truncate(3);
        let annotated = AnnotatedFrame::new(frame, vec![label(0.0, 0.0, 2.0, 2.0)]);
        assert_eq!(annotated.frame.data, vec![0, 0, 0]);
    }
}
