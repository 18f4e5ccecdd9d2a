//! Display preview: mirrored, annotated, JPEG-compressed frames and MJPEG framing.

use crate::frame::{Frame, FrameError};
use ab_glyph::{FontVec, PxScale};
use image::codecs::jpeg::JpegEncoder;
use image::{imageops, Rgb, RgbImage};
use imageproc::drawing::{draw_filled_rect_mut, draw_hollow_rect_mut, draw_text_mut};
use imageproc::rect::Rect;
use presence_core::BoundingBox;
use std::path::Path;
use thiserror::Error;

/// Multipart boundary used between preview frames.
pub const MJPEG_BOUNDARY: &str = "frame";
/// Content type announcing a multipart MJPEG stream.
pub const MJPEG_CONTENT_TYPE: &str = "multipart/x-mixed-replace; boundary=frame";

const SWATCH_SIZE: u32 = 24;
const MARGIN: i32 = 8;
const TEXT_SCALE: f32 = 22.0;
const BOX_THICKNESS: i32 = 3;
const PLACEHOLDER_BG: Rgb<u8> = Rgb([32, 32, 32]);
const PLACEHOLDER_ACCENT: Rgb<u8> = Rgb([200, 40, 40]);

#[derive(Error, Debug)]
pub enum PreviewError {
    #[error("font could not be loaded from {path}: {reason}")]
    Font { path: String, reason: String },
    #[error("frame: {0}")]
    Frame(#[from] FrameError),
    #[error("JPEG encode failed: {0}")]
    Encode(#[from] image::ImageError),
}

/// What to draw on top of the mirrored frame.
#[derive(Debug, Clone)]
pub struct Overlay<'a> {
    pub text: &'a str,
    pub color: [u8; 3],
    /// Face region in raw (unmirrored) frame coordinates.
    pub detection: Option<BoundingBox>,
}

/// Renders preview frames. Text is drawn only when a font is loaded.
pub struct PreviewRenderer {
    font: Option<FontVec>,
    quality: u8,
}

impl PreviewRenderer {
    pub fn new(quality: u8) -> Self {
        Self {
            font: None,
            quality: quality.clamp(1, 100),
        }
    }

    /// Load a TTF/OTF font for status text.
    pub fn with_font(mut self, path: &Path) -> Result<Self, PreviewError> {
        let font_err = |reason: String| PreviewError::Font {
            path: path.display().to_string(),
            reason,
        };
        let bytes = std::fs::read(path).map_err(|e| font_err(e.to_string()))?;
        let font = FontVec::try_from_vec(bytes).map_err(|e| font_err(e.to_string()))?;
        self.font = Some(font);
        Ok(self)
    }

    pub fn has_font(&self) -> bool {
        self.font.is_some()
    }

    /// Mirror the frame for self-view and draw the overlay.
    pub fn annotate(&self, frame: &Frame, overlay: &Overlay<'_>) -> Result<RgbImage, PreviewError> {
        let mut img = frame.to_rgb_image()?;
        imageops::flip_horizontal_in_place(&mut img);

        let color = Rgb(overlay.color);
        self.draw_status(&mut img, overlay.text, color);

        if let Some(detection) = overlay.detection {
            draw_box(&mut img, &detection.mirrored(frame.width), color);
        }

        Ok(img)
    }

    /// Annotate and compress one frame.
    pub fn render(&self, frame: &Frame, overlay: &Overlay<'_>) -> Result<Vec<u8>, PreviewError> {
        let img = self.annotate(frame, overlay)?;
        encode_jpeg(&img, self.quality)
    }

    /// Still image shown while no camera is running.
    pub fn placeholder(&self, width: u32, height: u32, text: &str) -> Result<Vec<u8>, PreviewError> {
        let mut img = RgbImage::from_pixel(width.max(1), height.max(1), PLACEHOLDER_BG);
        self.draw_status(&mut img, text, PLACEHOLDER_ACCENT);
        encode_jpeg(&img, self.quality)
    }

    fn draw_status(&self, img: &mut RgbImage, text: &str, color: Rgb<u8>) {
        if img.width() <= SWATCH_SIZE + MARGIN as u32 || img.height() <= SWATCH_SIZE + MARGIN as u32 {
            return;
        }
        draw_filled_rect_mut(
            img,
            Rect::at(MARGIN, MARGIN).of_size(SWATCH_SIZE, SWATCH_SIZE),
            color,
        );
        if let Some(font) = &self.font {
            let x = MARGIN * 2 + SWATCH_SIZE as i32;
            draw_text_mut(img, color, x, MARGIN, PxScale::from(TEXT_SCALE), font, text);
        }
    }
}

/// Outline `region` clipped to the image, a few pixels thick.
fn draw_box(img: &mut RgbImage, region: &BoundingBox, color: Rgb<u8>) {
    let (w, h) = (img.width() as i32, img.height() as i32);
    let x0 = (region.x.round() as i32).clamp(0, w - 1);
    let y0 = (region.y.round() as i32).clamp(0, h - 1);
    let x1 = ((region.x + region.width).round() as i32).clamp(0, w - 1);
    let y1 = ((region.y + region.height).round() as i32).clamp(0, h - 1);

    for inset in 0..BOX_THICKNESS {
        let bw = x1 - x0 - 2 * inset + 1;
        let bh = y1 - y0 - 2 * inset + 1;
        if bw <= 0 || bh <= 0 {
            break;
        }
        let rect = Rect::at(x0 + inset, y0 + inset).of_size(bw as u32, bh as u32);
        draw_hollow_rect_mut(img, rect, color);
    }
}

pub fn encode_jpeg(img: &RgbImage, quality: u8) -> Result<Vec<u8>, PreviewError> {
    let mut out = Vec::with_capacity(img.as_raw().len() / 8);
    JpegEncoder::new_with_quality(&mut out, quality).encode_image(img)?;
    Ok(out)
}

/// Wrap one JPEG as a self-contained part of a multipart MJPEG stream.
pub fn multipart_chunk(jpeg: &[u8]) -> Vec<u8> {
    let header = format!(
        "--{MJPEG_BOUNDARY}\r\nContent-Type: image/jpeg\r\nContent-Length: {}\r\n\r\n",
        jpeg.len()
    );
    let mut chunk = Vec::with_capacity(header.len() + jpeg.len() + 2);
    chunk.extend_from_slice(header.as_bytes());
    chunk.extend_from_slice(jpeg);
    chunk.extend_from_slice(b"\r\n");
    chunk
}

#[cfg(test)]
mod tests {
    use super::*;

    fn black_frame(w: u32, h: u32) -> Frame {
        Frame::from_rgb(vec![0; (w * h * 3) as usize], w, h, 0).unwrap()
    }

    #[test]
    fn test_annotate_mirrors_pixels() {
        // Left half white, right half black.
        let (w, h) = (80u32, 60u32);
        let mut data = Vec::new();
        for _y in 0..h {
            for x in 0..w {
                let v = if x < w / 2 { 255 } else { 0 };
                data.extend_from_slice(&[v, v, v]);
            }
        }
        let frame = Frame::from_rgb(data, w, h, 0).unwrap();
        let overlay = Overlay { text: "", color: [0, 255, 0], detection: None };
        let img = PreviewRenderer::new(90).annotate(&frame, &overlay).unwrap();

        assert_eq!(img.get_pixel(5, h - 5), &Rgb([0, 0, 0]));
        assert_eq!(img.get_pixel(w - 5, h - 5), &Rgb([255, 255, 255]));
    }

    #[test]
    fn test_annotate_draws_mirrored_box() {
        let frame = black_frame(100, 80);
        let overlay = Overlay {
            text: "ok",
            color: [255, 0, 0],
            detection: Some(BoundingBox { x: 10.0, y: 40.0, width: 20.0, height: 30.0 }),
        };
        let img = PreviewRenderer::new(90).annotate(&frame, &overlay).unwrap();

        // Mirrored region spans x = 70..=90.
        assert_eq!(img.get_pixel(70, 55), &Rgb([255, 0, 0]));
        assert_eq!(img.get_pixel(90, 55), &Rgb([255, 0, 0]));
        assert_eq!(img.get_pixel(80, 40), &Rgb([255, 0, 0]));
        assert_eq!(img.get_pixel(80, 55), &Rgb([0, 0, 0]));
        // Nothing at the unmirrored position.
        assert_eq!(img.get_pixel(10, 55), &Rgb([0, 0, 0]));
    }

    #[test]
    fn test_annotate_draws_swatch() {
        let frame = black_frame(100, 80);
        let overlay = Overlay { text: "Ready", color: [10, 200, 30], detection: None };
        let img = PreviewRenderer::new(90).annotate(&frame, &overlay).unwrap();
        assert_eq!(img.get_pixel(MARGIN as u32 + 2, MARGIN as u32 + 2), &Rgb([10, 200, 30]));
    }

    #[test]
    fn test_box_outside_frame_is_clipped() {
        let frame = black_frame(40, 30);
        let overlay = Overlay {
            text: "",
            color: [255, 255, 0],
            detection: Some(BoundingBox { x: -50.0, y: -50.0, width: 500.0, height: 500.0 }),
        };
        assert!(PreviewRenderer::new(90).annotate(&frame, &overlay).is_ok());
    }

    #[test]
    fn test_render_is_decodable_jpeg() {
        let frame = black_frame(64, 48);
        let overlay = Overlay { text: "Ready", color: [128, 128, 128], detection: None };
        let jpeg = PreviewRenderer::new(75).render(&frame, &overlay).unwrap();
        assert_eq!(&jpeg[..2], &[0xFF, 0xD8]);
        let decoded = image::load_from_memory(&jpeg).unwrap();
        assert_eq!((decoded.width(), decoded.height()), (64, 48));
    }

    #[test]
    fn test_placeholder() {
        let jpeg = PreviewRenderer::new(75).placeholder(320, 240, "Camera offline").unwrap();
        let decoded = image::load_from_memory(&jpeg).unwrap();
        assert_eq!((decoded.width(), decoded.height()), (320, 240));
    }

    #[test]
    fn test_missing_font_is_an_error() {
        let result = PreviewRenderer::new(75).with_font(Path::new("/nonexistent/font.ttf"));
        assert!(matches!(result, Err(PreviewError::Font { .. })));
    }

    #[test]
    fn test_multipart_chunk_framing() {
        let chunk = multipart_chunk(&[0xFF, 0xD8, 0xFF, 0xD9]);
        let text = String::from_utf8_lossy(&chunk);
        assert!(text.starts_with("--frame\r\nContent-Type: image/jpeg\r\nContent-Length: 4\r\n\r\n"));
        assert!(chunk.ends_with(&[0xFF, 0xD9, b'\r', b'\n']));
    }
}
