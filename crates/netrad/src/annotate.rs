//! Overlay drawing and JPEG encoding for the live preview.
//!
//! Boxes and labels are drawn straight into the frame's RGB buffer with a
//! built-in 5x7 glyph font, so no font files are needed at runtime.

use image::codecs::jpeg::JpegEncoder;
use image::{ExtendedColorType, ImageBuffer, ImageError, Rgb};
use netra_core::BoundingBox;
use netra_hw::Frame;

type Canvas<'a> = ImageBuffer<Rgb<u8>, &'a mut [u8]>;

pub const KNOWN_COLOR: Rgb<u8> = Rgb([0, 255, 0]);
pub const UNKNOWN_COLOR: Rgb<u8> = Rgb([255, 0, 0]);
const LABEL_BACKGROUND: Rgb<u8> = Rgb([0, 0, 0]);
const INFO_COLOR: Rgb<u8> = Rgb([255, 255, 255]);

const GLYPH_WIDTH: i32 = 5;
const GLYPH_HEIGHT: i32 = 7;
const GLYPH_ADVANCE: i32 = 6;
const BOX_THICKNESS: i32 = 2;

/// One face box to draw.
#[derive(Debug, Clone)]
pub struct Overlay {
    pub bbox: BoundingBox,
    pub label: String,
    pub known: bool,
}

/// Draw `overlays` and a frame counter onto `frame` in place.
pub fn annotate(frame: &mut Frame, overlays: &[Overlay], frame_number: u64) {
    let (width, height) = (frame.width, frame.height);
    let Some(mut canvas) = Canvas::from_raw(width, height, frame.data.as_mut_slice()) else {
        tracing::warn!(width, height, "frame buffer does not match geometry; not annotated");
        return;
    };
    let scale = text_scale(height);
    let max_x = width.saturating_sub(1) as f32;
    let max_y = height.saturating_sub(1) as f32;

    for overlay in overlays {
        let color = if overlay.known { KNOWN_COLOR } else { UNKNOWN_COLOR };
        let b = overlay.bbox;
        let left = b.x1.clamp(0.0, max_x).round() as i32;
        let top = b.y1.clamp(0.0, max_y).round() as i32;
        let right = b.x2.clamp(0.0, max_x).round() as i32;
        let bottom = b.y2.clamp(0.0, max_y).round() as i32;
        for inset in 0..BOX_THICKNESS {
            draw_rectangle(&mut canvas, left + inset, top + inset, right - inset, bottom - inset, color);
        }

        let text_height = GLYPH_HEIGHT * scale;
        let label_y = if top - text_height - 4 >= 0 {
            top - text_height - 4
        } else {
            bottom + 4
        };
        let text_width = text_width(&overlay.label, scale);
        fill_rect(
            &mut canvas,
            left,
            label_y - 1,
            left + text_width + 1,
            label_y + text_height,
            LABEL_BACKGROUND,
        );
        draw_text(&mut canvas, left + 1, label_y, &overlay.label, color, scale);
    }

    let info = format!("FRAME {frame_number}");
    let info_width = text_width(&info, scale);
    let info_x = 4;
    let info_y = (height as i32 - GLYPH_HEIGHT * scale - 4).max(0);
    fill_rect(
        &mut canvas,
        info_x - 2,
        info_y - 2,
        info_x + info_width + 1,
        info_y + GLYPH_HEIGHT * scale + 1,
        LABEL_BACKGROUND,
    );
    draw_text(&mut canvas, info_x, info_y, &info, INFO_COLOR, scale);
}

/// Encode an RGB frame as baseline JPEG.
pub fn encode_jpeg(frame: &Frame, quality: u8) -> Result<Vec<u8>, ImageError> {
    let mut buffer = Vec::with_capacity(frame.data.len() / 8);
    JpegEncoder::new_with_quality(&mut buffer, quality.clamp(1, 100)).encode(
        &frame.data,
        frame.width,
        frame.height,
        ExtendedColorType::Rgb8,
    )?;
    Ok(buffer)
}

fn text_scale(frame_height: u32) -> i32 {
    if frame_height >= 360 {
        2
    } else {
        1
    }
}

fn text_width(text: &str, scale: i32) -> i32 {
    text.chars().count() as i32 * GLYPH_ADVANCE * scale
}

fn put(canvas: &mut Canvas<'_>, x: i32, y: i32, color: Rgb<u8>) {
    if x >= 0 && y >= 0 && (x as u32) < canvas.width() && (y as u32) < canvas.height() {
        canvas.put_pixel(x as u32, y as u32, color);
    }
}

fn draw_rectangle(canvas: &mut Canvas<'_>, left: i32, top: i32, right: i32, bottom: i32, color: Rgb<u8>) {
    if right < left || bottom < top {
        return;
    }
    for x in left..=right {
        put(canvas, x, top, color);
        put(canvas, x, bottom, color);
    }
    for y in top..=bottom {
        put(canvas, left, y, color);
        put(canvas, right, y, color);
    }
}

fn fill_rect(canvas: &mut Canvas<'_>, left: i32, top: i32, right: i32, bottom: i32, color: Rgb<u8>) {
    let max_x = canvas.width() as i32 - 1;
    let max_y = canvas.height() as i32 - 1;
    for y in top.max(0)..=bottom.min(max_y) {
        for x in left.max(0)..=right.min(max_x) {
            canvas.put_pixel(x as u32, y as u32, color);
        }
    }
}

fn draw_text(canvas: &mut Canvas<'_>, mut x: i32, y: i32, text: &str, color: Rgb<u8>, scale: i32) {
    for ch in text.chars().flat_map(char::to_uppercase) {
        if let Some(glyph) = glyph_bits(ch) {
            for (row, pattern) in glyph.iter().enumerate() {
                for col in 0..GLYPH_WIDTH {
                    if (pattern >> (GLYPH_WIDTH - 1 - col)) & 1 == 0 {
                        continue;
                    }
                    let px = x + col * scale;
                    let py = y + row as i32 * scale;
                    for dy in 0..scale {
                        for dx in 0..scale {
                            put(canvas, px + dx, py + dy, color);
                        }
                    }
                }
            }
        }
        x += GLYPH_ADVANCE * scale;
    }
}

fn glyph_bits(ch: char) -> Option<[u8; 7]> {
    let rows = match ch {
        'A' => [0b01110, 0b10001, 0b10001, 0b11111, 0b10001, 0b10001, 0b10001],
        'B' => [0b11110, 0b10001, 0b10001, 0b11110, 0b10001, 0b10001, 0b11110],
        'C' => [0b01110, 0b10001, 0b10000, 0b10000, 0b10000, 0b10001, 0b01110],
        'D' => [0b11100, 0b10010, 0b10001, 0b10001, 0b10001, 0b10010, 0b11100],
        'E' => [0b11111, 0b10000, 0b10000, 0b11110, 0b10000, 0b10000, 0b11111],
        'F' => [0b11111, 0b10000, 0b10000, 0b11110, 0b10000, 0b10000, 0b10000],
        'G' => [0b01110, 0b10001, 0b10000, 0b10111, 0b10001, 0b10001, 0b01111],
        'H' => [0b10001, 0b10001, 0b10001, 0b11111, 0b10001, 0b10001, 0b10001],
        'I' => [0b01110, 0b00100, 0b00100, 0b00100, 0b00100, 0b00100, 0b01110],
        'J' => [0b00111, 0b00010, 0b00010, 0b00010, 0b00010, 0b10010, 0b01100],
        'K' => [0b10001, 0b10010, 0b10100, 0b11000, 0b10100, 0b10010, 0b10001],
        'L' => [0b10000, 0b10000, 0b10000, 0b10000, 0b10000, 0b10000, 0b11111],
        'M' => [0b10001, 0b11011, 0b10101, 0b10101, 0b10001, 0b10001, 0b10001],
        'N' => [0b10001, 0b10001, 0b11001, 0b10101, 0b10011, 0b10001, 0b10001],
        'O' => [0b01110, 0b10001, 0b10001, 0b10001, 0b10001, 0b10001, 0b01110],
        'P' => [0b11110, 0b10001, 0b10001, 0b11110, 0b10000, 0b10000, 0b10000],
        'Q' => [0b01110, 0b10001, 0b10001, 0b10001, 0b10101, 0b10010, 0b01101],
        'R' => [0b11110, 0b10001, 0b10001, 0b11110, 0b10100, 0b10010, 0b10001],
        'S' => [0b01111, 0b10000, 0b10000, 0b01110, 0b00001, 0b00001, 0b11110],
        'T' => [0b11111, 0b00100, 0b00100, 0b00100, 0b00100, 0b00100, 0b00100],
        'U' => [0b10001, 0b10001, 0b10001, 0b10001, 0b10001, 0b10001, 0b01110],
        'V' => [0b10001, 0b10001, 0b10001, 0b10001, 0b10001, 0b01010, 0b00100],
        'W' => [0b10001, 0b10001, 0b10001, 0b10101, 0b10101, 0b10101, 0b01010],
        'X' => [0b10001, 0b10001, 0b01010, 0b00100, 0b01010, 0b10001, 0b10001],
        'Y' => [0b10001, 0b10001, 0b10001, 0b01010, 0b00100, 0b00100, 0b00100],
        'Z' => [0b11111, 0b00001, 0b00010, 0b00100, 0b01000, 0b10000, 0b11111],
        '0' => [0b01110, 0b10001, 0b10011, 0b10101, 0b11001, 0b10001, 0b01110],
        '1' => [0b00100, 0b01100, 0b00100, 0b00100, 0b00100, 0b00100, 0b01110],
        '2' => [0b01110, 0b10001, 0b00001, 0b00010, 0b00100, 0b01000, 0b11111],
        '3' => [0b11111, 0b00010, 0b00100, 0b00010, 0b00001, 0b10001, 0b01110],
        '4' => [0b00010, 0b00110, 0b01010, 0b10010, 0b11111, 0b00010, 0b00010],
        '5' => [0b11111, 0b10000, 0b11110, 0b00001, 0b00001, 0b10001, 0b01110],
        '6' => [0b00110, 0b01000, 0b10000, 0b11110, 0b10001, 0b10001, 0b01110],
        '7' => [0b11111, 0b00001, 0b00010, 0b00100, 0b01000, 0b01000, 0b01000],
        '8' => [0b01110, 0b10001, 0b10001, 0b01110, 0b10001, 0b10001, 0b01110],
        '9' => [0b01110, 0b10001, 0b10001, 0b01111, 0b00001, 0b00010, 0b01100],
        ':' => [0, 0b01100, 0b01100, 0, 0b01100, 0b01100, 0],
        '-' => [0, 0, 0, 0b11111, 0, 0, 0],
        '.' => [0, 0, 0, 0, 0, 0b01100, 0b01100],
        '/' => [0b00001, 0b00010, 0b00010, 0b00100, 0b01000, 0b01000, 0b10000],
        '_' => [0, 0, 0, 0, 0, 0, 0b11111],
        ' ' => [0; 7],
        _ => return None,
    };
    Some(rows)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn gray_frame(width: u32, height: u32) -> Frame {
        Frame::from_rgb(vec![128; (width * height * 3) as usize], width, height, 1).unwrap()
    }

    fn overlay(known: bool) -> Overlay {
        Overlay {
            bbox: BoundingBox::new(100.0, 100.0, 200.0, 220.0),
            label: if known { "Asha".into() } else { "Unknown".into() },
            known,
        }
    }

    #[test]
    fn test_known_box_is_green() {
        let mut frame = gray_frame(640, 480);
        annotate(&mut frame, &[overlay(true)], 5);
        assert_eq!(frame.pixel(150, 220), KNOWN_COLOR.0);
        assert_eq!(frame.pixel(100, 150), KNOWN_COLOR.0);
        assert_eq!(frame.pixel(150, 150), [128, 128, 128]);
    }

    #[test]
    fn test_unknown_box_is_red() {
        let mut frame = gray_frame(640, 480);
        annotate(&mut frame, &[overlay(false)], 5);
        assert_eq!(frame.pixel(200, 160), UNKNOWN_COLOR.0);
    }

    #[test]
    fn test_label_drawn_above_box() {
        let mut frame = gray_frame(640, 480);
        annotate(&mut frame, &[overlay(true)], 5);
        let band_y = 100 - 4 - GLYPH_HEIGHT as u32;
        let touched = (100..160).any(|x| frame.pixel(x, band_y) == KNOWN_COLOR.0);
        assert!(touched);
    }

    #[test]
    fn test_box_outside_frame_is_clipped() {
        let mut frame = gray_frame(64, 48);
        let clipped = Overlay {
            bbox: BoundingBox::new(-20.0, -20.0, 500.0, 500.0),
            label: "x".into(),
            known: true,
        };
        annotate(&mut frame, &[clipped], 1);
        assert_eq!(frame.data.len(), 64 * 48 * 3);
        // Edges land on the frame border.
        assert_eq!(frame.pixel(0, 20), KNOWN_COLOR.0);
        assert_eq!(frame.pixel(63, 20), KNOWN_COLOR.0);
    }

    #[test]
    fn test_extreme_box_is_clamped_before_drawing() {
        let mut frame = gray_frame(64, 48);
        let huge = Overlay {
            bbox: BoundingBox::new(-1.0e9, -1.0e9, 1.0e9, 1.0e9),
            label: "x".into(),
            known: false,
        };
        let started = std::time::Instant::now();
        annotate(&mut frame, &[huge], 1);
        assert!(started.elapsed() < std::time::Duration::from_secs(1));
        assert_eq!(frame.pixel(63, 20), UNKNOWN_COLOR.0);
        assert_eq!(frame.pixel(20, 0), UNKNOWN_COLOR.0);
    }

    #[test]
    fn test_counter_drawn_without_faces() {
        let mut frame = gray_frame(640, 480);
        let before = frame.data.clone();
        annotate(&mut frame, &[], 42);
        assert_ne!(frame.data, before);
        assert_eq!(frame.pixel(320, 10), [128, 128, 128]);
    }

    #[test]
    fn test_encode_jpeg_markers() {
        let frame = gray_frame(32, 24);
        let jpeg = encode_jpeg(&frame, 80).unwrap();
        assert_eq!(&jpeg[..2], &[0xFF, 0xD8]);
        assert_eq!(&jpeg[jpeg.len() - 2..], &[0xFF, 0xD9]);
    }

    #[test]
    fn test_glyph_table_covers_labels() {
        for ch in "ABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789:-./_ ".chars() {
            assert!(glyph_bits(ch).is_some(), "missing glyph {ch:?}");
        }
        assert!(glyph_bits('@').is_none());
    }
}
