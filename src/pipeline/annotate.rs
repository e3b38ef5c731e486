//! Overlay drawn onto each processed frame.

use image::{ImageBuffer, Rgb};

use crate::capture::{Frame, PixelFormat};
use crate::events::{Event, Severity};

type RgbImage = ImageBuffer<Rgb<u8>, Vec<u8>>;

const SCALE: i32 = 2;
const FRAME_LABEL_POS: (i32, i32) = (20, 16);
const EVENTS_LABEL_POS: (i32, i32) = (20, 40);

const GREEN: [u8; 3] = [0, 255, 0];
const YELLOW: [u8; 3] = [255, 255, 0];
const RED: [u8; 3] = [255, 0, 0];

/// Copy `frame` and draw the frame index, the event count and any event
/// bounding boxes onto the copy.
///
/// Formats other than packed RGB/BGR are passed through with the overlay
/// text recorded but not drawn.
pub fn annotate(frame: &Frame, frame_index: u64, events: &[Event]) -> Frame {
    let mut overlay = vec![format!("FRAME: {}", frame_index)];
    if !events.is_empty() {
        overlay.push(format!("EVENTS: {}", events.len()));
    }

    let swap = match frame.format() {
        PixelFormat::Rgb24 => false,
        PixelFormat::Bgr24 => true,
        _ => return frame.with_data(frame.data.to_vec(), overlay),
    };
    let Some(mut image) = RgbImage::from_raw(frame.width(), frame.height(), frame.data.to_vec())
    else {
        return frame.with_data(frame.data.to_vec(), overlay);
    };
    let color = |rgb: [u8; 3]| {
        if swap {
            Rgb([rgb[2], rgb[1], rgb[0]])
        } else {
            Rgb(rgb)
        }
    };

    for event in events {
        if let Some([x1, y1, x2, y2]) = event.bbox() {
            let c = match event.severity {
                Severity::Info => GREEN,
                Severity::Warning => YELLOW,
                Severity::Critical => RED,
            };
            draw_rectangle(
                &mut image,
                x1.round() as i32,
                y1.round() as i32,
                x2.round() as i32,
                y2.round() as i32,
                color(c),
            );
        }
    }

    draw_label(&mut image, FRAME_LABEL_POS, &overlay[0], color(GREEN));
    if let Some(events_label) = overlay.get(1) {
        draw_label(&mut image, EVENTS_LABEL_POS, events_label, color(YELLOW));
    }

    frame.with_data(image.into_raw(), overlay)
}

fn put(image: &mut RgbImage, x: i32, y: i32, color: Rgb<u8>) {
    if x >= 0 && y >= 0 && (x as u32) < image.width() && (y as u32) < image.height() {
        image.put_pixel(x as u32, y as u32, color);
    }
}

fn draw_rectangle(image: &mut RgbImage, left: i32, top: i32, right: i32, bottom: i32, color: Rgb<u8>) {
    let (left, right) = (left.min(right), left.max(right));
    let (top, bottom) = (top.min(bottom), top.max(bottom));
    let max_x = image.width() as i32 - 1;
    let max_y = image.height() as i32 - 1;
    for x in left.max(0)..=right.min(max_x) {
        put(image, x, top, color);
        put(image, x, bottom, color);
    }
    for y in top.max(0)..=bottom.min(max_y) {
        put(image, left, y, color);
        put(image, right, y, color);
    }
}

fn draw_label(image: &mut RgbImage, (mut x, y): (i32, i32), text: &str, color: Rgb<u8>) {
    for ch in text.chars().flat_map(char::to_uppercase) {
        if let Some(glyph) = glyph_bits(ch) {
            for (row, pattern) in glyph.iter().enumerate() {
                for col in 0..5 {
                    if (pattern >> (4 - col)) & 1 == 1 {
                        for dy in 0..SCALE {
                            for dx in 0..SCALE {
                                put(
                                    image,
                                    x + col * SCALE + dx,
                                    y + row as i32 * SCALE + dy,
                                    color,
                                );
                            }
                        }
                    }
                }
            }
        }
        x += 6 * SCALE;
    }
}

fn glyph_bits(ch: char) -> Option<[u8; 7]> {
    let bits = match ch {
        'A' => [0b01110, 0b10001, 0b10001, 0b11111, 0b10001, 0b10001, 0b10001],
        'E' => [0b11111, 0b10000, 0b11110, 0b10000, 0b10000, 0b10000, 0b11111],
        'F' => [0b11111, 0b10000, 0b11110, 0b10000, 0b10000, 0b10000, 0b10000],
        'M' => [0b10001, 0b11011, 0b10101, 0b10101, 0b10001, 0b10001, 0b10001],
        'N' => [0b10001, 0b11001, 0b10101, 0b10101, 0b10011, 0b10001, 0b10001],
        'R' => [0b11110, 0b10001, 0b10001, 0b11110, 0b10100, 0b10010, 0b10001],
        'S' => [0b01111, 0b10000, 0b01110, 0b00001, 0b00001, 0b10001, 0b01110],
        'T' => [0b11111, 0b00100, 0b00100, 0b00100, 0b00100, 0b00100, 0b00100],
        'V' => [0b10001, 0b10001, 0b10001, 0b10001, 0b10001, 0b01010, 0b00100],
        '0' => [0b01110, 0b10001, 0b10011, 0b10101, 0b11001, 0b10001, 0b01110],
        '1' => [0b00100, 0b01100, 0b00100, 0b00100, 0b00100, 0b00100, 0b01110],
        '2' => [0b01110, 0b10001, 0b00001, 0b00010, 0b00100, 0b01000, 0b11111],
        '3' => [0b11110, 0b00001, 0b00001, 0b01110, 0b00001, 0b00001, 0b11110],
        '4' => [0b00010, 0b00110, 0b01010, 0b10010, 0b11111, 0b00010, 0b00010],
        '5' => [0b11111, 0b10000, 0b11110, 0b00001, 0b00001, 0b10001, 0b01110],
        '6' => [0b00110, 0b01000, 0b10000, 0b11110, 0b10001, 0b10001, 0b01110],
        '7' => [0b11111, 0b00001, 0b00010, 0b00100, 0b01000, 0b01000, 0b01000],
        '8' => [0b01110, 0b10001, 0b10001, 0b01110, 0b10001, 0b10001, 0b01110],
        '9' => [0b01110, 0b10001, 0b10001, 0b01111, 0b00001, 0b00010, 0b01100],
        ':' => [0, 0b00100, 0b00100, 0, 0b00100, 0b00100, 0],
        ' ' => [0; 7],
        _ => return None,
    };
    Some(bits)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::SystemTime;

    fn black(width: u32, height: u32, format: PixelFormat) -> Frame {
        let bpp = format.channels().unwrap_or(1) as usize;
        Frame::new(
            vec![0u8; width as usize * height as usize * bpp],
            width,
            height,
            format,
            "CAM".into(),
        )
    }

    fn count(frame: &Frame, rgb: [u8; 3]) -> usize {
        frame.data.chunks_exact(3).filter(|p| *p == rgb).count()
    }

    #[test]
    fn draws_frame_label_without_touching_source() {
        let frame = black(200, 80, PixelFormat::Rgb24);
        let annotated = annotate(&frame, 12, &[]);
        assert_eq!(annotated.overlay, ["FRAME: 12"]);
        assert!(count(&annotated, GREEN) > 0);
        assert_eq!(count(&annotated, YELLOW), 0);
        assert!(frame.data.iter().all(|&b| b == 0));
    }

    #[test]
    fn event_label_and_boxes_use_severity_colors() {
        let frame = black(200, 120, PixelFormat::Rgb24);
        let events = [Event::new("pothole", "CAM", SystemTime::now())
            .with_severity(Severity::Critical)
            .with_bbox([100.0, 70.0, 150.0, 110.0])];
        let annotated = annotate(&frame, 5, &events);
        assert_eq!(annotated.overlay, ["FRAME: 5", "EVENTS: 1"]);
        assert!(count(&annotated, YELLOW) > 0);
        // 51x41 box outline
        assert_eq!(count(&annotated, RED), 2 * 51 + 2 * 39);
    }

    #[test]
    fn bgr_frames_get_swapped_colors() {
        let frame = black(200, 80, PixelFormat::Bgr24);
        let events = [Event::new("x", "CAM", SystemTime::now())];
        let annotated = annotate(&frame, 1, &events);
        assert!(count(&annotated, [0, 255, 255]) > 0);
    }

    #[test]
    fn boxes_outside_the_frame_are_clipped() {
        let frame = black(10, 10, PixelFormat::Rgb24);
        let events = [Event::new("x", "CAM", SystemTime::now()).with_bbox([-5.0, -5.0, 50.0, 50.0])];
        let annotated = annotate(&frame, 1, &events);
        assert_eq!(annotated.data.len(), frame.data.len());
    }

    #[test]
    fn other_formats_pass_through() {
        let frame = black(4, 4, PixelFormat::Gray8);
        let annotated = annotate(&frame, 2, &[]);
        assert_eq!(annotated.data, frame.data);
        assert_eq!(annotated.overlay, ["FRAME: 2"]);
    }
}
