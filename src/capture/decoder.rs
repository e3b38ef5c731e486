//! Pixel conversions applied before frames enter the pipeline.

use color_eyre::{eyre::eyre, Result};

use super::frame::PixelFormat;

/// Decoded pixels with the dimensions the decoder actually produced.
pub struct Decoded {
    pub pixels: Vec<u8>,
    pub width: u32,
    pub height: u32,
}

/// Convert a captured buffer into packed RGB24.
pub fn decode_frame(data: &[u8], format: PixelFormat, width: u32, height: u32) -> Result<Decoded> {
    match format {
        PixelFormat::Mjpeg => {
            let mut decoder = zune_jpeg::JpegDecoder::new(data);
            let pixels = decoder
                .decode()
                .map_err(|e| eyre!("MJPEG decode failed: {:?}", e))?;
            let (w, h) = decoder
                .dimensions()
                .ok_or_else(|| eyre!("MJPEG decoder reported no dimensions"))?;
            Ok(Decoded {
                pixels,
                width: w as u32,
                height: h as u32,
            })
        }
        PixelFormat::Rgb24 => {
            // Already in RGB format
            check_len(data, width, height, 3)?;
            Ok(Decoded {
                pixels: data.to_vec(),
                width,
                height,
            })
        }
        PixelFormat::Bgr24 => {
            check_len(data, width, height, 3)?;
            let mut pixels = data.to_vec();
            for px in pixels.chunks_exact_mut(3) {
                px.swap(0, 2);
            }
            Ok(Decoded {
                pixels,
                width,
                height,
            })
        }
        PixelFormat::Gray8 => {
            check_len(data, width, height, 1)?;
            let pixels = data.iter().flat_map(|&y| [y, y, y]).collect();
            Ok(Decoded {
                pixels,
                width,
                height,
            })
        }
        PixelFormat::Yuyv4 => {
            check_len(data, width, height, 2)?;
            Ok(Decoded {
                pixels: yuyv_to_rgb(data),
                width,
                height,
            })
        }
    }
}

fn check_len(data: &[u8], width: u32, height: u32, bpp: u32) -> Result<()> {
    let expected = width as usize * height as usize * bpp as usize;
    if data.len() < expected {
        return Err(eyre!(
            "short frame buffer: {} bytes, expected {} for {}x{}",
            data.len(),
            expected,
            width,
            height
        ));
    }
    Ok(())
}

/// BT.601 YUYV 4:2:2 to RGB24. Each 4-byte macropixel yields two pixels.
fn yuyv_to_rgb(data: &[u8]) -> Vec<u8> {
    let mut rgb = Vec::with_capacity(data.len() / 2 * 3);
    for chunk in data.chunks_exact(4) {
        let (y0, u, y1, v) = (chunk[0], chunk[1], chunk[2], chunk[3]);
        rgb.extend_from_slice(&yuv_to_rgb(y0, u, v));
        rgb.extend_from_slice(&yuv_to_rgb(y1, u, v));
    }
    rgb
}

fn yuv_to_rgb(y: u8, u: u8, v: u8) -> [u8; 3] {
    let c = y as i32 - 16;
    let d = u as i32 - 128;
    let e = v as i32 - 128;
    let clamp = |x: i32| ((x + 128) >> 8).clamp(0, 255) as u8;
    [
        clamp(298 * c + 409 * e),
        clamp(298 * c - 100 * d - 208 * e),
        clamp(298 * c + 516 * d),
    ]
}
