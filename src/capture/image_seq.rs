//! Directory of still images played back as a stream.

use std::fs;
use std::path::PathBuf;
use std::sync::Arc;

use color_eyre::{eyre::eyre, Result};
use tracing::debug;

use super::frame::{Frame, PixelFormat};
use super::FrameSource;

const EXTENSIONS: &[&str] = &["jpg", "jpeg", "png"];

pub struct ImageSequenceSource {
    dir: PathBuf,
    fps: Option<f64>,
    camera_id: Arc<str>,
    files: Vec<PathBuf>,
    cursor: usize,
    open: bool,
}

impl ImageSequenceSource {
    pub fn new(dir: PathBuf, fps: Option<f64>, camera_id: Arc<str>) -> Self {
        Self {
            dir,
            fps,
            camera_id,
            files: Vec::new(),
            cursor: 0,
            open: false,
        }
    }
}

impl FrameSource for ImageSequenceSource {
    fn open(&mut self) -> Result<()> {
        let mut files: Vec<PathBuf> = fs::read_dir(&self.dir)?
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|path| {
                path.extension()
                    .and_then(|ext| ext.to_str())
                    .map(|ext| EXTENSIONS.contains(&ext.to_ascii_lowercase().as_str()))
                    .unwrap_or(false)
            })
            .collect();
        if files.is_empty() {
            return Err(eyre!("no images found in {}", self.dir.display()));
        }
        files.sort();
        debug!("Found {} images in {}", files.len(), self.dir.display());

        self.files = files;
        self.cursor = 0;
        self.open = true;
        Ok(())
    }

    fn read(&mut self) -> Result<Option<Frame>> {
        if !self.open {
            return Err(eyre!("image sequence is not open"));
        }
        let Some(path) = self.files.get(self.cursor) else {
            return Ok(None);
        };
        let image = image::open(path)
            .map_err(|e| eyre!("failed to decode {}: {}", path.display(), e))?
            .to_rgb8();
        self.cursor += 1;

        let (width, height) = image.dimensions();
        Ok(Some(Frame::new(
            image.into_raw(),
            width,
            height,
            PixelFormat::Rgb24,
            Arc::clone(&self.camera_id),
        )))
    }

    fn frame_rate(&self) -> Option<f64> {
        self.fps
    }

    fn total_frames(&self) -> Option<u64> {
        self.open.then_some(self.files.len() as u64)
    }

    fn release(&mut self) {
        self.open = false;
        self.files.clear();
    }

    fn is_open(&self) -> bool {
        self.open
    }

    fn describe(&self) -> String {
        format!("image sequence {}", self.dir.display())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{Rgb, RgbImage};

    #[test]
    fn plays_images_in_name_order() {
        let dir = tempfile::tempdir().unwrap();
        for (name, shade) in [("b.png", 200u8), ("a.png", 10u8)] {
            RgbImage::from_pixel(4, 2, Rgb([shade, shade, shade]))
                .save(dir.path().join(name))
                .unwrap();
        }
        std::fs::write(dir.path().join("notes.txt"), b"skip me").unwrap();

        let mut source = ImageSequenceSource::new(dir.path().into(), Some(5.0), "CAM".into());
        source.open().unwrap();
        assert_eq!(source.total_frames(), Some(2));

        let first = source.read().unwrap().unwrap();
        assert_eq!((first.width(), first.height()), (4, 2));
        assert_eq!(first.data[0], 10);
        let second = source.read().unwrap().unwrap();
        assert_eq!(second.data[0], 200);
        assert!(source.read().unwrap().is_none());
    }

    #[test]
    fn empty_directory_fails_to_open() {
        let dir = tempfile::tempdir().unwrap();
        let mut source = ImageSequenceSource::new(dir.path().into(), None, "CAM".into());
        assert!(source.open().is_err());
    }
}
