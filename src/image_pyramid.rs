use std::path::{Path, PathBuf};

use image::{ImageError, ImageFormat, ImageReader, RgbaImage, imageops::FilterType};

use crate::error::ViewerError;
use crate::pyramid::{BackendError, InMemoryPyramid, PyramidBackend, pack_rgba};

/// Pyramid backend for single-resolution rasters.
///
/// The file is decoded once; lower levels are derived by successive 2x
/// downsampling until the longer edge fits `min_level_edge`.
pub struct ImagePyramid {
    source: PathBuf,
    levels: InMemoryPyramid,
}

impl ImagePyramid {
    pub fn open(path: &Path, min_level_edge: u32) -> Result<Self, ViewerError> {
        ImageFormat::from_path(path).map_err(|_| {
            ViewerError::UnsupportedFormat(format!("cannot decode {}", path.display()))
        })?;

        let start = web_time::Instant::now();
        let decoded = ImageReader::open(path)?
            .with_guessed_format()?
            .decode()
            .map_err(|e| match e {
                ImageError::IoError(io) => ViewerError::Io(io),
                ImageError::Unsupported(u) => ViewerError::UnsupportedFormat(u.to_string()),
                other => ViewerError::BackendRead(BackendError::Read(other.to_string())),
            })?;

        let mut levels = InMemoryPyramid::new();
        for level in build_levels(decoded.into_rgba8(), min_level_edge) {
            let (width, height) = level.dimensions();
            let texels = level
                .pixels()
                .map(|pixel| pack_rgba(pixel.0))
                .collect();
            levels = levels.with_level(width, height, texels)?;
        }

        log::info!(
            "Decoded {} in {:.2?}",
            path.display(),
            start.elapsed()
        );

        Ok(Self {
            source: path.to_path_buf(),
            levels,
        })
    }

    pub fn source(&self) -> &Path {
        &self.source
    }
}

/// Full-resolution image followed by its 2x reductions.
fn build_levels(full: RgbaImage, min_level_edge: u32) -> Vec<RgbaImage> {
    let mut levels = vec![full];
    loop {
        let last = &levels[levels.len() - 1];
        let (width, height) = last.dimensions();
        if width.max(height) <= min_level_edge || width.min(height) < 2 {
            break;
        }
        let next = image::imageops::resize(last, width / 2, height / 2, FilterType::Triangle);
        levels.push(next);
    }
    levels
}

impl PyramidBackend for ImagePyramid {
    fn level_count(&self) -> usize {
        self.levels.level_count()
    }

    fn level_dimensions(&self, level: usize) -> Option<(u32, u32)> {
        self.levels.level_dimensions(level)
    }

    fn read_region(
        &mut self,
        level: usize,
        x: u32,
        y: u32,
        width: u32,
        height: u32,
        out: &mut [u32],
    ) -> Result<(), BackendError> {
        self.levels.read_region(level, x, y, width, height, out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgba;

    #[test]
    fn test_levels_halve_until_min_edge() {
        let full = RgbaImage::from_pixel(1000, 600, Rgba([10, 20, 30, 255]));
        let levels = build_levels(full, 200);
        let dims: Vec<_> = levels.iter().map(|l| l.dimensions()).collect();
        assert_eq!(dims, vec![(1000, 600), (500, 300), (250, 150), (125, 75)]);
    }

    #[test]
    fn test_small_image_is_single_level() {
        let full = RgbaImage::from_pixel(64, 64, Rgba([0, 0, 0, 255]));
        assert_eq!(build_levels(full, 512).len(), 1);
    }

    #[test]
    fn test_unknown_extension_is_unsupported() {
        let err = ImagePyramid::open(Path::new("slide.unknownext"), 512)
            .err()
            .unwrap();
        assert!(matches!(err, ViewerError::UnsupportedFormat(_)));
    }

    #[test]
    fn test_open_png_roundtrip() {
        let path = std::env::temp_dir().join("slide_volume_image_pyramid_test.png");
        let full = RgbaImage::from_fn(40, 20, |x, y| Rgba([x as u8, y as u8, 7, 255]));
        full.save(&path).unwrap();

        let mut pyramid = ImagePyramid::open(&path, 16).unwrap();
        assert_eq!(pyramid.level_count(), 3);
        assert_eq!(pyramid.level_dimensions(0), Some((40, 20)));

        let mut out = vec![0; 2];
        pyramid.read_region(0, 3, 4, 2, 1, &mut out).unwrap();
        assert_eq!(out[0].to_le_bytes(), [3, 4, 7, 255]);
        assert_eq!(out[1].to_le_bytes(), [4, 4, 7, 255]);

        let _ = std::fs::remove_file(&path);
    }
}
