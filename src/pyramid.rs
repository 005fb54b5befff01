//! Resolution pyramid access.
//!
//! A pyramid is an ordered set of raster levels of the same slide. Level 0 is
//! the highest resolution; the last level is the lowest resolution and serves
//! as the always-resident baseline. Backends expose the raw level geometry and
//! region reads, [`PyramidCatalog`] validates the ordering and owns the
//! backend for the lifetime of the volume.

use std::path::Path;

use thiserror::Error;

use crate::error::ViewerError;
use crate::image_pyramid::ImagePyramid;
use crate::tiff_pyramid::{TiffPyramid, is_tiff_path};

/// Bytes per packed RGBA voxel.
pub const BYTES_PER_VOXEL: u64 = 4;

#[derive(Debug, Error)]
pub enum BackendError {
    #[error("Level {0} does not exist")]
    LevelOutOfRange(usize),

    #[error("Region {width}x{height} at ({x}, {y}) exceeds level {level} bounds")]
    RegionOutOfBounds {
        level: usize,
        x: u32,
        y: u32,
        width: u32,
        height: u32,
    },

    #[error("Output buffer holds {actual} texels, {expected} required")]
    BufferSize { expected: usize, actual: usize },

    #[error("{0}")]
    Read(String),
}

/// Geometry of one resolution level.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PyramidLevelInfo {
    pub index: usize,
    pub width: u32,
    pub height: u32,
    pub estimated_size_bytes: u64,
}

impl PyramidLevelInfo {
    pub fn new(index: usize, width: u32, height: u32) -> Self {
        Self {
            index,
            width,
            height,
            estimated_size_bytes: width as u64 * height as u64 * BYTES_PER_VOXEL,
        }
    }
}

/// Source of pyramid levels, e.g. a decoded slide or a tiled file reader.
///
/// Texels are packed RGBA, one `u32` per pixel with byte order R, G, B, A.
pub trait PyramidBackend {
    fn level_count(&self) -> usize;

    fn level_dimensions(&self, level: usize) -> Option<(u32, u32)>;

    /// Read `width * height` texels of `level`, row-major, into `out`.
    fn read_region(
        &mut self,
        level: usize,
        x: u32,
        y: u32,
        width: u32,
        height: u32,
        out: &mut [u32],
    ) -> Result<(), BackendError>;
}

#[inline]
pub fn pack_rgba(rgba: [u8; 4]) -> u32 {
    u32::from_le_bytes(rgba)
}

#[inline]
pub fn unpack_rgba(texel: u32) -> [u8; 4] {
    texel.to_le_bytes()
}

/// Validated level listing plus the open backend handle.
pub struct PyramidCatalog {
    backend: Box<dyn PyramidBackend>,
    levels: Vec<PyramidLevelInfo>,
}

impl std::fmt::Debug for PyramidCatalog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PyramidCatalog")
            .field("levels", &self.levels)
            .finish_non_exhaustive()
    }
}

impl PyramidCatalog {
    /// Open a slide file. TIFF and SVS files use the levels stored in the
    /// file; other rasters are decoded and reduced in memory.
    pub fn open(path: impl AsRef<Path>, min_level_edge: u32) -> Result<Self, ViewerError> {
        let path = path.as_ref();
        let backend: Box<dyn PyramidBackend> = if is_tiff_path(path) {
            Box::new(TiffPyramid::open(path)?)
        } else {
            Box::new(ImagePyramid::open(path, min_level_edge)?)
        };
        Self::from_backend(backend)
    }

    /// Enumerate the levels of an already opened backend.
    ///
    /// # Errors
    ///
    /// `UnsupportedFormat` if the backend reports no levels, a level without
    /// dimensions or an empty level, or if level sizes grow with the index.
    pub fn from_backend(backend: Box<dyn PyramidBackend>) -> Result<Self, ViewerError> {
        let count = backend.level_count();
        if count == 0 {
            return Err(ViewerError::UnsupportedFormat(
                "pyramid has no levels".into(),
            ));
        }

        let levels = (0..count)
            .map(|index| {
                let (width, height) = backend.level_dimensions(index).ok_or_else(|| {
                    ViewerError::UnsupportedFormat(format!("level {index} has no dimensions"))
                })?;
                if width == 0 || height == 0 {
                    return Err(ViewerError::UnsupportedFormat(format!(
                        "level {index} is empty"
                    )));
                }
                Ok(PyramidLevelInfo::new(index, width, height))
            })
            .collect::<Result<Vec<_>, _>>()?;

        if levels
            .windows(2)
            .any(|pair| pair[1].estimated_size_bytes > pair[0].estimated_size_bytes)
        {
            return Err(ViewerError::UnsupportedFormat(
                "levels are not ordered from highest to lowest resolution".into(),
            ));
        }

        log::info!(
            "Pyramid opened: {} levels, {}x{} at full resolution",
            levels.len(),
            levels[0].width,
            levels[0].height
        );

        Ok(Self { backend, levels })
    }

    pub fn levels(&self) -> &[PyramidLevelInfo] {
        &self.levels
    }

    pub fn level(&self, index: usize) -> Option<&PyramidLevelInfo> {
        self.levels.get(index)
    }

    pub fn level_count(&self) -> usize {
        self.levels.len()
    }

    /// Index of the lowest-resolution level.
    pub fn baseline_index(&self) -> usize {
        self.levels.len() - 1
    }

    pub(crate) fn backend_mut(&mut self) -> &mut dyn PyramidBackend {
        self.backend.as_mut()
    }
}

/// Pyramid over rasters that are already decoded in memory.
#[derive(Clone, Debug, Default)]
pub struct InMemoryPyramid {
    levels: Vec<MemoryLevel>,
}

#[derive(Clone, Debug)]
struct MemoryLevel {
    width: u32,
    height: u32,
    texels: Vec<u32>,
}

impl InMemoryPyramid {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a level. Levels must be pushed from highest to lowest resolution.
    ///
    /// # Errors
    ///
    /// `InvalidArgument` if `texels` does not hold `width * height` values.
    pub fn with_level(
        mut self,
        width: u32,
        height: u32,
        texels: Vec<u32>,
    ) -> Result<Self, ViewerError> {
        let expected = width as usize * height as usize;
        if texels.len() != expected {
            return Err(ViewerError::InvalidArgument(format!(
                "level of {width}x{height} needs {expected} texels, got {}",
                texels.len()
            )));
        }
        self.levels.push(MemoryLevel {
            width,
            height,
            texels,
        });
        Ok(self)
    }

    /// Append a level whose texels are produced by `texel(x, y)`.
    pub fn with_level_fn(
        self,
        width: u32,
        height: u32,
        texel: impl Fn(u32, u32) -> u32,
    ) -> Result<Self, ViewerError> {
        let texels = (0..height)
            .flat_map(|y| (0..width).map(move |x| (x, y)))
            .map(|(x, y)| texel(x, y))
            .collect();
        self.with_level(width, height, texels)
    }
}

impl PyramidBackend for InMemoryPyramid {
    fn level_count(&self) -> usize {
        self.levels.len()
    }

    fn level_dimensions(&self, level: usize) -> Option<(u32, u32)> {
        self.levels.get(level).map(|l| (l.width, l.height))
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
        let source = self
            .levels
            .get(level)
            .ok_or(BackendError::LevelOutOfRange(level))?;
        copy_region(
            &source.texels,
            source.width,
            source.height,
            level,
            (x, y, width, height),
            out,
        )
    }
}

/// Copy a rectangle out of a row-major raster.
pub(crate) fn copy_region(
    texels: &[u32],
    source_width: u32,
    source_height: u32,
    level: usize,
    (x, y, width, height): (u32, u32, u32, u32),
    out: &mut [u32],
) -> Result<(), BackendError> {
    let in_bounds = x
        .checked_add(width)
        .is_some_and(|right| right <= source_width)
        && y.checked_add(height)
            .is_some_and(|bottom| bottom <= source_height);
    if !in_bounds {
        return Err(BackendError::RegionOutOfBounds {
            level,
            x,
            y,
            width,
            height,
        });
    }
    let expected = width as usize * height as usize;
    if out.len() != expected {
        return Err(BackendError::BufferSize {
            expected,
            actual: out.len(),
        });
    }
    if expected == 0 {
        return Ok(());
    }

    let (x, width, source_width) = (x as usize, width as usize, source_width as usize);
    for (row, dst) in out.chunks_exact_mut(width).enumerate() {
        let start = (y as usize + row) * source_width + x;
        dst.copy_from_slice(&texels[start..start + width]);
    }
    Ok(())
}
