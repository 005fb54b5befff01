use image::RgbaImage;
use ndarray::{Array3, ArrayView2, s};

use crate::error::{ViewerError, try_alloc};
use crate::pyramid::{BYTES_PER_VOXEL, PyramidCatalog, PyramidLevelInfo};

/// Pixel rectangle of one pyramid level.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Region {
    pub level: usize,
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

impl Region {
    /// The whole extent of `level`.
    pub fn full(level: &PyramidLevelInfo) -> Self {
        Self {
            level: level.index,
            x: 0,
            y: 0,
            width: level.width,
            height: level.height,
        }
    }

    pub fn texel_count(&self) -> usize {
        self.width as usize * self.height as usize
    }

    fn fits(&self, level: &PyramidLevelInfo) -> bool {
        self.x as u64 + self.width as u64 <= level.width as u64
            && self.y as u64 + self.height as u64 <= level.height as u64
    }
}

/// RGBA volume ready for upload, shaped `(depth, height, width)`.
#[derive(Clone, Debug, PartialEq)]
pub struct VolumeBuffer {
    data: Array3<u32>,
    region: Option<Region>,
}

impl VolumeBuffer {
    /// Stack `depth` copies of a row-major `width * height` plane.
    pub fn replicate_plane(
        plane: &[u32],
        width: u32,
        height: u32,
        depth: u32,
        region: Option<Region>,
    ) -> Result<Self, ViewerError> {
        let plane_len = width as usize * height as usize;
        if plane.len() != plane_len {
            return Err(ViewerError::InvalidArgument(format!(
                "plane of {width}x{height} needs {plane_len} texels, got {}",
                plane.len()
            )));
        }

        let mut texels = try_alloc(plane_len * depth as usize, 0u32)?;
        for slice in texels.chunks_exact_mut(plane_len.max(1)) {
            slice.copy_from_slice(plane);
        }
        let data = Array3::from_shape_vec(
            (depth as usize, height as usize, width as usize),
            texels,
        )
        .map_err(|e| ViewerError::InvalidArgument(e.to_string()))?;

        Ok(Self { data, region })
    }

    /// Wrap an existing `(depth, height, width)` array.
    pub fn from_array(data: Array3<u32>) -> Self {
        Self { data, region: None }
    }

    /// Dimensions as `(width, height, depth)`.
    pub fn size(&self) -> (u32, u32, u32) {
        let (depth, height, width) = self.data.dim();
        (width as u32, height as u32, depth as u32)
    }

    pub fn data(&self) -> &Array3<u32> {
        &self.data
    }

    /// Source rectangle for pyramid buffers, `None` for scans.
    pub fn region(&self) -> Option<Region> {
        self.region
    }

    pub fn size_bytes(&self) -> u64 {
        self.data.len() as u64 * BYTES_PER_VOXEL
    }

    /// Raw texel bytes in upload order.
    pub fn as_bytes(&self) -> &[u8] {
        match self.data.as_slice() {
            Some(texels) => bytemuck::cast_slice(texels),
            None => &[],
        }
    }

    pub fn slice(&self, z: usize) -> Option<ArrayView2<'_, u32>> {
        (z < self.data.dim().0).then(|| self.data.slice(s![z, .., ..]))
    }

    /// One depth slice as an RGBA image.
    pub fn slice_image(&self, z: usize) -> Option<RgbaImage> {
        let slice = self.slice(z)?;
        let (height, width) = slice.dim();
        let bytes: Vec<u8> = slice.iter().flat_map(|texel| texel.to_le_bytes()).collect();
        RgbaImage::from_raw(width as u32, height as u32, bytes)
    }
}

/// Reads pyramid regions and replicates them into pseudo-volumes.
#[derive(Clone, Copy, Debug)]
pub struct RegionLoader {
    depth: u32,
}

impl RegionLoader {
    pub fn new(depth: u32) -> Self {
        Self { depth }
    }

    pub fn depth(&self) -> u32 {
        self.depth
    }

    /// Read `region` and replicate it over the synthetic depth.
    ///
    /// # Errors
    ///
    /// `InvalidArgument` for an empty or out-of-bounds rectangle,
    /// `BackendRead` if the backend fails, `OutOfMemory` if the buffer cannot
    /// be allocated. Nothing is retried.
    pub fn load_region(
        &self,
        catalog: &mut PyramidCatalog,
        region: Region,
    ) -> Result<VolumeBuffer, ViewerError> {
        if region.width == 0 || region.height == 0 {
            return Err(ViewerError::InvalidArgument(format!(
                "region size must be positive, got {}x{}",
                region.width, region.height
            )));
        }
        let level = *catalog.level(region.level).ok_or_else(|| {
            ViewerError::InvalidArgument(format!("level {} does not exist", region.level))
        })?;
        if !region.fits(&level) {
            return Err(ViewerError::InvalidArgument(format!(
                "region {region:?} exceeds level {}x{}",
                level.width, level.height
            )));
        }

        let start = web_time::Instant::now();
        let mut plane = try_alloc(region.texel_count(), 0u32)?;
        catalog.backend_mut().read_region(
            region.level,
            region.x,
            region.y,
            region.width,
            region.height,
            &mut plane,
        )?;
        let buffer = VolumeBuffer::replicate_plane(
            &plane,
            region.width,
            region.height,
            self.depth,
            Some(region),
        )?;

        log::debug!(
            "Loaded level {} region {}x{} at ({}, {}) x{} in {:.2?}",
            region.level,
            region.width,
            region.height,
            region.x,
            region.y,
            self.depth,
            start.elapsed()
        );
        Ok(buffer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pyramid::{InMemoryPyramid, pack_rgba};

    fn catalog() -> PyramidCatalog {
        let pyramid = InMemoryPyramid::new()
            .with_level_fn(8, 6, |x, y| pack_rgba([x as u8, y as u8, 0, 255]))
            .unwrap();
        PyramidCatalog::from_backend(Box::new(pyramid)).unwrap()
    }

    #[test]
    fn test_every_slice_is_a_copy_of_the_region() {
        let mut catalog = catalog();
        let region = Region {
            level: 0,
            x: 2,
            y: 1,
            width: 4,
            height: 3,
        };
        let buffer = RegionLoader::new(5).load_region(&mut catalog, region).unwrap();

        assert_eq!(buffer.size(), (4, 3, 5));
        assert_eq!(buffer.region(), Some(region));
        let first = buffer.slice(0).unwrap();
        assert_eq!(first[[0, 0]], pack_rgba([2, 1, 0, 255]));
        for z in 1..5 {
            assert_eq!(buffer.slice(z).unwrap(), first);
        }
        assert!(buffer.slice(5).is_none());
    }

    #[test]
    fn test_byte_view_covers_whole_volume() {
        let mut catalog = catalog();
        let region = Region::full(catalog.level(0).unwrap());
        let buffer = RegionLoader::new(2).load_region(&mut catalog, region).unwrap();
        assert_eq!(buffer.as_bytes().len() as u64, buffer.size_bytes());
        assert_eq!(buffer.size_bytes(), 8 * 6 * 2 * 4);
    }

    #[test]
    fn test_empty_region_is_invalid() {
        let mut catalog = catalog();
        let region = Region {
            level: 0,
            x: 0,
            y: 0,
            width: 0,
            height: 3,
        };
        assert!(matches!(
            RegionLoader::new(2).load_region(&mut catalog, region),
            Err(ViewerError::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_region_outside_level_is_invalid() {
        let mut catalog = catalog();
        let region = Region {
            level: 0,
            x: 6,
            y: 0,
            width: 4,
            height: 3,
        };
        assert!(matches!(
            RegionLoader::new(2).load_region(&mut catalog, region),
            Err(ViewerError::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_slice_image_keeps_channel_order() {
        let mut catalog = catalog();
        let region = Region::full(catalog.level(0).unwrap());
        let buffer = RegionLoader::new(1).load_region(&mut catalog, region).unwrap();
        let image = buffer.slice_image(0).unwrap();
        assert_eq!(image.dimensions(), (8, 6));
        assert_eq!(image.get_pixel(3, 2).0, [3, 2, 0, 255]);
    }
}
