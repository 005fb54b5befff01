use image::{ImageBuffer, Luma};
use ndarray::{Array3, ArrayView2, s};
use rayon::prelude::*;

use crate::enums::Axis;
use crate::error::{ViewerError, try_alloc};
use crate::pyramid::pack_rgba;
use crate::region::VolumeBuffer;

/// Single-resolution scalar volume, e.g. a CT or MR series.
#[derive(Clone, Debug, Default)]
pub struct ScanVolume {
    data: Array3<u16>,
    spacing: (f32, f32, f32),
}

impl ScanVolume {
    pub fn new(data: Array3<u16>, spacing: (f32, f32, f32)) -> Self {
        Self { data, spacing }
    }

    /// Get the dimensions of the volume (depth, height, width)
    pub fn dim(&self) -> (usize, usize, usize) {
        self.data.dim()
    }

    /// Voxel spacing as `(x, y, z)`.
    pub fn spacing(&self) -> (f32, f32, f32) {
        self.spacing
    }

    pub fn data(&self) -> &Array3<u16> {
        &self.data
    }

    /// `(min, max)` stored intensity, `(0, 0)` for an empty volume.
    pub fn intensity_range(&self) -> (u16, u16) {
        let slice = match self.data.as_slice() {
            Some(slice) if !slice.is_empty() => slice,
            _ => return (0, 0),
        };
        slice
            .par_iter()
            .fold(
                || (u16::MAX, u16::MIN),
                |(lo, hi), &v| (lo.min(v), hi.max(v)),
            )
            .reduce(
                || (u16::MAX, u16::MIN),
                |(a_lo, a_hi), (b_lo, b_hi)| (a_lo.min(b_lo), a_hi.max(b_hi)),
            )
    }

    #[inline]
    fn normalize_to_u8(value: u16, (lo, hi): (u16, u16)) -> u8 {
        if hi <= lo {
            return 0;
        }
        (((value.saturating_sub(lo)) as f32 / (hi - lo) as f32) * 255.0).clamp(0.0, 255.0) as u8
    }

    pub fn slice(&self, index: usize, axis: Axis) -> Option<ArrayView2<'_, u16>> {
        if !self.is_valid_index(index, axis) {
            return None;
        }
        let slice = match axis {
            Axis::Z => self.data.slice(s![index, .., ..]),
            Axis::Y => self.data.slice(s![.., index, ..]),
            Axis::X => self.data.slice(s![.., .., index]),
        };
        Some(slice)
    }

    /// Slice normalised to the volume's intensity range as an 8-bit image.
    pub fn slice_image(&self, index: usize, axis: Axis) -> Option<ImageBuffer<Luma<u8>, Vec<u8>>> {
        let slice = self.slice(index, axis)?;
        let range = self.intensity_range();
        let (height, width) = slice.dim();
        let pixel_data: Vec<u8> = slice
            .iter()
            .map(|&v| Self::normalize_to_u8(v, range))
            .collect();
        ImageBuffer::from_raw(width as u32, height as u32, pixel_data)
    }

    /// Grey RGBA volume for the ray caster, intensity normalised to the range.
    pub fn to_volume_buffer(&self) -> Result<VolumeBuffer, ViewerError> {
        let range = self.intensity_range();
        let mut texels = try_alloc(self.data.len(), 0u32)?;
        texels
            .par_iter_mut()
            .zip(self.data.as_standard_layout().as_slice().unwrap_or_default())
            .for_each(|(texel, &v)| {
                let grey = Self::normalize_to_u8(v, range);
                *texel = pack_rgba([grey, grey, grey, 255]);
            });
        let data = Array3::from_shape_vec(self.data.dim(), texels)
            .map_err(|e| ViewerError::InvalidArgument(e.to_string()))?;
        Ok(VolumeBuffer::from_array(data))
    }

    fn is_valid_index(&self, index: usize, axis: Axis) -> bool {
        let dim = self.data.dim();
        let max_index = match axis {
            Axis::Z => dim.0,
            Axis::Y => dim.1,
            Axis::X => dim.2,
        };
        index < max_index
    }
}
