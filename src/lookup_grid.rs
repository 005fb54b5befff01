use half::f16;
use ndarray::{Array3, Zip};

use crate::error::{ViewerError, try_alloc};

/// Dense cubic grid of opacities, indexed `[[z, y, x]]`.
///
/// Grids are always rebuilt as a whole and swapped in, so a reader never
/// observes a partially written grid.
#[derive(Clone, Debug, PartialEq)]
pub struct LookupGrid {
    data: Array3<f32>,
}

impl LookupGrid {
    /// A `dim`³ grid filled with `value`. `dim` must be positive.
    pub fn filled(dim: usize, value: f32) -> Result<Self, ViewerError> {
        if dim == 0 {
            return Err(ViewerError::InvalidArgument(
                "lookup grid needs at least one cell per axis".into(),
            ));
        }
        let cells = dim
            .checked_pow(3)
            .ok_or(ViewerError::OutOfMemory { bytes: u64::MAX })?;
        let values = try_alloc(cells, value)?;
        let data = Array3::from_shape_vec((dim, dim, dim), values)
            .map_err(|e| ViewerError::InvalidArgument(e.to_string()))?;
        Ok(Self { data })
    }

    /// Build a `dim`³ grid by evaluating `cell(x, y, z)` for every cell in parallel.
    pub fn from_fn<F>(dim: usize, cell: F) -> Result<Self, ViewerError>
    where
        F: Fn(usize, usize, usize) -> f32 + Sync + Send,
    {
        let mut grid = Self::filled(dim, 0.0)?;
        Zip::indexed(&mut grid.data).par_for_each(|(z, y, x), value| {
            *value = cell(x, y, z);
        });
        Ok(grid)
    }

    pub fn dim(&self) -> usize {
        self.data.dim().0
    }

    pub fn data(&self) -> &Array3<f32> {
        &self.data
    }

    pub fn get(&self, x: usize, y: usize, z: usize) -> Option<f32> {
        self.data.get([z, y, x]).copied()
    }

    /// Value of the cell containing the normalised position `(x, y, z)`.
    pub fn sample(&self, x: f32, y: f32, z: f32) -> f32 {
        let dim = self.dim();
        let index = |v: f32| ((v.clamp(0.0, 1.0) * dim as f32) as usize).min(dim - 1);
        self.data[[index(z), index(y), index(x)]]
    }

    /// Normalised coordinate of the lower corner of cell `index`.
    pub fn cell_coordinate(&self, index: usize) -> f32 {
        index as f32 / self.dim() as f32
    }

    /// Texels for an `R16Float` 3D texture.
    pub fn to_f16_texels(&self) -> Vec<f16> {
        self.data.iter().map(|&v| f16::from_f32(v)).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_filled() {
        let grid = LookupGrid::filled(4, 0.5).unwrap();
        assert_eq!(grid.dim(), 4);
        assert_eq!(grid.data().len(), 64);
        assert!(grid.data().iter().all(|&v| v == 0.5));
    }

    #[test]
    fn test_empty_grid_is_rejected() {
        assert!(matches!(
            LookupGrid::filled(0, 1.0),
            Err(ViewerError::InvalidArgument(_))
        ));
        assert!(LookupGrid::from_fn(0, |_, _, _| 1.0).is_err());
        assert!(matches!(
            crate::location_tf::LocationLayer::new(0),
            Err(ViewerError::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_from_fn_uses_xyz_order() {
        let grid = LookupGrid::from_fn(4, |x, y, z| (x + 10 * y + 100 * z) as f32).unwrap();
        assert_eq!(grid.get(1, 2, 3), Some(321.0));
        assert_eq!(grid.data()[[3, 2, 1]], 321.0);
        assert_eq!(grid.get(4, 0, 0), None);
    }

    #[test]
    fn test_sample_maps_normalised_coordinates() {
        let grid = LookupGrid::from_fn(4, |x, _, _| x as f32).unwrap();
        assert_eq!(grid.sample(0.0, 0.0, 0.0), 0.0);
        assert_eq!(grid.sample(0.5, 0.0, 0.0), 2.0);
        assert_eq!(grid.sample(1.0, 0.0, 0.0), 3.0);
        assert_eq!(grid.sample(-3.0, 0.0, 0.0), 0.0);
    }

    #[test]
    fn test_f16_texels_follow_memory_order() {
        let grid = LookupGrid::from_fn(2, |x, _, _| x as f32 * 0.5).unwrap();
        let texels = grid.to_f16_texels();
        assert_eq!(texels.len(), 8);
        assert_eq!(texels[0].to_f32(), 0.0);
        assert_eq!(texels[1].to_f32(), 0.5);
    }
}
