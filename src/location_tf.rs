//! Spatial classification: user-drawn polygons and axis-aligned slicing planes.
//!
//! Positions are normalised model coordinates in `[0, 1]^3`. Polygons are
//! drawn parallel to the dominant face of the volume, so containment only
//! looks at `(x, y)` and the polygon slice is replicated through the depth.
//! Slicing planes are applied per depth layer on top of that slice.

use glam::Vec3;
use ndarray::{Array2, Zip};

use crate::enums::Axis;
use crate::error::ViewerError;
use crate::lookup_grid::LookupGrid;

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PolygonId(pub u32);

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PlaneId(pub u32);

#[derive(Clone, Debug, PartialEq)]
pub struct Polygon {
    pub id: PolygonId,
    pub vertices: Vec<Vec3>,
    pub opacity: f32,
}

impl Polygon {
    /// Even-odd crossing test on the `(x, y)` projection. Polygons with fewer
    /// than three vertices contain nothing.
    pub fn contains(&self, x: f32, y: f32) -> bool {
        if self.vertices.len() < 3 {
            return false;
        }
        let mut inside = false;
        let mut j = self.vertices.len() - 1;
        for (i, vi) in self.vertices.iter().enumerate() {
            let vj = self.vertices[j];
            if (vi.y > y) != (vj.y > y)
                && x < (vj.x - vi.x) * (y - vi.y) / (vj.y - vi.y) + vi.x
            {
                inside = !inside;
            }
            j = i;
        }
        inside
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct Plane {
    pub id: PlaneId,
    pub orientation: Axis,
    pub distance: f32,
    /// Hide the side at or below `distance` instead of the side above it.
    pub hide_left: bool,
    pub opacity: f32,
}

impl Plane {
    pub fn new(id: PlaneId) -> Self {
        Self {
            id,
            orientation: Axis::X,
            distance: 0.1,
            hide_left: true,
            opacity: 0.0,
        }
    }

    pub fn invert(&mut self) {
        self.hide_left = !self.hide_left;
    }

    pub fn hides(&self, position: Vec3) -> bool {
        let left = position[self.orientation.index()] <= self.distance;
        left == self.hide_left
    }
}

/// Polygons, slicing planes and the grid derived from them.
#[derive(Clone, Debug)]
pub struct LocationLayer {
    polygons: Vec<Polygon>,
    planes: Vec<Plane>,
    drawing: Option<Vec<Vec3>>,
    volume_opacity: f32,
    grid: LookupGrid,
}

impl LocationLayer {
    pub fn new(dim: usize) -> Result<Self, ViewerError> {
        Ok(Self {
            polygons: Vec::new(),
            planes: Vec::new(),
            drawing: None,
            volume_opacity: 1.0,
            grid: LookupGrid::filled(dim, 1.0)?,
        })
    }

    pub fn grid(&self) -> &LookupGrid {
        &self.grid
    }

    pub fn polygons(&self) -> &[Polygon] {
        &self.polygons
    }

    pub fn planes(&self) -> &[Plane] {
        &self.planes
    }

    pub fn volume_opacity(&self) -> f32 {
        self.volume_opacity
    }

    /// Vertices of the polygon currently being drawn.
    pub fn drawing(&self) -> Option<&[Vec3]> {
        self.drawing.as_deref()
    }

    /// Start a new polygon, discarding any unfinished one.
    pub fn begin_polygon(&mut self) {
        self.drawing = Some(Vec::new());
    }

    /// Add a vertex, starting a polygon if none is being drawn.
    pub fn add_vertex(&mut self, vertex: Vec3) {
        self.drawing.get_or_insert_with(Vec::new).push(vertex);
    }

    /// Finish the polygon being drawn and rebuild the grid.
    pub fn close_polygon(&mut self, id: PolygonId, opacity: f32) -> Result<(), ViewerError> {
        let vertices = self.drawing.take().ok_or_else(|| {
            ViewerError::InvalidArgument("no polygon is being drawn".into())
        })?;
        if vertices.len() < 3 {
            log::warn!(
                "Polygon {} closed with {} vertices, it classifies nothing",
                id.0,
                vertices.len()
            );
        }
        let mut polygons = self.polygons.clone();
        polygons.push(Polygon {
            id,
            vertices,
            opacity,
        });
        match self.build(&polygons, &self.planes, self.volume_opacity) {
            Ok(grid) => {
                self.polygons = polygons;
                self.grid = grid;
                Ok(())
            }
            Err(e) => {
                self.drawing = polygons.pop().map(|polygon| polygon.vertices);
                Err(e)
            }
        }
    }

    pub fn update_polygon(
        &mut self,
        id: PolygonId,
        change: impl FnOnce(&mut Polygon),
    ) -> Result<(), ViewerError> {
        let mut polygons = self.polygons.clone();
        let polygon = polygons
            .iter_mut()
            .find(|p| p.id == id)
            .ok_or_else(|| ViewerError::InvalidArgument(format!("unknown polygon {}", id.0)))?;
        change(polygon);
        self.grid = self.build(&polygons, &self.planes, self.volume_opacity)?;
        self.polygons = polygons;
        Ok(())
    }

    pub fn add_plane(&mut self, plane: Plane) -> Result<(), ViewerError> {
        let mut planes = self.planes.clone();
        planes.push(plane);
        self.grid = self.build(&self.polygons, &planes, self.volume_opacity)?;
        self.planes = planes;
        Ok(())
    }

    pub fn update_plane(
        &mut self,
        id: PlaneId,
        change: impl FnOnce(&mut Plane),
    ) -> Result<(), ViewerError> {
        let mut planes = self.planes.clone();
        let plane = planes
            .iter_mut()
            .find(|p| p.id == id)
            .ok_or_else(|| ViewerError::InvalidArgument(format!("unknown plane {}", id.0)))?;
        change(plane);
        self.grid = self.build(&self.polygons, &planes, self.volume_opacity)?;
        self.planes = planes;
        Ok(())
    }

    pub fn set_volume_opacity(&mut self, opacity: f32) -> Result<(), ViewerError> {
        self.grid = self.build(&self.polygons, &self.planes, opacity)?;
        self.volume_opacity = opacity;
        Ok(())
    }

    /// Rebuild the grid from the current polygons and planes.
    pub fn recompute(&mut self) -> Result<(), ViewerError> {
        self.grid = self.build(&self.polygons, &self.planes, self.volume_opacity)?;
        Ok(())
    }

    fn build(
        &self,
        polygons: &[Polygon],
        planes: &[Plane],
        volume_opacity: f32,
    ) -> Result<LookupGrid, ViewerError> {
        let start = web_time::Instant::now();
        let dim = self.grid.dim();
        let coordinate = |index: usize| index as f32 / dim as f32;

        let mut slice = Array2::<f32>::zeros((dim, dim));
        Zip::indexed(&mut slice).par_for_each(|(y, x), value| {
            *value = polygon_opacity(polygons, coordinate(x), coordinate(y), volume_opacity);
        });

        let grid = LookupGrid::from_fn(dim, |x, y, z| {
            let position = Vec3::new(coordinate(x), coordinate(y), coordinate(z));
            planes
                .iter()
                .filter(|plane| plane.hides(position))
                .fold(slice[[y, x]], |opacity, plane| opacity * plane.opacity)
        })?;

        log::debug!(
            "Location grid rebuilt from {} polygons and {} planes in {:.2?}",
            polygons.len(),
            planes.len(),
            start.elapsed()
        );
        Ok(grid)
    }
}

/// The first containing polygon replaces the volume opacity, later ones multiply.
fn polygon_opacity(polygons: &[Polygon], x: f32, y: f32, volume_opacity: f32) -> f32 {
    let mut containing = polygons.iter().filter(|p| p.contains(x, y));
    match containing.next() {
        Some(first) => containing.fold(first.opacity, |opacity, p| opacity * p.opacity),
        None => volume_opacity,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn square(id: u32, min: f32, max: f32, opacity: f32) -> Polygon {
        Polygon {
            id: PolygonId(id),
            vertices: vec![
                Vec3::new(min, min, 0.5),
                Vec3::new(max, min, 0.5),
                Vec3::new(max, max, 0.5),
                Vec3::new(min, max, 0.5),
            ],
            opacity,
        }
    }

    #[test]
    fn test_square_containment() {
        let polygon = square(0, 0.25, 0.75, 1.0);
        assert!(polygon.contains(0.5, 0.5));
        assert!(!polygon.contains(0.0, 0.0));
        assert!(!polygon.contains(0.9, 0.5));
    }

    #[test]
    fn test_concave_polygon_even_odd() {
        // U shape opening upwards; the notch is outside.
        let polygon = Polygon {
            id: PolygonId(0),
            vertices: vec![
                Vec3::new(0.0, 0.0, 0.0),
                Vec3::new(1.0, 0.0, 0.0),
                Vec3::new(1.0, 1.0, 0.0),
                Vec3::new(0.6, 1.0, 0.0),
                Vec3::new(0.6, 0.4, 0.0),
                Vec3::new(0.4, 0.4, 0.0),
                Vec3::new(0.4, 1.0, 0.0),
                Vec3::new(0.0, 1.0, 0.0),
            ],
            opacity: 1.0,
        };
        assert!(polygon.contains(0.2, 0.8));
        assert!(!polygon.contains(0.5, 0.8));
        assert!(polygon.contains(0.5, 0.2));
    }

    #[test]
    fn test_degenerate_polygon_contains_nothing() {
        let polygon = Polygon {
            id: PolygonId(0),
            vertices: vec![Vec3::ZERO, Vec3::ONE],
            opacity: 0.0,
        };
        assert!(!polygon.contains(0.5, 0.5));
    }

    #[test]
    fn test_overlapping_polygons_multiply() {
        let polygons = [square(0, 0.0, 0.6, 0.5), square(1, 0.4, 1.0, 0.5)];
        assert_eq!(polygon_opacity(&polygons, 0.5, 0.5, 0.3), 0.25);
        assert_eq!(polygon_opacity(&polygons, 0.1, 0.1, 0.3), 0.5);
        assert_eq!(polygon_opacity(&polygons, 0.1, 0.9, 0.3), 0.3);
    }

    #[test]
    fn test_plane_sides() {
        let mut plane = Plane::new(PlaneId(0));
        plane.orientation = Axis::Z;
        plane.distance = 0.5;
        assert!(plane.hides(Vec3::new(0.9, 0.9, 0.2)));
        assert!(!plane.hides(Vec3::new(0.1, 0.1, 0.8)));
        plane.invert();
        assert!(!plane.hides(Vec3::new(0.9, 0.9, 0.2)));
        assert!(plane.hides(Vec3::new(0.1, 0.1, 0.8)));
    }

    #[test]
    fn test_polygon_slice_is_replicated_through_depth() {
        let mut layer = LocationLayer::new(16).unwrap();
        layer.set_volume_opacity(0.2).unwrap();
        for v in square(0, 0.25, 0.75, 1.0).vertices {
            layer.add_vertex(v);
        }
        layer.close_polygon(PolygonId(0), 0.8).unwrap();

        let grid = layer.grid();
        for z in 0..16 {
            assert_eq!(grid.get(8, 8, z), Some(0.8));
            assert_eq!(grid.get(0, 0, z), Some(0.2));
        }
    }

    #[test]
    fn test_plane_only_affects_hidden_layers() {
        let mut layer = LocationLayer::new(8).unwrap();
        let mut plane = Plane::new(PlaneId(0));
        plane.orientation = Axis::Z;
        plane.distance = 0.5;
        plane.opacity = 0.0;
        layer.add_plane(plane).unwrap();

        assert_eq!(layer.grid().get(3, 3, 0), Some(0.0));
        assert_eq!(layer.grid().get(3, 3, 4), Some(0.0));
        assert_eq!(layer.grid().get(3, 3, 5), Some(1.0));
    }

    #[test]
    fn test_close_without_drawing_is_invalid() {
        let mut layer = LocationLayer::new(4).unwrap();
        assert!(matches!(
            layer.close_polygon(PolygonId(0), 1.0),
            Err(ViewerError::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_degenerate_polygon_keeps_baseline() {
        let mut layer = LocationLayer::new(8).unwrap();
        layer.begin_polygon();
        layer.add_vertex(Vec3::new(0.1, 0.1, 0.0));
        layer.add_vertex(Vec3::new(0.9, 0.9, 0.0));
        layer.close_polygon(PolygonId(0), 0.0).unwrap();
        assert_eq!(layer.polygons().len(), 1);
        assert!(layer.grid().data().iter().all(|&v| v == 1.0));
    }
}
