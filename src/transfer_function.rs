//! Transfer-function compositor.
//!
//! Holds the independent classification layers consumed by the ray caster:
//!  - colour proximity (3D grid over RGB)
//!  - location (3D grid over model space, polygons and slicing planes)
//!  - per-segment opacity (1D)
//!  - intensity and HSV thresholds (uniforms)
//!
//! Each layer is sampled separately by the shader, which multiplies them.
//! Every mutation either rebuilds its layer completely or leaves it as it was.

use glam::Vec3;

use crate::color_tf::{ColorEntryId, ColorProximityEntry, ColorProximityLayer};
use crate::config::TransferConfig;
use crate::enums::Axis;
use crate::error::ViewerError;
use crate::location_tf::{LocationLayer, Plane, PlaneId, PolygonId};
use crate::lookup_grid::LookupGrid;

pub const MAX_SEGMENTS: usize = 3;

/// Convert a `0..=100` UI slider value into `[0, 1]`.
pub fn ui_fraction(value: i32) -> f32 {
    value.clamp(0, 100) as f32 / 100.0
}

/// Monotonic id source for one kind of classification object.
#[derive(Clone, Copy, Debug, Default)]
pub struct IdAllocator {
    next: u32,
}

impl IdAllocator {
    /// Run `insert` with the next id. The id is consumed only if `insert` succeeds.
    pub fn insert_with<E>(&mut self, insert: impl FnOnce(u32) -> Result<(), E>) -> Result<u32, E> {
        let id = self.next;
        insert(id)?;
        self.next += 1;
        Ok(id)
    }
}

/// Scalar cutoffs passed straight to the shader.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Thresholds {
    pub intensity: f32,
    pub hue: f32,
    pub saturation: f32,
    pub value: f32,
}

impl Default for Thresholds {
    fn default() -> Self {
        Self {
            intensity: 1.0,
            hue: 1.0,
            saturation: 1.0,
            value: 1.0,
        }
    }
}

/// Layers whose textures must be re-uploaded.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct LayerChanges {
    pub color: bool,
    pub location: bool,
    pub segments: bool,
    pub uniforms: bool,
}

impl LayerChanges {
    pub fn any(&self) -> bool {
        self.color || self.location || self.segments || self.uniforms
    }
}

pub struct TransferFunctions {
    config: TransferConfig,
    color: ColorProximityLayer,
    location: LocationLayer,
    segments: [f32; MAX_SEGMENTS],
    thresholds: Thresholds,
    color_ids: IdAllocator,
    polygon_ids: IdAllocator,
    plane_ids: IdAllocator,
    changes: LayerChanges,
}

fn unit_interval(value: f32) -> Result<f32, ViewerError> {
    if !value.is_finite() {
        return Err(ViewerError::InvalidArgument(format!(
            "expected a finite value, got {value}"
        )));
    }
    Ok(value.clamp(0.0, 1.0))
}

impl TransferFunctions {
    pub fn new(config: TransferConfig) -> Result<Self, ViewerError> {
        Ok(Self {
            color: ColorProximityLayer::new()?,
            location: LocationLayer::new(config.location_grid_dim)?,
            segments: [1.0; MAX_SEGMENTS],
            thresholds: Thresholds::default(),
            color_ids: IdAllocator::default(),
            polygon_ids: IdAllocator::default(),
            plane_ids: IdAllocator::default(),
            changes: LayerChanges {
                color: true,
                location: true,
                segments: true,
                uniforms: true,
            },
            config,
        })
    }

    pub fn color_layer(&self) -> &ColorProximityLayer {
        &self.color
    }

    pub fn location_layer(&self) -> &LocationLayer {
        &self.location
    }

    pub fn color_grid(&self) -> &LookupGrid {
        self.color.grid()
    }

    pub fn location_grid(&self) -> &LookupGrid {
        self.location.grid()
    }

    pub fn segment_opacities(&self) -> &[f32; MAX_SEGMENTS] {
        &self.segments
    }

    pub fn thresholds(&self) -> Thresholds {
        self.thresholds
    }

    /// Layers changed since the last call.
    pub fn take_changes(&mut self) -> LayerChanges {
        std::mem::take(&mut self.changes)
    }

    /// Add a colour entry with the configured default radius and opacity.
    pub fn add_color_proximity(&mut self, rgb: [u8; 3]) -> Result<ColorEntryId, ViewerError> {
        self.add_color_entry(
            rgb,
            self.config.default_color_radius,
            self.config.default_color_opacity,
        )
    }

    pub fn add_color_entry(
        &mut self,
        rgb: [u8; 3],
        proximity_radius: f32,
        opacity_value: f32,
    ) -> Result<ColorEntryId, ViewerError> {
        let proximity_radius = radius(proximity_radius)?;
        let opacity_value = unit_interval(opacity_value)?;
        let color = &mut self.color;
        let id = ColorEntryId(self.color_ids.insert_with(|id| {
            color.push(ColorProximityEntry {
                id: ColorEntryId(id),
                rgb,
                proximity_radius,
                opacity: opacity_value,
            })
        })?);
        self.changes.color = true;
        log::info!(
            "Colour entry {} added for rgb({}, {}, {})",
            id.0,
            rgb[0],
            rgb[1],
            rgb[2]
        );
        Ok(id)
    }

    pub fn update_color_opacity(&mut self, id: ColorEntryId, value: f32) -> Result<(), ViewerError> {
        let value = unit_interval(value)?;
        self.color.update(id, |entry| entry.opacity = value)?;
        self.changes.color = true;
        Ok(())
    }

    pub fn update_color_radius(&mut self, id: ColorEntryId, value: f32) -> Result<(), ViewerError> {
        let value = radius(value)?;
        self.color.update(id, |entry| entry.proximity_radius = value)?;
        self.changes.color = true;
        Ok(())
    }

    pub fn begin_polygon(&mut self) {
        self.location.begin_polygon();
    }

    pub fn add_vertex(&mut self, x: f32, y: f32, z: f32) {
        self.location.add_vertex(Vec3::new(x, y, z));
    }

    /// Finish the polygon being drawn; returns its id.
    pub fn close_polygon(&mut self) -> Result<PolygonId, ViewerError> {
        if self.location.drawing().is_none() {
            return Err(ViewerError::InvalidArgument(
                "no polygon is being drawn".into(),
            ));
        }
        let (location, opacity) = (&mut self.location, self.config.default_polygon_opacity);
        let id = PolygonId(
            self.polygon_ids
                .insert_with(|id| location.close_polygon(PolygonId(id), opacity))?,
        );
        self.changes.location = true;
        Ok(id)
    }

    pub fn update_polygon_opacity(&mut self, id: PolygonId, value: f32) -> Result<(), ViewerError> {
        let value = unit_interval(value)?;
        self.location
            .update_polygon(id, |polygon| polygon.opacity = value)?;
        self.changes.location = true;
        Ok(())
    }

    pub fn add_slicing_plane(&mut self) -> Result<PlaneId, ViewerError> {
        let location = &mut self.location;
        let id = PlaneId(
            self.plane_ids
                .insert_with(|id| location.add_plane(Plane::new(PlaneId(id))))?,
        );
        self.changes.location = true;
        Ok(id)
    }

    pub fn update_plane_opacity(&mut self, id: PlaneId, value: f32) -> Result<(), ViewerError> {
        let value = unit_interval(value)?;
        self.location.update_plane(id, |plane| plane.opacity = value)?;
        self.changes.location = true;
        Ok(())
    }

    pub fn update_plane_orientation(&mut self, id: PlaneId, axis: Axis) -> Result<(), ViewerError> {
        self.location
            .update_plane(id, |plane| plane.orientation = axis)?;
        self.changes.location = true;
        Ok(())
    }

    pub fn update_plane_distance(&mut self, id: PlaneId, distance: f32) -> Result<(), ViewerError> {
        if !distance.is_finite() {
            return Err(ViewerError::InvalidArgument(format!(
                "plane distance must be finite, got {distance}"
            )));
        }
        self.location
            .update_plane(id, |plane| plane.distance = distance)?;
        self.changes.location = true;
        Ok(())
    }

    pub fn invert_plane(&mut self, id: PlaneId) -> Result<(), ViewerError> {
        self.location.update_plane(id, Plane::invert)?;
        self.changes.location = true;
        Ok(())
    }

    pub fn set_segment_opacity(&mut self, id: usize, value: f32) -> Result<(), ViewerError> {
        let value = unit_interval(value)?;
        let slot = self.segments.get_mut(id).ok_or_else(|| {
            ViewerError::InvalidArgument(format!(
                "segment {id} out of range, {MAX_SEGMENTS} segments supported"
            ))
        })?;
        *slot = value;
        self.changes.segments = true;
        Ok(())
    }

    /// Baseline opacity of everything outside the drawn polygons.
    pub fn set_volume_opacity(&mut self, value: f32) -> Result<(), ViewerError> {
        let value = unit_interval(value)?;
        self.location.set_volume_opacity(value)?;
        self.changes.location = true;
        Ok(())
    }

    pub fn volume_opacity(&self) -> f32 {
        self.location.volume_opacity()
    }

    pub fn set_intensity_threshold(&mut self, value: f32) -> Result<(), ViewerError> {
        self.thresholds.intensity = unit_interval(value)?;
        self.changes.uniforms = true;
        Ok(())
    }

    pub fn set_hsv_thresholds(&mut self, h: f32, s: f32, v: f32) -> Result<(), ViewerError> {
        let (hue, saturation, value) = (unit_interval(h)?, unit_interval(s)?, unit_interval(v)?);
        self.thresholds.hue = hue;
        self.thresholds.saturation = saturation;
        self.thresholds.value = value;
        self.changes.uniforms = true;
        Ok(())
    }
}

fn radius(value: f32) -> Result<f32, ViewerError> {
    if !value.is_finite() || value < 0.0 {
        return Err(ViewerError::InvalidArgument(format!(
            "proximity radius must be a non-negative number, got {value}"
        )));
    }
    Ok(value)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn small() -> TransferFunctions {
        TransferFunctions::new(TransferConfig {
            location_grid_dim: 16,
            ..TransferConfig::default()
        })
        .unwrap()
    }

    #[test]
    fn test_ids_are_allocated_per_kind() {
        let mut tf = small();
        assert_eq!(tf.add_color_proximity([1, 2, 3]).unwrap(), ColorEntryId(0));
        assert_eq!(tf.add_color_proximity([4, 5, 6]).unwrap(), ColorEntryId(1));
        assert_eq!(tf.add_slicing_plane().unwrap(), PlaneId(0));
        tf.add_vertex(0.1, 0.1, 0.0);
        tf.add_vertex(0.9, 0.1, 0.0);
        tf.add_vertex(0.5, 0.9, 0.0);
        assert_eq!(tf.close_polygon().unwrap(), PolygonId(0));
    }

    #[test]
    fn test_failed_insert_keeps_the_id() {
        let mut ids = IdAllocator::default();
        assert_eq!(ids.insert_with(|_| Ok::<_, ()>(())), Ok(0));
        assert_eq!(ids.insert_with(|_| Err(())), Err(()));
        let mut seen = None;
        let issued = ids.insert_with(|id| {
            seen = Some(id);
            Ok::<_, ()>(())
        });
        assert_eq!((issued, seen), (Ok(1), Some(1)));
    }

    #[test]
    fn test_rejected_close_does_not_consume_a_polygon_id() {
        let mut tf = small();
        assert!(tf.close_polygon().is_err());
        tf.add_vertex(0.1, 0.1, 0.0);
        tf.add_vertex(0.9, 0.1, 0.0);
        tf.add_vertex(0.5, 0.9, 0.0);
        assert_eq!(tf.close_polygon().unwrap(), PolygonId(0));
    }

    #[test]
    fn test_segment_out_of_range() {
        let mut tf = small();
        tf.set_segment_opacity(2, 0.4).unwrap();
        assert_eq!(tf.segment_opacities()[2], 0.4);
        assert!(matches!(
            tf.set_segment_opacity(MAX_SEGMENTS, 0.4),
            Err(ViewerError::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_changes_are_reported_once() {
        let mut tf = small();
        tf.take_changes();
        tf.set_segment_opacity(0, 0.5).unwrap();
        let changes = tf.take_changes();
        assert!(changes.segments);
        assert!(!changes.color && !changes.location);
        assert!(!tf.take_changes().any());
    }

    #[test]
    fn test_thresholds_pass_through() {
        let mut tf = small();
        tf.set_intensity_threshold(ui_fraction(40)).unwrap();
        tf.set_hsv_thresholds(0.1, 0.2, 0.3).unwrap();
        let thresholds = tf.thresholds();
        assert_eq!(thresholds.intensity, 0.4);
        assert_eq!(
            (thresholds.hue, thresholds.saturation, thresholds.value),
            (0.1, 0.2, 0.3)
        );
        assert!(tf.take_changes().uniforms);
    }

    #[test]
    fn test_opacity_is_clamped_and_nan_rejected() {
        let mut tf = small();
        tf.set_volume_opacity(3.0).unwrap();
        assert_eq!(tf.volume_opacity(), 1.0);
        assert!(matches!(
            tf.set_volume_opacity(f32::NAN),
            Err(ViewerError::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_negative_radius_rejected() {
        let mut tf = small();
        assert!(matches!(
            tf.add_color_entry([0, 0, 0], -1.0, 0.5),
            Err(ViewerError::InvalidArgument(_))
        ));
        assert!(tf.color_layer().entries().is_empty());
    }

    #[test]
    fn test_volume_opacity_sets_location_baseline() {
        let mut tf = small();
        tf.set_volume_opacity(0.3).unwrap();
        assert!(tf.location_grid().data().iter().all(|&v| v == 0.3));
    }

    #[test]
    fn test_ui_fraction() {
        assert_eq!(ui_fraction(0), 0.0);
        assert_eq!(ui_fraction(50), 0.5);
        assert_eq!(ui_fraction(250), 1.0);
        assert_eq!(ui_fraction(-5), 0.0);
    }
}
