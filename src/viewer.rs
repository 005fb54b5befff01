//! Command interface between the GUI layer and the viewer core.
//!
//! Every command runs to completion on the caller's thread, then records what
//! the renderer has to upload. [`Viewer::take_pending`] hands those flags to
//! the renderer on the next frame.

use std::path::Path;

use glam::Vec3;

use crate::camera::{Camera, VolumeGeometry};
use crate::config::ViewerConfig;
use crate::enums::{PanDirection, RenderMode, SortBy};
use crate::error::ViewerError;
use crate::location_tf::PolygonId;
use crate::lod::LodController;
use crate::pyramid::{PyramidBackend, PyramidCatalog};
use crate::region::VolumeBuffer;
use crate::renderer::RenderSettings;
use crate::scan::ScanVolume;
use crate::scan_loader::ScanLoader;
use crate::transfer_function::TransferFunctions;

const PYRAMID_EXTENSIONS: [&str; 6] = ["tif", "tiff", "svs", "png", "jpg", "jpeg"];

/// The volume currently on display.
#[derive(Debug)]
pub enum VolumeSource {
    Pyramid(LodController),
    Scan {
        scan: ScanVolume,
        buffer: VolumeBuffer,
    },
}

impl VolumeSource {
    pub fn buffer(&self) -> &VolumeBuffer {
        match self {
            VolumeSource::Pyramid(lod) => lod.current_buffer(),
            VolumeSource::Scan { buffer, .. } => buffer,
        }
    }
}

/// GPU work requested since the renderer last synced.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PendingUploads {
    pub volume: bool,
    pub color_lut: bool,
    pub location_lut: bool,
    pub segment_opacity: bool,
    pub uniforms: bool,
    pub redraw: bool,
}

impl PendingUploads {
    pub fn any(&self) -> bool {
        self.volume
            || self.color_lut
            || self.location_lut
            || self.segment_opacity
            || self.uniforms
            || self.redraw
    }

    fn merge(&mut self, other: PendingUploads) {
        self.volume |= other.volume;
        self.color_lut |= other.color_lut;
        self.location_lut |= other.location_lut;
        self.segment_opacity |= other.segment_opacity;
        self.uniforms |= other.uniforms;
        self.redraw |= other.redraw;
    }
}

pub struct Viewer {
    config: ViewerConfig,
    source: Option<VolumeSource>,
    transfer: TransferFunctions,
    settings: RenderSettings,
    pending: PendingUploads,
}

impl Viewer {
    pub fn new(config: ViewerConfig) -> Result<Self, ViewerError> {
        config.validate()?;
        let transfer = TransferFunctions::new(config.transfer.clone())?;
        let settings = RenderSettings {
            render_mode: config.render_mode,
            ..Default::default()
        };
        Ok(Self {
            config,
            source: None,
            transfer,
            settings,
            pending: PendingUploads {
                uniforms: true,
                redraw: true,
                ..Default::default()
            },
        })
    }

    pub fn config(&self) -> &ViewerConfig {
        &self.config
    }

    /// Open a pyramid image, a DICOM directory or a single DICOM file's series.
    ///
    /// # Errors
    ///
    /// `UnsupportedFormat` for unknown extensions, plus whatever the selected
    /// loader reports. The previous volume stays active on any error.
    pub fn load_volume(&mut self, path: impl AsRef<Path>) -> Result<(), ViewerError> {
        let path = path.as_ref();
        if path.is_dir() {
            let scan = ScanLoader::load_from_directory(path, SortBy::default())?;
            return self.load_scan(scan);
        }

        let extension = path
            .extension()
            .and_then(|ext| ext.to_str())
            .map(str::to_ascii_lowercase)
            .unwrap_or_default();
        if extension == "dcm" {
            let series = path.parent().unwrap_or_else(|| Path::new("."));
            let scan = ScanLoader::load_from_directory(series, SortBy::default())?;
            return self.load_scan(scan);
        }
        if PYRAMID_EXTENSIONS.contains(&extension.as_str()) {
            let catalog = PyramidCatalog::open(path, self.config.pyramid.min_level_edge)?;
            return self.load_catalog(catalog);
        }
        Err(ViewerError::UnsupportedFormat(format!(
            "{} has no supported extension",
            path.display()
        )))
    }

    /// Open a pyramid through a host-provided backend.
    pub fn load_pyramid(&mut self, backend: Box<dyn PyramidBackend>) -> Result<(), ViewerError> {
        let catalog = PyramidCatalog::from_backend(backend)?;
        self.load_catalog(catalog)
    }

    pub fn load_scan(&mut self, scan: ScanVolume) -> Result<(), ViewerError> {
        let buffer = scan.to_volume_buffer()?;
        log::info!(
            "Scan loaded: {:?} voxels, intensity range {:?}",
            scan.dim(),
            scan.intensity_range()
        );
        self.replace_source(VolumeSource::Scan { scan, buffer });
        Ok(())
    }

    fn load_catalog(&mut self, catalog: PyramidCatalog) -> Result<(), ViewerError> {
        let lod = LodController::open(catalog, &self.config)?;
        self.replace_source(VolumeSource::Pyramid(lod));
        Ok(())
    }

    fn replace_source(&mut self, source: VolumeSource) {
        self.source = Some(source);
        self.settings.threshold = 0.0;
        self.pending.volume = true;
        self.pending.uniforms = true;
        self.pending.redraw = true;
    }

    pub fn source(&self) -> Option<&VolumeSource> {
        self.source.as_ref()
    }

    pub fn has_volume(&self) -> bool {
        self.source.is_some()
    }

    fn source_ref(&self) -> Result<&VolumeSource, ViewerError> {
        self.source.as_ref().ok_or(ViewerError::NoVolume)
    }

    fn lod_mut(&mut self) -> Result<&mut LodController, ViewerError> {
        match self.source.as_mut() {
            Some(VolumeSource::Pyramid(lod)) => Ok(lod),
            Some(VolumeSource::Scan { .. }) => Err(ViewerError::NotNavigable),
            None => Err(ViewerError::NoVolume),
        }
    }

    fn volume_changed(&mut self, changed: bool) {
        if changed {
            self.pending.volume = true;
            self.pending.uniforms = true;
            self.pending.redraw = true;
        }
    }

    // Navigation

    pub fn zoom_in(&mut self) -> Result<bool, ViewerError> {
        let changed = self.lod_mut()?.zoom_in()?;
        self.volume_changed(changed);
        Ok(changed)
    }

    pub fn zoom_out(&mut self) -> Result<bool, ViewerError> {
        let changed = self.lod_mut()?.zoom_out()?;
        self.volume_changed(changed);
        Ok(changed)
    }

    pub fn pan(&mut self, direction: PanDirection) -> Result<bool, ViewerError> {
        let changed = self.lod_mut()?.pan(direction)?;
        self.volume_changed(changed);
        Ok(changed)
    }

    pub fn reset_view(&mut self) -> Result<bool, ViewerError> {
        let changed = self.lod_mut()?.reset_view()?;
        self.volume_changed(changed);
        Ok(changed)
    }

    pub fn select_best_level(&mut self, vram_budget_bytes: u64) -> Result<usize, ViewerError> {
        let lod = self.lod_mut()?;
        let before = (lod.current_level(), lod.viewport());
        let level = lod.select_best_level(vram_budget_bytes)?;
        let changed = before != (lod.current_level(), lod.viewport());
        self.volume_changed(changed);
        Ok(level)
    }

    /// Best level for the stored budget.
    pub fn load_best_resolution(&mut self) -> Result<usize, ViewerError> {
        let budget = self.config.vram_budget_bytes;
        self.select_best_level(budget)
    }

    /// Store the budget used by [`load_best_resolution`](Self::load_best_resolution).
    pub fn set_vram_budget(&mut self, bytes: u64) {
        self.config.vram_budget_bytes = bytes;
        if let Some(VolumeSource::Pyramid(lod)) = self.source.as_mut() {
            lod.set_vram_budget(bytes);
        }
    }

    // Queries

    pub fn volume_buffer(&self) -> Option<&VolumeBuffer> {
        self.source.as_ref().map(VolumeSource::buffer)
    }

    /// `(width, height, depth)` of the displayed buffer.
    pub fn current_size(&self) -> Result<(u32, u32, u32), ViewerError> {
        Ok(self.source_ref()?.buffer().size())
    }

    /// `(current level, lowest-resolution level)`; a scan has a single level.
    pub fn initial_levels(&self) -> Result<(usize, usize), ViewerError> {
        match self.source_ref()? {
            VolumeSource::Pyramid(lod) => Ok(lod.initial_levels()),
            VolumeSource::Scan { .. } => Ok((0, 0)),
        }
    }

    pub fn intensity_range(&self) -> Result<(u16, u16), ViewerError> {
        match self.source_ref()? {
            VolumeSource::Pyramid(_) => Ok((0, u8::MAX as u16)),
            VolumeSource::Scan { scan, .. } => Ok(scan.intensity_range()),
        }
    }

    pub fn geometry(&self) -> Option<VolumeGeometry> {
        match self.source.as_ref()? {
            VolumeSource::Pyramid(lod) => Some(VolumeGeometry::pyramid(lod.current_size())),
            VolumeSource::Scan { scan, .. } => {
                let (depth, height, width) = scan.dim();
                let (sx, sy, sz) = scan.spacing();
                Some(VolumeGeometry::new(
                    Vec3::new(width as f32, height as f32, depth as f32),
                    Vec3::new(sx, sy, sz),
                    Vec3::ZERO,
                ))
            }
        }
    }

    // Rendering parameters

    pub fn settings(&self) -> &RenderSettings {
        &self.settings
    }

    pub fn set_render_mode(&mut self, mode: RenderMode) {
        self.settings.render_mode = mode;
        self.mark_uniforms();
    }

    pub fn set_step_length(&mut self, step_length: f32) -> Result<(), ViewerError> {
        if !(step_length.is_finite() && step_length > 0.0) {
            return Err(ViewerError::InvalidArgument(format!(
                "step length must be positive, got {step_length}"
            )));
        }
        self.settings.step_length = step_length;
        self.mark_uniforms();
        Ok(())
    }

    /// Isosurface threshold in raw intensity units.
    pub fn set_isosurface_threshold(&mut self, threshold: f32) -> Result<(), ViewerError> {
        if !threshold.is_finite() {
            return Err(ViewerError::InvalidArgument(format!(
                "threshold must be finite, got {threshold}"
            )));
        }
        let (lo, hi) = self.intensity_range()?;
        let span = f32::from(hi) - f32::from(lo);
        self.settings.threshold = if span > 0.0 { threshold / span } else { 0.0 };
        self.mark_uniforms();
        Ok(())
    }

    pub fn set_background(&mut self, colour: Vec3) {
        self.settings.background = colour;
        self.mark_uniforms();
    }

    pub fn set_lighting(&mut self, enabled: bool) {
        self.settings.lighting_enabled = enabled;
        self.mark_uniforms();
    }

    pub fn set_light_position(&mut self, position: Vec3) {
        self.settings.light_position = position;
        self.mark_uniforms();
    }

    fn mark_uniforms(&mut self) {
        self.pending.uniforms = true;
        self.pending.redraw = true;
    }

    // Classification

    pub fn transfer_functions(&self) -> &TransferFunctions {
        &self.transfer
    }

    /// Classification commands; changes are picked up by the next
    /// [`take_pending`](Self::take_pending).
    pub fn transfer_functions_mut(&mut self) -> &mut TransferFunctions {
        &mut self.transfer
    }

    /// Add the polygon vertex under a viewport pixel.
    ///
    /// `depth` is the depth-buffer value at that pixel. Returns the vertex in
    /// normalised model space.
    pub fn add_vertex_at(
        &mut self,
        camera: &Camera,
        screen_x: f32,
        screen_y: f32,
        depth: f32,
    ) -> Result<Vec3, ViewerError> {
        let geometry = self.geometry().ok_or(ViewerError::NoVolume)?;
        let vertex = camera
            .unproject(screen_x, screen_y, depth, geometry.model_matrix(false))
            .ok_or_else(|| ViewerError::InvalidArgument("view transform is singular".into()))?;
        self.transfer.add_vertex(vertex.x, vertex.y, vertex.z);
        Ok(vertex)
    }

    /// Add the final vertex under a viewport pixel and close the polygon.
    pub fn close_polygon_at(
        &mut self,
        camera: &Camera,
        screen_x: f32,
        screen_y: f32,
        depth: f32,
    ) -> Result<PolygonId, ViewerError> {
        self.add_vertex_at(camera, screen_x, screen_y, depth)?;
        self.transfer.close_polygon()
    }

    // Renderer hand-off

    /// Collect and clear everything the renderer has to upload.
    pub fn take_pending(&mut self) -> PendingUploads {
        let changes = self.transfer.take_changes();
        let mut pending = std::mem::take(&mut self.pending);
        pending.color_lut |= changes.color;
        pending.location_lut |= changes.location;
        pending.segment_opacity |= changes.segments;
        pending.uniforms |= changes.uniforms;
        pending.redraw |= pending.any();
        pending
    }

    /// Hand back uploads that could not be performed.
    pub fn requeue(&mut self, pending: PendingUploads) {
        self.pending.merge(pending);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pyramid::{InMemoryPyramid, pack_rgba};
    use ndarray::Array3;

    fn small_config() -> ViewerConfig {
        let mut config = ViewerConfig::default();
        config.synthetic_depth = 4;
        config.transfer.location_grid_dim = 8;
        config
    }

    fn pyramid() -> Box<InMemoryPyramid> {
        let pyramid = InMemoryPyramid::new()
            .with_level_fn(64, 32, |x, y| pack_rgba([x as u8, y as u8, 0, 255]))
            .unwrap()
            .with_level_fn(16, 8, |x, y| pack_rgba([x as u8, y as u8, 1, 255]))
            .unwrap();
        Box::new(pyramid)
    }

    fn scan() -> ScanVolume {
        let data = Array3::from_shape_fn((3, 4, 5), |(z, y, x)| (z * 20 + y * 5 + x) as u16);
        ScanVolume::new(data, (1.0, 1.0, 2.0))
    }

    #[test]
    fn test_commands_without_volume() {
        let mut viewer = Viewer::new(small_config()).unwrap();
        assert!(matches!(viewer.zoom_in(), Err(ViewerError::NoVolume)));
        assert!(matches!(viewer.current_size(), Err(ViewerError::NoVolume)));
        assert!(viewer.geometry().is_none());
    }

    #[test]
    fn test_unknown_extension_is_unsupported() {
        let mut viewer = Viewer::new(small_config()).unwrap();
        let err = viewer.load_volume("slide.xyz").unwrap_err();
        assert!(matches!(err, ViewerError::UnsupportedFormat(_)));
        assert!(!viewer.has_volume());
    }

    #[test]
    fn test_svs_file_opens_its_stored_levels() {
        use tiff::encoder::{TiffEncoder, colortype};

        let path = std::env::temp_dir().join("slide_volume_viewer_test.svs");
        {
            let file = std::fs::File::create(&path).unwrap();
            let mut encoder = TiffEncoder::new(std::io::BufWriter::new(file)).unwrap();
            for (width, height) in [(64u32, 32u32), (32, 16)] {
                let data = vec![200u8; (width * height * 3) as usize];
                encoder
                    .write_image::<colortype::RGB8>(width, height, &data)
                    .unwrap();
            }
        }

        let mut viewer = Viewer::new(small_config()).unwrap();
        viewer.load_volume(&path).unwrap();
        assert_eq!(viewer.initial_levels().unwrap(), (1, 1));
        assert_eq!(viewer.current_size().unwrap(), (32, 16, 4));

        viewer.select_best_level(u64::MAX).unwrap();
        assert_eq!(viewer.current_size().unwrap(), (64, 32, 4));
        let texel = viewer.volume_buffer().unwrap().data()[[0, 5, 5]];
        assert_eq!(texel, pack_rgba([200, 200, 200, 255]));

        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn test_pyramid_opens_at_baseline() {
        let mut viewer = Viewer::new(small_config()).unwrap();
        viewer.load_pyramid(pyramid()).unwrap();
        assert_eq!(viewer.initial_levels().unwrap(), (1, 1));
        assert_eq!(viewer.current_size().unwrap(), (16, 8, 4));
        assert_eq!(viewer.intensity_range().unwrap(), (0, 255));

        let pending = viewer.take_pending();
        assert!(pending.volume && pending.color_lut && pending.location_lut && pending.redraw);
        assert!(!viewer.take_pending().any());
    }

    #[test]
    fn test_navigation_marks_volume_pending() {
        let mut viewer = Viewer::new(small_config()).unwrap();
        viewer.load_pyramid(pyramid()).unwrap();
        viewer.take_pending();

        assert!(viewer.zoom_in().unwrap());
        assert!(viewer.take_pending().volume);
        assert!(viewer.zoom_out().unwrap());
        assert!(viewer.take_pending().volume);

        assert!(!viewer.zoom_out().unwrap());
        assert!(!viewer.take_pending().volume);
    }

    #[test]
    fn test_scan_is_not_navigable() {
        let mut viewer = Viewer::new(small_config()).unwrap();
        viewer.load_scan(scan()).unwrap();
        assert!(matches!(viewer.zoom_in(), Err(ViewerError::NotNavigable)));
        assert!(matches!(
            viewer.pan(PanDirection::Left),
            Err(ViewerError::NotNavigable)
        ));
        assert_eq!(viewer.current_size().unwrap(), (5, 4, 3));
        assert_eq!(viewer.intensity_range().unwrap(), (0, 59));
        assert_eq!(viewer.initial_levels().unwrap(), (0, 0));
    }

    #[test]
    fn test_failed_load_keeps_previous_volume() {
        let mut viewer = Viewer::new(small_config()).unwrap();
        viewer.load_scan(scan()).unwrap();
        let err = viewer
            .load_pyramid(Box::new(InMemoryPyramid::new()))
            .unwrap_err();
        assert!(matches!(err, ViewerError::UnsupportedFormat(_)));
        assert!(matches!(viewer.source(), Some(VolumeSource::Scan { .. })));
    }

    #[test]
    fn test_isosurface_threshold_is_normalised_by_range() {
        let mut viewer = Viewer::new(small_config()).unwrap();
        viewer.load_pyramid(pyramid()).unwrap();
        viewer.set_isosurface_threshold(51.0).unwrap();
        assert_eq!(viewer.settings().threshold, 0.2);
    }

    #[test]
    fn test_requeue_restores_flags() {
        let mut viewer = Viewer::new(small_config()).unwrap();
        let pending = viewer.take_pending();
        assert!(pending.any());
        viewer.requeue(pending);
        assert_eq!(viewer.take_pending(), pending);
    }

    #[test]
    fn test_vram_budget_applies_to_next_pyramid() {
        let mut viewer = Viewer::new(small_config()).unwrap();
        viewer.set_vram_budget(64 * 32 * 4 * 4 * 2);
        viewer.load_pyramid(pyramid()).unwrap();
        assert_eq!(viewer.load_best_resolution().unwrap(), 0);
        assert_eq!(viewer.current_size().unwrap(), (64, 32, 4));
    }
}
