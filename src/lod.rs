//! Level-of-detail selection and pan/zoom navigation over a pyramid.

use glam::Vec3;

use crate::config::{NavigationConfig, ViewerConfig};
use crate::enums::PanDirection;
use crate::error::ViewerError;
use crate::pyramid::{PyramidCatalog, PyramidLevelInfo};
use crate::region::{Region, RegionLoader, VolumeBuffer};

/// Normalised zoom window over the current level.
///
/// `scaling_factor` is the retained fraction of the level, `scaling_offset`
/// the position of the window. Both stay inside `[0, 1]` and
/// `scaling_offset + scaling_factor <= 1` on every axis.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct ViewportState {
    pub scaling_factor: Vec3,
    pub scaling_offset: Vec3,
}

impl Default for ViewportState {
    fn default() -> Self {
        Self::full()
    }
}

impl ViewportState {
    pub fn full() -> Self {
        Self {
            scaling_factor: Vec3::ONE,
            scaling_offset: Vec3::ZERO,
        }
    }

    pub fn is_full_extent(&self) -> bool {
        *self == Self::full()
    }

    /// Shrink the window on X/Y around its centre. Depth carries no
    /// navigable information and is left untouched.
    pub fn zoomed_in(&self, step: f32, min_scale: f32) -> Self {
        self.rescaled(|factor| (factor - step).max(min_scale))
    }

    pub fn zoomed_out(&self, step: f32) -> Self {
        self.rescaled(|factor| (factor + step).min(1.0))
    }

    fn rescaled(&self, scale: impl Fn(f32) -> f32) -> Self {
        let mut next = *self;
        for axis in 0..2 {
            let factor = scale(self.scaling_factor[axis]);
            let change = self.scaling_factor[axis] - factor;
            next.scaling_factor[axis] = factor;
            next.scaling_offset[axis] = self.scaling_offset[axis] + change / 2.0;
        }
        next.clamped()
    }

    pub fn panned(&self, direction: PanDirection, step_x: f32, step_y: f32) -> Self {
        let mut next = *self;
        match direction {
            PanDirection::Left => next.scaling_offset.x -= step_x,
            PanDirection::Right => next.scaling_offset.x += step_x,
            PanDirection::Up => next.scaling_offset.y -= step_y,
            PanDirection::Down => next.scaling_offset.y += step_y,
        }
        next.clamped()
    }

    fn clamped(mut self) -> Self {
        for axis in 0..3 {
            let factor = self.scaling_factor[axis].clamp(f32::MIN_POSITIVE, 1.0);
            self.scaling_factor[axis] = factor;
            self.scaling_offset[axis] = self.scaling_offset[axis].clamp(0.0, 1.0 - factor);
        }
        self
    }

    /// Pixel rectangle the window covers on `level`, at least one pixel wide.
    pub fn region_on(&self, level: &PyramidLevelInfo) -> Region {
        let (x, width) = span(
            self.scaling_offset.x,
            self.scaling_factor.x,
            level.width,
        );
        let (y, height) = span(
            self.scaling_offset.y,
            self.scaling_factor.y,
            level.height,
        );
        Region {
            level: level.index,
            x,
            y,
            width,
            height,
        }
    }
}

fn span(offset: f32, factor: f32, extent: u32) -> (u32, u32) {
    let size = ((factor * extent as f32).round() as u32).clamp(1, extent);
    let start = ((offset * extent as f32).floor() as u32).min(extent - size);
    (start, size)
}

/// Which buffer is currently published to the renderer.
#[derive(Debug)]
enum ActiveBuffer {
    /// The eagerly loaded lowest-resolution level at full extent.
    Baseline,
    /// A buffer read for the current level and window.
    Live(VolumeBuffer),
}

/// Owns the pyramid, the navigation state and the published volume buffer.
///
/// The baseline buffer is loaded once when the controller is created and kept
/// until it is dropped; every other view lives in a separate buffer that is
/// replaced, never patched, on each reload.
#[derive(Debug)]
pub struct LodController {
    catalog: PyramidCatalog,
    loader: RegionLoader,
    navigation: NavigationConfig,
    vram_headroom: f32,
    vram_budget: u64,
    current_level: usize,
    viewport: ViewportState,
    baseline: VolumeBuffer,
    active: ActiveBuffer,
}

impl LodController {
    /// Load the baseline level and start browsing it at full extent.
    pub fn open(mut catalog: PyramidCatalog, config: &ViewerConfig) -> Result<Self, ViewerError> {
        let loader = RegionLoader::new(config.synthetic_depth);
        let baseline_index = catalog.baseline_index();
        let full = Region::full(&catalog.levels()[baseline_index]);
        let baseline = loader.load_region(&mut catalog, full)?;

        log::info!(
            "Baseline level {} resident: {}x{}x{}",
            baseline_index,
            full.width,
            full.height,
            loader.depth()
        );

        Ok(Self {
            catalog,
            loader,
            navigation: config.navigation.clone(),
            vram_headroom: config.vram_headroom,
            vram_budget: config.vram_budget_bytes,
            current_level: baseline_index,
            viewport: ViewportState::full(),
            baseline,
            active: ActiveBuffer::Baseline,
        })
    }

    pub fn catalog(&self) -> &PyramidCatalog {
        &self.catalog
    }

    pub fn current_level(&self) -> usize {
        self.current_level
    }

    pub fn viewport(&self) -> ViewportState {
        self.viewport
    }

    pub fn vram_budget(&self) -> u64 {
        self.vram_budget
    }

    pub fn set_vram_budget(&mut self, bytes: u64) {
        self.vram_budget = bytes;
    }

    /// `(current level, index of the lowest-resolution level)`.
    pub fn initial_levels(&self) -> (usize, usize) {
        (self.current_level, self.catalog.baseline_index())
    }

    /// `(width, height, depth)` of the published buffer.
    pub fn current_size(&self) -> (u32, u32, u32) {
        self.current_buffer().size()
    }

    pub fn current_buffer(&self) -> &VolumeBuffer {
        match &self.active {
            ActiveBuffer::Baseline => &self.baseline,
            ActiveBuffer::Live(buffer) => buffer,
        }
    }

    pub fn baseline_buffer(&self) -> &VolumeBuffer {
        &self.baseline
    }

    pub fn is_showing_baseline(&self) -> bool {
        matches!(self.active, ActiveBuffer::Baseline)
    }

    /// Highest-resolution level whose replicated volume fits the budget.
    ///
    /// A level fits iff `size_bytes < budget * headroom / depth`. Falls back
    /// to the baseline level when none fits.
    pub fn best_fitting_level(&self, vram_budget_bytes: u64) -> usize {
        let threshold =
            vram_budget_bytes as f64 * self.vram_headroom as f64 / self.loader.depth() as f64;
        self.catalog
            .levels()
            .iter()
            .find(|level| (level.estimated_size_bytes as f64) < threshold)
            .map_or(self.catalog.baseline_index(), |level| level.index)
    }

    /// Switch to the best level for `vram_budget_bytes` at full extent.
    ///
    /// Returns the (possibly unchanged) current level. Staying on the same
    /// level performs no reload.
    pub fn select_best_level(&mut self, vram_budget_bytes: u64) -> Result<usize, ViewerError> {
        let level = self.best_fitting_level(vram_budget_bytes);
        if level != self.current_level {
            log::info!(
                "Switching from level {} to level {} (budget {} MB)",
                self.current_level,
                level,
                vram_budget_bytes / (1024 * 1024)
            );
            self.show(level, ViewportState::full())?;
        }
        Ok(self.current_level)
    }

    /// [`select_best_level`](Self::select_best_level) with the stored budget.
    pub fn load_best_level(&mut self) -> Result<usize, ViewerError> {
        self.select_best_level(self.vram_budget)
    }

    /// Return to the baseline level at full extent, releasing the live buffer.
    pub fn reset_view(&mut self) -> Result<bool, ViewerError> {
        self.navigate(self.catalog.baseline_index(), ViewportState::full())
    }

    pub fn zoom_in(&mut self) -> Result<bool, ViewerError> {
        let next = self
            .viewport
            .zoomed_in(self.navigation.zoom_step, self.navigation.min_scale);
        self.navigate(self.current_level, next)
    }

    pub fn zoom_out(&mut self) -> Result<bool, ViewerError> {
        let next = self.viewport.zoomed_out(self.navigation.zoom_step);
        self.navigate(self.current_level, next)
    }

    pub fn pan(&mut self, direction: PanDirection) -> Result<bool, ViewerError> {
        let next = self.viewport.panned(
            direction,
            self.navigation.pan_step_x,
            self.navigation.pan_step_y,
        );
        self.navigate(self.current_level, next)
    }

    /// Show `level` through `viewport` unless that is already displayed.
    /// Returns whether anything changed.
    fn navigate(&mut self, level: usize, viewport: ViewportState) -> Result<bool, ViewerError> {
        if level == self.current_level && viewport == self.viewport {
            return Ok(false);
        }
        self.show(level, viewport)?;
        Ok(true)
    }

    /// Publish the buffer for `level` and `viewport`. State is committed only
    /// once the new buffer exists; on error the previous view stays active.
    fn show(&mut self, level: usize, viewport: ViewportState) -> Result<(), ViewerError> {
        let info = *self.catalog.level(level).ok_or_else(|| {
            ViewerError::InvalidArgument(format!("level {level} does not exist"))
        })?;

        if level == self.catalog.baseline_index() && viewport.is_full_extent() {
            self.active = ActiveBuffer::Baseline;
        } else {
            let region = viewport.region_on(&info);
            let buffer = self.loader.load_region(&mut self.catalog, region)?;
            self.active = ActiveBuffer::Live(buffer);
        }

        self.current_level = level;
        self.viewport = viewport;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn level(width: u32, height: u32) -> PyramidLevelInfo {
        PyramidLevelInfo::new(0, width, height)
    }

    #[test]
    fn test_zoom_in_is_centre_anchored() {
        let next = ViewportState::full().zoomed_in(0.06, 0.01);
        assert!((next.scaling_factor.x - 0.94).abs() < 1e-6);
        assert!((next.scaling_offset.x - 0.03).abs() < 1e-6);
        assert!((next.scaling_offset.y - 0.03).abs() < 1e-6);
        assert_eq!(next.scaling_factor.z, 1.0);
        assert_eq!(next.scaling_offset.z, 0.0);
    }

    #[test]
    fn test_zoom_in_stops_at_min_scale() {
        let mut state = ViewportState::full();
        for _ in 0..100 {
            state = state.zoomed_in(0.06, 0.01);
        }
        assert_eq!(state.scaling_factor.x, 0.01);
        assert_eq!(state.zoomed_in(0.06, 0.01), state);
    }

    #[test]
    fn test_zoom_out_at_full_extent_is_unchanged() {
        let state = ViewportState::full();
        assert_eq!(state.zoomed_out(0.06), state);
    }

    #[test]
    fn test_pan_clamps_to_window() {
        let zoomed = ViewportState::full().zoomed_in(0.5, 0.01);
        let mut state = zoomed;
        for _ in 0..50 {
            state = state.panned(PanDirection::Right, 0.05, 0.05);
        }
        assert!((state.scaling_offset.x + state.scaling_factor.x - 1.0).abs() < 1e-6);
        for _ in 0..50 {
            state = state.panned(PanDirection::Up, 0.05, 0.05);
        }
        assert_eq!(state.scaling_offset.y, 0.0);
    }

    #[test]
    fn test_pan_at_full_extent_is_unchanged() {
        let state = ViewportState::full();
        assert_eq!(state.panned(PanDirection::Left, 0.05, 0.05), state);
        assert_eq!(state.panned(PanDirection::Down, 0.05, 0.05), state);
    }

    #[test]
    fn test_region_of_full_window_is_whole_level() {
        let region = ViewportState::full().region_on(&level(1000, 800));
        assert_eq!((region.x, region.y, region.width, region.height), (0, 0, 1000, 800));
    }

    #[test]
    fn test_region_of_window() {
        let state = ViewportState {
            scaling_factor: Vec3::new(0.5, 0.25, 1.0),
            scaling_offset: Vec3::new(0.25, 0.5, 0.0),
        };
        let region = state.region_on(&level(1000, 800));
        assert_eq!((region.x, region.y, region.width, region.height), (250, 400, 500, 200));
    }

    #[test]
    fn test_region_is_never_empty() {
        let state = ViewportState {
            scaling_factor: Vec3::new(0.01, 0.01, 1.0),
            scaling_offset: Vec3::new(0.99, 0.99, 0.0),
        };
        let region = state.region_on(&level(10, 10));
        assert_eq!((region.width, region.height), (1, 1));
        assert!(region.x + region.width <= 10);
        assert!(region.y + region.height <= 10);
    }
}
