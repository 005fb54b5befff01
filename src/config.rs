use std::{fs, path::Path};

use serde::Deserialize;

use crate::enums::RenderMode;
use crate::error::ViewerError;

/// Number of identical slices a 2D pyramid region is replicated into.
pub const SYNTHETIC_DEPTH: u32 = 32;

/// Share of the VRAM budget a volume texture may occupy.
pub const VRAM_HEADROOM: f32 = 0.75;

/// Default VRAM budget: 2 GiB.
pub const DEFAULT_VRAM_BUDGET: u64 = 2 * 1024 * 1024 * 1024;

#[derive(Clone, Debug, PartialEq, Deserialize)]
#[serde(default)]
pub struct NavigationConfig {
    /// Change of the scaling factor per zoom step.
    pub zoom_step: f32,
    /// Smallest scaling factor zooming in may reach.
    pub min_scale: f32,
    pub pan_step_x: f32,
    pub pan_step_y: f32,
}

impl Default for NavigationConfig {
    fn default() -> Self {
        Self {
            zoom_step: 0.06,
            min_scale: 0.01,
            pan_step_x: 0.05,
            pan_step_y: 0.05,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Deserialize)]
#[serde(default)]
pub struct TransferConfig {
    /// Edge length of the cubic location lookup grid.
    pub location_grid_dim: usize,
    pub default_color_radius: f32,
    pub default_color_opacity: f32,
    pub default_polygon_opacity: f32,
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            location_grid_dim: 256,
            default_color_radius: 1.0,
            default_color_opacity: 1.0,
            default_polygon_opacity: 0.0,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Deserialize)]
#[serde(default)]
pub struct PyramidConfig {
    /// Downsampling stops once the longer edge of a level is at most this many pixels.
    pub min_level_edge: u32,
}

impl Default for PyramidConfig {
    fn default() -> Self {
        Self {
            min_level_edge: 512,
        }
    }
}

/// Top-level viewer configuration. Every field has a default, so a RON file
/// only needs to name the values it overrides.
#[derive(Clone, Debug, PartialEq, Deserialize)]
#[serde(default)]
pub struct ViewerConfig {
    pub synthetic_depth: u32,
    pub vram_budget_bytes: u64,
    pub vram_headroom: f32,
    pub render_mode: RenderMode,
    pub navigation: NavigationConfig,
    pub transfer: TransferConfig,
    pub pyramid: PyramidConfig,
}

impl Default for ViewerConfig {
    fn default() -> Self {
        Self {
            synthetic_depth: SYNTHETIC_DEPTH,
            vram_budget_bytes: DEFAULT_VRAM_BUDGET,
            vram_headroom: VRAM_HEADROOM,
            render_mode: RenderMode::default(),
            navigation: NavigationConfig::default(),
            transfer: TransferConfig::default(),
            pyramid: PyramidConfig::default(),
        }
    }
}

impl ViewerConfig {
    /// Parse a configuration from a RON string and validate it.
    pub fn from_ron_str(ron_str: &str) -> Result<Self, ViewerError> {
        let options = ron::Options::default();
        let config: ViewerConfig = options
            .from_str(ron_str)
            .map_err(|e| ViewerError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, ViewerError> {
        let ron_str = fs::read_to_string(path.as_ref())?;
        Self::from_ron_str(&ron_str)
    }

    pub fn validate(&self) -> Result<(), ViewerError> {
        if self.synthetic_depth == 0 {
            return Err(ViewerError::Config("synthetic_depth must be > 0".into()));
        }
        if !(self.vram_headroom > 0.0 && self.vram_headroom <= 1.0) {
            return Err(ViewerError::Config(
                "vram_headroom must be in (0, 1]".into(),
            ));
        }
        let nav = &self.navigation;
        if !(nav.min_scale > 0.0 && nav.min_scale <= 1.0) {
            return Err(ViewerError::Config("min_scale must be in (0, 1]".into()));
        }
        if !(nav.zoom_step > 0.0 && nav.pan_step_x > 0.0 && nav.pan_step_y > 0.0) {
            return Err(ViewerError::Config(
                "zoom and pan steps must be positive".into(),
            ));
        }
        if self.transfer.location_grid_dim == 0 {
            return Err(ViewerError::Config(
                "location_grid_dim must be > 0".into(),
            ));
        }
        if self.pyramid.min_level_edge == 0 {
            return Err(ViewerError::Config("min_level_edge must be > 0".into()));
        }
        Ok(())
    }
}
