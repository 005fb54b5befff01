//! # slide-volume
//!
//! Core of an interactive volume viewer for gigapixel whole-slide images and
//! volumetric scans.
//!
//! A slide is a multi-resolution image pyramid. The viewer keeps one level of
//! it resident, chosen so that the replicated pseudo-volume fits a VRAM
//! budget, and re-reads regions of the pyramid as the user pans and zooms.
//! Each 2D region is stacked into a fixed number of identical depth slices so
//! that the same ray caster serves slides and real 3D scans.
//!
//! Opacity is controlled by independent classification layers:
//!  - colour proximity: attenuate every colour close to a picked RGB value
//!  - location: polygons drawn over the volume and axis-aligned slicing planes
//!  - per-segment opacity
//!  - intensity and HSV thresholds
//!
//! Each layer is compiled into a dense lookup grid that the renderer uploads
//! as a texture; the shader multiplies them.
//!
//! DICOM series are loaded with the dicom-rs ecosystem and rendered as grey
//! volumes through the same pipeline.
//!
//! # Examples
//!
//! ## Opening a slide and zooming in
//!
//! ```no_run
//! # use slide_volume::{Viewer, ViewerConfig};
//! let mut viewer = Viewer::new(ViewerConfig::default()).expect("default config is valid");
//! viewer.load_volume("slide.tiff").expect("should have opened the slide");
//! viewer
//!     .select_best_level(2 * 1024 * 1024 * 1024)
//!     .expect("should have loaded the best level");
//! viewer.zoom_in().expect("should have zoomed in");
//! let id = viewer
//!     .transfer_functions_mut()
//!     .add_color_proximity([230, 230, 230])
//!     .expect("should have added a colour entry");
//! viewer
//!     .transfer_functions_mut()
//!     .update_color_opacity(id, 0.0)
//!     .expect("should have hidden the background colour");
//! ```

pub mod camera;
pub mod color_tf;
pub mod config;
pub mod enums;
pub mod error;
pub mod image_pyramid;
pub mod location_tf;
pub mod lod;
pub mod lookup_grid;
pub mod pyramid;
pub mod region;
pub mod renderer;
pub mod scan;
pub mod scan_loader;
pub mod tiff_pyramid;
pub mod transfer_function;
pub mod viewer;

pub use camera::{Camera, VolumeGeometry};
pub use config::ViewerConfig;
pub use enums::{Axis, PanDirection, RenderMode, SortBy};
pub use error::ViewerError;
pub use pyramid::{InMemoryPyramid, PyramidBackend, PyramidCatalog, PyramidLevelInfo};
pub use region::{Region, VolumeBuffer};
pub use renderer::{GpuContext, GpuVolumeRenderer, RenderError, RenderPipelines, RenderSettings};
pub use scan::ScanVolume;
pub use scan_loader::{ScanLoader, ScanLoaderError};
pub use tiff_pyramid::TiffPyramid;
pub use viewer::{PendingUploads, Viewer};
