//! Colour-space proximity classification.

use crate::error::ViewerError;
use crate::lookup_grid::LookupGrid;

/// Edge length of the RGB lookup grid, one cell per 8-bit channel value.
pub const COLOR_GRID_DIM: usize = 256;

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ColorEntryId(pub u32);

/// Attenuates every colour within `proximity_radius` of `rgb`.
#[derive(Clone, Debug, PartialEq)]
pub struct ColorProximityEntry {
    pub id: ColorEntryId,
    pub rgb: [u8; 3],
    /// Euclidean distance in 8-bit RGB units.
    pub proximity_radius: f32,
    pub opacity: f32,
}

impl ColorProximityEntry {
    fn covers(&self, r: usize, g: usize, b: usize) -> bool {
        let dr = r as f32 - self.rgb[0] as f32;
        let dg = g as f32 - self.rgb[1] as f32;
        let db = b as f32 - self.rgb[2] as f32;
        dr * dr + dg * dg + db * db <= self.proximity_radius * self.proximity_radius
    }
}

/// Ordered colour entries and the grid derived from them.
///
/// The grid is indexed `[[b, g, r]]` so that the texture x axis is red.
#[derive(Clone, Debug)]
pub struct ColorProximityLayer {
    entries: Vec<ColorProximityEntry>,
    grid: LookupGrid,
}

impl ColorProximityLayer {
    pub fn new() -> Result<Self, ViewerError> {
        Ok(Self {
            entries: Vec::new(),
            grid: LookupGrid::filled(COLOR_GRID_DIM, 1.0)?,
        })
    }

    pub fn entries(&self) -> &[ColorProximityEntry] {
        &self.entries
    }

    pub fn entry(&self, id: ColorEntryId) -> Option<&ColorProximityEntry> {
        self.entries.iter().find(|e| e.id == id)
    }

    pub fn grid(&self) -> &LookupGrid {
        &self.grid
    }

    /// Opacity multiplier for an exact colour.
    pub fn opacity_at(&self, rgb: [u8; 3]) -> f32 {
        self.grid.data()[[rgb[2] as usize, rgb[1] as usize, rgb[0] as usize]]
    }

    pub fn push(&mut self, entry: ColorProximityEntry) -> Result<(), ViewerError> {
        let mut entries = self.entries.clone();
        entries.push(entry);
        self.replace(entries)
    }

    pub fn update(
        &mut self,
        id: ColorEntryId,
        change: impl FnOnce(&mut ColorProximityEntry),
    ) -> Result<(), ViewerError> {
        let mut entries = self.entries.clone();
        let entry = entries
            .iter_mut()
            .find(|e| e.id == id)
            .ok_or_else(|| ViewerError::InvalidArgument(format!("unknown colour entry {}", id.0)))?;
        change(entry);
        self.replace(entries)
    }

    /// Rebuild the grid from the current entries.
    pub fn recompute(&mut self) -> Result<(), ViewerError> {
        self.grid = Self::build(&self.entries)?;
        Ok(())
    }

    fn replace(&mut self, entries: Vec<ColorProximityEntry>) -> Result<(), ViewerError> {
        let grid = Self::build(&entries)?;
        self.entries = entries;
        self.grid = grid;
        Ok(())
    }

    fn build(entries: &[ColorProximityEntry]) -> Result<LookupGrid, ViewerError> {
        let start = web_time::Instant::now();
        let grid = LookupGrid::from_fn(COLOR_GRID_DIM, |r, g, b| {
            entries
                .iter()
                .filter(|entry| entry.covers(r, g, b))
                .fold(1.0, |opacity, entry| opacity * entry.opacity)
        })?;
        log::debug!(
            "Colour proximity grid rebuilt from {} entries in {:.2?}",
            entries.len(),
            start.elapsed()
        );
        Ok(grid)
    }
}
