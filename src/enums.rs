use serde::Deserialize;

/// Volume axis, used both for scan slicing and for slicing plane orientation.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Axis {
    #[default]
    X,
    Y,
    Z,
}

impl Axis {
    /// Component index of the axis in an `(x, y, z)` vector.
    pub fn index(self) -> usize {
        match self {
            Axis::X => 0,
            Axis::Y => 1,
            Axis::Z => 2,
        }
    }
}

impl TryFrom<u32> for Axis {
    type Error = u32;

    fn try_from(value: u32) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Axis::X),
            1 => Ok(Axis::Y),
            2 => Ok(Axis::Z),
            other => Err(other),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PanDirection {
    Up,
    Down,
    Left,
    Right,
}

/// Ray marching mode. Each mode maps to one shader pipeline at the renderer.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Deserialize)]
pub enum RenderMode {
    #[default]
    AlphaBlending,
    Isosurface,
    MaximumIntensity,
}

impl RenderMode {
    pub const ALL: [RenderMode; 3] = [
        RenderMode::AlphaBlending,
        RenderMode::Isosurface,
        RenderMode::MaximumIntensity,
    ];

    pub fn label(self) -> &'static str {
        match self {
            RenderMode::AlphaBlending => "Alpha blending",
            RenderMode::Isosurface => "Isosurface",
            RenderMode::MaximumIntensity => "MIP",
        }
    }
}

/// Slice ordering applied when stacking a DICOM series.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum SortBy {
    #[default]
    ImagePositionPatient,
    TablePosition,
    InstanceNumber,
    None,
}
