use thiserror::Error;

use crate::pyramid::BackendError;
use crate::scan_loader::ScanLoaderError;

/// Errors surfaced by the viewer core to its host.
#[derive(Debug, Error)]
pub enum ViewerError {
    #[error("Unsupported format: {0}")]
    UnsupportedFormat(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Backend read error: {0}")]
    BackendRead(#[from] BackendError),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Out of memory: failed to allocate {bytes} bytes")]
    OutOfMemory { bytes: u64 },

    #[error("Scan error: {0}")]
    Scan(#[from] ScanLoaderError),

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("The active volume has no resolution pyramid to navigate")]
    NotNavigable,

    #[error("No volume loaded")]
    NoVolume,
}

/// Allocate `len` copies of `value`, reporting allocation failure instead of aborting.
pub(crate) fn try_alloc<T: Clone>(len: usize, value: T) -> Result<Vec<T>, ViewerError> {
    let mut data = Vec::new();
    data.try_reserve_exact(len)
        .map_err(|_| ViewerError::OutOfMemory {
            bytes: (len as u64).saturating_mul(std::mem::size_of::<T>() as u64),
        })?;
    data.resize(len, value);
    Ok(data)
}
