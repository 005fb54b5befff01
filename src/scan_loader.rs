use crate::{enums::SortBy, scan::ScanVolume};

use dicom::{
    core::Tag,
    object::{FileDicomObject, InMemDicomObject, open_file},
    pixeldata::{ConvertOptions, PixelDecoder, VoiLutOption},
};
use dicom_dictionary_std::tags;
use ndarray::{Array2, Array3, s};
use std::{
    cmp::Ordering,
    fs::{self, File},
    io::Read,
    path::{Path, PathBuf},
};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ScanLoaderError {
    #[error("No valid DICOM images found")]
    NoValidImages,

    #[error("Inconsistent image dimensions: expected {expected:?}, found {found:?}")]
    InconsistentDimensions {
        expected: (usize, usize),
        found: (usize, usize),
    },

    #[error("Missing spacing information")]
    MissingSpacing,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("DICOM error: {0}")]
    Dicom(#[from] dicom::object::ReadError),
}

type DicomFile = FileDicomObject<InMemDicomObject>;

/// Offset of the `DICM` magic after the 128 byte file preamble.
const MAGIC_OFFSET: usize = 128;

/// A decoded image plane with the values used to order and space it.
#[derive(Debug)]
struct ScanSlice {
    key: Option<f32>,
    position: Option<[f32; 3]>,
    pixels: Array2<u16>,
}

impl ScanSlice {
    fn decode(object: &DicomFile, sort_by: SortBy) -> Option<Self> {
        let key = match sort_by {
            SortBy::ImagePositionPatient => Some(float_at(object, tags::IMAGE_POSITION_PATIENT, 2)?),
            SortBy::TablePosition => float_at(object, tags::TABLE_POSITION, 0),
            SortBy::InstanceNumber => object
                .element(tags::INSTANCE_NUMBER)
                .ok()
                .and_then(|e| e.to_int::<i32>().ok())
                .map(|n| n as f32),
            SortBy::None => None,
        };

        let options = ConvertOptions::new().with_voi_lut(VoiLutOption::First);
        let pixels = object
            .decode_pixel_data()
            .ok()?
            .to_ndarray_with_options::<u16>(&options)
            .ok()?
            .slice_move(s![0, .., .., 0]);

        Some(Self {
            key,
            position: position(object),
            pixels,
        })
    }
}

fn float_at(object: &DicomFile, tag: Tag, index: usize) -> Option<f32> {
    let values = object.element(tag).ok()?.to_multi_float32().ok()?;
    values.get(index).copied()
}

fn position(object: &DicomFile) -> Option<[f32; 3]> {
    let values = object
        .element(tags::IMAGE_POSITION_PATIENT)
        .ok()?
        .to_multi_float32()
        .ok()?;
    match values[..] {
        [x, y, z, ..] => Some([x, y, z]),
        _ => None,
    }
}

/// Stacks a DICOM series into a [`ScanVolume`].
pub struct ScanLoader;

impl ScanLoader {
    /// Decode, order and stack a series.
    ///
    /// Objects without decodable pixel data, or without the tag `sort_by`
    /// needs, are skipped.
    ///
    /// # Errors
    ///
    /// `NoValidImages` if nothing decodes, `InconsistentDimensions` if the
    /// planes differ in size, `MissingSpacing` if neither slice thickness nor
    /// slice positions give a depth spacing.
    pub fn load_from_dicom_objects(
        dicom_objects: &[DicomFile],
        sort_by: SortBy,
    ) -> Result<ScanVolume, ScanLoaderError> {
        let mut slices: Vec<_> = dicom_objects
            .iter()
            .filter_map(|object| ScanSlice::decode(object, sort_by))
            .collect();
        if slices.len() < dicom_objects.len() {
            log::warn!(
                "Skipped {} of {} DICOM objects",
                dicom_objects.len() - slices.len(),
                dicom_objects.len()
            );
        }

        sort_slices(&mut slices, sort_by);
        let volume = stack_slices(&slices)?;
        let spacing = spacing(dicom_objects, &slices).ok_or(ScanLoaderError::MissingSpacing)?;

        log::info!(
            "Stacked {} slices into a {:?} scan, spacing {:?}",
            slices.len(),
            volume.dim(),
            spacing
        );
        Ok(ScanVolume::new(volume, spacing))
    }

    pub fn load_from_file_paths(
        paths: &[impl AsRef<Path>],
        sort_by: SortBy,
    ) -> Result<ScanVolume, ScanLoaderError> {
        let objects = paths
            .iter()
            .map(|path| open_file(path.as_ref()))
            .collect::<Result<Vec<_>, _>>()?;
        Self::load_from_dicom_objects(&objects, sort_by)
    }

    /// Load every DICOM file of a directory: `.dcm` files plus extensionless
    /// files that carry the `DICM` magic.
    pub fn load_from_directory(
        path: impl AsRef<Path>,
        sort_by: SortBy,
    ) -> Result<ScanVolume, ScanLoaderError> {
        let mut paths = fs::read_dir(path.as_ref())?
            .filter_map(Result::ok)
            .map(|entry| entry.path())
            .filter(|path| path.is_file() && is_dicom_file(path))
            .collect::<Vec<PathBuf>>();
        if paths.is_empty() {
            return Err(ScanLoaderError::NoValidImages);
        }
        paths.sort();

        log::debug!("Found {} DICOM files in {}", paths.len(), path.as_ref().display());
        Self::load_from_file_paths(&paths, sort_by)
    }
}

fn is_dicom_file(path: &Path) -> bool {
    match path.extension().and_then(|ext| ext.to_str()) {
        Some(ext) => ext.eq_ignore_ascii_case("dcm"),
        None => {
            let mut head = [0u8; MAGIC_OFFSET + 4];
            File::open(path)
                .and_then(|mut file| file.read_exact(&mut head))
                .is_ok_and(|()| &head[MAGIC_OFFSET..] == b"DICM")
        }
    }
}

fn compare_keys(a: Option<f32>, b: Option<f32>) -> Ordering {
    a.partial_cmp(&b).unwrap_or(Ordering::Equal)
}

fn sort_slices(slices: &mut [ScanSlice], sort_by: SortBy) {
    match sort_by {
        SortBy::None => {}
        // Patient z grows towards the head; stack head first.
        SortBy::ImagePositionPatient => slices.sort_by(|a, b| compare_keys(b.key, a.key)),
        SortBy::TablePosition | SortBy::InstanceNumber => {
            slices.sort_by(|a, b| compare_keys(a.key, b.key))
        }
    }
}

/// `(depth, rows, columns)` array of equally sized planes.
fn stack_slices(slices: &[ScanSlice]) -> Result<Array3<u16>, ScanLoaderError> {
    let expected = slices
        .first()
        .map(|slice| slice.pixels.dim())
        .ok_or(ScanLoaderError::NoValidImages)?;
    if let Some(found) = slices
        .iter()
        .map(|slice| slice.pixels.dim())
        .find(|dim| *dim != expected)
    {
        return Err(ScanLoaderError::InconsistentDimensions { expected, found });
    }

    let planes: Vec<_> = slices.iter().map(|slice| slice.pixels.view()).collect();
    ndarray::stack(ndarray::Axis(0), &planes).map_err(|_| ScanLoaderError::InconsistentDimensions {
        expected,
        found: expected,
    })
}

/// `(x, y, z)` spacing. PixelSpacing stores row spacing first; the depth
/// spacing is the slice thickness, or the distance between the first two
/// slice positions when no thickness is recorded.
fn spacing(objects: &[DicomFile], slices: &[ScanSlice]) -> Option<(f32, f32, f32)> {
    let (column, row) = objects.iter().find_map(|object| {
        Some((
            float_at(object, tags::PIXEL_SPACING, 1)?,
            float_at(object, tags::PIXEL_SPACING, 0)?,
        ))
    })?;
    let depth = objects
        .iter()
        .find_map(|object| float_at(object, tags::SLICE_THICKNESS, 0))
        .filter(|thickness| *thickness > 0.0)
        .or_else(|| position_spacing(slices))?;
    Some((column, row, depth))
}

fn position_spacing(slices: &[ScanSlice]) -> Option<f32> {
    let [first, second] = [slices.first()?.position?, slices.get(1)?.position?];
    let distance = first
        .iter()
        .zip(second)
        .map(|(a, b)| (a - b) * (a - b))
        .sum::<f32>()
        .sqrt();
    (distance > 0.0).then_some(distance)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn slice(key: Option<f32>, value: u16, dim: (usize, usize)) -> ScanSlice {
        ScanSlice {
            key,
            position: key.map(|z| [0.0, 0.0, z]),
            pixels: Array2::from_elem(dim, value),
        }
    }

    fn keys(slices: &[ScanSlice]) -> Vec<Option<f32>> {
        slices.iter().map(|s| s.key).collect()
    }

    #[test]
    fn test_sort_by_patient_position_stacks_descending() {
        let mut slices = vec![
            slice(Some(2.0), 2, (2, 2)),
            slice(Some(-1.0), 0, (2, 2)),
            slice(Some(5.0), 5, (2, 2)),
        ];
        sort_slices(&mut slices, SortBy::ImagePositionPatient);
        assert_eq!(keys(&slices), vec![Some(5.0), Some(2.0), Some(-1.0)]);
    }

    #[test]
    fn test_sort_by_instance_number_is_ascending() {
        let mut slices = vec![slice(Some(3.0), 3, (1, 1)), slice(Some(1.0), 1, (1, 1))];
        sort_slices(&mut slices, SortBy::InstanceNumber);
        assert_eq!(keys(&slices), vec![Some(1.0), Some(3.0)]);
    }

    #[test]
    fn test_unsorted_keeps_input_order() {
        let mut slices = vec![slice(Some(3.0), 3, (1, 1)), slice(Some(1.0), 1, (1, 1))];
        sort_slices(&mut slices, SortBy::None);
        assert_eq!(keys(&slices), vec![Some(3.0), Some(1.0)]);
    }

    #[test]
    fn test_mismatched_dimensions_are_rejected() {
        let slices = vec![slice(None, 0, (4, 4)), slice(None, 0, (4, 3))];
        assert!(matches!(
            stack_slices(&slices),
            Err(ScanLoaderError::InconsistentDimensions {
                expected: (4, 4),
                found: (4, 3)
            })
        ));
        assert!(matches!(stack_slices(&[]), Err(ScanLoaderError::NoValidImages)));
    }

    #[test]
    fn test_planes_stack_in_order() {
        let slices = vec![slice(None, 7, (2, 3)), slice(None, 9, (2, 3))];
        let volume = stack_slices(&slices).unwrap();
        assert_eq!(volume.dim(), (2, 2, 3));
        assert_eq!(volume[[0, 1, 2]], 7);
        assert_eq!(volume[[1, 0, 0]], 9);
    }

    #[test]
    fn test_depth_spacing_from_positions() {
        let slices = vec![slice(Some(10.0), 0, (1, 1)), slice(Some(7.5), 0, (1, 1))];
        assert_eq!(position_spacing(&slices), Some(2.5));
        assert_eq!(position_spacing(&slices[..1]), None);

        let coincident = vec![slice(Some(1.0), 0, (1, 1)), slice(Some(1.0), 0, (1, 1))];
        assert_eq!(position_spacing(&coincident), None);
    }

    #[test]
    fn test_empty_object_list_has_no_images() {
        assert!(matches!(
            ScanLoader::load_from_dicom_objects(&[], SortBy::default()),
            Err(ScanLoaderError::NoValidImages)
        ));
    }

    #[test]
    fn test_dicom_files_are_recognised_by_extension_or_magic() {
        let dir = std::env::temp_dir().join(format!("slide-volume-magic-{}", std::process::id()));
        fs::create_dir_all(&dir).unwrap();

        let mut tagged = vec![0u8; MAGIC_OFFSET];
        tagged.extend_from_slice(b"DICM");
        fs::write(dir.join("IM0001"), &tagged).unwrap();
        fs::write(dir.join("README"), b"plain text").unwrap();
        fs::write(dir.join("slice.DCM"), b"").unwrap();
        fs::write(dir.join("notes.txt"), &tagged).unwrap();

        assert!(is_dicom_file(&dir.join("IM0001")));
        assert!(!is_dicom_file(&dir.join("README")));
        assert!(is_dicom_file(&dir.join("slice.DCM")));
        assert!(!is_dicom_file(&dir.join("notes.txt")));

        fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn test_directory_without_dicom_files() {
        let dir = std::env::temp_dir().join(format!("slide-volume-empty-{}", std::process::id()));
        fs::create_dir_all(&dir).unwrap();
        fs::write(dir.join("notes.txt"), b"not a scan").unwrap();
        let result = ScanLoader::load_from_directory(&dir, SortBy::default());
        fs::remove_dir_all(&dir).unwrap();
        assert!(matches!(result, Err(ScanLoaderError::NoValidImages)));
    }
}
