//! Multi-resolution TIFF slides (Aperio SVS, pyramidal TIFF).
//!
//! Every image file directory (IFD) of the file is one candidate level. When
//! the file holds tiled directories only those form the pyramid, which drops
//! the stripped thumbnail, label and macro images an SVS file carries.
//! Regions are served by decoding just the tiles or strips they touch, so a
//! gigapixel level is never decoded as a whole.

use std::cmp::Reverse;
use std::fs::File;
use std::io::{BufReader, Read, Seek};
use std::path::Path;

use tiff::decoder::{Decoder, DecodingResult};
use tiff::tags::Tag;
use tiff::{ColorType, TiffError};

use crate::error::ViewerError;
use crate::pyramid::{BackendError, PyramidBackend, pack_rgba};

/// Extensions routed to [`TiffPyramid`].
pub const TIFF_EXTENSIONS: [&str; 3] = ["tif", "tiff", "svs"];

pub fn is_tiff_path(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| TIFF_EXTENSIONS.contains(&ext.to_ascii_lowercase().as_str()))
}

/// Layout of one directory used as a pyramid level.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
struct TiffLevel {
    ifd: usize,
    width: u32,
    height: u32,
    chunk_width: u32,
    chunk_height: u32,
    samples: usize,
}

impl TiffLevel {
    fn chunks_across(&self) -> u32 {
        self.width.div_ceil(self.chunk_width)
    }

    fn chunk_index(&self, column: u32, row: u32) -> u32 {
        row * self.chunks_across() + column
    }

    /// Pixels of chunk `(column, row)` that lie inside the image.
    fn chunk_extent(&self, column: u32, row: u32) -> (u32, u32) {
        (
            (self.width - column * self.chunk_width).min(self.chunk_width),
            (self.height - row * self.chunk_height).min(self.chunk_height),
        )
    }
}

#[derive(Debug)]
struct Directory {
    level: TiffLevel,
    tiled: bool,
}

pub struct TiffPyramid<R: Read + Seek> {
    decoder: Decoder<R>,
    levels: Vec<TiffLevel>,
}

impl TiffPyramid<BufReader<File>> {
    pub fn open(path: &Path) -> Result<Self, ViewerError> {
        let file = File::open(path)?;
        let pyramid = Self::from_reader(BufReader::new(file))?;
        log::info!(
            "Opened {} with {} TIFF levels",
            path.display(),
            pyramid.levels.len()
        );
        Ok(pyramid)
    }
}

impl<R: Read + Seek> TiffPyramid<R> {
    /// Scan every directory of a TIFF stream and keep the pyramid levels,
    /// ordered from highest to lowest resolution.
    ///
    /// # Errors
    ///
    /// `UnsupportedFormat` if the stream is not a TIFF or no directory has a
    /// sample layout that can be converted to RGBA, `Io` on read failure.
    pub fn from_reader(reader: R) -> Result<Self, ViewerError> {
        let mut decoder = Decoder::new(reader).map_err(open_error)?;

        let mut directories = Vec::new();
        let mut ifd = 0;
        loop {
            match describe(&mut decoder, ifd)? {
                Some(directory) => directories.push(directory),
                None => log::warn!("Skipping TIFF directory {ifd}: unsupported sample layout"),
            }
            if !decoder.more_images() {
                break;
            }
            decoder.next_image().map_err(open_error)?;
            ifd += 1;
        }

        let levels = select_levels(directories);
        if levels.is_empty() {
            return Err(ViewerError::UnsupportedFormat(
                "TIFF has no readable image directory".into(),
            ));
        }
        Ok(Self { decoder, levels })
    }

    /// Decode one chunk of `level` into packed texels.
    fn read_chunk(&mut self, level: &TiffLevel, column: u32, row: u32) -> Result<ChunkTexels, BackendError> {
        let decoded = self
            .decoder
            .read_chunk(level.chunk_index(column, row))
            .map_err(read_error)?;
        let texels = to_texels(decoded, level.samples)?;

        let (width, height) = level.chunk_extent(column, row);
        // Edge chunks come back either cropped or padded to the full chunk size.
        let stride = if texels.len() == width as usize * height as usize {
            width
        } else if texels.len() == level.chunk_width as usize * level.chunk_height as usize {
            level.chunk_width
        } else {
            return Err(BackendError::Read(format!(
                "chunk ({column}, {row}) of directory {} decoded to {} texels",
                level.ifd,
                texels.len()
            )));
        };
        Ok(ChunkTexels { texels, stride })
    }
}

struct ChunkTexels {
    texels: Vec<u32>,
    stride: u32,
}

fn describe<R: Read + Seek>(
    decoder: &mut Decoder<R>,
    ifd: usize,
) -> Result<Option<Directory>, ViewerError> {
    let (width, height) = decoder.dimensions().map_err(open_error)?;
    let planar = match decoder
        .find_tag(Tag::PlanarConfiguration)
        .map_err(open_error)?
    {
        Some(value) => value.into_u16().map_err(open_error)?,
        None => 1,
    };
    let samples = match decoder.colortype() {
        Ok(color) => samples_per_pixel(color),
        Err(_) => None,
    };
    let Some(samples) = samples.filter(|_| planar == 1 && width > 0 && height > 0) else {
        return Ok(None);
    };

    let tiled = decoder
        .find_tag(Tag::TileWidth)
        .map_err(open_error)?
        .is_some();
    let (chunk_width, chunk_height) = decoder.chunk_dimensions();
    if chunk_width == 0 || chunk_height == 0 {
        return Ok(None);
    }

    Ok(Some(Directory {
        level: TiffLevel {
            ifd,
            width,
            height,
            chunk_width,
            chunk_height,
            samples,
        },
        tiled,
    }))
}

/// Tiled directories when there are any, otherwise every directory, largest first.
fn select_levels(directories: Vec<Directory>) -> Vec<TiffLevel> {
    let any_tiled = directories.iter().any(|d| d.tiled);
    let mut levels: Vec<TiffLevel> = directories
        .into_iter()
        .filter(|d| d.tiled || !any_tiled)
        .map(|d| d.level)
        .collect();
    levels.sort_by_key(|level| Reverse(level.width as u64 * level.height as u64));
    levels
}

fn samples_per_pixel(color: ColorType) -> Option<usize> {
    let (samples, bits) = match color {
        ColorType::Gray(bits) => (1, bits),
        ColorType::GrayA(bits) => (2, bits),
        ColorType::RGB(bits) | ColorType::YCbCr(bits) => (3, bits),
        ColorType::RGBA(bits) => (4, bits),
        _ => return None,
    };
    matches!(bits, 8 | 16).then_some(samples)
}

fn to_texels(decoded: DecodingResult, samples: usize) -> Result<Vec<u32>, BackendError> {
    let bytes = match decoded {
        DecodingResult::U8(bytes) => bytes,
        DecodingResult::U16(words) => words.into_iter().map(|w| (w >> 8) as u8).collect(),
        _ => {
            return Err(BackendError::Read(
                "unsupported TIFF sample format".into(),
            ));
        }
    };
    Ok(bytes
        .chunks_exact(samples)
        .map(|pixel| {
            pack_rgba(match *pixel {
                [g] => [g, g, g, 255],
                [g, a] => [g, g, g, a],
                [r, g, b] => [r, g, b, 255],
                [r, g, b, a] => [r, g, b, a],
                _ => [0, 0, 0, 255],
            })
        })
        .collect())
}

fn open_error(err: TiffError) -> ViewerError {
    match err {
        TiffError::IoError(io) => ViewerError::Io(io),
        other => ViewerError::UnsupportedFormat(other.to_string()),
    }
}

fn read_error(err: TiffError) -> BackendError {
    BackendError::Read(err.to_string())
}

impl<R: Read + Seek> PyramidBackend for TiffPyramid<R> {
    fn level_count(&self) -> usize {
        self.levels.len()
    }

    fn level_dimensions(&self, level: usize) -> Option<(u32, u32)> {
        self.levels.get(level).map(|l| (l.width, l.height))
    }

    fn read_region(
        &mut self,
        level: usize,
        x: u32,
        y: u32,
        width: u32,
        height: u32,
        out: &mut [u32],
    ) -> Result<(), BackendError> {
        let info = *self
            .levels
            .get(level)
            .ok_or(BackendError::LevelOutOfRange(level))?;
        let right = x.checked_add(width).filter(|&r| r <= info.width);
        let bottom = y.checked_add(height).filter(|&b| b <= info.height);
        let (Some(right), Some(bottom)) = (right, bottom) else {
            return Err(BackendError::RegionOutOfBounds {
                level,
                x,
                y,
                width,
                height,
            });
        };
        let expected = width as usize * height as usize;
        if out.len() != expected {
            return Err(BackendError::BufferSize {
                expected,
                actual: out.len(),
            });
        }
        if expected == 0 {
            return Ok(());
        }

        let start = web_time::Instant::now();
        self.decoder
            .seek_to_image(info.ifd)
            .map_err(read_error)?;

        let columns = x / info.chunk_width..=(right - 1) / info.chunk_width;
        let rows = y / info.chunk_height..=(bottom - 1) / info.chunk_height;
        let mut decoded = 0;
        for row in rows {
            for column in columns.clone() {
                let chunk = self.read_chunk(&info, column, row)?;
                decoded += 1;

                let (chunk_w, chunk_h) = info.chunk_extent(column, row);
                let (chunk_x, chunk_y) = (column * info.chunk_width, row * info.chunk_height);
                let left = x.max(chunk_x);
                let span = (right.min(chunk_x + chunk_w) - left) as usize;
                for py in y.max(chunk_y)..bottom.min(chunk_y + chunk_h) {
                    let src = ((py - chunk_y) * chunk.stride + (left - chunk_x)) as usize;
                    let dst = ((py - y) * width + (left - x)) as usize;
                    out[dst..dst + span].copy_from_slice(&chunk.texels[src..src + span]);
                }
            }
        }

        log::debug!(
            "Decoded {decoded} TIFF chunks of directory {} for {width}x{height} in {:.2?}",
            info.ifd,
            start.elapsed()
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use tiff::encoder::{TiffEncoder, colortype};

    use super::*;

    fn texel(x: u32, y: u32, width: u32) -> [u8; 4] {
        [x as u8, y as u8, width as u8, 255]
    }

    /// One stripped RGBA directory per entry, four rows per strip.
    fn encode(levels: &[(u32, u32)]) -> Vec<u8> {
        let mut cursor = Cursor::new(Vec::new());
        {
            let mut encoder = TiffEncoder::new(&mut cursor).unwrap();
            for &(width, height) in levels {
                let data: Vec<u8> = (0..height)
                    .flat_map(|y| (0..width).flat_map(move |x| texel(x, y, width)))
                    .collect();
                let mut image = encoder.new_image::<colortype::RGBA8>(width, height).unwrap();
                image.rows_per_strip(4).unwrap();
                image.write_data(&data).unwrap();
            }
        }
        cursor.into_inner()
    }

    fn open(levels: &[(u32, u32)]) -> TiffPyramid<Cursor<Vec<u8>>> {
        TiffPyramid::from_reader(Cursor::new(encode(levels))).unwrap()
    }

    #[test]
    fn test_directories_become_levels() {
        let pyramid = open(&[(300, 40), (150, 20), (75, 10)]);
        assert_eq!(pyramid.level_count(), 3);
        assert_eq!(pyramid.level_dimensions(0), Some((300, 40)));
        assert_eq!(pyramid.level_dimensions(2), Some((75, 10)));
        assert_eq!(pyramid.level_dimensions(3), None);
    }

    #[test]
    fn test_levels_are_ordered_largest_first() {
        let pyramid = open(&[(75, 10), (300, 40)]);
        assert_eq!(pyramid.level_dimensions(0), Some((300, 40)));
        assert_eq!(pyramid.levels[0].ifd, 1);
    }

    #[test]
    fn test_region_spans_several_strips() {
        let mut pyramid = open(&[(300, 40), (150, 20)]);
        let (x, y, width, height) = (290, 2, 10, 11);
        let mut out = vec![0; (width * height) as usize];
        pyramid.read_region(0, x, y, width, height, &mut out).unwrap();

        for row in 0..height {
            for column in 0..width {
                let expected = pack_rgba(texel(x + column, y + row, 300));
                assert_eq!(out[(row * width + column) as usize], expected);
            }
        }
    }

    #[test]
    fn test_region_of_lower_level() {
        let mut pyramid = open(&[(300, 40), (150, 20)]);
        let mut out = vec![0; 150 * 20];
        pyramid.read_region(1, 0, 0, 150, 20, &mut out).unwrap();
        assert_eq!(out[0], pack_rgba(texel(0, 0, 150)));
        assert_eq!(out[150 * 20 - 1], pack_rgba(texel(149, 19, 150)));
    }

    #[test]
    fn test_region_outside_level_is_rejected() {
        let mut pyramid = open(&[(300, 40)]);
        let mut out = vec![0; 20];
        let err = pyramid.read_region(0, 295, 0, 10, 2, &mut out).unwrap_err();
        assert!(matches!(err, BackendError::RegionOutOfBounds { .. }));
        let err = pyramid.read_region(1, 0, 0, 10, 2, &mut out).unwrap_err();
        assert!(matches!(err, BackendError::LevelOutOfRange(1)));
    }

    #[test]
    fn test_not_a_tiff_is_unsupported() {
        let err = TiffPyramid::from_reader(Cursor::new(b"definitely not a tiff".to_vec()))
            .err()
            .unwrap();
        assert!(matches!(err, ViewerError::UnsupportedFormat(_)));
    }

    #[test]
    fn test_tiled_directories_take_precedence() {
        let strip = |ifd, width, height| Directory {
            level: TiffLevel {
                ifd,
                width,
                height,
                chunk_width: width,
                chunk_height: 16,
                samples: 3,
            },
            tiled: false,
        };
        let tile = |ifd, width, height| Directory {
            level: TiffLevel {
                ifd,
                width,
                height,
                chunk_width: 256,
                chunk_height: 256,
                samples: 3,
            },
            tiled: true,
        };
        // Full level, thumbnail, reduced level, label
        let levels = select_levels(vec![
            tile(0, 40000, 30000),
            strip(1, 1024, 768),
            tile(2, 10000, 7500),
            strip(3, 600, 600),
        ]);
        let ifds: Vec<_> = levels.iter().map(|l| l.ifd).collect();
        assert_eq!(ifds, vec![0, 2]);
    }

    #[test]
    fn test_edge_chunk_extent() {
        let level = TiffLevel {
            ifd: 0,
            width: 600,
            height: 300,
            chunk_width: 256,
            chunk_height: 256,
            samples: 3,
        };
        assert_eq!(level.chunks_across(), 3);
        assert_eq!(level.chunk_index(2, 1), 5);
        assert_eq!(level.chunk_extent(2, 1), (88, 44));
        assert_eq!(level.chunk_extent(0, 0), (256, 256));
    }

    #[test]
    fn test_extension_routing() {
        assert!(is_tiff_path(Path::new("slide.svs")));
        assert!(is_tiff_path(Path::new("slide.TIF")));
        assert!(!is_tiff_path(Path::new("slide.png")));
    }
}
