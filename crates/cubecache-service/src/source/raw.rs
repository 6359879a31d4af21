//! A minimal on-disk cube format.
//!
//! The file starts with a fixed header, followed by the pixels as little-endian `f32` with `x`
//! varying fastest and polarization slowest:
//!
//! ```text
//! magic     b"CUBE"
//! version   u32 LE (1)
//! ndim      u32 LE (2..=4)
//! dims      ndim × u64 LE
//! beam area f64 LE (NaN when unknown)
//! pixels    f32 LE × product(dims)
//! ```

use std::fs::{self, File};
use std::io::{BufWriter, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use filetime::FileTime;

use super::{CubeShape, DataSource, Slice, SourceOpener};
use crate::error::CubeError;
use crate::types::SourceKey;

const MAGIC: &[u8; 4] = b"CUBE";
const VERSION: u32 = 1;

#[derive(Debug)]
pub struct RawFileSource {
    path: PathBuf,
    file: Mutex<File>,
    shape: CubeShape,
    beam_area: Option<f64>,
    data_offset: u64,
    opened_mtime: FileTime,
    opened_len: u64,
}

impl RawFileSource {
    pub fn open(path: &Path) -> Result<Self, CubeError> {
        let mut file = File::open(path)?;
        let metadata = file.metadata()?;

        let mut fixed = [0u8; 12];
        file.read_exact(&mut fixed)?;
        if &fixed[..4] != MAGIC {
            return Err(CubeError::Io(format!("{}: not a cube file", path.display())));
        }
        let version = u32::from_le_bytes([fixed[4], fixed[5], fixed[6], fixed[7]]);
        if version != VERSION {
            return Err(CubeError::Io(format!(
                "{}: unsupported version {version}",
                path.display()
            )));
        }
        let ndim = u32::from_le_bytes([fixed[8], fixed[9], fixed[10], fixed[11]]) as usize;
        if !(2..=4).contains(&ndim) {
            return Err(CubeError::UnsupportedShape(format!(
                "{}: {ndim} dimensions, expected 2 to 4",
                path.display()
            )));
        }

        let mut rest = vec![0u8; ndim * 8 + 8];
        file.read_exact(&mut rest)?;
        let words: Vec<[u8; 8]> = rest
            .chunks_exact(8)
            .map(|chunk| {
                let mut word = [0u8; 8];
                word.copy_from_slice(chunk);
                word
            })
            .collect();
        let dims: Vec<usize> = words[..ndim]
            .iter()
            .map(|w| u64::from_le_bytes(*w) as usize)
            .collect();
        let beam_area = Some(f64::from_le_bytes(words[ndim])).filter(|a| a.is_finite());

        let shape = CubeShape::from_dims(&dims)?;
        let data_offset = (12 + rest.len()) as u64;
        let expected = data_offset + shape.len() as u64 * 4;
        if metadata.len() < expected {
            return Err(CubeError::Io(format!(
                "{}: truncated, {} of {expected} bytes",
                path.display(),
                metadata.len()
            )));
        }

        tracing::debug!(path = %path.display(), %shape, "opened raw cube");
        Ok(Self {
            path: path.to_owned(),
            file: Mutex::new(file),
            shape,
            beam_area,
            data_offset,
            opened_mtime: FileTime::from_last_modification_time(&metadata),
            opened_len: metadata.len(),
        })
    }

    /// Writes a cube in this format.
    pub fn write(
        path: &Path,
        dims: &[usize],
        data: &[f32],
        beam_area: Option<f64>,
    ) -> Result<(), CubeError> {
        let shape = CubeShape::from_dims(dims)?;
        if data.len() != shape.len() {
            return Err(CubeError::InvalidRange(format!(
                "{} values for a {shape} cube",
                data.len()
            )));
        }

        let mut writer = BufWriter::new(File::create(path)?);
        writer.write_all(MAGIC)?;
        writer.write_all(&VERSION.to_le_bytes())?;
        writer.write_all(&(dims.len() as u32).to_le_bytes())?;
        for dim in dims {
            writer.write_all(&(*dim as u64).to_le_bytes())?;
        }
        writer.write_all(&beam_area.unwrap_or(f64::NAN).to_le_bytes())?;
        for value in data {
            writer.write_all(&value.to_le_bytes())?;
        }
        writer.flush()?;
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn read_run(&self, file: &mut File, start: usize, out: &mut Vec<f32>, len: usize) -> Result<(), CubeError> {
        let mut buf = vec![0u8; len * 4];
        file.seek(SeekFrom::Start(self.data_offset + start as u64 * 4))?;
        file.read_exact(&mut buf)?;
        out.extend(
            buf.chunks_exact(4)
                .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]])),
        );
        Ok(())
    }
}

impl DataSource for RawFileSource {
    fn shape(&self) -> CubeShape {
        self.shape
    }

    fn has_changed(&self) -> bool {
        match fs::metadata(&self.path) {
            Ok(metadata) => {
                FileTime::from_last_modification_time(&metadata) != self.opened_mtime
                    || metadata.len() != self.opened_len
            }
            // the file vanished
            Err(_) => true,
        }
    }

    fn read_slice(&self, slice: &Slice) -> Result<Vec<f32>, CubeError> {
        slice.validate(&self.shape)?;
        let mut file = self.file.lock().unwrap();
        let mut out = Vec::with_capacity(slice.len());
        let full_rows = slice.width() == self.shape.width;
        for channel in slice.channels.clone() {
            if full_rows {
                let start = self.shape.index(0, slice.y.start, channel, slice.polarization);
                self.read_run(&mut file, start, &mut out, slice.width() * slice.height())?;
                continue;
            }
            for y in slice.y.clone() {
                let start = self.shape.index(slice.x.start, y, channel, slice.polarization);
                self.read_run(&mut file, start, &mut out, slice.width())?;
            }
        }
        Ok(out)
    }

    fn beam_area(&self) -> Option<f64> {
        self.beam_area
    }
}

/// Opens [`RawFileSource`]s from the path part of a key.
#[derive(Clone, Copy, Debug, Default)]
pub struct RawFileOpener;

impl SourceOpener for RawFileOpener {
    fn open(&self, key: &SourceKey) -> Result<Arc<dyn DataSource>, CubeError> {
        if let Some(unit) = key.sub_unit() {
            return Err(CubeError::Io(format!(
                "raw cube files have no sub-units, got {unit:?}"
            )));
        }
        Ok(Arc::new(RawFileSource::open(Path::new(key.path()))?))
    }
}
