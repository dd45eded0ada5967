//! Binary concentration file codec.
//!
//! Layout, all little-endian, counts and indices `u32`, values `f64`,
//! matrices column-major and preceded by their `[rows, cols]` shape:
//!
//! ```text
//! u32 voxels | f64 roi_volume | u32 channels | f64[channels] S
//! u32[2] U shape | f64[] U
//! voxels × record, voxel index descending:
//!   u32 voxel | u32 n, u32[n] roi_columns | u32 n, u32[n] roi_voxels
//!   u32 n, f64[n] eigenvalues | u32[2] Vp shape | f64[] Vp
//! ```
//!
//! There is no magic number, version field or record index in the stream;
//! records are matched purely by position.

use std::collections::HashMap;
use std::fs::File;
use std::io::{self, BufReader, BufWriter, Read, Seek, SeekFrom, Write};
use std::path::Path;

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use ndarray::{Array1, Array2};
use serde::Serialize;

use crate::error::{LocalizeError, LocalizeResult};
use crate::linalg::{from_column_major, to_column_major};

/// Global spectral basis shared by every record in the file.
#[derive(Debug, Clone, PartialEq)]
pub struct ConcentrationHeader {
    pub voxels: u32,
    pub roi_volume: f64,
    /// Global singular values, descending, one per channel
    pub singular_values: Array1<f64>,
    /// Sensor-side singular vectors, `channels × channels`
    pub u: Array2<f64>,
}

impl ConcentrationHeader {
    pub fn channels(&self) -> usize {
        self.singular_values.len()
    }

    fn encoded_len(&self) -> u64 {
        4 + 8 + 4 + 8 * self.singular_values.len() as u64 + 8 + 8 * self.u.len() as u64
    }
}

/// Local concentration spectrum of one voxel.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct VoxelRecord {
    /// 1-based voxel identity
    pub voxel: u32,
    /// 0-based kernel columns of the ROI
    pub roi_columns: Vec<u32>,
    /// 1-based voxel identities of the ROI
    pub roi_voxels: Vec<u32>,
    /// Concentration eigenvalues, descending, in `[0, 1]`
    pub eigenvalues: Vec<f64>,
    /// Local right singular vectors, `channels × eigenvalues.len()`
    pub vp: Array2<f64>,
}

impl VoxelRecord {
    pub fn leading_eigenvalue(&self) -> f64 {
        self.eigenvalues.first().copied().unwrap_or(0.0)
    }

    /// Number of eigenvalues at or above `threshold`.
    pub fn modes_above(&self, threshold: f64) -> usize {
        self.eigenvalues
            .iter()
            .take_while(|&&value| value >= threshold)
            .count()
    }

    pub fn encoded_len(&self) -> u64 {
        4 + 4
            + 4 * self.roi_columns.len() as u64
            + 4
            + 4 * self.roi_voxels.len() as u64
            + 4
            + 8 * self.eigenvalues.len() as u64
            + 8
            + 8 * self.vp.len() as u64
    }
}

/// Streaming writer enforcing the descending voxel order.
pub struct ConcentrationWriter<W: Write> {
    inner: W,
    channels: usize,
    next_voxel: u32,
}

impl ConcentrationWriter<BufWriter<File>> {
    pub fn create<P: AsRef<Path>>(
        path: P,
        header: &ConcentrationHeader,
    ) -> LocalizeResult<Self> {
        let file = File::create(path)?;
        Self::new(BufWriter::new(file), header)
    }

    /// Flush buffered records and sync the file to disk.
    pub fn close(self) -> LocalizeResult<()> {
        let file = self
            .finish()?
            .into_inner()
            .map_err(|err| LocalizeError::Io(err.into_error()))?;
        file.sync_all()?;
        Ok(())
    }
}

impl<W: Write> ConcentrationWriter<W> {
    pub fn new(mut inner: W, header: &ConcentrationHeader) -> LocalizeResult<Self> {
        let channels = header.channels();
        if header.u.dim() != (channels, channels) {
            return Err(LocalizeError::consistency(
                "header U shape",
                format!("{channels}x{channels}"),
                format!("{}x{}", header.u.nrows(), header.u.ncols()),
            ));
        }
        inner.write_u32::<LittleEndian>(header.voxels)?;
        inner.write_f64::<LittleEndian>(header.roi_volume)?;
        inner.write_u32::<LittleEndian>(to_u32(channels, "channel count")?)?;
        write_f64s(&mut inner, header.singular_values.iter().copied())?;
        write_matrix(&mut inner, &header.u)?;
        Ok(Self {
            inner,
            channels,
            next_voxel: header.voxels,
        })
    }

    /// Identity of the record the writer expects next, `None` once every
    /// voxel has been written.
    pub fn next_voxel(&self) -> Option<u32> {
        (self.next_voxel > 0).then_some(self.next_voxel)
    }

    pub fn write_record(&mut self, record: &VoxelRecord) -> LocalizeResult<()> {
        if record.voxel != self.next_voxel {
            return Err(LocalizeError::consistency(
                "record voxel index",
                self.next_voxel,
                record.voxel,
            ));
        }
        if record.vp.nrows() != self.channels || record.vp.ncols() != record.eigenvalues.len() {
            return Err(LocalizeError::consistency(
                "record Vp shape",
                format!("{}x{}", self.channels, record.eigenvalues.len()),
                format!("{}x{}", record.vp.nrows(), record.vp.ncols()),
            ));
        }

        let w = &mut self.inner;
        w.write_u32::<LittleEndian>(record.voxel)?;
        write_u32s(w, &record.roi_columns)?;
        write_u32s(w, &record.roi_voxels)?;
        w.write_u32::<LittleEndian>(to_u32(record.eigenvalues.len(), "eigenvalue count")?)?;
        write_f64s(w, record.eigenvalues.iter().copied())?;
        write_matrix(w, &record.vp)?;

        self.next_voxel -= 1;
        Ok(())
    }

    /// Verify every voxel was written, flush, and hand back the sink.
    pub fn finish(mut self) -> LocalizeResult<W> {
        if self.next_voxel != 0 {
            return Err(LocalizeError::consistency(
                "records remaining",
                0,
                self.next_voxel,
            ));
        }
        self.inner.flush()?;
        Ok(self.inner)
    }
}

/// Byte offsets of every record, keyed by voxel identity.
#[derive(Debug, Clone, Default)]
pub struct RecordIndex {
    offsets: HashMap<u32, u64>,
}

impl RecordIndex {
    pub fn offset(&self, voxel: u32) -> Option<u64> {
        self.offsets.get(&voxel).copied()
    }

    pub fn len(&self) -> usize {
        self.offsets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.offsets.is_empty()
    }
}

/// Streaming reader yielding records in file order.
pub struct ConcentrationReader<R: Read> {
    inner: R,
    header: ConcentrationHeader,
    next_voxel: u32,
}

impl ConcentrationReader<BufReader<File>> {
    pub fn open<P: AsRef<Path>>(path: P) -> LocalizeResult<Self> {
        let file = File::open(path)?;
        Self::new(BufReader::new(file))
    }
}

impl<R: Read> ConcentrationReader<R> {
    pub fn new(mut inner: R) -> LocalizeResult<Self> {
        let voxels = inner.read_u32::<LittleEndian>()?;
        let roi_volume = inner.read_f64::<LittleEndian>()?;
        let channels = inner.read_u32::<LittleEndian>()? as usize;
        let singular_values = Array1::from_vec(read_f64s(&mut inner, channels)?);
        let u = read_matrix(&mut inner, (channels, channels), "header U shape")?;

        Ok(Self {
            inner,
            header: ConcentrationHeader {
                voxels,
                roi_volume,
                singular_values,
                u,
            },
            next_voxel: voxels,
        })
    }

    pub fn header(&self) -> &ConcentrationHeader {
        &self.header
    }

    /// Read the next record; `Ok(None)` once all voxels have been consumed.
    pub fn next_record(&mut self) -> LocalizeResult<Option<VoxelRecord>> {
        if self.next_voxel == 0 {
            return Ok(None);
        }
        let record = read_record(&mut self.inner, &self.header)?;
        if record.voxel != self.next_voxel {
            return Err(LocalizeError::consistency(
                "record voxel index",
                self.next_voxel,
                record.voxel,
            ));
        }
        self.next_voxel -= 1;
        Ok(Some(record))
    }

    /// Consume the reader, failing if records are missing or bytes trail
    /// the last record.
    pub fn finish(mut self) -> LocalizeResult<()> {
        if self.next_voxel != 0 {
            return Err(LocalizeError::consistency(
                "records remaining",
                0,
                self.next_voxel,
            ));
        }
        let mut probe = [0u8; 1];
        match self.inner.read(&mut probe)? {
            0 => Ok(()),
            _ => Err(LocalizeError::DataFormat(
                "trailing bytes after the last voxel record".into(),
            )),
        }
    }
}

impl<R: Read + Seek> ConcentrationReader<R> {
    /// Scan the remaining records once and record their byte offsets. The
    /// stream position is restored afterwards.
    pub fn build_index(&mut self) -> LocalizeResult<RecordIndex> {
        let start = self.inner.stream_position()?;
        let mut offsets = HashMap::with_capacity(self.next_voxel as usize);
        for _ in 0..self.next_voxel {
            let offset = self.inner.stream_position()?;
            let voxel = skip_record(&mut self.inner, &self.header)?;
            if offsets.insert(voxel, offset).is_some() {
                return Err(LocalizeError::DataFormat(format!(
                    "voxel {voxel} appears twice in the concentration file"
                )));
            }
        }
        self.inner.seek(SeekFrom::Start(start))?;
        Ok(RecordIndex { offsets })
    }

    /// Random-access read through an index; the streaming position is kept.
    pub fn read_record_at(
        &mut self,
        index: &RecordIndex,
        voxel: u32,
    ) -> LocalizeResult<VoxelRecord> {
        let offset = index.offset(voxel).ok_or_else(|| {
            LocalizeError::Configuration(format!("voxel {voxel} is not in the record index"))
        })?;
        let resume = self.inner.stream_position()?;
        self.inner.seek(SeekFrom::Start(offset))?;
        let record = read_record(&mut self.inner, &self.header);
        self.inner.seek(SeekFrom::Start(resume))?;
        let record = record?;
        if record.voxel != voxel {
            return Err(LocalizeError::consistency("indexed voxel", voxel, record.voxel));
        }
        Ok(record)
    }
}

/// Bytes taken by the header of a file with this global basis.
pub fn header_len(header: &ConcentrationHeader) -> u64 {
    header.encoded_len()
}

fn read_record<R: Read>(r: &mut R, header: &ConcentrationHeader) -> LocalizeResult<VoxelRecord> {
    let voxel = r.read_u32::<LittleEndian>()?;
    if voxel == 0 || voxel > header.voxels {
        return Err(LocalizeError::consistency(
            "record voxel index range",
            format!("1..={}", header.voxels),
            voxel,
        ));
    }

    let column_limit = 3 * header.voxels as usize;
    let roi_columns = read_u32s(r, column_limit, "roi column count")?;
    let roi_voxels = read_u32s(r, header.voxels as usize, "roi voxel count")?;

    let count = r.read_u32::<LittleEndian>()? as usize;
    if count > header.channels() {
        return Err(LocalizeError::consistency(
            "eigenvalue count limit",
            header.channels(),
            count,
        ));
    }
    let eigenvalues = read_f64s(r, count)?;
    let vp = read_matrix(r, (header.channels(), count), "record Vp shape")?;

    Ok(VoxelRecord {
        voxel,
        roi_columns,
        roi_voxels,
        eigenvalues,
        vp,
    })
}

fn skip_record<R: Read + Seek>(r: &mut R, header: &ConcentrationHeader) -> LocalizeResult<u32> {
    let voxel = r.read_u32::<LittleEndian>()?;
    let columns = i64::from(r.read_u32::<LittleEndian>()?);
    r.seek(SeekFrom::Current(4 * columns))?;
    let voxels = i64::from(r.read_u32::<LittleEndian>()?);
    r.seek(SeekFrom::Current(4 * voxels))?;
    let count = r.read_u32::<LittleEndian>()? as usize;
    if count > header.channels() {
        return Err(LocalizeError::consistency(
            "eigenvalue count limit",
            header.channels(),
            count,
        ));
    }
    r.seek(SeekFrom::Current(8 * count as i64))?;
    let rows = r.read_u32::<LittleEndian>()? as usize;
    let cols = r.read_u32::<LittleEndian>()? as usize;
    if (rows, cols) != (header.channels(), count) {
        return Err(LocalizeError::consistency(
            "record Vp shape",
            format!("{}x{}", header.channels(), count),
            format!("{rows}x{cols}"),
        ));
    }
    r.seek(SeekFrom::Current(8 * (rows * cols) as i64))?;
    Ok(voxel)
}

fn to_u32(value: usize, field: &'static str) -> LocalizeResult<u32> {
    u32::try_from(value).map_err(|_| LocalizeError::consistency(field, u32::MAX, value))
}

fn write_u32s<W: Write>(w: &mut W, values: &[u32]) -> LocalizeResult<()> {
    w.write_u32::<LittleEndian>(to_u32(values.len(), "array length")?)?;
    for &value in values {
        w.write_u32::<LittleEndian>(value)?;
    }
    Ok(())
}

fn write_f64s<W: Write>(w: &mut W, values: impl Iterator<Item = f64>) -> io::Result<()> {
    for value in values {
        w.write_f64::<LittleEndian>(value)?;
    }
    Ok(())
}

fn write_matrix<W: Write>(w: &mut W, matrix: &Array2<f64>) -> LocalizeResult<()> {
    w.write_u32::<LittleEndian>(to_u32(matrix.nrows(), "matrix rows")?)?;
    w.write_u32::<LittleEndian>(to_u32(matrix.ncols(), "matrix columns")?)?;
    write_f64s(w, to_column_major(matrix.view()).into_iter())?;
    Ok(())
}

/// Values read per chunk. Counts come from the stream itself, so buffers
/// only grow as far as the bytes actually present.
const READ_CHUNK: usize = 4096;

fn read_u32s<R: Read>(r: &mut R, limit: usize, field: &'static str) -> LocalizeResult<Vec<u32>> {
    let count = r.read_u32::<LittleEndian>()? as usize;
    if count > limit {
        return Err(LocalizeError::consistency(field, format!("<= {limit}"), count));
    }
    let mut values = Vec::with_capacity(count.min(READ_CHUNK));
    let mut chunk = [0u32; READ_CHUNK];
    while values.len() < count {
        let take = (count - values.len()).min(READ_CHUNK);
        r.read_u32_into::<LittleEndian>(&mut chunk[..take])?;
        values.extend_from_slice(&chunk[..take]);
    }
    Ok(values)
}

fn read_f64s<R: Read>(r: &mut R, count: usize) -> io::Result<Vec<f64>> {
    let mut values = Vec::with_capacity(count.min(READ_CHUNK));
    let mut chunk = [0.0f64; READ_CHUNK];
    while values.len() < count {
        let take = (count - values.len()).min(READ_CHUNK);
        r.read_f64_into::<LittleEndian>(&mut chunk[..take])?;
        values.extend_from_slice(&chunk[..take]);
    }
    Ok(values)
}

/// Read a shaped matrix, rejecting any shape other than `expected` before
/// its data is touched.
fn read_matrix<R: Read>(
    r: &mut R,
    expected: (usize, usize),
    field: &'static str,
) -> LocalizeResult<Array2<f64>> {
    let rows = r.read_u32::<LittleEndian>()? as usize;
    let cols = r.read_u32::<LittleEndian>()? as usize;
    if (rows, cols) != expected {
        return Err(LocalizeError::consistency(
            field,
            format!("{}x{}", expected.0, expected.1),
            format!("{rows}x{cols}"),
        ));
    }
    let len = rows.checked_mul(cols).ok_or_else(|| {
        LocalizeError::DataFormat(format!("matrix shape {rows}x{cols} overflows"))
    })?;
    let data = read_f64s(r, len)?;
    from_column_major(rows, cols, data)
}
