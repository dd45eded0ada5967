//! Discrete-discrete concentration eigenvalue solver.
//!
//! The kernel `K` (`channels × 3·voxels`) is decomposed once as
//! `Kᵀ = V·S·Uᵀ`. For every voxel the rows of `V` belonging to its ROI are
//! decomposed again; the squared local singular values are the fractions of
//! ROI energy reachable inside the global rank-`channels` subspace.

use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use ndarray::{Array2, ArrayView2, Axis};
use rayon::prelude::*;
use serde::Serialize;

use super::format::{header_len, ConcentrationHeader, ConcentrationWriter, VoxelRecord};
use crate::config::ConcentrationConfig;
use crate::error::{LocalizeError, LocalizeResult};
use crate::geometry::{
    ensure_centroid_shape, search_for, source_volume, voxel_spacing, NeighbourSearch,
};
use crate::linalg::thin_svd;
use crate::logging;

/// Outcome of one solver run.
#[derive(Debug, Clone, Serialize)]
pub struct ConcentrationSummary {
    pub voxels: usize,
    pub channels: usize,
    pub roi_volume: f64,
    pub spacing: f64,
    pub source_volume: f64,
    pub mean_roi_voxels: f64,
    pub min_leading_eigenvalue: f64,
    pub mean_leading_eigenvalue: f64,
    pub bytes_written: u64,
}

#[derive(Default)]
struct RecordStats {
    roi_voxels: usize,
    leading_sum: f64,
    leading_min: f64,
    bytes: u64,
}

impl RecordStats {
    fn new(header_bytes: u64) -> Self {
        Self {
            leading_min: f64::INFINITY,
            bytes: header_bytes,
            ..Self::default()
        }
    }

    fn add(&mut self, record: &VoxelRecord) {
        let leading = record.leading_eigenvalue();
        self.roi_voxels += record.roi_voxels.len();
        self.leading_sum += leading;
        self.leading_min = self.leading_min.min(leading);
        self.bytes += record.encoded_len();
    }
}

/// Per-voxel concentration solver writing one concentration file.
pub struct ConcentrationSolver {
    roi_volume: f64,
    path: PathBuf,
    batch_size: usize,
    channels: Option<usize>,
    search: Box<dyn NeighbourSearch>,
}

impl ConcentrationSolver {
    pub fn new(config: &ConcentrationConfig) -> LocalizeResult<Self> {
        config.validate()?;
        let roi_volume = config.roi_volume.ok_or_else(|| {
            LocalizeError::Configuration("concentration.roi_volume is not set".into())
        })?;
        Ok(Self {
            roi_volume,
            path: config.artifact_path()?,
            batch_size: config.batch_size,
            channels: config.channels,
            search: search_for(config.neighbourhood),
        })
    }

    /// Replace the configured neighbour policy.
    pub fn with_search(mut self, search: Box<dyn NeighbourSearch>) -> Self {
        self.search = search;
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Solve and write the concentration file. A failed run removes the
    /// partially written file, but never a file it could not open.
    pub fn solve(
        &self,
        kernel: ArrayView2<f64>,
        centroids: ArrayView2<f64>,
    ) -> LocalizeResult<ConcentrationSummary> {
        self.check_inputs(kernel, centroids)?;
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }

        let mut created = false;
        let result = self
            .run(kernel, centroids, |header| {
                let file = File::create(&self.path)?;
                created = true;
                ConcentrationWriter::new(BufWriter::new(file), header)
            })
            .and_then(|(writer, summary)| writer.close().map(|()| summary));

        match result {
            Ok(summary) => {
                logging::record("concentration_solve", &summary);
                Ok(summary)
            }
            Err(err) => {
                if created {
                    if let Err(remove) = fs::remove_file(&self.path) {
                        eprintln!(
                            "failed to remove partial concentration file {}: {remove}",
                            self.path.display()
                        );
                    }
                }
                Err(err)
            }
        }
    }

    /// Solve into an arbitrary sink, returning it after the last record.
    pub fn solve_to<W: Write>(
        &self,
        kernel: ArrayView2<f64>,
        centroids: ArrayView2<f64>,
        sink: W,
    ) -> LocalizeResult<(W, ConcentrationSummary)> {
        self.check_inputs(kernel, centroids)?;
        let (writer, summary) = self.run(kernel, centroids, |header| {
            ConcentrationWriter::new(sink, header)
        })?;
        Ok((writer.finish()?, summary))
    }

    fn check_inputs(&self, kernel: ArrayView2<f64>, centroids: ArrayView2<f64>) -> LocalizeResult<()> {
        ensure_centroid_shape(centroids)?;
        let voxels = centroids.nrows();
        let (channels, columns) = kernel.dim();
        if columns != 3 * voxels {
            return Err(LocalizeError::consistency("kernel columns", 3 * voxels, columns));
        }
        if let Some(expected) = self.channels {
            if expected != channels {
                return Err(LocalizeError::consistency("kernel rows", expected, channels));
            }
        }
        if channels == 0 || channels > columns {
            return Err(LocalizeError::DataFormat(format!(
                "kernel must have between 1 and {columns} rows, got {channels}"
            )));
        }
        Ok(())
    }

    fn run<W, F>(
        &self,
        kernel: ArrayView2<f64>,
        centroids: ArrayView2<f64>,
        open: F,
    ) -> LocalizeResult<(ConcentrationWriter<W>, ConcentrationSummary)>
    where
        W: Write,
        F: FnOnce(&ConcentrationHeader) -> LocalizeResult<ConcentrationWriter<W>>,
    {
        let voxels = centroids.nrows();
        let channels = kernel.nrows();

        let global = thin_svd(kernel.t())?;
        let source_basis = global.u;
        let spacing = voxel_spacing(centroids)?;
        let volume = source_volume(voxels, spacing);

        let header = ConcentrationHeader {
            voxels: u32::try_from(voxels)
                .map_err(|_| LocalizeError::consistency("voxel count", u32::MAX, voxels))?,
            roi_volume: self.roi_volume,
            singular_values: global.singular_values,
            u: global.v,
        };
        let mut stats = RecordStats::new(header_len(&header));
        let mut writer = open(&header)?;

        let order: Vec<u32> = (1..=header.voxels).rev().collect();
        for batch in order.chunks(self.batch_size) {
            let records = batch
                .par_iter()
                .map(|&voxel| self.local_record(voxel, &source_basis, centroids, spacing, volume))
                .collect::<LocalizeResult<Vec<_>>>()?;
            for record in &records {
                writer.write_record(record)?;
                stats.add(record);
            }
        }

        let summary = ConcentrationSummary {
            voxels,
            channels,
            roi_volume: self.roi_volume,
            spacing,
            source_volume: volume,
            mean_roi_voxels: stats.roi_voxels as f64 / voxels as f64,
            min_leading_eigenvalue: stats.leading_min,
            mean_leading_eigenvalue: stats.leading_sum / voxels as f64,
            bytes_written: stats.bytes,
        };
        Ok((writer, summary))
    }

    fn local_record(
        &self,
        voxel: u32,
        source_basis: &Array2<f64>,
        centroids: ArrayView2<f64>,
        spacing: f64,
        volume: f64,
    ) -> LocalizeResult<VoxelRecord> {
        let roi = self
            .search
            .neighbours(self.roi_volume, voxel, centroids, spacing, volume);
        if roi.is_empty() {
            return Err(LocalizeError::Numerical(format!(
                "voxel {voxel} has an empty ROI"
            )));
        }

        let rows: Vec<usize> = roi.columns.iter().map(|&c| c as usize).collect();
        let restricted = source_basis.select(Axis(0), &rows);
        let local = thin_svd(restricted.view())?;
        let eigenvalues = local
            .singular_values
            .iter()
            .map(|e| (e * e).clamp(0.0, 1.0))
            .collect();

        Ok(VoxelRecord {
            voxel,
            roi_columns: roi.columns,
            roi_voxels: roi.voxels,
            eigenvalues,
            vp: local.v,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::concentration::format::ConcentrationReader;
    use crate::config::Neighbourhood;
    use crate::geometry::Roi;
    use ndarray::{Array2, ArrayView2};
    use std::io::Cursor;

    fn line(voxels: usize) -> Array2<f64> {
        Array2::from_shape_fn((voxels, 3), |(i, j)| if j == 0 { i as f64 } else { 0.0 })
    }

    /// Smooth, full-rank kernel decaying with distance from each sensor.
    fn kernel(channels: usize, voxels: usize) -> Array2<f64> {
        Array2::from_shape_fn((channels, 3 * voxels), |(c, col)| {
            let voxel = (col / 3) as f64;
            let sensor = c as f64 * (voxels as f64 - 1.0) / (channels as f64 - 1.0);
            let orientation = 1.0 + 0.25 * (col % 3) as f64;
            orientation / (1.0 + (voxel - sensor).powi(2))
        })
    }

    fn config(roi_volume: f64, neighbourhood: Neighbourhood) -> ConcentrationConfig {
        ConcentrationConfig {
            roi_volume: Some(roi_volume),
            neighbourhood,
            filename: Some("unused.cev".into()),
            batch_size: 3,
            ..ConcentrationConfig::default()
        }
    }

    fn solve(config: &ConcentrationConfig, k: ArrayView2<f64>, c: ArrayView2<f64>) -> Vec<u8> {
        let solver = ConcentrationSolver::new(config).unwrap();
        let (bytes, summary) = solver.solve_to(k, c, Vec::new()).unwrap();
        assert_eq!(summary.bytes_written, bytes.len() as u64);
        bytes
    }

    #[test]
    fn requires_roi_volume_and_filename() {
        let mut cfg = config(2.0, Neighbourhood::Ball);
        cfg.roi_volume = None;
        assert!(matches!(
            ConcentrationSolver::new(&cfg),
            Err(LocalizeError::Configuration(_))
        ));
        let mut cfg = config(2.0, Neighbourhood::Ball);
        cfg.filename = None;
        assert!(ConcentrationSolver::new(&cfg).is_err());
    }

    #[test]
    fn rejects_kernel_that_does_not_match_grid() {
        let solver = ConcentrationSolver::new(&config(2.0, Neighbourhood::Ball)).unwrap();
        let k = kernel(4, 6);
        let c = line(5);
        let err = solver.solve_to(k.view(), c.view(), Vec::new()).unwrap_err();
        assert!(matches!(err, LocalizeError::Consistency { field: "kernel columns", .. }));
    }

    #[test]
    fn rejects_unexpected_channel_count() {
        let mut cfg = config(2.0, Neighbourhood::Ball);
        cfg.channels = Some(5);
        let solver = ConcentrationSolver::new(&cfg).unwrap();
        let k = kernel(4, 6);
        let c = line(6);
        let err = solver.solve_to(k.view(), c.view(), Vec::new()).unwrap_err();
        assert!(matches!(err, LocalizeError::Consistency { field: "kernel rows", .. }));
    }

    #[test]
    fn records_are_orthonormal_and_ordered() {
        let k = kernel(5, 9);
        let c = line(9);
        let bytes = solve(&config(3.0, Neighbourhood::Nearest), k.view(), c.view());

        let mut reader = ConcentrationReader::new(Cursor::new(bytes)).unwrap();
        let channels = reader.header().channels();
        assert_eq!(channels, 5);
        let s = reader.header().singular_values.clone();
        assert!(s.iter().zip(s.iter().skip(1)).all(|(a, b)| a >= b));

        let u = reader.header().u.clone();
        let eye = Array2::<f64>::eye(channels);
        for (a, b) in u.t().dot(&u).iter().zip(eye.iter()) {
            assert!((a - b).abs() < 1e-9);
        }

        let mut expected = 9;
        while let Some(record) = reader.next_record().unwrap() {
            assert_eq!(record.voxel, expected);
            expected -= 1;

            assert_eq!(record.roi_voxels.len(), 3);
            assert_eq!(record.roi_columns.len(), 9);
            assert!(record.vp.ncols() <= record.roi_columns.len().min(channels));
            assert_eq!(record.vp.nrows(), channels);

            let gram = record.vp.t().dot(&record.vp);
            let eye = Array2::<f64>::eye(record.vp.ncols());
            for (a, b) in gram.iter().zip(eye.iter()) {
                assert!((a - b).abs() < 1e-9);
            }

            assert!(record.eigenvalues.windows(2).all(|w| w[0] >= w[1]));
            assert!(record
                .eigenvalues
                .iter()
                .all(|&e| (0.0..=1.0).contains(&e)));
        }
        assert_eq!(expected, 0);
        reader.finish().unwrap();
    }

    #[test]
    fn full_grid_roi_is_perfectly_concentrated() {
        let k = kernel(4, 6);
        let c = line(6);
        let bytes = solve(&config(1e4, Neighbourhood::Ball), k.view(), c.view());

        let mut reader = ConcentrationReader::new(Cursor::new(bytes)).unwrap();
        while let Some(record) = reader.next_record().unwrap() {
            assert_eq!(record.roi_voxels, (1..=6).collect::<Vec<u32>>());
            assert_eq!(record.eigenvalues.len(), 4);
            for e in &record.eigenvalues {
                assert!((e - 1.0).abs() < 1e-9);
            }
        }
    }

    #[test]
    fn single_voxel_roi_leaks() {
        let k = kernel(6, 8);
        let c = line(8);
        let bytes = solve(&config(1e-3, Neighbourhood::Ball), k.view(), c.view());

        let mut reader = ConcentrationReader::new(Cursor::new(bytes)).unwrap();
        while let Some(record) = reader.next_record().unwrap() {
            assert_eq!(record.roi_voxels, vec![record.voxel]);
            assert_eq!(record.eigenvalues.len(), 3);
            assert!(record.leading_eigenvalue() < 1.0);
        }
    }

    struct SelfOnly;

    impl NeighbourSearch for SelfOnly {
        fn neighbours(&self, _: f64, voxel: u32, _: ArrayView2<f64>, _: f64, _: f64) -> Roi {
            Roi::from_voxels(vec![voxel])
        }
    }

    #[test]
    fn custom_search_replaces_policy() {
        let k = kernel(4, 6);
        let c = line(6);
        let solver = ConcentrationSolver::new(&config(1e4, Neighbourhood::Ball))
            .unwrap()
            .with_search(Box::new(SelfOnly));
        let (bytes, summary) = solver.solve_to(k.view(), c.view(), Vec::new()).unwrap();
        assert!((summary.mean_roi_voxels - 1.0).abs() < 1e-12);

        let mut reader = ConcentrationReader::new(Cursor::new(bytes)).unwrap();
        while let Some(record) = reader.next_record().unwrap() {
            assert_eq!(record.roi_voxels, vec![record.voxel]);
        }
    }

    #[test]
    fn solve_writes_and_closes_file() {
        let dir = tempfile::tempdir().unwrap();
        let mut cfg = config(3.0, Neighbourhood::Nearest);
        cfg.dir = dir.path().join("nested");
        cfg.filename = Some("grid.cev".into());

        let k = kernel(4, 6);
        let c = line(6);
        let solver = ConcentrationSolver::new(&cfg).unwrap();
        let summary = solver.solve(k.view(), c.view()).unwrap();

        let on_disk = fs::metadata(solver.path()).unwrap().len();
        assert_eq!(on_disk, summary.bytes_written);
        assert_eq!(summary.voxels, 6);
        assert!((summary.spacing - 1.0).abs() < 1e-12);
        assert!((summary.mean_roi_voxels - 3.0).abs() < 1e-12);
    }

    /// Loses the ROI of one voxel, after earlier records were written.
    struct EmptyAt(u32);

    impl NeighbourSearch for EmptyAt {
        fn neighbours(&self, _: f64, voxel: u32, _: ArrayView2<f64>, _: f64, _: f64) -> Roi {
            if voxel == self.0 {
                Roi::from_voxels(Vec::new())
            } else {
                Roi::from_voxels(vec![voxel])
            }
        }
    }

    #[test]
    fn mid_run_failure_removes_partial_file() {
        let dir = tempfile::tempdir().unwrap();
        let mut cfg = config(3.0, Neighbourhood::Ball);
        cfg.dir = dir.path().to_path_buf();
        cfg.filename = Some("partial.cev".into());
        cfg.batch_size = 1;

        let k = kernel(4, 6);
        let c = line(6);
        let solver = ConcentrationSolver::new(&cfg)
            .unwrap()
            .with_search(Box::new(EmptyAt(2)));
        let err = solver.solve(k.view(), c.view()).unwrap_err();
        assert!(matches!(err, LocalizeError::Numerical(msg) if msg.contains("voxel 2")));
        assert!(!solver.path().exists());
    }

    #[test]
    fn unopenable_path_is_left_alone() {
        let dir = tempfile::tempdir().unwrap();
        let mut cfg = config(3.0, Neighbourhood::Ball);
        cfg.dir = dir.path().to_path_buf();
        cfg.filename = Some("occupied".into());
        let solver = ConcentrationSolver::new(&cfg).unwrap();
        fs::create_dir(solver.path()).unwrap();
        fs::write(solver.path().join("keep.txt"), b"kept").unwrap();

        let k = kernel(4, 6);
        let c = line(6);
        assert!(matches!(
            solver.solve(k.view(), c.view()),
            Err(LocalizeError::Io(_))
        ));
        assert_eq!(fs::read(solver.path().join("keep.txt")).unwrap(), b"kept");
    }

    #[test]
    fn early_failure_keeps_previous_artifact() {
        let dir = tempfile::tempdir().unwrap();
        let mut cfg = config(3.0, Neighbourhood::Nearest);
        cfg.dir = dir.path().to_path_buf();
        cfg.filename = Some("previous.cev".into());
        let solver = ConcentrationSolver::new(&cfg).unwrap();
        fs::write(solver.path(), b"previous run").unwrap();

        let mut k = kernel(4, 6);
        k[[1, 2]] = f64::INFINITY;
        let c = line(6);
        assert!(solver.solve(k.view(), c.view()).is_err());
        assert_eq!(fs::read(solver.path()).unwrap(), b"previous run");
    }

    #[test]
    fn failed_solve_leaves_no_file() {
        let dir = tempfile::tempdir().unwrap();
        let mut cfg = config(3.0, Neighbourhood::Nearest);
        cfg.dir = dir.path().to_path_buf();
        cfg.filename = Some("broken.cev".into());

        let mut k = kernel(4, 6);
        k[[0, 0]] = f64::NAN;
        let c = line(6);
        let solver = ConcentrationSolver::new(&cfg).unwrap();
        assert!(matches!(
            solver.solve(k.view(), c.view()),
            Err(LocalizeError::Numerical(_))
        ));
        assert!(!solver.path().exists());
    }
}
