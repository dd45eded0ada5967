use std::path::Path;

use concentration_localizer::localize::cut_index;
use concentration_localizer::{
    logging, ConcentrationReader, ConcentrationSolver, ConcentrationWriter, LocalizeError,
    PowerLocalizer, SensorSpectra, StudyConfig, VoxelRecord, LEAKAGE_SENTINEL,
};
use ndarray::{Array2, ArrayD, IxDyn};
use num_complex::Complex64;

const CHANNELS: usize = 4;
const VOXELS: usize = 8;

fn quiet_logs() {
    logging::set_log_dir(std::env::temp_dir().join("concentration_localizer_test_logs"));
}

/// Voxels 1..=8 on the x axis, unit spacing.
fn line() -> Array2<f64> {
    Array2::from_shape_fn((VOXELS, 3), |(i, j)| if j == 0 { i as f64 } else { 0.0 })
}

/// Channel `c` sees the x-dipole of voxels `c + 1` and `c + 5`.
fn identity_like_kernel() -> Array2<f64> {
    Array2::from_shape_fn((CHANNELS, 3 * VOXELS), |(c, col)| {
        let voxel = col / 3;
        if col % 3 == 0 && voxel % CHANNELS == c {
            1.0
        } else {
            0.0
        }
    })
}

fn study(dir: &Path, roi_volume: f64, cut_off: f64, threshold: f64) -> StudyConfig {
    let toml = format!(
        "[concentration]\nroi_volume = {roi_volume}\nneighbourhood = \"ball\"\n\
         dir = {dir:?}\nfilename = \"line.cev\"\nbatch_size = 3\nchannels = {CHANNELS}\n\n\
         [localize]\ncut_off = {cut_off}\nthreshold = {threshold}\n",
        dir = dir.display().to_string(),
    );
    let config = StudyConfig::from_str(&toml).unwrap();
    config.validate().unwrap();
    config
}

/// Unit impulse in every channel: a flat spectrum, 1 at DC.
fn dc_impulse() -> SensorSpectra {
    let data = ArrayD::from_elem(IxDyn(&[CHANNELS, 1, 1]), Complex64::new(1.0, 0.0));
    SensorSpectra::from_dyn(data).unwrap()
}

fn read_all(path: &Path) -> (concentration_localizer::ConcentrationHeader, Vec<VoxelRecord>) {
    let mut reader = ConcentrationReader::open(path).unwrap();
    let header = reader.header().clone();
    let mut records = Vec::new();
    while let Some(record) = reader.next_record().unwrap() {
        records.push(record);
    }
    reader.finish().unwrap();
    (header, records)
}

#[test]
fn line_grid_scenario() {
    quiet_logs();
    let dir = tempfile::tempdir().unwrap();
    let config = study(dir.path(), 5000.0, 0.0, 0.5);

    let solver = ConcentrationSolver::new(&config.concentration).unwrap();
    let summary = solver
        .solve(identity_like_kernel().view(), line().view())
        .unwrap();
    assert_eq!(summary.voxels, VOXELS);
    assert_eq!(summary.channels, CHANNELS);
    assert!((summary.mean_roi_voxels - VOXELS as f64).abs() < 1e-12);

    let (header, records) = read_all(solver.path());
    assert_eq!(cut_index(header.singular_values.view(), 0.0), CHANNELS);
    for s in header.singular_values.iter() {
        assert!((s - 2f64.sqrt()).abs() < 1e-10);
    }

    // Force odd voxels to full concentration and even voxels to none.
    let forced = dir.path().join("forced.cev");
    let mut writer = ConcentrationWriter::create(&forced, &header).unwrap();
    for mut record in records {
        let value = if record.voxel % 2 == 1 { 1.0 } else { 0.0 };
        record.eigenvalues.iter_mut().for_each(|e| *e = value);
        writer.write_record(&record).unwrap();
    }
    writer.close().unwrap();

    let localizer = PowerLocalizer::new(&config.localize).unwrap();
    let map = localizer.localize(&dc_impulse(), &forced).unwrap();
    assert_eq!(map.power().dim(), (1, 1, VOXELS));
    assert_eq!(map.summary().cut_index, CHANNELS);

    for voxel in 1..=VOXELS as u32 {
        let value = map.voxel(voxel).unwrap()[[0, 0]];
        if voxel % 2 == 1 {
            assert!(!map.is_rejected(voxel));
            assert!(value.is_finite() && value > 0.0, "voxel {voxel}: {value}");
            // ‖S⁻¹Uᵀx‖² with S = √2·I and ‖x‖² = 4.
            assert!((value - 2.0).abs() < 1e-9, "voxel {voxel}: {value}");
        } else {
            assert!(map.is_rejected(voxel));
            assert_eq!(value, LEAKAGE_SENTINEL);
        }
    }
    assert_eq!(map.summary().rejected, VOXELS / 2);
}

#[test]
fn concentration_file_round_trips_bit_for_bit() {
    quiet_logs();
    let dir = tempfile::tempdir().unwrap();
    let config = study(dir.path(), 20.0, 0.0, 0.5);
    let solver = ConcentrationSolver::new(&config.concentration).unwrap();
    solver
        .solve(identity_like_kernel().view(), line().view())
        .unwrap();

    let (header, records) = read_all(solver.path());
    let copy = dir.path().join("copy.cev");
    let mut writer = ConcentrationWriter::create(&copy, &header).unwrap();
    for record in &records {
        writer.write_record(record).unwrap();
    }
    writer.close().unwrap();

    let original = std::fs::read(solver.path()).unwrap();
    let rewritten = std::fs::read(&copy).unwrap();
    assert_eq!(original, rewritten);

    let (header_again, records_again) = read_all(&copy);
    assert_eq!(header, header_again);
    assert_eq!(records, records_again);
}

#[test]
fn index_reads_match_streaming_reads() {
    quiet_logs();
    let dir = tempfile::tempdir().unwrap();
    let config = study(dir.path(), 20.0, 0.0, 0.5);
    let solver = ConcentrationSolver::new(&config.concentration).unwrap();
    solver
        .solve(identity_like_kernel().view(), line().view())
        .unwrap();

    let (_, records) = read_all(solver.path());
    let mut reader = ConcentrationReader::open(solver.path()).unwrap();
    let index = reader.build_index().unwrap();
    assert_eq!(index.len(), VOXELS);
    for record in records.iter().rev() {
        assert_eq!(&reader.read_record_at(&index, record.voxel).unwrap(), record);
    }
}

#[test]
fn localizer_rejects_mismatched_sensor_count() {
    quiet_logs();
    let dir = tempfile::tempdir().unwrap();
    let config = study(dir.path(), 20.0, 0.0, 0.5);
    let solver = ConcentrationSolver::new(&config.concentration).unwrap();
    solver
        .solve(identity_like_kernel().view(), line().view())
        .unwrap();

    let data = ArrayD::from_elem(IxDyn(&[CHANNELS + 1, 1, 1, 1]), Complex64::new(1.0, 0.0));
    let spectra = SensorSpectra::from_dyn(data).unwrap();
    let localizer = PowerLocalizer::new(&config.localize).unwrap();
    let err = localizer.localize(&spectra, solver.path()).unwrap_err();
    assert!(matches!(err, LocalizeError::Consistency { .. }));
}

#[test]
fn missing_concentration_file_is_io_error() {
    quiet_logs();
    let dir = tempfile::tempdir().unwrap();
    let config = study(dir.path(), 20.0, 0.0, 0.5);
    let localizer = PowerLocalizer::new(&config.localize).unwrap();
    let err = localizer
        .localize(&dc_impulse(), dir.path().join("absent.cev"))
        .unwrap_err();
    assert!(matches!(err, LocalizeError::Io(_)));
}
