//! # Concentration Localizer
//!
//! Eigenvalue-based spatial localization of multi-taper EEG/MEG source power.
//!
//! Two phases share one binary artifact:
//!
//! 1. [`ConcentrationSolver`] decomposes a forward kernel
//!    (`channels × 3·voxels`), finds each voxel's region of interest and
//!    writes the local concentration spectrum of every voxel to a
//!    concentration file, in descending voxel order.
//! 2. [`PowerLocalizer`] streams that file and projects complex multi-taper
//!    sensor spectra onto each voxel's concentrated modes, producing a
//!    `frequency × time × voxel` [`PowerMap`]. Voxels whose ROI leaks too
//!    much energy hold [`LEAKAGE_SENTINEL`].
//!
//! ## Quick Start
//!
//! ```no_run
//! use concentration_localizer::{
//!     ConcentrationSolver, PowerLocalizer, SensorSpectra, StudyConfig,
//! };
//! use ndarray::{Array2, Array4};
//! use num_complex::Complex64;
//!
//! let config = StudyConfig::load_from_file("study.toml")?;
//! let kernel = Array2::<f64>::zeros((64, 3 * 500));
//! let centroids = Array2::<f64>::zeros((500, 3));
//!
//! let solver = ConcentrationSolver::new(&config.concentration)?;
//! solver.solve(kernel.view(), centroids.view())?;
//!
//! let spectra = SensorSpectra::new(Array4::<Complex64>::zeros((64, 3, 40, 10)));
//! let localizer = PowerLocalizer::new(&config.localize)?;
//! let power = localizer.localize(&spectra, solver.path())?;
//! println!("rejected voxels: {:?}", power.rejected_voxels());
//! # Ok::<(), concentration_localizer::LocalizeError>(())
//! ```
//!
//! ## Core Modules
//!
//! - [`config`] - Study configuration via TOML
//! - [`concentration`] - Concentration solver and file codec
//! - [`localize`] - Power localizer and output map
//! - [`geometry`] - Voxel spacing and ROI neighbour search
//! - [`logging`] - JSON line-delimited operation log

pub mod concentration;
pub mod config;
pub mod error;
pub mod geometry;
pub mod linalg;
pub mod localize;
pub mod logging;

pub use concentration::{
    ConcentrationHeader, ConcentrationReader, ConcentrationSolver, ConcentrationSummary,
    ConcentrationWriter, RecordIndex, VoxelRecord,
};
pub use config::{ConcentrationConfig, LocalizeConfig, Neighbourhood, StudyConfig};
pub use error::{LocalizeError, LocalizeResult};
pub use geometry::{BallSearch, NearestSearch, NeighbourSearch, Roi};
pub use localize::{
    LocalizationSummary, PowerLocalizer, PowerMap, SensorSpectra, LEAKAGE_SENTINEL,
};
