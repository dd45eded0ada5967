//! Concentration solver and the binary concentration file it produces.
//!
//! The solver runs once per (kernel, voxel grid) pair; its file is the
//! only input the power localizer needs besides the sensor spectra.

pub mod format;
pub mod solver;

pub use format::{
    ConcentrationHeader, ConcentrationReader, ConcentrationWriter, RecordIndex, VoxelRecord,
};
pub use solver::{ConcentrationSolver, ConcentrationSummary};
