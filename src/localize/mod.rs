//! Power localization from multi-taper sensor spectra and a concentration
//! file.

pub mod localizer;
pub mod power;
pub mod spectra;
pub mod truncation;

pub use localizer::PowerLocalizer;
pub use power::{LocalizationSummary, PowerMap, LEAKAGE_SENTINEL};
pub use spectra::SensorSpectra;
pub use truncation::{cut_index, whitening};
