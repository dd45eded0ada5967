//! Eigenvalue-weighted multi-taper power localization.
//!
//! For an accepted voxel with `m*` trustworthy modes, the sensor data at
//! each frequency and window is projected onto
//! `cV = (cutUS · Vp[..cut, ..m*])ᵀ` and
//! `P = Σ_m Σ_k λ_m |(cV · X)[m, k]|² / tapers`.

use std::io::Read;
use std::path::Path;

use ndarray::{s, Array1, Array2, Axis, Zip};
use serde::Serialize;

use super::power::{LocalizationSummary, PowerMap};
use super::spectra::SensorSpectra;
use super::truncation::{cut_index, whitening};
use crate::concentration::format::{ConcentrationReader, VoxelRecord};
use crate::config::LocalizeConfig;
use crate::error::{LocalizeError, LocalizeResult};
use crate::logging;

#[derive(Debug, Serialize)]
struct Leakage {
    voxel: u32,
    leading_eigenvalue: f64,
    leakage_db: f64,
}

/// Sensor spectra flattened once per run, `channels × (tapers·F·T)`.
struct ProjectionInput {
    re: Array2<f64>,
    im: Array2<f64>,
    tapers: usize,
    frequencies: usize,
    windows: usize,
}

impl ProjectionInput {
    fn new(spectra: &SensorSpectra) -> Self {
        let (re, im) = spectra.split_columns();
        Self {
            re,
            im,
            tapers: spectra.tapers(),
            frequencies: spectra.frequencies(),
            windows: spectra.windows(),
        }
    }

    /// `frequency × window` power for the projector `cv` (`m × channels`).
    fn power(&self, cv: &Array2<f64>, eigenvalues: &[f64]) -> LocalizeResult<Array2<f64>> {
        let projected_re = cv.dot(&self.re);
        let projected_im = cv.dot(&self.im);

        let mut energy = Array1::<f64>::zeros(self.re.ncols());
        let scale = 1.0 / self.tapers as f64;
        for (m, &eigenvalue) in eigenvalues.iter().enumerate() {
            let weight = eigenvalue * scale;
            Zip::from(&mut energy)
                .and(projected_re.row(m))
                .and(projected_im.row(m))
                .par_for_each(|out, &re, &im| *out += weight * (re * re + im * im));
        }

        let per_taper = energy
            .into_shape((self.tapers, self.frequencies, self.windows))
            .map_err(|err| LocalizeError::DataFormat(err.to_string()))?;
        Ok(per_taper.sum_axis(Axis(0)))
    }
}

/// Streams a concentration file and localizes sensor power voxel by voxel.
#[derive(Debug, Clone, Copy)]
pub struct PowerLocalizer {
    cut_off: f64,
    threshold: f64,
}

impl PowerLocalizer {
    pub fn new(config: &LocalizeConfig) -> LocalizeResult<Self> {
        config.validate()?;
        match (config.cut_off, config.threshold) {
            (Some(cut_off), Some(threshold)) => Ok(Self { cut_off, threshold }),
            _ => Err(LocalizeError::Configuration(
                "localize.cut_off and localize.threshold must be set".into(),
            )),
        }
    }

    pub fn cut_off(&self) -> f64 {
        self.cut_off
    }

    pub fn threshold(&self) -> f64 {
        self.threshold
    }

    pub fn localize<P: AsRef<Path>>(
        &self,
        spectra: &SensorSpectra,
        path: P,
    ) -> LocalizeResult<PowerMap> {
        let reader = ConcentrationReader::open(path)?;
        self.localize_from(spectra, reader)
    }

    /// Localize from an already opened concentration stream. The reader is
    /// consumed and dropped on every path; its header basis is already known
    /// to be `channels × channels`.
    pub fn localize_from<R: Read>(
        &self,
        spectra: &SensorSpectra,
        mut reader: ConcentrationReader<R>,
    ) -> LocalizeResult<PowerMap> {
        let header = reader.header();
        let channels = header.channels();
        if channels != spectra.channels() {
            return Err(LocalizeError::consistency(
                "channel count",
                channels,
                spectra.channels(),
            ));
        }

        let voxels = header.voxels as usize;
        let cut = cut_index(header.singular_values.view(), self.cut_off);
        let cut_us = whitening(header.u.view(), header.singular_values.view(), cut);
        let input = ProjectionInput::new(spectra);

        let mut map = PowerMap::new(spectra.frequencies(), spectra.windows(), voxels);
        let mut accepted = 0;
        while let Some(record) = reader.next_record()? {
            match self.voxel_power(&record, &cut_us, cut, &input)? {
                Some(estimate) => {
                    map.accept(record.voxel, &estimate);
                    accepted += 1;
                }
                None => {
                    map.reject(record.voxel);
                    let leading = record.leading_eigenvalue();
                    logging::record(
                        "leakage",
                        &Leakage {
                            voxel: record.voxel,
                            leading_eigenvalue: leading,
                            leakage_db: 10.0 * (1.0 - leading).log10(),
                        },
                    );
                }
            }
        }
        reader.finish()?;

        let summary = LocalizationSummary {
            voxels,
            accepted,
            rejected: voxels - accepted,
            cut_index: cut,
            channels,
            tapers: spectra.tapers(),
            frequencies: spectra.frequencies(),
            windows: spectra.windows(),
        };
        logging::record("localize_power", &summary);
        map.set_summary(summary);
        Ok(map)
    }

    /// `None` when the voxel's leading eigenvalue is below threshold.
    fn voxel_power(
        &self,
        record: &VoxelRecord,
        cut_us: &Array2<f64>,
        cut: usize,
        input: &ProjectionInput,
    ) -> LocalizeResult<Option<Array2<f64>>> {
        if record.eigenvalues.is_empty() || record.leading_eigenvalue() < self.threshold {
            return Ok(None);
        }

        let m_star = record.modes_above(self.threshold).min(record.vp.ncols());
        let conc_vectors = cut_us.dot(&record.vp.slice(s![..cut, ..m_star]));
        let cv = conc_vectors.reversed_axes();
        let estimate = input.power(&cv, &record.eigenvalues[..m_star])?;
        Ok(Some(estimate))
    }
}
