//! Multi-taper sensor spectra, `channels × tapers × frequency × time`.

use ndarray::{Array2, Array3, Array4, ArrayD, Axis, Ix3, Ix4, Zip};
use num_complex::Complex64;

use crate::error::{LocalizeError, LocalizeResult};

/// Complex Fourier coefficients of tapered sensor data.
#[derive(Debug, Clone)]
pub struct SensorSpectra {
    data: Array4<Complex64>,
}

impl SensorSpectra {
    pub fn new(data: Array4<Complex64>) -> Self {
        Self { data }
    }

    /// Spectra of a single time window.
    pub fn single_window(data: Array3<Complex64>) -> Self {
        Self {
            data: data.insert_axis(Axis(3)),
        }
    }

    /// Accept rank 3 (one time window) or rank 4 input.
    pub fn from_dyn(data: ArrayD<Complex64>) -> LocalizeResult<Self> {
        match data.ndim() {
            3 => {
                let data = data
                    .into_dimensionality::<Ix3>()
                    .map_err(|err| LocalizeError::DataFormat(err.to_string()))?;
                Ok(Self::single_window(data))
            }
            4 => {
                let data = data
                    .into_dimensionality::<Ix4>()
                    .map_err(|err| LocalizeError::DataFormat(err.to_string()))?;
                Ok(Self::new(data))
            }
            rank => Err(LocalizeError::DataFormat(format!(
                "sensor spectra must have rank 3 or 4 (channels x tapers x frequency [x time]), got rank {rank}"
            ))),
        }
    }

    /// Assemble spectra from separately stored real and imaginary parts.
    /// The imaginary part is required: real-valued input is not a Fourier
    /// transform of tapered data.
    pub fn from_parts(real: ArrayD<f64>, imag: Option<ArrayD<f64>>) -> LocalizeResult<Self> {
        let imag = imag.ok_or_else(|| {
            LocalizeError::DataFormat("sensor spectra must be complex; imaginary part missing".into())
        })?;
        if real.shape() != imag.shape() {
            return Err(LocalizeError::DataFormat(format!(
                "real part shape {:?} differs from imaginary part shape {:?}",
                real.shape(),
                imag.shape()
            )));
        }
        let mut data = ArrayD::<Complex64>::zeros(real.raw_dim());
        Zip::from(&mut data)
            .and(&real)
            .and(&imag)
            .for_each(|out, &re, &im| *out = Complex64::new(re, im));
        Self::from_dyn(data)
    }

    pub fn data(&self) -> &Array4<Complex64> {
        &self.data
    }

    pub fn channels(&self) -> usize {
        self.data.len_of(Axis(0))
    }

    pub fn tapers(&self) -> usize {
        self.data.len_of(Axis(1))
    }

    pub fn frequencies(&self) -> usize {
        self.data.len_of(Axis(2))
    }

    pub fn windows(&self) -> usize {
        self.data.len_of(Axis(3))
    }

    /// Real and imaginary parts as `channels × (tapers·frequency·time)`
    /// matrices, column `j` holding taper `j / (F·T)`, frequency
    /// `(j / T) % F`, window `j % T`.
    pub(crate) fn split_columns(&self) -> (Array2<f64>, Array2<f64>) {
        let (channels, tapers, frequencies, windows) = self.data.dim();
        let cells = tapers * frequencies * windows;
        let index = |c: usize, j: usize| {
            let t = j % windows;
            let f = (j / windows) % frequencies;
            let k = j / (frequencies * windows);
            self.data[[c, k, f, t]]
        };
        (
            Array2::from_shape_fn((channels, cells), |(c, j)| index(c, j).re),
            Array2::from_shape_fn((channels, cells), |(c, j)| index(c, j).im),
        )
    }
}
