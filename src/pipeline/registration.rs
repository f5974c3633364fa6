// Sub-pixel translation registration of each round onto a reference image by
// phase correlation, and resampling of every plane by the estimated shift.

use clap::ValueEnum;
use ndarray::{Array2, Array3, ArrayView2, Axis, Zip};
use rayon::prelude::*;
use rustfft::num_complex::Complex;
use rustfft::{Fft, FftPlanner};
use std::f64::consts::PI;
use std::sync::Arc;
use thiserror::Error;

use super::conv::transpose_into;
use super::image::{ImageTensor, Projection};
use super::PipelineError;

// Spectrum bins this far below the strongest bin carry no usable phase.
const SPECTRUM_FLOOR: f64 = 1e-9;

// Correlation peaks this close to the maximum are considered equal.
const PEAK_TOLERANCE: f64 = 1e-6;

#[derive(Copy, Clone, Debug, PartialEq, Eq, Default, ValueEnum)]
pub enum Interpolation {
    Nearest,
    Bilinear,
    #[default]
    Bicubic,
}

#[derive(Clone, Debug)]
pub struct RegistrationParams {
    // shifts are resolved to 1/upsample_factor pixels
    pub upsample_factor: usize,
    pub projection: Projection,
    pub interpolation: Interpolation,
}

impl Default for RegistrationParams {
    fn default() -> Self {
        RegistrationParams {
            upsample_factor: 100,
            projection: Projection::Max,
            interpolation: Interpolation::Bicubic,
        }
    }
}

/// Correction applied to a round: resampling computes
/// `out(x, y) = in(x - dx, y - dy)`.
#[derive(Copy, Clone, Debug, PartialEq, Default)]
pub struct ShiftVector {
    pub dx: f32,
    pub dy: f32,
}

impl ShiftVector {
    pub fn new(dx: f32, dy: f32) -> Self {
        ShiftVector { dx, dy }
    }

    pub fn magnitude(&self) -> f32 {
        self.dx.hypot(self.dy)
    }

    pub fn is_zero(&self) -> bool {
        self.dx == 0.0 && self.dy == 0.0
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Error)]
pub enum RegistrationFailure {
    #[error("round projection is flat")]
    FlatProjection,
    #[error("reference image is flat")]
    FlatReference,
    #[error("cross-power spectrum is degenerate")]
    DegenerateSpectrum,
    #[error("correlation peak is not finite")]
    NonFinitePeak,
}

impl RegistrationFailure {
    pub fn code(&self) -> u32 {
        match self {
            RegistrationFailure::FlatProjection => 1,
            RegistrationFailure::FlatReference => 2,
            RegistrationFailure::DegenerateSpectrum => 3,
            RegistrationFailure::NonFinitePeak => 4,
        }
    }
}

#[derive(Copy, Clone, Debug)]
pub struct ShiftEstimate {
    pub shift: ShiftVector,
    // sqrt(1 - normalized cross-correlation^2) at the estimated shift
    pub error: f32,
    pub ambiguous_peak: bool,
}

#[derive(Clone, Debug)]
pub struct RoundRegistration {
    pub round: usize,
    pub shift: ShiftVector,
    pub error: f32,
    pub ambiguous_peak: bool,
    // set when estimation failed and the round was left unshifted
    pub failure: Option<RegistrationFailure>,
}

// Register every round of `tensor` onto `reference`. Rounds whose shift can't
// be estimated are kept as they are, with the failure recorded.
pub fn register(
    tensor: &ImageTensor,
    reference: ArrayView2<f32>,
    params: &RegistrationParams,
) -> Result<(ImageTensor, Vec<RoundRegistration>), PipelineError> {
    super::check_shape("registration reference", tensor.plane_dim(), reference.dim())?;
    if params.upsample_factor == 0 {
        return Err(PipelineError::InvalidParameter(String::from(
            "upsample factor must be at least 1",
        )));
    }

    let correlator = PhaseCorrelator::new(reference);

    let results: Vec<(Array3<f32>, RoundRegistration)> = (0..tensor.n_rounds())
        .into_par_iter()
        .map(|round| {
            let projection = tensor.project_round(round, params.projection);
            let estimate = correlator
                .as_ref()
                .map_err(|failure| *failure)
                .and_then(|c| c.estimate(projection.view(), params.upsample_factor));

            let registration = match estimate {
                Ok(estimate) => RoundRegistration {
                    round,
                    shift: estimate.shift,
                    error: estimate.error,
                    ambiguous_peak: estimate.ambiguous_peak,
                    failure: None,
                },
                Err(failure) => RoundRegistration {
                    round,
                    shift: ShiftVector::default(),
                    error: 1.0,
                    ambiguous_peak: false,
                    failure: Some(failure),
                },
            };

            let mut shifted = tensor.round(round).to_owned();
            if !registration.shift.is_zero() {
                for mut plane in shifted.axis_iter_mut(Axis(0)) {
                    let resampled =
                        shift_image(plane.view(), registration.shift, params.interpolation);
                    plane.assign(&resampled);
                }
            }

            (shifted, registration)
        })
        .collect();

    let (rounds, registrations): (Vec<_>, Vec<_>) = results.into_iter().unzip();
    Ok((ImageTensor::from_rounds(rounds)?, registrations))
}

// Two dimensional FFT over row-major buffers indexed `x * height + y`.
struct Fft2 {
    width: usize,
    height: usize,
    row_forward: Arc<dyn Fft<f64>>,
    row_inverse: Arc<dyn Fft<f64>>,
    col_forward: Arc<dyn Fft<f64>>,
    col_inverse: Arc<dyn Fft<f64>>,
}

impl Fft2 {
    fn new(width: usize, height: usize) -> Self {
        let mut planner = FftPlanner::new();
        Fft2 {
            width,
            height,
            row_forward: planner.plan_fft_forward(height),
            row_inverse: planner.plan_fft_inverse(height),
            col_forward: planner.plan_fft_forward(width),
            col_inverse: planner.plan_fft_inverse(width),
        }
    }

    fn forward(&self, data: &mut [Complex<f64>]) {
        self.transform(data, &self.row_forward, &self.col_forward);
    }

    // Normalized inverse.
    fn inverse(&self, data: &mut [Complex<f64>]) {
        self.transform(data, &self.row_inverse, &self.col_inverse);
        let scale = 1.0 / (self.width * self.height) as f64;
        data.iter_mut().for_each(|v| *v *= scale);
    }

    fn transform(
        &self,
        data: &mut [Complex<f64>],
        rows: &Arc<dyn Fft<f64>>,
        cols: &Arc<dyn Fft<f64>>,
    ) {
        rows.process(data);
        let mut transposed = vec![Complex::new(0.0, 0.0); data.len()];
        transpose_into(data, self.width, self.height, &mut transposed);
        cols.process(&mut transposed);
        transpose_into(&transposed, self.height, self.width, data);
    }

    fn spectrum(&self, image: ArrayView2<f32>) -> Vec<Complex<f64>> {
        let mut data: Vec<Complex<f64>> =
            image.iter().map(|&v| Complex::new(v as f64, 0.0)).collect();
        self.forward(&mut data);
        data
    }
}

// Phase correlation against a fixed reference, whose spectrum is computed once
// and shared by every round.
struct PhaseCorrelator {
    fft: Fft2,
    reference: Vec<Complex<f64>>,
    reference_energy: f64,
}

impl PhaseCorrelator {
    fn new(reference: ArrayView2<f32>) -> Result<Self, RegistrationFailure> {
        if is_flat(reference) {
            return Err(RegistrationFailure::FlatReference);
        }
        let (width, height) = reference.dim();
        let fft = Fft2::new(width, height);
        let spectrum = fft.spectrum(reference);
        let reference_energy = spectrum.iter().map(|v| v.norm_sqr()).sum();

        Ok(PhaseCorrelator {
            fft,
            reference: spectrum,
            reference_energy,
        })
    }

    fn estimate(
        &self,
        moving: ArrayView2<f32>,
        upsample_factor: usize,
    ) -> Result<ShiftEstimate, RegistrationFailure> {
        if is_flat(moving) {
            return Err(RegistrationFailure::FlatProjection);
        }

        let moving_spectrum = self.fft.spectrum(moving);
        let moving_energy: f64 = moving_spectrum.iter().map(|v| v.norm_sqr()).sum();

        let product: Vec<Complex<f64>> = self
            .reference
            .iter()
            .zip(&moving_spectrum)
            .map(|(r, m)| r * m.conj())
            .collect();

        let max_norm = product.iter().fold(0.0_f64, |acc, v| acc.max(v.norm()));
        if !(max_norm > 0.0) || !max_norm.is_finite() {
            return Err(RegistrationFailure::DegenerateSpectrum);
        }

        let floor = SPECTRUM_FLOOR * max_norm;
        let mut correlation: Vec<Complex<f64>> = product
            .iter()
            .map(|&v| {
                let norm = v.norm();
                if norm > floor {
                    v / norm
                } else {
                    Complex::new(0.0, 0.0)
                }
            })
            .collect();
        self.fft.inverse(&mut correlation);

        let (coarse, ambiguous_peak) = self.coarse_peak(&correlation)?;
        let (dx, dy, peak) = self.refine(&product, coarse, upsample_factor);
        if !peak.is_finite() {
            return Err(RegistrationFailure::NonFinitePeak);
        }

        let ratio = peak * peak / (self.reference_energy * moving_energy);
        let error = (1.0 - ratio).abs().sqrt();

        Ok(ShiftEstimate {
            shift: ShiftVector::new(dx as f32, dy as f32),
            error: error as f32,
            ambiguous_peak,
        })
    }

    // Integer peak of the phase correlation surface. Equal peaks resolve to the
    // smallest shift, then the smallest (dx, dy).
    fn coarse_peak(
        &self,
        correlation: &[Complex<f64>],
    ) -> Result<((f64, f64), bool), RegistrationFailure> {
        let (width, height) = (self.fft.width, self.fft.height);

        let max = correlation
            .iter()
            .fold(f64::NEG_INFINITY, |acc, v| acc.max(v.re));
        if !max.is_finite() {
            return Err(RegistrationFailure::NonFinitePeak);
        }
        let tolerance = PEAK_TOLERANCE * max.abs();

        let mut peaks: Vec<(i64, i64)> = correlation
            .iter()
            .enumerate()
            .filter(|(_, v)| v.re >= max - tolerance)
            .map(|(i, _)| (wrap(i / height, width), wrap(i % height, height)))
            .collect();
        peaks.sort_by_key(|&(dx, dy)| (dx * dx + dy * dy, dx, dy));

        let (dx, dy) = peaks[0];
        Ok(((dx as f64, dy as f64), peaks.len() > 1))
    }

    // Search a window of ±0.75 pixels around the coarse peak on a grid of
    // 1/upsample_factor, evaluating the cross-correlation by a matrix
    // multiply DFT. Returns the refined shift and the correlation magnitude.
    fn refine(
        &self,
        product: &[Complex<f64>],
        coarse: (f64, f64),
        upsample_factor: usize,
    ) -> (f64, f64, f64) {
        let (width, height) = (self.fft.width, self.fft.height);
        let up = upsample_factor.max(1) as f64;
        let region = if upsample_factor > 1 {
            (1.5 * up).ceil() as usize
        } else {
            1
        };
        let center = (region / 2) as f64;
        let offsets: Vec<f64> = (0..region).map(|a| (a as f64 - center) / up).collect();

        let product = Array2::from_shape_fn((width, height), |(x, y)| product[x * height + y]);
        let kernel_x = dft_kernel(width, offsets.iter().map(|o| coarse.0 + o));
        let kernel_y = dft_kernel(height, offsets.iter().map(|o| coarse.1 + o));
        let upsampled = kernel_x.dot(&product.dot(&kernel_y.t()));

        let mut best = (0, 0, f64::NEG_INFINITY);
        for ((a, b), v) in upsampled.indexed_iter() {
            let norm = v.norm();
            if norm > best.2 {
                best = (a, b, norm);
            }
        }

        (
            coarse.0 + offsets[best.0],
            coarse.1 + offsets[best.1],
            best.2,
        )
    }
}

fn wrap(k: usize, n: usize) -> i64 {
    if k > n / 2 {
        k as i64 - n as i64
    } else {
        k as i64
    }
}

// Signed frequency of DFT bin `k`.
fn frequency(k: usize, n: usize) -> f64 {
    if k < (n + 1) / 2 {
        k as f64
    } else {
        k as f64 - n as f64
    }
}

// Rows evaluate the inverse DFT of a length `n` axis at the given positions.
fn dft_kernel(n: usize, positions: impl Iterator<Item = f64>) -> Array2<Complex<f64>> {
    let positions: Vec<f64> = positions.collect();
    Array2::from_shape_fn((positions.len(), n), |(a, k)| {
        Complex::from_polar(1.0, 2.0 * PI * frequency(k, n) * positions[a] / n as f64)
    })
}

fn is_flat(image: ArrayView2<f32>) -> bool {
    let (min, max) = image
        .iter()
        .fold((f32::INFINITY, f32::NEG_INFINITY), |(lo, hi), &v| {
            (lo.min(v), hi.max(v))
        });
    !(max > min)
}

// Resample `image` by `shift`. Output pixels whose source lies outside the
// image are zero; interpolated values are clamped to be non-negative.
pub fn shift_image(
    image: ArrayView2<f32>,
    shift: ShiftVector,
    interpolation: Interpolation,
) -> Array2<f32> {
    let mut out = Array2::zeros(image.dim());
    Zip::indexed(&mut out).par_for_each(|(x, y), o| {
        let sx = x as f32 - shift.dx;
        let sy = y as f32 - shift.dy;
        *o = interpolation.sample(image, sx, sy).max(0.0);
    });
    out
}

impl Interpolation {
    pub fn sample(&self, image: ArrayView2<f32>, x: f32, y: f32) -> f32 {
        const EPS: f32 = 1e-4;
        let (w, h) = image.dim();
        if x < -EPS || y < -EPS || x > (w - 1) as f32 + EPS || y > (h - 1) as f32 + EPS {
            return 0.0;
        }

        let clamp = |i: isize, n: usize| i.clamp(0, n as isize - 1) as usize;

        match self {
            Interpolation::Nearest => {
                image[[clamp(x.round() as isize, w), clamp(y.round() as isize, h)]]
            }
            Interpolation::Bilinear => {
                let (x0, y0) = (x.floor() as isize, y.floor() as isize);
                let (fx, fy) = (x - x0 as f32, y - y0 as f32);
                let p = |i: isize, j: isize| image[[clamp(i, w), clamp(j, h)]];

                let top = p(x0, y0) + fx * (p(x0 + 1, y0) - p(x0, y0));
                let bottom = p(x0, y0 + 1) + fx * (p(x0 + 1, y0 + 1) - p(x0, y0 + 1));
                top + fy * (bottom - top)
            }
            Interpolation::Bicubic => {
                let (x0, y0) = (x.floor() as isize, y.floor() as isize);
                let (fx, fy) = (x - x0 as f32, y - y0 as f32);
                let wx = [
                    cubic_weight(fx + 1.0),
                    cubic_weight(fx),
                    cubic_weight(fx - 1.0),
                    cubic_weight(fx - 2.0),
                ];
                let wy = [
                    cubic_weight(fy + 1.0),
                    cubic_weight(fy),
                    cubic_weight(fy - 1.0),
                    cubic_weight(fy - 2.0),
                ];

                let mut sum = 0.0;
                for (i, wxi) in wx.iter().enumerate() {
                    let px = clamp(x0 - 1 + i as isize, w);
                    for (j, wyj) in wy.iter().enumerate() {
                        let py = clamp(y0 - 1 + j as isize, h);
                        sum += image[[px, py]] * wxi * wyj;
                    }
                }
                sum
            }
        }
    }
}

// Keys cubic convolution kernel with a = -0.5.
fn cubic_weight(x: f32) -> f32 {
    const A: f32 = -0.5;
    let x = x.abs();
    if x <= 1.0 {
        ((A + 2.0) * x - (A + 3.0)) * x * x + 1.0
    } else if x < 2.0 {
        ((A * x - 5.0 * A) * x + 8.0 * A) * x - 4.0 * A
    } else {
        0.0
    }
}
