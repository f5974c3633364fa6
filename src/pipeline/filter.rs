// Background removal applied to every plane before registration.

use ndarray::{Array2, ArrayView2, Zip};

use super::conv::Conv2D;
use super::morphology::grey_opening;
use super::PipelineError;

pub trait ImageFilter: Sync {
    // Must return an image with the same shape as its input.
    fn filter(&self, image: ArrayView2<f32>) -> Result<Array2<f32>, PipelineError>;
}

#[derive(Copy, Clone, Debug, PartialEq)]
pub enum FilterKind {
    // Subtract the grey opening with a disk, keeping features smaller than the
    // disk and removing smooth background.
    WhiteTophat { radius: usize },
    GaussianLowPass { sigma: f32 },
}

impl ImageFilter for FilterKind {
    fn filter(&self, image: ArrayView2<f32>) -> Result<Array2<f32>, PipelineError> {
        match *self {
            FilterKind::WhiteTophat { radius } => Ok(white_tophat(image, radius)),
            FilterKind::GaussianLowPass { sigma } => gaussian_lowpass(image, sigma),
        }
    }
}

fn white_tophat(image: ArrayView2<f32>, radius: usize) -> Array2<f32> {
    let mut opened = grey_opening(image, radius);
    Zip::from(&mut opened).and(&image).for_each(|o, &v| {
        *o = (v - *o).max(0.0);
    });
    opened
}

fn gaussian_lowpass(image: ArrayView2<f32>, sigma: f32) -> Result<Array2<f32>, PipelineError> {
    if !(sigma > 0.0 && sigma.is_finite()) {
        return Err(PipelineError::InvalidParameter(format!(
            "low-pass sigma must be positive, got {}",
            sigma
        )));
    }

    let mut smoothed = image.to_owned();
    Conv2D::new(image.dim(), &gaussian_kernel(sigma))?.compute(&mut smoothed)?;

    // fft round-off can dip slightly below zero
    smoothed.mapv_inplace(|v| v.max(0.0));
    Ok(smoothed)
}

pub fn normal_pdf(σ: f32, x: f32) -> f32 {
    const SQRT_TWO_PI: f32 = 2.506_628_3_f32;
    (-0.5 * (x / σ).powi(2)).exp() / (σ * SQRT_TWO_PI)
}

// Kernel half-width covering four standard deviations.
pub fn kernel_radius(σ: f32) -> usize {
    ((4.0 * σ).ceil() as usize).max(1)
}

pub fn gaussian_kernel(σ: f32) -> Array2<f32> {
    let k = kernel_radius(σ);
    let mut kernel = Array2::zeros((1 + 2 * k, 1 + 2 * k));

    for i in 0..(1 + 2 * k) {
        for j in 0..(1 + 2 * k) {
            kernel[[i, j]] =
                normal_pdf(σ, i as f32 - k as f32) * normal_pdf(σ, j as f32 - k as f32);
        }
    }

    kernel /= kernel.sum();

    kernel
}
