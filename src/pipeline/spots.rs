// Multi-scale Laplacian of Gaussian blob detection on a reference image, and
// per (round, channel) intensity measurement of every detected spot.

use clap::ValueEnum;
use ndarray::{s, Array2, ArrayView2};
use rayon::prelude::*;
use std::collections::HashMap;
use std::f32::consts::PI;

use super::conv::Conv2D;
use super::filter::kernel_radius;
use super::image::ImageTensor;
use super::PipelineError;

#[derive(Copy, Clone, Debug, PartialEq, Eq, Default, ValueEnum)]
pub enum ScaleSpacing {
    #[default]
    Linear,
    Log,
}

// Statistic used to summarize a spot's bounding box in each plane.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Default, ValueEnum)]
pub enum Measurement {
    #[default]
    Mean,
    Max,
}

#[derive(Clone, Debug)]
pub struct SpotDetectionParams {
    pub min_sigma: f32,
    pub max_sigma: f32,
    pub num_sigma: usize,
    pub threshold: f32,

    // candidates overlapping a stronger spot by more than this fraction of
    // the smaller disk are dropped
    pub overlap: f32,

    pub spacing: ScaleSpacing,
    pub measurement: Measurement,
}

impl Default for SpotDetectionParams {
    fn default() -> Self {
        SpotDetectionParams {
            min_sigma: 4.0,
            max_sigma: 6.0,
            num_sigma: 20,
            threshold: 0.01,
            overlap: 0.5,
            spacing: ScaleSpacing::Linear,
            measurement: Measurement::Mean,
        }
    }
}

// Inclusive pixel bounds.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct BoundingBox {
    pub x_min: usize,
    pub x_max: usize,
    pub y_min: usize,
    pub y_max: usize,
}

impl BoundingBox {
    fn around(x: f32, y: f32, radius: f32, dim: (usize, usize)) -> Self {
        let clamp = |v: f32, n: usize| (v.max(0.0) as usize).min(n - 1);
        BoundingBox {
            x_min: clamp((x - radius).floor(), dim.0),
            x_max: clamp((x + radius).ceil(), dim.0),
            y_min: clamp((y - radius).floor(), dim.1),
            y_max: clamp((y + radius).ceil(), dim.1),
        }
    }
}

#[derive(Clone, Debug)]
pub struct Spot {
    pub spot_id: usize,
    pub x: f32,
    pub y: f32,
    pub sigma: f32,
    pub radius: f32,
    pub response: f32,
    pub bbox: BoundingBox,

    // [round, channel]
    pub intensities: Array2<f32>,
}

/// Detected spots with their measured intensities, ordered by `spot_id`.
#[derive(Clone, Debug)]
pub struct EncoderTable {
    spots: Vec<Spot>,
    n_rounds: usize,
    n_channels: usize,
}

impl EncoderTable {
    pub fn new(
        spots: Vec<Spot>,
        n_rounds: usize,
        n_channels: usize,
    ) -> Result<Self, PipelineError> {
        for spot in &spots {
            super::check_shape(
                "spot intensities",
                (n_rounds, n_channels),
                spot.intensities.dim(),
            )?;
        }
        Ok(EncoderTable {
            spots,
            n_rounds,
            n_channels,
        })
    }

    pub fn spots(&self) -> &[Spot] {
        &self.spots
    }

    pub fn len(&self) -> usize {
        self.spots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.spots.is_empty()
    }

    pub fn n_rounds(&self) -> usize {
        self.n_rounds
    }

    pub fn n_channels(&self) -> usize {
        self.n_channels
    }
}

#[derive(Copy, Clone, Debug)]
struct Candidate {
    x: usize,
    y: usize,
    sigma: f32,
    response: f32,
}

impl Candidate {
    fn radius(&self) -> f32 {
        self.sigma * 2.0_f32.sqrt()
    }
}

pub fn detect(
    tensor: &ImageTensor,
    reference: ArrayView2<f32>,
    params: &SpotDetectionParams,
    verbose: bool,
) -> Result<EncoderTable, PipelineError> {
    super::check_shape("spot reference", tensor.plane_dim(), reference.dim())?;
    validate_params(params)?;

    let sigmas = sigmas(params);
    let responses = scale_space(reference, &sigmas)?;
    let candidates = local_maxima(&responses, &sigmas, params.threshold);
    let kept = prune_overlapping(candidates, params.overlap);

    let progress = super::progress_bar(kept.len() as u64, verbose);
    let spots: Vec<Spot> = kept
        .par_iter()
        .enumerate()
        .map(|(spot_id, candidate)| {
            let (x, y) = (candidate.x as f32, candidate.y as f32);
            let radius = candidate.radius();
            let bbox = BoundingBox::around(x, y, radius, tensor.plane_dim());
            let intensities = measure(tensor, &bbox, params.measurement);
            progress.inc(1);
            Spot {
                spot_id,
                x,
                y,
                sigma: candidate.sigma,
                radius,
                response: candidate.response,
                bbox,
                intensities,
            }
        })
        .collect();
    progress.finish_and_clear();

    EncoderTable::new(spots, tensor.n_rounds(), tensor.n_channels())
}

fn validate_params(params: &SpotDetectionParams) -> Result<(), PipelineError> {
    if !(params.min_sigma > 0.0) || !(params.max_sigma >= params.min_sigma) {
        return Err(PipelineError::InvalidParameter(format!(
            "sigma range must satisfy 0 < min <= max, got {}..{}",
            params.min_sigma, params.max_sigma
        )));
    }
    if params.num_sigma == 0 {
        return Err(PipelineError::InvalidParameter(String::from(
            "num_sigma must be at least 1",
        )));
    }
    if !params.threshold.is_finite() {
        return Err(PipelineError::InvalidParameter(String::from(
            "spot threshold must be finite",
        )));
    }
    if !(0.0..=1.0).contains(&params.overlap) {
        return Err(PipelineError::InvalidParameter(format!(
            "overlap must be in [0, 1], got {}",
            params.overlap
        )));
    }
    Ok(())
}

pub fn sigmas(params: &SpotDetectionParams) -> Vec<f32> {
    let n = params.num_sigma;
    if n <= 1 {
        return vec![params.min_sigma];
    }

    let step = |lo: f32, hi: f32, i: usize| lo + (hi - lo) * i as f32 / (n - 1) as f32;
    match params.spacing {
        ScaleSpacing::Linear => (0..n)
            .map(|i| step(params.min_sigma, params.max_sigma, i))
            .collect(),
        ScaleSpacing::Log => (0..n)
            .map(|i| step(params.min_sigma.ln(), params.max_sigma.ln(), i).exp())
            .collect(),
    }
}

// Laplacian of Gaussian kernel, truncated at 4σ and shifted to sum to zero so
// that flat regions give no response.
pub fn log_kernel(σ: f32) -> Array2<f32> {
    let k = kernel_radius(σ) as isize;
    let σ2 = σ * σ;
    let mut kernel = Array2::from_shape_fn((2 * k as usize + 1, 2 * k as usize + 1), |(i, j)| {
        let r2 = ((i as isize - k).pow(2) + (j as isize - k).pow(2)) as f32;
        -(1.0 / (PI * σ2 * σ2)) * (1.0 - r2 / (2.0 * σ2)) * (-r2 / (2.0 * σ2)).exp()
    });
    let mean = kernel.sum() / kernel.len() as f32;
    kernel -= mean;
    kernel
}

// Scale normalized blob response, -σ² (LoG_σ ∗ image), one plane per scale.
fn scale_space(
    image: ArrayView2<f32>,
    sigmas: &[f32],
) -> Result<Vec<Array2<f32>>, PipelineError> {
    sigmas
        .par_iter()
        .map(|&σ| -> Result<Array2<f32>, PipelineError> {
            let mut conv = Conv2D::new(image.dim(), &log_kernel(σ))?;
            let mut response = image.to_owned();
            conv.compute(&mut response)?;
            response *= -σ * σ;
            Ok(response)
        })
        .collect()
}

// Pixels strictly above threshold that are no smaller than any neighbour in
// their 3x3x3 scale-space neighbourhood.
fn local_maxima(responses: &[Array2<f32>], sigmas: &[f32], threshold: f32) -> Vec<Candidate> {
    let nscales = responses.len();
    (0..nscales)
        .into_par_iter()
        .flat_map_iter(|s| {
            let response = &responses[s];
            let (w, h) = response.dim();
            let scales = s.saturating_sub(1)..(s + 2).min(nscales);
            response
                .indexed_iter()
                .filter(move |&((x, y), &v)| {
                    v > threshold
                        && scales.clone().all(|t| {
                            let xs = x.saturating_sub(1)..(x + 2).min(w);
                            xs.into_iter().all(|nx| {
                                (y.saturating_sub(1)..(y + 2).min(h))
                                    .all(|ny| responses[t][[nx, ny]] <= v)
                            })
                        })
                })
                .map(move |((x, y), &v)| Candidate {
                    x,
                    y,
                    sigma: sigmas[s],
                    response: v,
                })
        })
        .collect()
}

// Sort strongest first and greedily drop candidates that overlap an already
// kept spot too much.
fn prune_overlapping(mut candidates: Vec<Candidate>, overlap: f32) -> Vec<Candidate> {
    candidates.sort_by(|a, b| {
        b.response
            .total_cmp(&a.response)
            .then(a.y.cmp(&b.y))
            .then(a.x.cmp(&b.x))
            .then(a.sigma.total_cmp(&b.sigma))
    });

    let max_radius = candidates
        .iter()
        .fold(0.0_f32, |acc, c| acc.max(c.radius()));
    let cell_size = (2.0 * max_radius).max(1.0);
    let cell = |c: &Candidate| {
        (
            (c.x as f32 / cell_size).floor() as i64,
            (c.y as f32 / cell_size).floor() as i64,
        )
    };

    let mut kept: Vec<Candidate> = Vec::new();
    let mut grid: HashMap<(i64, i64), Vec<usize>> = HashMap::new();
    for candidate in candidates {
        let (i, j) = cell(&candidate);
        let conflicts = (i - 1..=i + 1).any(|ni| {
            (j - 1..=j + 1).any(|nj| {
                grid.get(&(ni, nj)).is_some_and(|indices| {
                    indices.iter().any(|&k| {
                        let other = &kept[k];
                        let d = (candidate.x as f32 - other.x as f32)
                            .hypot(candidate.y as f32 - other.y as f32);
                        disk_overlap(d, candidate.radius(), other.radius()) > overlap
                    })
                })
            })
        });

        if !conflicts {
            grid.entry((i, j)).or_default().push(kept.len());
            kept.push(candidate);
        }
    }

    kept
}

// Area of the intersection of two disks at distance `d`, as a fraction of the
// smaller disk.
pub fn disk_overlap(d: f32, r1: f32, r2: f32) -> f32 {
    if d >= r1 + r2 {
        return 0.0;
    }
    if d <= (r1 - r2).abs() {
        return 1.0;
    }

    let ratio1 = ((d * d + r1 * r1 - r2 * r2) / (2.0 * d * r1)).clamp(-1.0, 1.0);
    let ratio2 = ((d * d + r2 * r2 - r1 * r1) / (2.0 * d * r2)).clamp(-1.0, 1.0);
    let a = -d + r2 + r1;
    let b = d - r2 + r1;
    let c = d + r2 - r1;
    let e = d + r2 + r1;
    let area = r1 * r1 * ratio1.acos() + r2 * r2 * ratio2.acos()
        - 0.5 * (a * b * c * e).abs().sqrt();

    area / (PI * r1.min(r2).powi(2))
}

fn measure(tensor: &ImageTensor, bbox: &BoundingBox, measurement: Measurement) -> Array2<f32> {
    Array2::from_shape_fn((tensor.n_rounds(), tensor.n_channels()), |(r, c)| {
        let plane = tensor.plane(r, c);
        let window = plane.slice(s![bbox.x_min..=bbox.x_max, bbox.y_min..=bbox.y_max]);
        match measurement {
            Measurement::Mean => window.mean().unwrap_or(0.0),
            Measurement::Max => window.fold(0.0_f32, |acc, &v| acc.max(v)),
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::Array4;

    fn blob(dim: (usize, usize), cx: f32, cy: f32, sigma: f32, amplitude: f32) -> Array2<f32> {
        Array2::from_shape_fn(dim, |(x, y)| {
            let d2 = (x as f32 - cx).powi(2) + (y as f32 - cy).powi(2);
            amplitude * (-d2 / (2.0 * sigma * sigma)).exp()
        })
    }

    fn params() -> SpotDetectionParams {
        SpotDetectionParams {
            min_sigma: 1.0,
            max_sigma: 3.0,
            num_sigma: 5,
            threshold: 0.05,
            ..SpotDetectionParams::default()
        }
    }

    fn tensor_from(planes: &[Array2<f32>], nrounds: usize, nchannels: usize) -> ImageTensor {
        let (w, h) = planes[0].dim();
        let mut data = Array4::zeros((nrounds, nchannels, w, h));
        for (i, plane) in planes.iter().enumerate() {
            data.slice_mut(s![i / nchannels, i % nchannels, .., ..])
                .assign(plane);
        }
        ImageTensor::new(data).unwrap()
    }

    #[test]
    fn test_sigma_spacing() {
        let linear = sigmas(&params());
        assert_eq!(linear.len(), 5);
        for (a, b) in linear.iter().zip([1.0, 1.5, 2.0, 2.5, 3.0]) {
            assert!((a - b).abs() < 1e-6);
        }

        let log = sigmas(&SpotDetectionParams {
            min_sigma: 1.0,
            max_sigma: 4.0,
            num_sigma: 3,
            spacing: ScaleSpacing::Log,
            ..params()
        });
        for (a, b) in log.iter().zip([1.0, 2.0, 4.0]) {
            assert!((a - b).abs() < 1e-5);
        }
    }

    #[test]
    fn test_log_kernel_sums_to_zero() {
        let kernel = log_kernel(2.0);
        assert_eq!(kernel.dim(), (17, 17));
        assert!(kernel.sum().abs() < 1e-5);
        assert!(kernel[[8, 8]] < 0.0);
    }

    #[test]
    fn test_disk_overlap() {
        assert_eq!(disk_overlap(5.0, 1.0, 1.0), 0.0);
        assert_eq!(disk_overlap(0.0, 2.0, 1.0), 1.0);
        assert!((disk_overlap(1.0, 1.0, 1.0) - 0.391).abs() < 1e-3);
    }

    #[test]
    fn test_single_spot_center_and_scale() {
        let dim = (64, 64);
        let image = blob(dim, 30.0, 25.0, 2.0, 1.0);
        let tensor = tensor_from(&[image.clone(), Array2::zeros(dim)], 1, 2);

        let table = detect(&tensor, image.view(), &params(), false).unwrap();
        assert_eq!(table.len(), 1);

        let spot = &table.spots()[0];
        assert_eq!(spot.spot_id, 0);
        assert!((spot.x - 30.0).abs() <= 1.0);
        assert!((spot.y - 25.0).abs() <= 1.0);
        assert!((spot.radius - 2.0 * 2.0_f32.sqrt()).abs() < 0.75);
        assert!((spot.response - 0.5).abs() < 0.05);
        assert_eq!(spot.intensities.dim(), (1, 2));
        assert!(spot.intensities[[0, 0]] > 0.0);
        assert_eq!(spot.intensities[[0, 1]], 0.0);
    }

    #[test]
    fn test_spot_ids_follow_response() {
        let dim = (64, 64);
        let mut image = blob(dim, 20.0, 40.0, 2.0, 0.6);
        image += &blob(dim, 44.0, 18.0, 2.0, 1.0);
        let tensor = tensor_from(&[image.clone()], 1, 1);

        let table = detect(&tensor, image.view(), &params(), false).unwrap();
        assert_eq!(table.len(), 2);
        assert_eq!(table.spots()[0].x, 44.0);
        assert_eq!(table.spots()[1].x, 20.0);
        assert_eq!(table.spots()[1].spot_id, 1);
    }

    #[test]
    fn test_measurement_statistics() {
        let dim = (32, 32);
        let reference = blob(dim, 16.0, 16.0, 2.0, 1.0);
        let mut plane = Array2::from_elem(dim, 2.0_f32);
        plane[[16, 16]] = 10.0;
        let tensor = tensor_from(&[plane], 1, 1);

        let table = detect(&tensor, reference.view(), &params(), false).unwrap();
        assert_eq!(table.len(), 1);
        let mean = table.spots()[0].intensities[[0, 0]];
        assert!(mean > 2.0 && mean < 10.0);

        let max_params = SpotDetectionParams {
            measurement: Measurement::Max,
            ..params()
        };
        let table = detect(&tensor, reference.view(), &max_params, false).unwrap();
        assert_eq!(table.spots()[0].intensities[[0, 0]], 10.0);
    }

    #[test]
    fn test_bounding_box_clamped() {
        let bbox = BoundingBox::around(1.0, 30.0, 2.5, (32, 32));
        assert_eq!(bbox.x_min, 0);
        assert_eq!(bbox.x_max, 4);
        assert_eq!(bbox.y_min, 27);
        assert_eq!(bbox.y_max, 31);
    }

    #[test]
    fn test_empty_reference_has_no_spots() {
        let dim = (32, 32);
        let tensor = tensor_from(&[Array2::zeros(dim)], 1, 1);
        let table = detect(&tensor, Array2::zeros(dim).view(), &params(), false).unwrap();
        assert!(table.is_empty());
    }

    #[test]
    fn test_rejects_bad_sigma_range() {
        let dim = (8, 8);
        let tensor = tensor_from(&[Array2::zeros(dim)], 1, 1);
        let bad = SpotDetectionParams {
            min_sigma: 3.0,
            max_sigma: 1.0,
            ..params()
        };
        let result = detect(&tensor, Array2::zeros(dim).view(), &bad, false);
        assert!(matches!(result, Err(PipelineError::InvalidParameter(_))));
    }
}
