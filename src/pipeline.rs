pub mod assignment;
pub mod codebook;
mod conv;
pub mod decoding;
pub mod filter;
pub mod image;
mod morphology;
pub mod registration;
pub mod segmentation;
pub mod spots;

use indicatif::{ProgressBar, ProgressStyle};
use ndarray::{Array2, ArrayView2};
use thiserror::Error;

use assignment::{assign, ResultRecord};
use codebook::{Codebook, CodebookError};
use decoding::{DecodedSpot, Decoder, DecoderKind};
use filter::{FilterKind, ImageFilter};
use image::{ImageTensor, Projection};
use registration::{register, RegistrationParams, RoundRegistration};
use segmentation::{segment, LabelMask, SegmentationParams};
use spots::{detect, EncoderTable, SpotDetectionParams};

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("{what} has shape {found:?}, expected {expected:?}")]
    ShapeMismatch {
        what: &'static str,
        expected: (usize, usize),
        found: (usize, usize),
    },
    #[error("codebook codes have length {code_length} but the image stack has {rounds} rounds")]
    CodeLengthMismatch { code_length: usize, rounds: usize },
    #[error("codebook alphabet has {symbols} symbols but the image stack has {channels} channels")]
    AlphabetMismatch { symbols: usize, channels: usize },
    #[error("invalid image stack: {0}")]
    InvalidTensor(String),
    #[error("invalid parameter: {0}")]
    InvalidParameter(String),
    #[error("fft failed: {0}")]
    Fft(String),
    #[error(transparent)]
    Codebook(#[from] CodebookError),
}

// Everything needed to process one field of view.
pub struct FieldOfView {
    pub tensor: ImageTensor,
    pub dots: Array2<f32>,
    pub nuclei: Array2<f32>,
}

#[derive(Clone, Debug)]
pub struct PipelineConfig {
    pub filter: Option<FilterKind>,
    pub registration: RegistrationParams,
    pub detection: SpotDetectionParams,
    pub decoder: DecoderKind,
    pub segmentation: SegmentationParams,

    // channel projection used to build the cytoplasmic stain from the
    // registered stack
    pub stain_projection: Projection,

    // scale nuclear and stain images to a maximum of 1 before thresholding
    pub normalize_stains: bool,

    pub verbose: bool,
}

pub struct PipelineOutput {
    pub registration: Vec<RoundRegistration>,

    // filtered and registered image stack
    pub registered: ImageTensor,

    pub encoder_table: EncoderTable,
    pub labels: LabelMask,
    pub records: Vec<ResultRecord>,
}

pub fn run_pipeline(
    fov: &FieldOfView,
    codebook: &Codebook,
    config: &PipelineConfig,
) -> Result<PipelineOutput, PipelineError> {
    validate_inputs(fov, codebook)?;

    let (tensor, dots, nuclei) = match &config.filter {
        Some(filter) => {
            narrate(config.verbose, "Filtering images...");
            let progress = progress_bar(
                (fov.tensor.n_rounds() * fov.tensor.n_channels()) as u64,
                config.verbose,
            );
            let tensor = fov.tensor.map_planes(|plane| {
                let filtered = filter.filter(plane);
                progress.inc(1);
                filtered
            })?;
            progress.finish_and_clear();
            (
                tensor,
                filter.filter(fov.dots.view())?,
                filter.filter(fov.nuclei.view())?,
            )
        }
        None => (fov.tensor.clone(), fov.dots.clone(), fov.nuclei.clone()),
    };

    narrate(config.verbose, "Registering rounds...");
    let (registered, registration) = register(&tensor, dots.view(), &config.registration)?;
    if config.verbose {
        for round in &registration {
            match &round.failure {
                Some(failure) => println!(
                    "  round {}: registration failed ({}, code {}), using zero shift",
                    round.round,
                    failure,
                    failure.code()
                ),
                None => println!(
                    "  round {}: shift ({:.3}, {:.3}), |shift| {:.3}, error {:.4}",
                    round.round,
                    round.shift.dx,
                    round.shift.dy,
                    round.shift.magnitude(),
                    round.error
                ),
            }
        }
    }

    // Segmentation only depends on the registered stack, so it runs alongside
    // detection and decoding.
    let (decoding_result, segmentation_result) = rayon::join(
        || -> Result<(EncoderTable, Vec<DecodedSpot>), PipelineError> {
            let encoder_table = detect(
                &registered,
                dots.view(),
                &config.detection,
                config.verbose,
            )?;
            if encoder_table.is_empty() {
                narrate(config.verbose, "No spots detected");
            } else {
                narrate(
                    config.verbose,
                    &format!("Detected {} spots", encoder_table.len()),
                );
            }
            let decoded = config.decoder.decode(&encoder_table, codebook)?;
            Ok((encoder_table, decoded))
        },
        || -> Result<LabelMask, PipelineError> {
            let stain = registered.stain_image(config.stain_projection);
            if config.normalize_stains {
                segment(
                    normalize_max(nuclei.view()).view(),
                    normalize_max(stain.view()).view(),
                    &config.segmentation,
                )
            } else {
                segment(nuclei.view(), stain.view(), &config.segmentation)
            }
        },
    );
    let (encoder_table, decoded) = decoding_result?;
    let labels = segmentation_result?;

    if config.verbose {
        let ngenes = decoded.iter().filter(|d| d.gene.is_some()).count();
        println!(
            "Decoded {} spots ({} matched to a gene)",
            decoded.len(),
            ngenes
        );
        let areas = labels.areas();
        if areas.is_empty() {
            println!("Segmented 0 cells");
        } else {
            println!(
                "Segmented {} cells (mean area {:.1} pixels)",
                labels.n_labels(),
                areas.iter().sum::<usize>() as f64 / areas.len() as f64
            );
        }
    }

    let records = assign(&decoded, &labels);

    Ok(PipelineOutput {
        registration,
        registered,
        encoder_table,
        labels,
        records,
    })
}

fn validate_inputs(fov: &FieldOfView, codebook: &Codebook) -> Result<(), PipelineError> {
    let tensor = &fov.tensor;
    if codebook.code_length() != tensor.n_rounds() {
        return Err(PipelineError::CodeLengthMismatch {
            code_length: codebook.code_length(),
            rounds: tensor.n_rounds(),
        });
    }
    if codebook.n_symbols() != tensor.n_channels() {
        return Err(PipelineError::AlphabetMismatch {
            symbols: codebook.n_symbols(),
            channels: tensor.n_channels(),
        });
    }
    check_shape("dots image", tensor.plane_dim(), fov.dots.dim())?;
    check_shape("nuclei image", tensor.plane_dim(), fov.nuclei.dim())?;
    Ok(())
}

pub fn check_shape(
    what: &'static str,
    expected: (usize, usize),
    found: (usize, usize),
) -> Result<(), PipelineError> {
    if expected != found {
        return Err(PipelineError::ShapeMismatch {
            what,
            expected,
            found,
        });
    }
    Ok(())
}

// Divide by the image maximum. All-zero images are left as they are.
fn normalize_max(image: ArrayView2<f32>) -> Array2<f32> {
    let max = image.fold(0.0_f32, |acc, &v| acc.max(v));
    if max > 0.0 {
        image.mapv(|v| v / max)
    } else {
        image.to_owned()
    }
}

fn narrate(verbose: bool, message: &str) {
    if verbose {
        println!("{}", message);
    }
}

pub(crate) fn progress_bar(len: u64, visible: bool) -> ProgressBar {
    if !visible {
        return ProgressBar::hidden();
    }
    let style = ProgressStyle::with_template("  [{elapsed_precise}] {bar:40} {pos}/{len} {msg}")
        .unwrap_or_else(|_| ProgressStyle::default_bar());
    ProgressBar::new(len).with_style(style)
}

#[cfg(test)]
mod tests {
    use super::decoding::HardDecoder;
    use super::registration::Interpolation;
    use super::spots::{Measurement, ScaleSpacing};
    use super::*;
    use ndarray::Array4;

    const ALPHABET: [char; 4] = ['T', 'G', 'C', 'A'];

    fn gaussian_spot(dim: (usize, usize), cx: f32, cy: f32, sigma: f32) -> Array2<f32> {
        Array2::from_shape_fn(dim, |(x, y)| {
            let d2 = (x as f32 - cx).powi(2) + (y as f32 - cy).powi(2);
            (-d2 / (2.0 * sigma * sigma)).exp()
        })
    }

    fn disk_image(dim: (usize, usize), cx: f32, cy: f32, radius: f32) -> Array2<f32> {
        Array2::from_shape_fn(dim, |(x, y)| {
            let d2 = (x as f32 - cx).powi(2) + (y as f32 - cy).powi(2);
            if d2 <= radius * radius {
                1.0
            } else {
                0.0
            }
        })
    }

    fn iss_config() -> PipelineConfig {
        PipelineConfig {
            filter: None,
            registration: RegistrationParams {
                upsample_factor: 10,
                projection: Projection::Max,
                interpolation: Interpolation::Bicubic,
            },
            detection: SpotDetectionParams {
                min_sigma: 1.0,
                max_sigma: 3.0,
                num_sigma: 5,
                threshold: 0.05,
                overlap: 0.5,
                spacing: ScaleSpacing::Linear,
                measurement: Measurement::Mean,
            },
            decoder: DecoderKind::Hard(HardDecoder),
            segmentation: SegmentationParams {
                nuclear_threshold: 0.16,
                cyto_threshold: 0.22,
                size_limits: (10, 10000),
                marker_disk_size: 0,
                mask_disk_size: 0,
                min_marker_distance: Some(57.0),
            },
            stain_projection: Projection::Max,
            normalize_stains: true,
            verbose: false,
        }
    }

    // One spot at (50, 50) carrying the code "ACTG" over a nucleus.
    fn single_spot_fov(code: &str) -> FieldOfView {
        let dim = (100, 100);
        let spot = gaussian_spot(dim, 50.0, 50.0, 2.0);
        let mut data = Array4::zeros((4, 4, dim.0, dim.1));
        for (round, symbol) in code.chars().enumerate() {
            let channel = ALPHABET.iter().position(|&s| s == symbol).unwrap();
            data.slice_mut(ndarray::s![round, channel, .., ..]).assign(&spot);
        }

        FieldOfView {
            tensor: ImageTensor::new(data).unwrap(),
            dots: spot,
            nuclei: disk_image(dim, 50.0, 50.0, 10.0),
        }
    }

    fn her2_codebook() -> Codebook {
        Codebook::new(
            ALPHABET.to_vec(),
            vec![("ACTG".to_string(), "HER2".to_string())],
            Some(4),
        )
        .unwrap()
    }

    #[test]
    fn test_single_spot_end_to_end() {
        let fov = single_spot_fov("ACTG");
        let output = run_pipeline(&fov, &her2_codebook(), &iss_config()).unwrap();

        assert_eq!(output.records.len(), 1);
        let record = &output.records[0];
        assert_eq!(record.gene.as_deref(), Some("HER2"));
        assert!((record.x - 50.0).abs() <= 1.0);
        assert!((record.y - 50.0).abs() <= 1.0);

        let nucleus_label = output.labels.get(50, 50);
        assert!(nucleus_label > 0);
        assert_eq!(record.cell, nucleus_label);
        assert_eq!(output.labels.n_labels(), 1);

        assert_eq!(output.registered.n_rounds(), 4);
        assert_eq!(output.registered.plane_dim(), (100, 100));
        assert_eq!(output.encoder_table.len(), 1);

        for round in &output.registration {
            assert!(round.failure.is_none());
            assert!(round.shift.magnitude() < 0.2);
        }
    }

    #[test]
    fn test_unknown_code_is_reported_with_quality() {
        let fov = single_spot_fov("GGGG");
        let output = run_pipeline(&fov, &her2_codebook(), &iss_config()).unwrap();

        assert_eq!(output.records.len(), 1);
        let record = &output.records[0];
        assert_eq!(record.gene, None);
        assert_eq!(record.code.as_deref(), Some("GGGG"));
        assert!(record.quality.is_finite());
        assert!(record.quality > 0.9);
    }

    #[test]
    fn test_empty_field_of_view() {
        let dim = (40, 40);
        let fov = FieldOfView {
            tensor: ImageTensor::new(Array4::zeros((4, 4, dim.0, dim.1))).unwrap(),
            dots: Array2::zeros(dim),
            nuclei: Array2::zeros(dim),
        };
        let output = run_pipeline(&fov, &her2_codebook(), &iss_config()).unwrap();

        assert!(output.records.is_empty());
        assert!(output.encoder_table.is_empty());
        assert_eq!(output.labels.n_labels(), 0);
        // flat projections degrade to a zero shift but are reported
        assert!(output.registration.iter().all(|r| r.failure.is_some()));
    }

    #[test]
    fn test_rejects_mismatched_codebook() {
        let fov = single_spot_fov("ACTG");
        let codebook = Codebook::new(
            ALPHABET.to_vec(),
            vec![("ACT".to_string(), "HER2".to_string())],
            None,
        )
        .unwrap();
        let result = run_pipeline(&fov, &codebook, &iss_config());
        assert!(matches!(
            result,
            Err(PipelineError::CodeLengthMismatch {
                code_length: 3,
                rounds: 4
            })
        ));
    }

    #[test]
    fn test_rejects_mismatched_auxiliary_image() {
        let mut fov = single_spot_fov("ACTG");
        fov.nuclei = Array2::zeros((50, 50));
        let result = run_pipeline(&fov, &her2_codebook(), &iss_config());
        assert!(matches!(result, Err(PipelineError::ShapeMismatch { .. })));
    }

    #[test]
    fn test_filtered_pipeline_keeps_spot() {
        let fov = single_spot_fov("ACTG");
        let mut config = iss_config();
        config.filter = Some(FilterKind::WhiteTophat { radius: 6 });
        let output = run_pipeline(&fov, &her2_codebook(), &config).unwrap();

        assert_eq!(output.records.len(), 1);
        assert_eq!(output.records[0].gene.as_deref(), Some("HER2"));
    }

    #[test]
    fn test_filter_errors_are_propagated() {
        let fov = single_spot_fov("ACTG");
        let mut config = iss_config();
        config.filter = Some(FilterKind::GaussianLowPass { sigma: 0.0 });
        let result = run_pipeline(&fov, &her2_codebook(), &config);
        assert!(matches!(result, Err(PipelineError::InvalidParameter(_))));
    }
}
