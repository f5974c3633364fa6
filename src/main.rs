use clap::{Parser, ValueEnum};
use rayon::current_num_threads;
use std::error::Error;

mod npy_input;
mod output;
mod pipeline;
mod schemas;

use npy_input::{read_image_stack, read_plane};
use output::{
    write_encoder_table, write_image_stack, write_label_mask, write_registration, write_spots,
};
use pipeline::codebook::Codebook;
use pipeline::decoding::{DecoderKind, DistanceMetric, HardDecoder, SoftDecoder};
use pipeline::filter::FilterKind;
use pipeline::image::{ImageTensor, Projection};
use pipeline::registration::{Interpolation, RegistrationParams};
use pipeline::segmentation::SegmentationParams;
use pipeline::spots::{Measurement, ScaleSpacing, SpotDetectionParams};
use pipeline::{run_pipeline, FieldOfView, PipelineConfig};
use schemas::OutputFormat;

#[derive(Copy, Clone, Debug, PartialEq, Eq, ValueEnum)]
enum DecoderChoice {
    Hard,
    Soft,
}

#[derive(Parser, Debug)]
#[command(version)]
#[command(about = "Register, decode and assign in situ sequencing spots to segmented cells.")]
struct Args {
    // .npy image stack with axes (round, channel, x, y)
    image_stack: String,

    // .npy pan-transcript "dots" stain, used as the registration and spot
    // detection reference
    dots: String,

    // .npy nuclear stain
    nuclei: String,

    // CSV codebook, optionally gzipped
    codebook: String,

    #[arg(long, default_value_t = false)]
    iss: bool,

    #[arg(long, default_value = None)]
    alphabet: Option<String>,

    #[arg(long, default_value = "barcode")]
    code_column: String,

    #[arg(long, default_value = "gene")]
    gene_column: String,

    #[arg(long, default_value = None)]
    code_length: Option<usize>,

    #[arg(long, default_value = None)]
    tophat_radius: Option<usize>,

    #[arg(long, default_value = None)]
    lowpass_sigma: Option<f32>,

    #[arg(long, default_value_t = false)]
    no_filter: bool,

    #[arg(long, default_value = None)]
    upsample_factor: Option<usize>,

    #[arg(long, value_enum, default_value_t = Projection::Max)]
    projection: Projection,

    #[arg(long, value_enum, default_value_t = Interpolation::Bicubic)]
    interpolation: Interpolation,

    #[arg(long, default_value = None)]
    min_sigma: Option<f32>,

    #[arg(long, default_value = None)]
    max_sigma: Option<f32>,

    #[arg(long, default_value = None)]
    num_sigma: Option<usize>,

    #[arg(long, default_value = None)]
    spot_threshold: Option<f32>,

    #[arg(long, default_value_t = 0.5)]
    overlap: f32,

    #[arg(long, value_enum, default_value_t = ScaleSpacing::Linear)]
    scale_spacing: ScaleSpacing,

    #[arg(long, value_enum, default_value_t = Measurement::Mean)]
    measurement: Measurement,

    #[arg(long, value_enum, default_value_t = DecoderChoice::Hard)]
    decoder: DecoderChoice,

    #[arg(long, value_enum, default_value_t = DistanceMetric::Euclidean)]
    distance_metric: DistanceMetric,

    #[arg(long, default_value = None)]
    max_distance: Option<f32>,

    #[arg(long, default_value = None)]
    nuclear_threshold: Option<f32>,

    #[arg(long, default_value = None)]
    cyto_threshold: Option<f32>,

    #[arg(long, default_value = None)]
    min_cell_size: Option<usize>,

    #[arg(long, default_value = None)]
    max_cell_size: Option<usize>,

    #[arg(long, default_value_t = 0)]
    marker_disk_size: usize,

    #[arg(long, default_value_t = 0)]
    mask_disk_size: usize,

    #[arg(long, default_value = None)]
    min_marker_distance: Option<f32>,

    #[arg(long, value_enum, default_value_t = Projection::Max)]
    stain_projection: Projection,

    #[arg(long, default_value_t = false)]
    no_normalize_stains: bool,

    #[arg(long, default_value = "spots.csv.gz")]
    output_spots: String,

    #[arg(long, value_enum, default_value_t = OutputFormat::Infer)]
    output_spots_fmt: OutputFormat,

    #[arg(long, default_value = None)]
    output_registration: Option<String>,

    #[arg(long, value_enum, default_value_t = OutputFormat::Infer)]
    output_registration_fmt: OutputFormat,

    #[arg(long, default_value = None)]
    output_encoder_table: Option<String>,

    #[arg(long, value_enum, default_value_t = OutputFormat::Infer)]
    output_encoder_table_fmt: OutputFormat,

    // .npy path for the filtered and registered (round, channel, x, y) stack
    #[arg(long, default_value = None)]
    output_registered: Option<String>,

    #[arg(long, default_value = None)]
    output_labels: Option<String>,

    #[arg(short = 't', long, default_value = None)]
    nthreads: Option<usize>,

    #[arg(long, default_value_t = false)]
    quiet: bool,
}

fn set_iss_presets(args: &mut Args) {
    args.alphabet.get_or_insert(String::from("TGCA"));
    if !args.no_filter && args.lowpass_sigma.is_none() {
        args.tophat_radius.get_or_insert(15);
    }
    args.upsample_factor.get_or_insert(100);
    args.min_sigma.get_or_insert(4.0);
    args.max_sigma.get_or_insert(6.0);
    args.num_sigma.get_or_insert(20);
    args.spot_threshold.get_or_insert(0.01);
    args.nuclear_threshold.get_or_insert(0.16);
    args.cyto_threshold.get_or_insert(0.22);
    args.min_cell_size.get_or_insert(10);
    args.max_cell_size.get_or_insert(10000);
    args.min_marker_distance.get_or_insert(57.0);
}

fn expect_arg<T>(arg: Option<T>, argname: &str) -> Result<T, String> {
    arg.ok_or_else(|| format!("Missing required argument: --{}", argname))
}

fn select_filter(args: &Args) -> Result<Option<FilterKind>, String> {
    if args.no_filter {
        return Ok(None);
    }
    match (args.tophat_radius, args.lowpass_sigma) {
        (Some(_), Some(_)) => {
            Err(String::from("At most one of --tophat-radius, --lowpass-sigma can be set"))
        }
        (Some(radius), None) => Ok(Some(FilterKind::WhiteTophat { radius })),
        (None, Some(sigma)) => Ok(Some(FilterKind::GaussianLowPass { sigma })),
        (None, None) => Ok(None),
    }
}

fn main() -> Result<(), Box<dyn Error>> {
    let mut args = Args::parse();

    if let Some(nthreads) = args.nthreads {
        rayon::ThreadPoolBuilder::new()
            .num_threads(nthreads)
            .build_global()?;
    }
    let verbose = !args.quiet;
    if verbose {
        println!("Using {} threads", current_num_threads());
    }

    if args.iss {
        set_iss_presets(&mut args);
    }

    let alphabet: Vec<char> = expect_arg(args.alphabet.clone(), "alphabet")?
        .chars()
        .collect();

    let decoder = match args.decoder {
        DecoderChoice::Hard => DecoderKind::Hard(HardDecoder),
        DecoderChoice::Soft => DecoderKind::Soft(SoftDecoder {
            metric: args.distance_metric,
            max_distance: args.max_distance,
        }),
    };

    let config = PipelineConfig {
        filter: select_filter(&args)?,
        registration: RegistrationParams {
            upsample_factor: expect_arg(args.upsample_factor, "upsample-factor")?,
            projection: args.projection,
            interpolation: args.interpolation,
        },
        detection: SpotDetectionParams {
            min_sigma: expect_arg(args.min_sigma, "min-sigma")?,
            max_sigma: expect_arg(args.max_sigma, "max-sigma")?,
            num_sigma: expect_arg(args.num_sigma, "num-sigma")?,
            threshold: expect_arg(args.spot_threshold, "spot-threshold")?,
            overlap: args.overlap,
            spacing: args.scale_spacing,
            measurement: args.measurement,
        },
        decoder,
        segmentation: SegmentationParams {
            nuclear_threshold: expect_arg(args.nuclear_threshold, "nuclear-threshold")?,
            cyto_threshold: expect_arg(args.cyto_threshold, "cyto-threshold")?,
            size_limits: (
                expect_arg(args.min_cell_size, "min-cell-size")?,
                expect_arg(args.max_cell_size, "max-cell-size")?,
            ),
            marker_disk_size: args.marker_disk_size,
            mask_disk_size: args.mask_disk_size,
            min_marker_distance: args.min_marker_distance,
        },
        stain_projection: args.stain_projection,
        normalize_stains: !args.no_normalize_stains,
        verbose,
    };

    if verbose {
        println!("Reading codebook...");
    }
    let codebook = Codebook::read_csv(
        &args.codebook,
        alphabet,
        &args.code_column,
        &args.gene_column,
        args.code_length,
    )?;
    if verbose {
        println!(
            "Read {} codes of length {}",
            codebook.len(),
            codebook.code_length()
        );
    }

    if verbose {
        println!("Reading images...");
    }
    let fov = FieldOfView {
        tensor: ImageTensor::new(read_image_stack(&args.image_stack)?)?,
        dots: read_plane(&args.dots)?,
        nuclei: read_plane(&args.nuclei)?,
    };
    if verbose {
        println!(
            "Read {} rounds x {} channels of {:?} planes",
            fov.tensor.n_rounds(),
            fov.tensor.n_channels(),
            fov.tensor.plane_dim()
        );
    }

    let output = run_pipeline(&fov, &codebook, &config)?;

    if verbose {
        println!("Writing output...");
    }
    write_spots(&args.output_spots, args.output_spots_fmt, &output.records)?;
    if let Some(path) = &args.output_registration {
        write_registration(path, args.output_registration_fmt, &output.registration)?;
    }
    if let Some(path) = &args.output_encoder_table {
        write_encoder_table(path, args.output_encoder_table_fmt, &output.encoder_table)?;
    }
    if let Some(path) = &args.output_registered {
        write_image_stack(path, &output.registered)?;
    }
    if let Some(path) = &args.output_labels {
        write_label_mask(path, &output.labels)?;
    }

    Ok(())
}
