use arrow::array::{
    ArrayRef, BooleanArray, Float32Array, LargeStringArray, RecordBatch, StringArray, UInt32Array,
    UInt64Array,
};
use arrow::csv;
use flate2::write::GzEncoder;
use flate2::Compression;
use ndarray_npy::write_npy;
use parquet::arrow::ArrowWriter;
use parquet::basic::{Compression::ZSTD, ZstdLevel};
use parquet::file::properties::WriterProperties;
use std::error::Error;
use std::fs::File;
use std::io::Write;
use std::sync::Arc;

use crate::pipeline::assignment::ResultRecord;
use crate::pipeline::image::ImageTensor;
use crate::pipeline::registration::RoundRegistration;
use crate::pipeline::segmentation::LabelMask;
use crate::pipeline::spots::EncoderTable;
use crate::schemas::{encoder_table_schema, registration_schema, spot_schema, OutputFormat};

pub fn write_table(
    filename: &str,
    fmt: OutputFormat,
    batch: &RecordBatch,
) -> Result<(), Box<dyn Error>> {
    let fmt = determine_format(filename, fmt)?;
    let file = File::create(filename)?;

    match fmt {
        OutputFormat::Csv => {
            write_table_csv(file, batch)?;
        }
        OutputFormat::CsvGz => {
            let encoder = GzEncoder::new(file, Compression::default());
            write_table_csv(encoder, batch)?.finish()?;
        }
        OutputFormat::Parquet => write_table_parquet(file, batch)?,
        OutputFormat::Infer => {
            return Err(format!("Unable to infer output format for: {}", filename).into())
        }
    }

    Ok(())
}

fn write_table_csv<W: Write>(output: W, batch: &RecordBatch) -> Result<W, Box<dyn Error>> {
    let mut writer = csv::WriterBuilder::new().with_header(true).build(output);
    writer.write(batch)?;
    Ok(writer.into_inner())
}

fn write_table_parquet(output: File, batch: &RecordBatch) -> Result<(), Box<dyn Error>> {
    let props = WriterProperties::builder()
        .set_compression(ZSTD(ZstdLevel::try_new(3)?))
        .build();

    let mut writer = ArrowWriter::try_new(output, batch.schema(), Some(props))?;
    writer.write(batch)?;
    writer.close()?;

    Ok(())
}

pub fn determine_format(
    filename: &str,
    fmt: OutputFormat,
) -> Result<OutputFormat, Box<dyn Error>> {
    if fmt != OutputFormat::Infer {
        return Ok(fmt);
    }

    if filename.ends_with(".csv.gz") {
        Ok(OutputFormat::CsvGz)
    } else if filename.ends_with(".csv") {
        Ok(OutputFormat::Csv)
    } else if filename.ends_with(".parquet") {
        Ok(OutputFormat::Parquet)
    } else {
        Err(format!("Unknown file format for: {}", filename).into())
    }
}

fn string_column<'a, I>(fmt: OutputFormat, values: I) -> ArrayRef
where
    I: Iterator<Item = Option<&'a str>>,
{
    match fmt {
        OutputFormat::Parquet => Arc::new(values.collect::<LargeStringArray>()),
        _ => Arc::new(values.collect::<StringArray>()),
    }
}

pub fn write_spots(
    filename: &str,
    fmt: OutputFormat,
    records: &[ResultRecord],
) -> Result<(), Box<dyn Error>> {
    let fmt = determine_format(filename, fmt)?;
    let schema = spot_schema(fmt);

    let columns: Vec<ArrayRef> = vec![
        Arc::new(
            records
                .iter()
                .map(|r| r.spot_id as u64)
                .collect::<UInt64Array>(),
        ),
        Arc::new(records.iter().map(|r| r.x).collect::<Float32Array>()),
        Arc::new(records.iter().map(|r| r.y).collect::<Float32Array>()),
        Arc::new(records.iter().map(|r| r.radius).collect::<Float32Array>()),
        string_column(fmt, records.iter().map(|r| r.code.as_deref())),
        string_column(fmt, records.iter().map(|r| r.gene.as_deref())),
        Arc::new(records.iter().map(|r| r.quality).collect::<Float32Array>()),
        Arc::new(records.iter().map(|r| r.cell).collect::<UInt32Array>()),
        string_column(fmt, records.iter().map(|r| r.flag.map(|f| f.as_str()))),
    ];

    let batch = RecordBatch::try_new(Arc::new(schema), columns)?;
    write_table(filename, fmt, &batch)
}

pub fn write_encoder_table(
    filename: &str,
    fmt: OutputFormat,
    table: &EncoderTable,
) -> Result<(), Box<dyn Error>> {
    let spots = table.spots();
    let schema = encoder_table_schema(table.n_rounds(), table.n_channels());

    let mut columns: Vec<ArrayRef> = vec![
        Arc::new(spots.iter().map(|s| s.spot_id as u64).collect::<UInt64Array>()),
        Arc::new(spots.iter().map(|s| s.x).collect::<Float32Array>()),
        Arc::new(spots.iter().map(|s| s.y).collect::<Float32Array>()),
        Arc::new(spots.iter().map(|s| s.sigma).collect::<Float32Array>()),
        Arc::new(spots.iter().map(|s| s.radius).collect::<Float32Array>()),
        Arc::new(spots.iter().map(|s| s.response).collect::<Float32Array>()),
        Arc::new(spots.iter().map(|s| s.bbox.x_min as u32).collect::<UInt32Array>()),
        Arc::new(spots.iter().map(|s| s.bbox.x_max as u32).collect::<UInt32Array>()),
        Arc::new(spots.iter().map(|s| s.bbox.y_min as u32).collect::<UInt32Array>()),
        Arc::new(spots.iter().map(|s| s.bbox.y_max as u32).collect::<UInt32Array>()),
    ];
    for round in 0..table.n_rounds() {
        for channel in 0..table.n_channels() {
            columns.push(Arc::new(
                spots
                    .iter()
                    .map(|s| s.intensities[[round, channel]])
                    .collect::<Float32Array>(),
            ));
        }
    }

    let batch = RecordBatch::try_new(Arc::new(schema), columns)?;
    write_table(filename, fmt, &batch)
}

pub fn write_registration(
    filename: &str,
    fmt: OutputFormat,
    registrations: &[RoundRegistration],
) -> Result<(), Box<dyn Error>> {
    let columns: Vec<ArrayRef> = vec![
        Arc::new(
            registrations
                .iter()
                .map(|r| r.round as u32)
                .collect::<UInt32Array>(),
        ),
        Arc::new(
            registrations
                .iter()
                .map(|r| r.shift.dx)
                .collect::<Float32Array>(),
        ),
        Arc::new(
            registrations
                .iter()
                .map(|r| r.shift.dy)
                .collect::<Float32Array>(),
        ),
        Arc::new(registrations.iter().map(|r| r.error).collect::<Float32Array>()),
        Arc::new(BooleanArray::from(
            registrations
                .iter()
                .map(|r| r.ambiguous_peak)
                .collect::<Vec<_>>(),
        )),
        Arc::new(
            registrations
                .iter()
                .map(|r| r.failure.map(|f| f.code()))
                .collect::<UInt32Array>(),
        ),
    ];

    let batch = RecordBatch::try_new(Arc::new(registration_schema()), columns)?;
    write_table(filename, fmt, &batch)
}

pub fn write_label_mask(filename: &str, mask: &LabelMask) -> Result<(), Box<dyn Error>> {
    write_npy(filename, mask.labels())?;
    Ok(())
}

// Write a (round, channel, x, y) stack as f32 .npy.
pub fn write_image_stack(filename: &str, tensor: &ImageTensor) -> Result<(), Box<dyn Error>> {
    write_npy(filename, tensor.data())?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::npy_input::read_image_stack;
    use crate::pipeline::decoding::DecodeFlag;
    use crate::pipeline::registration::{RegistrationFailure, ShiftVector};
    use crate::pipeline::spots::{BoundingBox, Spot};
    use flate2::read::GzDecoder;
    use ndarray::{Array2, Array4};
    use std::io::Read;

    fn temp_path(name: &str) -> String {
        std::env::temp_dir()
            .join(format!("issdecode-{}-{}", std::process::id(), name))
            .to_string_lossy()
            .into_owned()
    }

    fn records() -> Vec<ResultRecord> {
        vec![
            ResultRecord {
                spot_id: 0,
                x: 50.0,
                y: 49.0,
                radius: 2.5,
                code: Some("ACTG".to_string()),
                gene: Some("HER2".to_string()),
                quality: 1.0,
                cell: 3,
                flag: None,
            },
            ResultRecord {
                spot_id: 1,
                x: 10.0,
                y: 12.0,
                radius: 2.5,
                code: None,
                gene: None,
                quality: 0.0,
                cell: 0,
                flag: Some(DecodeFlag::EmptyRound),
            },
        ]
    }

    #[test]
    fn test_determine_format() {
        assert_eq!(
            determine_format("spots.csv.gz", OutputFormat::Infer).unwrap(),
            OutputFormat::CsvGz
        );
        assert_eq!(
            determine_format("spots.parquet", OutputFormat::Infer).unwrap(),
            OutputFormat::Parquet
        );
        assert_eq!(
            determine_format("spots.txt", OutputFormat::Csv).unwrap(),
            OutputFormat::Csv
        );
        assert!(determine_format("spots.txt", OutputFormat::Infer).is_err());
    }

    #[test]
    fn test_write_spots_csv() {
        let path = temp_path("spots.csv");
        write_spots(&path, OutputFormat::Infer, &records()).unwrap();

        let content = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines[0], "spot_id,x,y,radius,code,gene,quality,cell,flag");
        assert!(lines[1].starts_with("0,"));
        assert!(lines[1].contains(",ACTG,HER2,"));
        assert!(lines[2].ends_with(",0,empty_round"));
        std::fs::remove_file(path).unwrap();
    }

    #[test]
    fn test_write_registration_csv_gz() {
        let path = temp_path("registration.csv.gz");
        let registrations = vec![
            RoundRegistration {
                round: 0,
                shift: ShiftVector::new(0.5, -1.25),
                error: 0.01,
                ambiguous_peak: false,
                failure: None,
            },
            RoundRegistration {
                round: 1,
                shift: ShiftVector::default(),
                error: 1.0,
                ambiguous_peak: false,
                failure: Some(RegistrationFailure::FlatProjection),
            },
        ];
        write_registration(&path, OutputFormat::Infer, &registrations).unwrap();

        let mut content = String::new();
        GzDecoder::new(File::open(&path).unwrap())
            .read_to_string(&mut content)
            .unwrap();
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines.len(), 3);
        assert_eq!(lines[0], "round,dx,dy,error,ambiguous_peak,failure_code");
        assert!(lines[1].ends_with(",false,"));
        assert!(lines[2].ends_with(",false,1"));
        std::fs::remove_file(path).unwrap();
    }

    #[test]
    fn test_write_encoder_table_csv() {
        let path = temp_path("encoder.csv");
        let spot = Spot {
            spot_id: 0,
            x: 12.0,
            y: 7.0,
            sigma: 2.0,
            radius: 2.0 * std::f32::consts::SQRT_2,
            response: 0.5,
            bbox: BoundingBox {
                x_min: 9,
                x_max: 15,
                y_min: 4,
                y_max: 10,
            },
            intensities: Array2::from_shape_fn((2, 3), |(r, c)| (10 * r + c) as f32),
        };
        let table = EncoderTable::new(vec![spot], 2, 3).unwrap();
        write_encoder_table(&path, OutputFormat::Infer, &table).unwrap();

        let content = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].starts_with(
            "spot_id,x,y,sigma,radius,response,x_min,x_max,y_min,y_max,intensity_r0_c0,"
        ));
        assert!(lines[0].ends_with(",intensity_r1_c2"));
        assert_eq!(lines[0].split(',').count(), 10 + 6);
        assert!(lines[1].contains(",9,15,4,10,"));
        let last: f32 = lines[1].rsplit(',').next().unwrap().parse().unwrap();
        assert_eq!(last, 12.0);
        std::fs::remove_file(path).unwrap();
    }

    #[test]
    fn test_write_image_stack_round_trip() {
        let path = temp_path("registered.npy");
        let data = Array4::from_shape_fn((2, 3, 5, 4), |(r, c, x, y)| {
            (r * 1000 + c * 100 + x * 10 + y) as f32 * 0.5
        });
        let tensor = ImageTensor::new(data.clone()).unwrap();
        write_image_stack(&path, &tensor).unwrap();

        let read = read_image_stack(&path).unwrap();
        assert_eq!(read, data);
        std::fs::remove_file(path).unwrap();
    }

    #[test]
    fn test_write_spots_parquet() {
        let path = temp_path("spots.parquet");
        write_spots(&path, OutputFormat::Infer, &records()).unwrap();
        assert!(std::fs::metadata(&path).unwrap().len() > 0);
        std::fs::remove_file(path).unwrap();
    }
}
