// Output table schemas, shared by the spot, encoder table and registration
// writers.

use arrow::datatypes::{DataType, Field, Schema};
use clap::ValueEnum;

#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, ValueEnum)]
pub enum OutputFormat {
    Infer,
    Csv,
    CsvGz,
    Parquet,
}

pub fn large_utf8_if_parquet(fmt: OutputFormat) -> DataType {
    match fmt {
        OutputFormat::Parquet => DataType::LargeUtf8,
        _ => DataType::Utf8,
    }
}

pub fn spot_schema(fmt: OutputFormat) -> Schema {
    Schema::new(vec![
        Field::new("spot_id", DataType::UInt64, false),
        Field::new("x", DataType::Float32, false),
        Field::new("y", DataType::Float32, false),
        Field::new("radius", DataType::Float32, false),
        Field::new("code", large_utf8_if_parquet(fmt), true),
        Field::new("gene", large_utf8_if_parquet(fmt), true),
        Field::new("quality", DataType::Float32, false),
        Field::new("cell", DataType::UInt32, false),
        Field::new("flag", large_utf8_if_parquet(fmt), true),
    ])
}

// Detected spots before decoding, with one intensity column per
// (round, channel) plane.
pub fn encoder_table_schema(n_rounds: usize, n_channels: usize) -> Schema {
    let mut fields = vec![
        Field::new("spot_id", DataType::UInt64, false),
        Field::new("x", DataType::Float32, false),
        Field::new("y", DataType::Float32, false),
        Field::new("sigma", DataType::Float32, false),
        Field::new("radius", DataType::Float32, false),
        Field::new("response", DataType::Float32, false),
        Field::new("x_min", DataType::UInt32, false),
        Field::new("x_max", DataType::UInt32, false),
        Field::new("y_min", DataType::UInt32, false),
        Field::new("y_max", DataType::UInt32, false),
    ];
    for round in 0..n_rounds {
        for channel in 0..n_channels {
            fields.push(Field::new(
                format!("intensity_r{}_c{}", round, channel),
                DataType::Float32,
                false,
            ));
        }
    }
    Schema::new(fields)
}

pub fn registration_schema() -> Schema {
    Schema::new(vec![
        Field::new("round", DataType::UInt32, false),
        Field::new("dx", DataType::Float32, false),
        Field::new("dy", DataType::Float32, false),
        Field::new("error", DataType::Float32, false),
        Field::new("ambiguous_peak", DataType::Boolean, false),
        Field::new("failure_code", DataType::UInt32, true),
    ])
}
