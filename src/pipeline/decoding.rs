// Barcode decoding of measured spot intensities against a codebook.

use clap::ValueEnum;
use ndarray::Axis;
use rayon::prelude::*;
use std::fmt;

use super::codebook::Codebook;
use super::spots::{EncoderTable, Spot};
use super::PipelineError;

// Numerical conditions that changed how a spot was called.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum DecodeFlag {
    // some round had no positive intensity in any channel
    EmptyRound,
    // some round had more than one channel at the maximum
    TiedChannels,
    // the spot's intensity vector is zero
    EmptySpot,
    // the nearest code is farther than the configured maximum distance
    BeyondMaxDistance,
}

impl DecodeFlag {
    pub fn as_str(&self) -> &'static str {
        match self {
            DecodeFlag::EmptyRound => "empty_round",
            DecodeFlag::TiedChannels => "tied_channels",
            DecodeFlag::EmptySpot => "empty_spot",
            DecodeFlag::BeyondMaxDistance => "beyond_max_distance",
        }
    }
}

impl fmt::Display for DecodeFlag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct DecodedSpot {
    pub spot_id: usize,
    pub x: f32,
    pub y: f32,
    pub radius: f32,
    pub code: Option<String>,
    pub gene: Option<String>,

    // higher is more confident for every decoder
    pub quality: f32,

    pub flag: Option<DecodeFlag>,
}

impl DecodedSpot {
    fn uncalled(spot: &Spot, flag: DecodeFlag) -> Self {
        DecodedSpot {
            spot_id: spot.spot_id,
            x: spot.x,
            y: spot.y,
            radius: spot.radius,
            code: None,
            gene: None,
            quality: 0.0,
            flag: Some(flag),
        }
    }
}

pub trait Decoder: Sync {
    fn decode_spot(&self, spot: &Spot, codebook: &Codebook) -> DecodedSpot;

    // Decode every spot of the table, in spot_id order.
    fn decode(
        &self,
        table: &EncoderTable,
        codebook: &Codebook,
    ) -> Result<Vec<DecodedSpot>, PipelineError> {
        if table.n_rounds() != codebook.code_length() {
            return Err(PipelineError::CodeLengthMismatch {
                code_length: codebook.code_length(),
                rounds: table.n_rounds(),
            });
        }
        if table.n_channels() != codebook.n_symbols() {
            return Err(PipelineError::AlphabetMismatch {
                symbols: codebook.n_symbols(),
                channels: table.n_channels(),
            });
        }

        Ok(table
            .spots()
            .par_iter()
            .map(|spot| self.decode_spot(spot, codebook))
            .collect())
    }
}

/// Per round argmax decoding. Quality is the smallest relative margin between
/// the strongest and second strongest channel over all rounds.
#[derive(Copy, Clone, Debug, Default)]
pub struct HardDecoder;

impl Decoder for HardDecoder {
    fn decode_spot(&self, spot: &Spot, codebook: &Codebook) -> DecodedSpot {
        let mut channels = Vec::with_capacity(codebook.code_length());
        let mut quality = f32::INFINITY;
        let mut tied = false;

        for round in spot.intensities.axis_iter(Axis(0)) {
            let mut best = 0;
            let mut top1 = f32::NEG_INFINITY;
            let mut top2 = f32::NEG_INFINITY;
            for (channel, &v) in round.iter().enumerate() {
                if v > top1 {
                    top2 = top1;
                    top1 = v;
                    best = channel;
                } else if v > top2 {
                    top2 = v;
                }
            }

            if !(top1 > 0.0) {
                return DecodedSpot::uncalled(spot, DecodeFlag::EmptyRound);
            }

            let top2 = top2.max(0.0);
            if top2 == top1 {
                tied = true;
            }
            quality = quality.min((top1 - top2) / top1);
            channels.push(best);
        }

        let code = codebook.code_for_channels(&channels);
        let gene = codebook.gene(&code).map(String::from);

        DecodedSpot {
            spot_id: spot.spot_id,
            x: spot.x,
            y: spot.y,
            radius: spot.radius,
            code: Some(code),
            gene,
            quality,
            flag: if tied {
                Some(DecodeFlag::TiedChannels)
            } else {
                None
            },
        }
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Default, ValueEnum)]
pub enum DistanceMetric {
    #[default]
    Euclidean,
    Cosine,
}

impl DistanceMetric {
    // Distance between unit vectors with the given dot product.
    fn distance(&self, dot: f32) -> f32 {
        match self {
            DistanceMetric::Euclidean => (2.0 - 2.0 * dot).max(0.0).sqrt(),
            DistanceMetric::Cosine => 1.0 - dot,
        }
    }
}

// Largest possible distance between unit vectors with non-negative entries
// under either metric.
const MAX_DISTANCE: f32 = 2.0;

/// Nearest codebook entry to the normalized intensity vector, where each
/// entry's template is one-hot per round. Quality is the gap between the
/// second nearest and nearest distances.
#[derive(Copy, Clone, Debug, Default)]
pub struct SoftDecoder {
    pub metric: DistanceMetric,
    pub max_distance: Option<f32>,
}

impl Decoder for SoftDecoder {
    fn decode_spot(&self, spot: &Spot, codebook: &Codebook) -> DecodedSpot {
        let intensities = &spot.intensities;
        let norm = intensities.iter().map(|v| v * v).sum::<f32>().sqrt();
        if !(norm > 0.0) {
            return DecodedSpot::uncalled(spot, DecodeFlag::EmptySpot);
        }

        // every template has norm 1 after dividing by sqrt(rounds)
        let template_scale = 1.0 / (codebook.code_length() as f32).sqrt();

        let mut nearest: Option<(usize, f32)> = None;
        let mut second = MAX_DISTANCE;
        for (i, entry) in codebook.entries().iter().enumerate() {
            let dot: f32 = entry
                .channels
                .iter()
                .enumerate()
                .map(|(round, &channel)| intensities[[round, channel]])
                .sum::<f32>()
                * template_scale
                / norm;
            let d = self.metric.distance(dot);

            match nearest {
                Some((_, best)) if d >= best => second = second.min(d),
                Some((_, best)) => {
                    second = second.min(best);
                    nearest = Some((i, d));
                }
                None => nearest = Some((i, d)),
            }
        }

        let Some((index, distance)) = nearest else {
            return DecodedSpot::uncalled(spot, DecodeFlag::EmptySpot);
        };
        let entry = &codebook.entries()[index];

        let beyond = self.max_distance.is_some_and(|max| distance > max);
        DecodedSpot {
            spot_id: spot.spot_id,
            x: spot.x,
            y: spot.y,
            radius: spot.radius,
            code: Some(entry.code.clone()),
            gene: if beyond {
                None
            } else {
                Some(entry.gene.clone())
            },
            quality: second - distance,
            flag: if beyond {
                Some(DecodeFlag::BeyondMaxDistance)
            } else {
                None
            },
        }
    }
}

// Decoding strategy chosen by configuration.
#[derive(Copy, Clone, Debug)]
pub enum DecoderKind {
    Hard(HardDecoder),
    Soft(SoftDecoder),
}

impl Decoder for DecoderKind {
    fn decode_spot(&self, spot: &Spot, codebook: &Codebook) -> DecodedSpot {
        match self {
            DecoderKind::Hard(decoder) => decoder.decode_spot(spot, codebook),
            DecoderKind::Soft(decoder) => decoder.decode_spot(spot, codebook),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::super::spots::BoundingBox;
    use super::*;
    use ndarray::Array2;

    fn codebook() -> Codebook {
        Codebook::new(
            vec!['T', 'G', 'C', 'A'],
            vec![
                ("ACTG".to_string(), "HER2".to_string()),
                ("GGAT".to_string(), "ACTB".to_string()),
            ],
            Some(4),
        )
        .unwrap()
    }

    fn spot(spot_id: usize, intensities: Array2<f32>) -> Spot {
        Spot {
            spot_id,
            x: 10.0,
            y: 12.0,
            sigma: 2.0,
            radius: 2.83,
            response: 1.0,
            bbox: BoundingBox {
                x_min: 7,
                x_max: 13,
                y_min: 9,
                y_max: 15,
            },
            intensities,
        }
    }

    // One-hot intensities spelling `code` over the TGCA alphabet.
    fn one_hot(code: &str) -> Array2<f32> {
        let mut intensities = Array2::zeros((4, 4));
        for (round, symbol) in code.chars().enumerate() {
            let channel = "TGCA".find(symbol).unwrap();
            intensities[[round, channel]] = 1.0;
        }
        intensities
    }

    #[test]
    fn test_hard_exact_code() {
        let decoded = HardDecoder.decode_spot(&spot(0, one_hot("ACTG")), &codebook());
        assert_eq!(decoded.code.as_deref(), Some("ACTG"));
        assert_eq!(decoded.gene.as_deref(), Some("HER2"));
        assert_eq!(decoded.quality, 1.0);
        assert_eq!(decoded.flag, None);
    }

    #[test]
    fn test_hard_perturbation_keeps_call() {
        let mut intensities = one_hot("ACTG");
        intensities[[1, 3]] = 0.8;
        let decoded = HardDecoder.decode_spot(&spot(0, intensities), &codebook());
        assert_eq!(decoded.gene.as_deref(), Some("HER2"));
        assert!((decoded.quality - 0.2).abs() < 1e-6);
    }

    #[test]
    fn test_hard_unknown_code() {
        let decoded = HardDecoder.decode_spot(&spot(0, one_hot("TTTT")), &codebook());
        assert_eq!(decoded.code.as_deref(), Some("TTTT"));
        assert_eq!(decoded.gene, None);
        assert!(decoded.quality.is_finite());
        assert_eq!(decoded.quality, 1.0);
    }

    #[test]
    fn test_hard_empty_round_and_ties() {
        let mut intensities = one_hot("ACTG");
        intensities.row_mut(2).fill(0.0);
        let decoded = HardDecoder.decode_spot(&spot(0, intensities), &codebook());
        assert_eq!(decoded.flag, Some(DecodeFlag::EmptyRound));
        assert_eq!(decoded.code, None);
        assert_eq!(decoded.quality, 0.0);

        let mut intensities = one_hot("ACTG");
        intensities[[0, 1]] = 1.0;
        let decoded = HardDecoder.decode_spot(&spot(0, intensities), &codebook());
        assert_eq!(decoded.flag, Some(DecodeFlag::TiedChannels));
        // ties go to the lowest channel, G before A
        assert_eq!(decoded.code.as_deref(), Some("GCTG"));
        assert_eq!(decoded.quality, 0.0);
    }

    #[test]
    fn test_soft_nearest_code() {
        let mut intensities = one_hot("GGAT");
        intensities.mapv_inplace(|v| 3.0 * v + 0.1);
        let decoder = SoftDecoder::default();
        let decoded = decoder.decode_spot(&spot(0, intensities), &codebook());
        assert_eq!(decoded.gene.as_deref(), Some("ACTB"));
        assert!(decoded.quality > 0.5);

        let exact = decoder.decode_spot(&spot(1, one_hot("ACTG")), &codebook());
        assert_eq!(exact.gene.as_deref(), Some("HER2"));
        // ACTG and GGAT share no round, so they are sqrt(2) apart
        assert!((exact.quality - 2.0_f32.sqrt()).abs() < 1e-5);
    }

    #[test]
    fn test_soft_metrics_and_max_distance() {
        let mut intensities = one_hot("ACTG");
        intensities.row_mut(3).fill(0.0);
        intensities[[3, 2]] = 1.0;

        let cosine = SoftDecoder {
            metric: DistanceMetric::Cosine,
            max_distance: None,
        };
        let decoded = cosine.decode_spot(&spot(0, intensities.clone()), &codebook());
        assert_eq!(decoded.gene.as_deref(), Some("HER2"));
        assert!((decoded.quality - 0.75).abs() < 1e-5);

        let strict = SoftDecoder {
            metric: DistanceMetric::Euclidean,
            max_distance: Some(0.1),
        };
        let decoded = strict.decode_spot(&spot(0, intensities), &codebook());
        assert_eq!(decoded.code.as_deref(), Some("ACTG"));
        assert_eq!(decoded.gene, None);
        assert_eq!(decoded.flag, Some(DecodeFlag::BeyondMaxDistance));
    }

    #[test]
    fn test_soft_empty_spot() {
        let decoded =
            SoftDecoder::default().decode_spot(&spot(0, Array2::zeros((4, 4))), &codebook());
        assert_eq!(decoded.flag, Some(DecodeFlag::EmptySpot));
        assert_eq!(decoded.quality, 0.0);
    }

    #[test]
    fn test_decode_table_in_order() {
        let table = EncoderTable::new(
            vec![
                spot(0, one_hot("GGAT")),
                spot(1, one_hot("ACTG")),
                spot(2, one_hot("CCCC")),
            ],
            4,
            4,
        )
        .unwrap();
        let decoder = DecoderKind::Hard(HardDecoder);
        let decoded = decoder.decode(&table, &codebook()).unwrap();

        let ids: Vec<usize> = decoded.iter().map(|d| d.spot_id).collect();
        assert_eq!(ids, vec![0, 1, 2]);
        assert_eq!(decoded[0].gene.as_deref(), Some("ACTB"));
        assert_eq!(decoded[2].gene, None);
    }

    #[test]
    fn test_decode_rejects_mismatched_table() {
        let table = EncoderTable::new(vec![], 3, 4).unwrap();
        let result = HardDecoder.decode(&table, &codebook());
        assert!(matches!(
            result,
            Err(PipelineError::CodeLengthMismatch { .. })
        ));
    }
}
