use clap::ValueEnum;
use ndarray::{s, Array2, Array3, Array4, ArrayView2, ArrayView3, Axis};
use rayon::prelude::*;

use super::PipelineError;

// How the channels of one round are collapsed into a single plane.
#[derive(Copy, Clone, Debug, PartialEq, Eq, ValueEnum)]
pub enum Projection {
    Max,
    Mean,
}

impl Projection {
    pub fn project(&self, round: ArrayView3<f32>) -> Array2<f32> {
        match self {
            Projection::Max => round.fold_axis(Axis(0), f32::NEG_INFINITY, |&a, &b| a.max(b)),
            Projection::Mean => round
                .mean_axis(Axis(0))
                .unwrap_or_else(|| Array2::zeros((round.shape()[1], round.shape()[2]))),
        }
    }
}

/// Intensities of one field of view indexed by (round, channel, x, y).
#[derive(Clone, Debug)]
pub struct ImageTensor {
    data: Array4<f32>,
}

impl ImageTensor {
    pub fn new(data: Array4<f32>) -> Result<Self, PipelineError> {
        if data.shape().iter().any(|&n| n == 0) {
            return Err(PipelineError::InvalidTensor(format!(
                "every axis must be non-empty, got shape {:?}",
                data.shape()
            )));
        }

        if let Some(v) = data.iter().find(|v| !v.is_finite() || **v < 0.0) {
            return Err(PipelineError::InvalidTensor(format!(
                "intensities must be finite and non-negative, found {}",
                v
            )));
        }

        Ok(Self { data })
    }

    pub fn n_rounds(&self) -> usize {
        self.data.shape()[0]
    }

    pub fn n_channels(&self) -> usize {
        self.data.shape()[1]
    }

    pub fn plane_dim(&self) -> (usize, usize) {
        (self.data.shape()[2], self.data.shape()[3])
    }

    pub fn data(&self) -> &Array4<f32> {
        &self.data
    }

    pub fn plane(&self, round: usize, channel: usize) -> ArrayView2<f32> {
        self.data.slice(s![round, channel, .., ..])
    }

    pub fn round(&self, round: usize) -> ArrayView3<f32> {
        self.data.index_axis(Axis(0), round)
    }

    pub fn project_round(&self, round: usize, projection: Projection) -> Array2<f32> {
        projection.project(self.round(round))
    }

    // Mean over rounds of each round's channel projection. This is the
    // "cytoplasmic" stain used to bound cell growth.
    pub fn stain_image(&self, projection: Projection) -> Array2<f32> {
        let mut stain = Array2::zeros(self.plane_dim());
        for round in 0..self.n_rounds() {
            stain += &self.project_round(round, projection);
        }
        stain /= self.n_rounds() as f32;
        stain
    }

    // Apply `f` to every plane in parallel, producing a new tensor. The first
    // error from `f` is returned.
    pub fn map_planes<F>(&self, f: F) -> Result<Self, PipelineError>
    where
        F: Fn(ArrayView2<f32>) -> Result<Array2<f32>, PipelineError> + Sync,
    {
        let nchannels = self.n_channels();
        let planes = (0..self.n_rounds() * nchannels)
            .into_par_iter()
            .map(|i| f(self.plane(i / nchannels, i % nchannels)))
            .collect::<Result<Vec<Array2<f32>>, PipelineError>>()?;

        let mut data = Array4::zeros(self.data.raw_dim());
        for (i, plane) in planes.iter().enumerate() {
            super::check_shape("filtered plane", self.plane_dim(), plane.dim())?;
            data.slice_mut(s![i / nchannels, i % nchannels, .., ..])
                .assign(plane);
        }

        ImageTensor::new(data)
    }

    // Reassemble a tensor from per-round (channel, x, y) stacks.
    pub fn from_rounds(rounds: Vec<Array3<f32>>) -> Result<Self, PipelineError> {
        let Some(first) = rounds.first() else {
            return Err(PipelineError::InvalidTensor(String::from("no rounds")));
        };
        let (nchannels, width, height) = first.dim();

        let mut data = Array4::zeros((rounds.len(), nchannels, width, height));
        for (i, round) in rounds.iter().enumerate() {
            if round.dim() != (nchannels, width, height) {
                return Err(PipelineError::InvalidTensor(format!(
                    "round {} has shape {:?}, expected {:?}",
                    i,
                    round.dim(),
                    (nchannels, width, height)
                )));
            }
            data.index_axis_mut(Axis(0), i).assign(round);
        }

        ImageTensor::new(data)
    }
}
