// Reading image stacks and auxiliary planes from .npy files.

use ndarray::{Array, Array2, Array4, Dimension};
use ndarray_npy::read_npy;
use std::error::Error;

// Read an array of f32, u16, u8 or f64 elements, converting to f32.
pub fn read_npy_f32<D: Dimension>(path: &str) -> Result<Array<f32, D>, Box<dyn Error>> {
    let first_err = match read_npy::<_, Array<f32, D>>(path) {
        Ok(data) => return Ok(data),
        Err(err) => err,
    };

    if let Ok(data) = read_npy::<_, Array<u16, D>>(path) {
        return Ok(data.mapv(|v| v as f32));
    }
    if let Ok(data) = read_npy::<_, Array<u8, D>>(path) {
        return Ok(data.mapv(|v| v as f32));
    }
    if let Ok(data) = read_npy::<_, Array<f64, D>>(path) {
        return Ok(data.mapv(|v| v as f32));
    }

    Err(format!("Unable to read {}: {}", path, first_err).into())
}

// Image stack with axes (round, channel, x, y).
pub fn read_image_stack(path: &str) -> Result<Array4<f32>, Box<dyn Error>> {
    read_npy_f32(path)
}

pub fn read_plane(path: &str) -> Result<Array2<f32>, Box<dyn Error>> {
    read_npy_f32(path)
}
