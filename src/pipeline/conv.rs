use ndarray::Array2;
use realfft::{ComplexToReal, RealFftPlanner, RealToComplex};
use rustfft::num_complex::Complex;
use rustfft::{Fft, FftPlanner};
use std::sync::Arc;

use super::PipelineError;

// FFT based convolution, using pre-allocated buffers and a pre-computed kernel
// spectrum, since the same kernel is applied to every plane of a stack.
//
// The image is extended past its borders by mirroring about the edge,
// repeating the edge pixel (d c b a | a b c d | d c b a).
//
// Spectra are stored transposed (half-spectrum columns by padded rows) so the
// column transforms run over contiguous memory.
pub struct Conv2D {
    shape: (usize, usize),
    kernel_shape: (usize, usize),
    padded_shape: (usize, usize),

    input: Vec<f32>,
    spectrum: Vec<Complex<f32>>,
    spectrum_t: Vec<Complex<f32>>,
    kernel_spectrum_t: Vec<Complex<f32>>,

    fwd_row_scratch: Vec<Complex<f32>>,
    inv_row_scratch: Vec<Complex<f32>>,
    fwd_col_scratch: Vec<Complex<f32>>,
    inv_col_scratch: Vec<Complex<f32>>,

    fft_row: Arc<dyn RealToComplex<f32>>,
    ifft_row: Arc<dyn ComplexToReal<f32>>,
    fft_col: Arc<dyn Fft<f32>>,
    ifft_col: Arc<dyn Fft<f32>>,
}

impl Conv2D {
    pub fn new(shape: (usize, usize), kernel: &Array2<f32>) -> Result<Self, PipelineError> {
        let (m_kernel, n_kernel) = kernel.dim();
        if m_kernel % 2 != 1 || n_kernel % 2 != 1 {
            return Err(PipelineError::InvalidParameter(format!(
                "convolution kernel must have odd dimensions, got {:?}",
                kernel.dim()
            )));
        }

        let (m_padded, n_padded) = (shape.0 + m_kernel - 1, shape.1 + n_kernel - 1);
        let n_half = n_padded / 2 + 1;

        let mut rp = RealFftPlanner::new();
        let mut cp = FftPlanner::new();
        let fft_row = rp.plan_fft_forward(n_padded);
        let ifft_row = rp.plan_fft_inverse(n_padded);
        let fft_col = cp.plan_fft_forward(m_padded);
        let ifft_col = cp.plan_fft_inverse(m_padded);

        let zero = Complex::new(0.0, 0.0);
        let mut conv = Conv2D {
            shape,
            kernel_shape: (m_kernel, n_kernel),
            padded_shape: (m_padded, n_padded),
            input: vec![0.0; m_padded * n_padded],
            spectrum: vec![zero; m_padded * n_half],
            spectrum_t: vec![zero; n_half * m_padded],
            kernel_spectrum_t: vec![zero; n_half * m_padded],
            fwd_row_scratch: vec![zero; fft_row.get_scratch_len()],
            inv_row_scratch: vec![zero; ifft_row.get_scratch_len()],
            fwd_col_scratch: vec![zero; fft_col.get_inplace_scratch_len()],
            inv_col_scratch: vec![zero; ifft_col.get_inplace_scratch_len()],
            fft_row,
            ifft_row,
            fft_col,
            ifft_col,
        };

        // kernel forward fft, with the kernel anchored at the origin
        for i in 0..m_kernel {
            for j in 0..n_kernel {
                conv.input[i * n_padded + j] = kernel[[i, j]];
            }
        }
        conv.forward()?;
        std::mem::swap(&mut conv.kernel_spectrum_t, &mut conv.spectrum_t);

        Ok(conv)
    }

    // Convolve `data` with the kernel in place. The output has the same shape
    // as the input and is centred on the kernel's middle element.
    pub fn compute(&mut self, data: &mut Array2<f32>) -> Result<(), PipelineError> {
        super::check_shape("convolution input", self.shape, data.dim())?;

        let (m, n) = self.shape;
        let (m_kernel, n_kernel) = self.kernel_shape;
        let (m_pad, n_pad) = ((m_kernel - 1) / 2, (n_kernel - 1) / 2);
        let (m_padded, n_padded) = self.padded_shape;

        for i in 0..m_padded {
            let si = i as isize - m_pad as isize;
            for j in 0..n_padded {
                let sj = j as isize - n_pad as isize;
                self.input[i * n_padded + j] = data[[reflect(si, m), reflect(sj, n)]];
            }
        }

        self.forward()?;

        // multiply
        for (a, b) in self.spectrum_t.iter_mut().zip(&self.kernel_spectrum_t) {
            *a *= *b;
        }

        self.inverse()?;

        let scale = (m_padded * n_padded) as f32;
        for ((p, q), v) in data.indexed_iter_mut() {
            *v = self.input[(p + m_kernel - 1) * n_padded + q + n_kernel - 1] / scale;
        }

        Ok(())
    }

    // Real rows -> half spectra -> transposed -> column transforms.
    fn forward(&mut self) -> Result<(), PipelineError> {
        let (m_padded, n_padded) = self.padded_shape;
        let n_half = n_padded / 2 + 1;

        for (row, output) in self
            .input
            .chunks_exact_mut(n_padded)
            .zip(self.spectrum.chunks_exact_mut(n_half))
        {
            self.fft_row
                .process_with_scratch(row, output, &mut self.fwd_row_scratch)
                .map_err(|e| PipelineError::Fft(format!("{:?}", e)))?;
        }

        transpose_into(&self.spectrum, m_padded, n_half, &mut self.spectrum_t);
        self.fft_col
            .process_with_scratch(&mut self.spectrum_t, &mut self.fwd_col_scratch);

        Ok(())
    }

    // Inverse of `forward`, leaving the (unnormalized) result in `input`.
    fn inverse(&mut self) -> Result<(), PipelineError> {
        let (m_padded, n_padded) = self.padded_shape;
        let n_half = n_padded / 2 + 1;

        self.ifft_col
            .process_with_scratch(&mut self.spectrum_t, &mut self.inv_col_scratch);
        transpose_into(&self.spectrum_t, n_half, m_padded, &mut self.spectrum);

        for (row, output) in self
            .spectrum
            .chunks_exact_mut(n_half)
            .zip(self.input.chunks_exact_mut(n_padded))
        {
            // the DC and nyquist terms of a real signal are real
            row[0].im = 0.0;
            if n_padded % 2 == 0 {
                row[n_half - 1].im = 0.0;
            }

            self.ifft_row
                .process_with_scratch(row, output, &mut self.inv_row_scratch)
                .map_err(|e| PipelineError::Fft(format!("{:?}", e)))?;
        }

        Ok(())
    }
}

pub fn transpose_into<T: Copy>(src: &[T], rows: usize, cols: usize, dst: &mut [T]) {
    for i in 0..rows {
        for j in 0..cols {
            dst[j * rows + i] = src[i * cols + j];
        }
    }
}

pub fn reflect(i: isize, n: usize) -> usize {
    let period = 2 * n as isize;
    let k = i.rem_euclid(period);
    if k < n as isize {
        k as usize
    } else {
        (period - 1 - k) as usize
    }
}
