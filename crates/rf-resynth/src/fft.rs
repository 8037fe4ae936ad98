//! Spectral transform primitive
//!
//! In-place complex FFT over power-of-two buffers. Forward is unscaled,
//! inverse is scaled by 1/N so a forward/inverse pair is the identity.

use std::sync::Arc;

use num_complex::Complex;
use rustfft::{Fft, FftPlanner};

use crate::{ResynthError, ResynthResult};

/// Zero-valued bin, used to initialize spectral buffers
pub const COMPLEX_ZERO: Complex<f32> = Complex::new(0.0, 0.0);

/// Check that `size` is a usable transform length
pub fn validate_size(size: usize) -> ResynthResult<()> {
    if size < 2 || !size.is_power_of_two() {
        return Err(ResynthError::InvalidTransformSize(size));
    }
    Ok(())
}

/// Transform `buffer` in place
///
/// Plans a fresh transform for every call. Repeated transforms of one size
/// should go through [`SpectralTransform`] instead.
pub fn transform(buffer: &mut [Complex<f32>], inverse: bool) -> ResynthResult<()> {
    let mut fft = SpectralTransform::new(buffer.len())?;
    fft.process(buffer, inverse)
}

/// Planned forward/inverse transform pair for one size
///
/// Clones share the planned kernels and get their own scratch space, so a
/// clone per worker thread is the intended way to parallelize.
pub struct SpectralTransform {
    size: usize,
    forward: Arc<dyn Fft<f32>>,
    inverse: Arc<dyn Fft<f32>>,
    scratch: Vec<Complex<f32>>,
}

impl SpectralTransform {
    /// Plan a transform of `size` bins
    pub fn new(size: usize) -> ResynthResult<Self> {
        validate_size(size)?;

        let mut planner = FftPlanner::new();
        let forward = planner.plan_fft_forward(size);
        let inverse = planner.plan_fft_inverse(size);
        let scratch_len = forward
            .get_inplace_scratch_len()
            .max(inverse.get_inplace_scratch_len());

        Ok(Self {
            size,
            forward,
            inverse,
            scratch: vec![COMPLEX_ZERO; scratch_len],
        })
    }

    /// Transform length
    pub fn size(&self) -> usize {
        self.size
    }

    /// Forward transform in place
    pub fn forward(&mut self, buffer: &mut [Complex<f32>]) -> ResynthResult<()> {
        self.process(buffer, false)
    }

    /// Inverse transform in place, scaled by 1/N
    pub fn inverse(&mut self, buffer: &mut [Complex<f32>]) -> ResynthResult<()> {
        self.process(buffer, true)
    }

    /// Forward or inverse transform in place
    pub fn process(&mut self, buffer: &mut [Complex<f32>], inverse: bool) -> ResynthResult<()> {
        if buffer.len() != self.size {
            return Err(ResynthError::FrameSizeMismatch {
                expected: self.size,
                actual: buffer.len(),
            });
        }

        if inverse {
            self.inverse.process_with_scratch(buffer, &mut self.scratch);
            let scale = 1.0 / self.size as f32;
            for bin in buffer.iter_mut() {
                *bin *= scale;
            }
        } else {
            self.forward.process_with_scratch(buffer, &mut self.scratch);
        }

        Ok(())
    }
}

impl Clone for SpectralTransform {
    fn clone(&self) -> Self {
        Self {
            size: self.size,
            forward: Arc::clone(&self.forward),
            inverse: Arc::clone(&self.inverse),
            scratch: vec![COMPLEX_ZERO; self.scratch.len()],
        }
    }
}

impl std::fmt::Debug for SpectralTransform {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SpectralTransform")
            .field("size", &self.size)
            .finish_non_exhaustive()
    }
}
