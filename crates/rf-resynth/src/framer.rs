//! Windowed framer
//!
//! Hann-windowed frame extraction and windowed overlap-add. `accumulate` is
//! the only place overlap-add gain is normalized; every transform variant
//! goes through it.

use std::f32::consts::PI;

use num_complex::Complex;

use crate::fft::{COMPLEX_ZERO, validate_size};
use crate::{ResynthError, ResynthResult};

/// Symmetric Hann window of `size` samples
pub fn hann_window(size: usize) -> Vec<f32> {
    if size < 2 {
        return vec![1.0; size];
    }
    let denom = (size - 1) as f32;
    (0..size)
        .map(|i| 0.5 * (1.0 - (2.0 * PI * i as f32 / denom).cos()))
        .collect()
}

/// Frame extractor and overlap-add accumulator
#[derive(Debug, Clone)]
pub struct Framer {
    /// Transform length
    size: usize,
    /// Overlap factor (frames covering each sample)
    overlap: usize,
    /// Analysis hop
    hop: usize,
    /// Analysis and synthesis window
    window: Vec<f32>,
    /// Sum of squared window samples
    window_energy: f32,
}

impl Framer {
    /// Create framer for `size`-sample frames at the given overlap factor
    pub fn new(size: usize, overlap: usize) -> ResynthResult<Self> {
        validate_size(size)?;
        if overlap == 0 || overlap > size || size % overlap != 0 {
            return Err(ResynthError::InvalidConfig(format!(
                "overlap {} does not divide frame size {}",
                overlap, size
            )));
        }

        let window = hann_window(size);
        let window_energy = window.iter().map(|w| w * w).sum();

        Ok(Self {
            size,
            overlap,
            hop: size / overlap,
            window,
            window_energy,
        })
    }

    /// Frame length
    pub fn size(&self) -> usize {
        self.size
    }

    /// Overlap factor
    pub fn overlap(&self) -> usize {
        self.overlap
    }

    /// Analysis hop (size / overlap)
    pub fn hop(&self) -> usize {
        self.hop
    }

    /// Window coefficients
    pub fn window(&self) -> &[f32] {
        &self.window
    }

    /// Overlap-add normalization at the analysis hop
    pub fn norm_factor(&self) -> f32 {
        self.norm_factor_for_hop(self.hop as f64)
    }

    /// Overlap-add normalization for frames laid out `hop_out` apart
    ///
    /// Frames are windowed twice (analysis and synthesis), so the steady-state
    /// overlap sum is `sum(w^2) / hop_out`. `hop_out` may be fractional when
    /// frame offsets are rounded from a non-integer stretch.
    pub fn norm_factor_for_hop(&self, hop_out: f64) -> f32 {
        if self.window_energy <= 0.0 {
            return 1.0;
        }
        (hop_out / self.window_energy as f64) as f32
    }

    /// Copy `size` samples from `start`, windowed, into a fresh complex buffer
    ///
    /// Samples past the end of `source` read as zero.
    pub fn extract_frame(&self, source: &[f32], start: usize) -> Vec<Complex<f32>> {
        let mut frame = vec![COMPLEX_ZERO; self.size];
        let available = source.len().saturating_sub(start).min(self.size);

        for (i, bin) in frame.iter_mut().take(available).enumerate() {
            bin.re = source[start + i] * self.window[i];
        }

        frame
    }

    /// Window the real part of an inverse-transformed frame and add it into
    /// `output` at `offset`, scaled by `norm`
    pub fn accumulate(
        &self,
        output: &mut [f32],
        frame: &[Complex<f32>],
        offset: usize,
        norm: f32,
    ) {
        let available = output.len().saturating_sub(offset).min(self.size);

        for (i, bin) in frame.iter().take(available).enumerate() {
            output[offset + i] += bin.re * self.window[i] * norm;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fft::SpectralTransform;

    #[test]
    fn test_hann_window_shape() {
        let window = hann_window(1024);
        assert_eq!(window.len(), 1024);
        assert!(window[0].abs() < 1e-7);
        assert!(window[1023].abs() < 1e-6);

        // Symmetric about the centre
        for i in 0..512 {
            assert!((window[i] - window[1023 - i]).abs() < 1e-5);
        }
        assert!(window.iter().all(|&w| (0.0..=1.0).contains(&w)));
    }

    #[test]
    fn test_invalid_overlap() {
        assert!(Framer::new(1024, 0).is_err());
        assert!(Framer::new(1024, 3).is_err());
        assert!(Framer::new(1000, 4).is_err());
        assert!(Framer::new(8, 16).is_err());
    }

    #[test]
    fn test_hop_and_norm() {
        let framer = Framer::new(4096, 4).unwrap();
        assert_eq!(framer.hop(), 1024);
        assert_eq!(framer.overlap(), 4);

        // Hann^2 averages 3/8, four frames overlap
        assert!((framer.norm_factor() - 1.0 / (4.0 * 0.375)).abs() < 1e-3);
        assert!((framer.norm_factor_for_hop(2048.0) - 2.0 * framer.norm_factor()).abs() < 1e-6);
    }

    #[test]
    fn test_extract_zero_pads() {
        let framer = Framer::new(8, 2).unwrap();
        let source = vec![1.0; 5];

        let frame = framer.extract_frame(&source, 2);
        for i in 0..3 {
            assert!((frame[i].re - framer.window()[i]).abs() < 1e-7);
        }
        assert!(frame[3..].iter().all(|c| c.re == 0.0 && c.im == 0.0));

        let past_end = framer.extract_frame(&source, 100);
        assert!(past_end.iter().all(|c| c.re == 0.0));
    }

    #[test]
    fn test_accumulate_clips_at_end() {
        let framer = Framer::new(8, 2).unwrap();
        let frame = vec![Complex::new(1.0, 0.0); 8];
        let mut output = vec![0.0; 10];

        framer.accumulate(&mut output, &frame, 6, 1.0);
        assert!(output[..6].iter().all(|&s| s == 0.0));
        for i in 0..4 {
            assert!((output[6 + i] - framer.window()[i]).abs() < 1e-7);
        }
    }

    #[test]
    fn test_overlap_add_energy_conservation() {
        let size = 1024;
        let framer = Framer::new(size, 4).unwrap();
        let mut fft = SpectralTransform::new(size).unwrap();

        let len = size * 16;
        let amplitude = 0.7;
        let input: Vec<f32> = (0..len)
            .map(|i| amplitude * (2.0 * PI * 440.0 * i as f32 / 44100.0).sin())
            .collect();

        let mut output = vec![0.0; len + size];
        let norm = framer.norm_factor();
        let mut start = 0;
        while start < len {
            let mut frame = framer.extract_frame(&input, start);
            fft.forward(&mut frame).unwrap();
            fft.inverse(&mut frame).unwrap();
            framer.accumulate(&mut output, &frame, start, norm);
            start += framer.hop();
        }

        // Steady state: skip the first and last frame
        for i in size..(len - size) {
            assert!(
                (output[i] - input[i]).abs() < 0.01 * amplitude,
                "sample {}: {} vs {}",
                i,
                output[i],
                input[i]
            );
        }
    }
}
