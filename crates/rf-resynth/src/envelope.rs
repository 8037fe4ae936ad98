//! Spectral envelope extraction
//!
//! Cepstral smoothing: the log-magnitude spectrum is transformed, all but
//! the low-order quefrencies are zeroed (the lifter), and the result is
//! transformed back and exponentiated. What remains is the smooth formant
//! shape without the harmonic fine structure.

use num_complex::Complex;

use crate::fft::SpectralTransform;
use crate::{ResynthError, ResynthResult};

/// Floor added to magnitudes before taking the logarithm
pub const MAGNITUDE_FLOOR: f32 = 1e-10;

/// Default lifter order
pub const DEFAULT_ENVELOPE_ORDER: usize = 40;

/// Cepstral envelope extractor for one transform size
#[derive(Debug, Clone)]
pub struct EnvelopeExtractor {
    /// Cepstral transform
    fft: SpectralTransform,
    /// Lifter order
    order: usize,
    /// Cepstrum work buffer
    cepstrum: Vec<Complex<f32>>,
}

impl EnvelopeExtractor {
    /// Create extractor for `size`-bin spectra keeping `order` quefrencies
    pub fn new(size: usize, order: usize) -> ResynthResult<Self> {
        Self::with_transform(SpectralTransform::new(size)?, order)
    }

    /// Create extractor reusing an already planned transform
    pub fn with_transform(fft: SpectralTransform, order: usize) -> ResynthResult<Self> {
        let size = fft.size();
        if order == 0 || order >= size / 2 {
            return Err(ResynthError::InvalidConfig(format!(
                "envelope order {} out of range for size {} (1..{})",
                order,
                size,
                size / 2
            )));
        }

        Ok(Self {
            fft,
            order,
            cepstrum: vec![Complex::new(0.0, 0.0); size],
        })
    }

    /// Lifter order
    pub fn order(&self) -> usize {
        self.order
    }

    /// Smoothed magnitude envelope of `spectrum`, N/2+1 entries
    pub fn extract(&mut self, spectrum: &[Complex<f32>]) -> ResynthResult<Vec<f32>> {
        let size = self.fft.size();
        if spectrum.len() != size {
            return Err(ResynthError::FrameSizeMismatch {
                expected: size,
                actual: spectrum.len(),
            });
        }

        for (c, bin) in self.cepstrum.iter_mut().zip(spectrum) {
            *c = Complex::new((bin.norm() + MAGNITUDE_FLOOR).ln(), 0.0);
        }

        self.fft.forward(&mut self.cepstrum)?;

        // Keep [0, order) and (N - order, N)
        for c in &mut self.cepstrum[self.order..=size - self.order] {
            *c = Complex::new(0.0, 0.0);
        }

        self.fft.inverse(&mut self.cepstrum)?;

        Ok(self.cepstrum[..=size / 2]
            .iter()
            .map(|c| c.re.exp())
            .collect())
    }
}

/// Read `envelope` at a fractional bin position
///
/// Linear interpolation, clamped to the first and last entries.
pub fn sample_at(envelope: &[f32], position: f32) -> f32 {
    let Some(&last) = envelope.last() else {
        return 0.0;
    };
    if position <= 0.0 {
        return envelope[0];
    }

    let low = position.floor() as usize;
    if low + 1 >= envelope.len() {
        return last;
    }

    let frac = position - low as f32;
    envelope[low] * (1.0 - frac) + envelope[low + 1] * frac
}

/// Read `envelope` at `position`, floored so it is safe to divide by
#[inline]
pub(crate) fn sample_floored(envelope: &[f32], position: f32) -> f32 {
    sample_at(envelope, position).max(MAGNITUDE_FLOOR)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::framer::Framer;
    use std::f32::consts::PI;

    fn harmonic_spectrum(size: usize, f0_bins: f32, resonance_bin: f32) -> Vec<Complex<f32>> {
        let framer = Framer::new(size, 4).unwrap();
        let signal: Vec<f32> = (0..size)
            .map(|i| {
                let mut sample = 0.0;
                let mut h = 1.0;
                while h * f0_bins < size as f32 / 2.0 - 4.0 {
                    let f = h * f0_bins;
                    let amp = 0.05 + (-((f - resonance_bin) / 40.0).powi(2)).exp();
                    sample += amp * (2.0 * PI * f * i as f32 / size as f32).sin();
                    h += 1.0;
                }
                sample * 0.1
            })
            .collect();

        let mut frame = framer.extract_frame(&signal, 0);
        let mut fft = SpectralTransform::new(size).unwrap();
        fft.forward(&mut frame).unwrap();
        frame
    }

    #[test]
    fn test_flat_spectrum_gives_flat_envelope() {
        let size = 256;
        let mut extractor = EnvelopeExtractor::new(size, 20).unwrap();
        let spectrum = vec![Complex::new(3.0, 4.0); size];

        let envelope = extractor.extract(&spectrum).unwrap();
        assert_eq!(envelope.len(), size / 2 + 1);
        for &e in &envelope {
            assert!((e - 5.0).abs() < 1e-3, "{}", e);
        }
    }

    #[test]
    fn test_silence_is_finite() {
        let size = 512;
        let mut extractor = EnvelopeExtractor::new(size, DEFAULT_ENVELOPE_ORDER).unwrap();
        let spectrum = vec![Complex::new(0.0, 0.0); size];

        let envelope = extractor.extract(&spectrum).unwrap();
        assert!(envelope.iter().all(|e| e.is_finite() && *e > 0.0));
    }

    #[test]
    fn test_envelope_tracks_resonance() {
        let size = 4096;
        let resonance = 140.0;
        let spectrum = harmonic_spectrum(size, 20.0, resonance);

        let mut extractor = EnvelopeExtractor::new(size, DEFAULT_ENVELOPE_ORDER).unwrap();
        let envelope = extractor.extract(&spectrum).unwrap();

        let peak = envelope
            .iter()
            .enumerate()
            .skip(10)
            .max_by(|a, b| a.1.total_cmp(b.1))
            .map(|(k, _)| k)
            .unwrap();
        assert!(
            (peak as f32 - resonance).abs() < 25.0,
            "envelope peak at bin {}",
            peak
        );
    }

    #[test]
    fn test_envelope_is_smooth() {
        let size = 4096;
        let spectrum = harmonic_spectrum(size, 20.0, 140.0);
        let mut extractor = EnvelopeExtractor::new(size, DEFAULT_ENVELOPE_ORDER).unwrap();
        let envelope = extractor.extract(&spectrum).unwrap();

        // Harmonics repeat every 20 bins; the envelope must not follow them
        let worst_step = envelope
            .windows(11)
            .skip(100)
            .take(80)
            .map(|w| (w[10] / w[0]).ln().abs())
            .fold(0.0f32, f32::max);

        let raw_step = spectrum
            .windows(11)
            .skip(100)
            .take(80)
            .map(|w| ((w[10].norm() + MAGNITUDE_FLOOR) / (w[0].norm() + MAGNITUDE_FLOOR)).ln().abs())
            .fold(0.0f32, f32::max);

        assert!(worst_step < raw_step / 4.0, "{} vs {}", worst_step, raw_step);
    }

    #[test]
    fn test_invalid_order() {
        assert!(EnvelopeExtractor::new(256, 0).is_err());
        assert!(EnvelopeExtractor::new(256, 128).is_err());
        assert!(EnvelopeExtractor::new(256, 127).is_ok());
        assert!(matches!(
            EnvelopeExtractor::new(100, 10),
            Err(ResynthError::InvalidTransformSize(100))
        ));
    }

    #[test]
    fn test_sample_at_interpolates() {
        let envelope = [1.0, 3.0, 5.0];
        assert_eq!(sample_at(&envelope, 0.0), 1.0);
        assert!((sample_at(&envelope, 0.5) - 2.0).abs() < 1e-6);
        assert!((sample_at(&envelope, 1.25) - 3.5).abs() < 1e-6);
        assert_eq!(sample_at(&envelope, 2.0), 5.0);
        assert_eq!(sample_at(&envelope, 10.0), 5.0);
        assert_eq!(sample_at(&envelope, -3.0), 1.0);
        assert_eq!(sample_at(&[], 1.0), 0.0);
    }
}
