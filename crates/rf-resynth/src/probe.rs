//! Spectrum probe
//!
//! One-shot spectral measurements of a finished signal: the magnitude
//! spectrum of the whole buffer and the envelope peak of its centre frame.
//! Handy for checking what a transform did.

use realfft::RealFftPlanner;

use crate::envelope::EnvelopeExtractor;
use crate::fft::SpectralTransform;
use crate::framer::{Framer, hann_window};
use crate::{ResynthConfig, ResynthError, ResynthResult};

/// Magnitude spectrum of a Hann-windowed signal
#[derive(Debug, Clone)]
pub struct SpectrumSnapshot {
    /// Sample rate of the analyzed signal
    sample_rate: u32,
    /// Analyzed length in samples
    len: usize,
    /// Bin magnitudes, len/2+1 entries
    magnitudes: Vec<f32>,
}

impl SpectrumSnapshot {
    /// Analyze the whole of `signal` with a single real FFT
    pub fn from_signal(signal: &[f32], sample_rate: u32) -> ResynthResult<Self> {
        if signal.is_empty() {
            return Err(ResynthError::EmptyInput);
        }

        let len = signal.len();
        let mut planner = RealFftPlanner::<f32>::new();
        let fft = planner.plan_fft_forward(len);

        let mut input = fft.make_input_vec();
        for ((dst, &src), w) in input.iter_mut().zip(signal).zip(hann_window(len)) {
            *dst = src * w;
        }
        let mut spectrum = fft.make_output_vec();
        fft.process(&mut input, &mut spectrum)
            .map_err(|e| ResynthError::Fft(e.to_string()))?;

        Ok(Self {
            sample_rate,
            len,
            magnitudes: spectrum.iter().map(|c| c.norm()).collect(),
        })
    }

    /// Bin magnitudes
    pub fn magnitudes(&self) -> &[f32] {
        &self.magnitudes
    }

    /// Width of one bin in Hz
    pub fn bin_frequency(&self) -> f32 {
        self.sample_rate as f32 / self.len as f32
    }

    /// Frequency of the strongest bin above DC, refined by parabolic
    /// interpolation
    pub fn dominant_frequency(&self) -> f32 {
        let Some((peak, _)) = self
            .magnitudes
            .iter()
            .enumerate()
            .skip(1)
            .max_by(|a, b| a.1.total_cmp(b.1))
        else {
            return 0.0;
        };

        let mut position = peak as f32;
        if peak + 1 < self.magnitudes.len() {
            let (a, b, c) = (
                self.magnitudes[peak - 1],
                self.magnitudes[peak],
                self.magnitudes[peak + 1],
            );
            let denom = a - 2.0 * b + c;
            if denom.abs() > f32::EPSILON {
                position += (0.5 * (a - c) / denom).clamp(-0.5, 0.5);
            }
        }

        position * self.bin_frequency()
    }
}

/// Frequency of the spectral envelope maximum in the centre frame of `signal`
///
/// Uses the transform size and lifter order of `config`. Signals shorter than
/// one frame are zero-padded.
pub fn envelope_peak_frequency(signal: &[f32], config: &ResynthConfig) -> ResynthResult<f32> {
    if signal.is_empty() {
        return Err(ResynthError::EmptyInput);
    }
    config.validate()?;

    let size = config.fft_size;
    let framer = Framer::new(size, config.overlap)?;
    let mut fft = SpectralTransform::new(size)?;

    let start = signal.len().saturating_sub(size) / 2;
    let mut frame = framer.extract_frame(signal, start);
    fft.forward(&mut frame)?;

    let mut extractor = EnvelopeExtractor::with_transform(fft, config.envelope_order)?;
    let envelope = extractor.extract(&frame)?;

    let peak = envelope
        .iter()
        .enumerate()
        .skip(1)
        .max_by(|a, b| a.1.total_cmp(b.1))
        .map_or(0, |(bin, _)| bin);

    Ok(peak as f32 * config.sample_rate as f32 / size as f32)
}
