//! Phase tracker
//!
//! Per-bin phase unwrapping and true-frequency estimation across analysis
//! frames, and phase accumulation at an arbitrary synthesis hop with
//! identity phase locking around spectral peaks.
//!
//! All state lives in a [`PhaseCursor`] owned by one transform invocation.
//! Frames carry their index; the cursor refuses frames presented out of
//! order, since a skipped or repeated frame corrupts every later phase.

use std::f64::consts::{PI, TAU};

use num_complex::Complex;

use crate::fft::COMPLEX_ZERO;
use crate::{ResynthError, ResynthResult};

/// Wrap a phase into (-pi, pi]
#[inline]
pub fn wrap_phase(phase: f64) -> f64 {
    let wrapped = phase - TAU * (phase / TAU).round();
    if wrapped <= -PI { wrapped + TAU } else { wrapped }
}

/// Output position of synthesis frame `frame` when frames are `hop_out` apart
///
/// Offsets are rounded from the exact position, so a fractional hop never
/// drifts away from the requested stretch.
#[inline]
pub fn synthesis_offset(frame: u64, hop_out: f64) -> usize {
    (frame as f64 * hop_out).round() as usize
}

/// For every bin, the nearest local magnitude maximum
///
/// A spectrum without interior maxima anchors every bin to itself.
fn nearest_peaks(magnitude: &[f32]) -> Vec<usize> {
    let num_bins = magnitude.len();
    let peaks: Vec<usize> = (1..num_bins.saturating_sub(1))
        .filter(|&b| magnitude[b] > magnitude[b - 1] && magnitude[b] > magnitude[b + 1])
        .collect();
    if peaks.is_empty() {
        return (0..num_bins).collect();
    }

    let mut nearest = 0;
    (0..num_bins)
        .map(|bin| {
            while nearest + 1 < peaks.len()
                && peaks[nearest + 1].abs_diff(bin) < peaks[nearest].abs_diff(bin)
            {
                nearest += 1;
            }
            peaks[nearest]
        })
        .collect()
}

/// Magnitude, true frequency and analysis phase of the non-redundant
/// half-spectrum
#[derive(Debug, Clone)]
pub struct BinFrame {
    /// Position of this frame in the analysis sequence
    index: u64,
    /// Bin magnitudes, N/2+1 entries
    pub magnitude: Vec<f32>,
    /// Instantaneous frequency per bin, in bins
    pub frequency: Vec<f32>,
    /// Measured analysis phase per bin
    pub phase: Vec<f32>,
    /// Peak bin each bin is phase-locked to (itself for peaks)
    anchor: Vec<usize>,
}

impl BinFrame {
    /// Frame index in the analysis sequence
    pub fn index(&self) -> u64 {
        self.index
    }

    /// Number of bins (N/2+1)
    pub fn len(&self) -> usize {
        self.magnitude.len()
    }

    /// True when the frame holds no bins
    pub fn is_empty(&self) -> bool {
        self.magnitude.is_empty()
    }

    /// Peak bin that `bin` follows during synthesis
    pub fn anchor(&self, bin: usize) -> usize {
        self.anchor[bin]
    }

    /// True when `bin` advances its own phase instead of following a peak
    fn is_free(&self, bin: usize) -> bool {
        let anchor = self.anchor[bin];
        anchor == bin || self.anchor[anchor] != anchor
    }

    /// Resample bins in frequency by `ratio`
    ///
    /// Each peak moves by the whole number of bins closest to its true
    /// frequency times `ratio - 1`, which puts peak bin k at or next to
    /// `round(k * ratio)`. The bins around a peak keep their offset from it,
    /// so the peak's lobe arrives intact. Moved bins carry their frequency
    /// scaled by `ratio` and their analysis phase. Bins landing outside
    /// 0..=Nyquist are dropped; bins landing on the same target add their
    /// magnitudes and the stronger one supplies frequency and phase.
    pub fn shift_pitch(&self, ratio: f32) -> BinFrame {
        let num_bins = self.len();
        let mut magnitude = vec![0.0; num_bins];
        let mut frequency = vec![0.0; num_bins];
        let mut phase = vec![0.0; num_bins];
        let mut anchor: Vec<usize> = (0..num_bins).collect();
        let mut strongest = vec![-1.0f32; num_bins];

        let target_of = |bin: usize, peak: usize| -> Option<usize> {
            // Estimates more than a bin off (first frame) use the bin centre
            let mut centre = self.frequency[peak];
            if !centre.is_finite() || (centre - peak as f32).abs() > 1.0 {
                centre = peak as f32;
            }
            let moved = bin as i64 + (centre * (ratio - 1.0)).round() as i64;
            usize::try_from(moved).ok().filter(|&t| t < num_bins)
        };

        for bin in 0..num_bins {
            let peak = self.anchor[bin];
            let Some(target) = target_of(bin, peak) else {
                continue;
            };

            let mag = self.magnitude[bin];
            magnitude[target] += mag;
            if mag > strongest[target] {
                strongest[target] = mag;
                frequency[target] = self.frequency[bin] * ratio;
                phase[target] = self.phase[bin];
                anchor[target] = target_of(peak, peak).unwrap_or(target);
            }
        }

        BinFrame {
            index: self.index,
            magnitude,
            frequency,
            phase,
            anchor,
        }
    }
}

/// Per-bin phase state for one transform invocation
#[derive(Debug, Clone)]
pub struct PhaseCursor {
    /// Transform length
    size: usize,
    /// Analysis hop
    hop_in: usize,
    /// Synthesis hop, possibly fractional
    hop_out: f64,
    /// Phase observed in the previous analysis frame
    last_phase: Vec<f64>,
    /// Accumulated synthesis phase
    accumulated_phase: Vec<f64>,
    /// Expected per-hop phase advance of each bin centre, wrapped
    expected_advance: Vec<f64>,
    /// Frames analyzed so far
    analyzed: u64,
    /// Frames synthesized so far
    synthesized: u64,
}

impl PhaseCursor {
    /// Fresh cursor for `size`-bin frames analyzed `hop_in` apart and
    /// synthesized `hop_out` apart
    pub fn new(size: usize, hop_in: usize, hop_out: f64) -> Self {
        let num_bins = size / 2 + 1;
        let step = TAU * hop_in as f64 / size as f64;

        Self {
            size,
            hop_in,
            hop_out,
            last_phase: vec![0.0; num_bins],
            accumulated_phase: vec![0.0; num_bins],
            expected_advance: (0..num_bins)
                .map(|k| wrap_phase(k as f64 * step))
                .collect(),
            analyzed: 0,
            synthesized: 0,
        }
    }

    /// Number of non-redundant bins
    pub fn num_bins(&self) -> usize {
        self.last_phase.len()
    }

    /// Analysis hop
    pub fn hop_in(&self) -> usize {
        self.hop_in
    }

    /// Synthesis hop
    pub fn hop_out(&self) -> f64 {
        self.hop_out
    }

    /// Measure magnitude, true frequency and phase of the next analysis frame
    pub fn analyze(&mut self, spectrum: &[Complex<f32>]) -> ResynthResult<BinFrame> {
        if spectrum.len() != self.size {
            return Err(ResynthError::FrameSizeMismatch {
                expected: self.size,
                actual: spectrum.len(),
            });
        }

        let num_bins = self.num_bins();
        let to_bins = self.size as f64 / (TAU * self.hop_in as f64);
        let mut magnitude = Vec::with_capacity(num_bins);
        let mut frequency = Vec::with_capacity(num_bins);
        let mut phases = Vec::with_capacity(num_bins);

        for (k, bin) in spectrum.iter().take(num_bins).enumerate() {
            let phase = (bin.im as f64).atan2(bin.re as f64);
            let deviation =
                wrap_phase(phase - self.last_phase[k] - self.expected_advance[k]);
            self.last_phase[k] = phase;

            magnitude.push(bin.norm());
            frequency.push((k as f64 + deviation * to_bins) as f32);
            phases.push(phase as f32);
        }

        let index = self.analyzed;
        self.analyzed += 1;

        Ok(BinFrame {
            index,
            anchor: nearest_peaks(&magnitude),
            magnitude,
            frequency,
            phase: phases,
        })
    }

    /// Advance the synthesis phases by one output hop and write the full
    /// conjugate-symmetric spectrum for `frame` into `out`
    ///
    /// Peak bins advance by their true frequency over the hop. Every other
    /// bin keeps the analysis phase offset it had from its peak (identity
    /// phase locking). The first frame starts from the analysis phases.
    pub fn synthesize(&mut self, frame: &BinFrame, out: &mut [Complex<f32>]) -> ResynthResult<()> {
        if frame.index != self.synthesized {
            return Err(ResynthError::FrameOutOfOrder {
                expected: self.synthesized,
                actual: frame.index,
            });
        }
        if out.len() != self.size {
            return Err(ResynthError::FrameSizeMismatch {
                expected: self.size,
                actual: out.len(),
            });
        }
        let num_bins = self.num_bins();
        let lengths = [frame.magnitude.len(), frame.frequency.len(), frame.phase.len()];
        if let Some(actual) = lengths.into_iter().find(|&len| len != num_bins) {
            return Err(ResynthError::FrameSizeMismatch {
                expected: num_bins,
                actual,
            });
        }

        let m = self.synthesized;
        let first = m == 0;
        let advance = if first {
            0
        } else {
            synthesis_offset(m, self.hop_out) - synthesis_offset(m - 1, self.hop_out)
        };
        let step = TAU * advance as f64 / self.size as f64;

        for k in (0..num_bins).filter(|&k| frame.is_free(k)) {
            self.accumulated_phase[k] = if first {
                frame.phase[k] as f64
            } else {
                wrap_phase(self.accumulated_phase[k] + frame.frequency[k] as f64 * step)
            };
        }
        for k in (0..num_bins).filter(|&k| !frame.is_free(k)) {
            let peak = frame.anchor[k];
            let offset = frame.phase[k] as f64 - frame.phase[peak] as f64;
            self.accumulated_phase[k] = wrap_phase(self.accumulated_phase[peak] + offset);
        }

        out.fill(COMPLEX_ZERO);
        for k in 0..num_bins {
            out[k] = Complex::from_polar(frame.magnitude[k], self.accumulated_phase[k] as f32);
        }
        for k in 1..self.size - num_bins + 1 {
            out[self.size - k] = out[k].conj();
        }

        self.synthesized += 1;
        Ok(())
    }
}
