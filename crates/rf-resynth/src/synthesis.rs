//! Note-level resynthesis
//!
//! Re-renders the regions of a signal covered by modified notes:
//! - Per-note transform selection (pitch, formant, identity)
//! - Linear crossfades into the untouched residual at segment edges
//! - Voices rendered in parallel, merged in voice order
//! - Global peak limiting

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use rayon::prelude::*;

use crate::transform::{TransformKind, TransformSelector};
use crate::{NoteEvent, ResynthConfig, ResynthError, ResynthResult, Voice};

/// Output ceiling applied by [`limit_peak`]
pub const PEAK_CEILING: f32 = 0.99;

/// Cooperative cancellation flag, checked between note segments
#[derive(Debug, Clone, Default)]
pub struct CancellationToken(Arc<AtomicBool>);

impl CancellationToken {
    /// Create new token
    pub fn new() -> Self {
        Self::default()
    }

    /// Request cancellation
    pub fn cancel(&self) {
        self.0.store(true, Ordering::Relaxed);
    }

    /// Check whether cancellation was requested
    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }
}

/// Scale `samples` so the peak magnitude is at most [`PEAK_CEILING`]
///
/// Returns the gain applied (1.0 when the signal was already below the
/// ceiling).
pub fn limit_peak(samples: &mut [f32]) -> f32 {
    let peak = samples.iter().fold(0.0f32, |max, s| max.max(s.abs()));
    if peak <= PEAK_CEILING {
        return 1.0;
    }

    let gain = PEAK_CEILING / peak;
    for sample in samples.iter_mut() {
        *sample *= gain;
    }

    log::info!("[Resynth] Peak {:.3} limited to {}", peak, PEAK_CEILING);
    gain
}

/// Crossfade gain at `pos` within a segment of `len` samples
///
/// Linear ramps of `fade_len` samples at both edges, unity in between.
fn crossfade_gain(pos: usize, len: usize, fade_len: usize) -> f32 {
    if fade_len == 0 {
        return 1.0;
    }
    let fade_in = pos as f32 / fade_len as f32;
    let fade_out = (len - 1 - pos) as f32 / fade_len as f32;
    fade_in.min(fade_out).min(1.0)
}

/// One processed note, ready to be mixed
#[derive(Debug)]
struct RenderedSegment {
    /// First sample in the signal
    start: usize,
    /// Processed samples, already scaled by volume and fade
    samples: Vec<f32>,
    /// Fade gain per sample
    fade: Vec<f32>,
}

/// Note-level resynthesis driver
#[derive(Debug, Clone)]
pub struct Resynthesizer {
    /// Configuration
    config: ResynthConfig,
    /// Transform selector shared by all voices
    selector: TransformSelector,
}

impl Resynthesizer {
    /// Create resynthesizer, validating the configuration
    pub fn new(config: ResynthConfig) -> ResynthResult<Self> {
        let selector = TransformSelector::new(&config)?;
        Ok(Self { config, selector })
    }

    /// Get configuration
    pub fn config(&self) -> &ResynthConfig {
        &self.config
    }

    /// Transform selector
    pub fn selector(&self) -> &TransformSelector {
        &self.selector
    }

    /// Apply one transform to a segment
    pub fn process_segment(&self, segment: &[f32], kind: TransformKind) -> ResynthResult<Vec<f32>> {
        self.selector.apply(segment, kind)
    }

    /// Change the duration of `signal` by `ratio` without changing its pitch
    pub fn time_stretch(&self, signal: &[f32], ratio: f32) -> ResynthResult<Vec<f32>> {
        self.selector
            .apply(signal, TransformKind::TimeStretch { ratio })
    }

    /// Re-render `signal` with the modified notes of `voices` applied
    pub fn synthesize(&self, voices: &[Voice], signal: &[f32]) -> ResynthResult<Vec<f32>> {
        self.synthesize_with_cancel(voices, signal, &CancellationToken::new())
    }

    /// [`synthesize`](Self::synthesize) with cooperative cancellation
    pub fn synthesize_with_cancel(
        &self,
        voices: &[Voice],
        signal: &[f32],
        cancel: &CancellationToken,
    ) -> ResynthResult<Vec<f32>> {
        if signal.is_empty() {
            return Err(ResynthError::EmptyInput);
        }
        validate_voices(voices)?;

        if !any_note_needs_processing(voices) {
            log::trace!("[Resynth] No modified notes, copying input");
            return Ok(signal.to_vec());
        }

        let mut output = self.render(voices, signal, cancel)?;
        limit_peak(&mut output);
        Ok(output)
    }

    /// Re-render an interleaved multi-channel buffer
    ///
    /// Every channel is processed with the same voices; the peak limiter runs
    /// over all channels together so their balance is kept.
    pub fn synthesize_interleaved(
        &self,
        voices: &[Voice],
        samples: &[f32],
        channels: usize,
    ) -> ResynthResult<Vec<f32>> {
        self.synthesize_interleaved_with_cancel(voices, samples, channels, &CancellationToken::new())
    }

    /// [`synthesize_interleaved`](Self::synthesize_interleaved) with
    /// cooperative cancellation
    pub fn synthesize_interleaved_with_cancel(
        &self,
        voices: &[Voice],
        samples: &[f32],
        channels: usize,
        cancel: &CancellationToken,
    ) -> ResynthResult<Vec<f32>> {
        if channels == 0 || samples.len() % channels != 0 {
            return Err(ResynthError::InvalidChannelLayout {
                samples: samples.len(),
                channels,
            });
        }
        if samples.is_empty() {
            return Err(ResynthError::EmptyInput);
        }
        validate_voices(voices)?;

        if !any_note_needs_processing(voices) {
            return Ok(samples.to_vec());
        }

        let mut output = vec![0.0; samples.len()];
        for (channel, input) in deinterleave(samples, channels).iter().enumerate() {
            let rendered = self.render(voices, input, cancel)?;
            for (frame, sample) in rendered.into_iter().enumerate() {
                output[frame * channels + channel] = sample;
            }
        }

        limit_peak(&mut output);
        Ok(output)
    }

    /// Render all voices over one channel, without peak limiting
    fn render(
        &self,
        voices: &[Voice],
        signal: &[f32],
        cancel: &CancellationToken,
    ) -> ResynthResult<Vec<f32>> {
        let per_voice: Vec<Vec<RenderedSegment>> = voices
            .par_iter()
            .map(|voice| self.render_voice(voice, signal, cancel))
            .collect::<ResynthResult<_>>()?;

        let mut output = vec![0.0; signal.len()];
        let mut residual = signal.to_vec();
        let mut segment_count = 0;

        for segment in per_voice.iter().flatten() {
            let range = segment.start..segment.start + segment.samples.len();
            for ((res, out), (&sample, &fade)) in residual[range.clone()]
                .iter_mut()
                .zip(&mut output[range])
                .zip(segment.samples.iter().zip(&segment.fade))
            {
                *res *= 1.0 - fade;
                *out += sample;
            }
            segment_count += 1;
        }

        for (out, res) in output.iter_mut().zip(&residual) {
            *out += res;
        }

        log::debug!(
            "[Resynth] Rendered {} segments from {} voices over {} samples",
            segment_count,
            voices.len(),
            signal.len()
        );

        Ok(output)
    }

    /// Process every note of one voice that needs it
    fn render_voice(
        &self,
        voice: &Voice,
        signal: &[f32],
        cancel: &CancellationToken,
    ) -> ResynthResult<Vec<RenderedSegment>> {
        if voice.muted {
            return Ok(Vec::new());
        }

        let mut segments = Vec::new();
        for note in voice.notes.iter().filter(|n| n.needs_processing()) {
            if cancel.is_cancelled() {
                return Err(ResynthError::Cancelled);
            }
            if let Some(segment) = self.render_note(note, voice.volume, signal)? {
                segments.push(segment);
            }
        }

        Ok(segments)
    }

    fn render_note(
        &self,
        note: &NoteEvent,
        volume: f32,
        signal: &[f32],
    ) -> ResynthResult<Option<RenderedSegment>> {
        let start = note.start_sample.min(signal.len());
        let end = note.end_sample().min(signal.len());
        let len = end - start;

        if len < self.selector.frame_size() {
            log::trace!(
                "[Resynth] Skipping note at {} ({} samples, shorter than one frame)",
                start,
                len
            );
            return Ok(None);
        }

        let kind = self.selector.select(note.pitch_shift, note.formant_shift);
        let processed = self.selector.apply(&signal[start..end], kind)?;

        let fade_len = self.selector.hop().min(len / 4);
        let fade: Vec<f32> = (0..len).map(|i| crossfade_gain(i, len, fade_len)).collect();
        let samples = processed
            .iter()
            .zip(&fade)
            .map(|(s, f)| s * volume * f)
            .collect();

        log::debug!(
            "[Resynth] Note {}..{}: {:?}, volume {:.2}",
            start,
            end,
            kind,
            volume
        );

        Ok(Some(RenderedSegment {
            start,
            samples,
            fade,
        }))
    }
}

fn validate_voices(voices: &[Voice]) -> ResynthResult<()> {
    voices
        .iter()
        .enumerate()
        .try_for_each(|(index, voice)| voice.validate(index))
}

fn any_note_needs_processing(voices: &[Voice]) -> bool {
    voices
        .iter()
        .flat_map(|voice| &voice.notes)
        .any(NoteEvent::needs_processing)
}

fn deinterleave(samples: &[f32], channels: usize) -> Vec<Vec<f32>> {
    (0..channels)
        .map(|channel| samples.iter().skip(channel).step_by(channels).copied().collect())
        .collect()
}

/// Re-render `signal` with the modified notes of `voices` (main API)
pub fn resynthesize(voices: &[Voice], signal: &[f32], config: ResynthConfig) -> ResynthResult<Vec<f32>> {
    Resynthesizer::new(config)?.synthesize(voices, signal)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::f32::consts::PI;

    const SAMPLE_RATE: u32 = 44100;

    fn sine(freq: f32, amplitude: f32, len: usize) -> Vec<f32> {
        (0..len)
            .map(|i| amplitude * (2.0 * PI * freq * i as f32 / SAMPLE_RATE as f32).sin())
            .collect()
    }

    fn engine() -> Resynthesizer {
        Resynthesizer::new(
            ResynthConfig::default()
                .with_sample_rate(SAMPLE_RATE)
                .with_fft_size(2048),
        )
        .unwrap()
    }

    #[test]
    fn test_unmodified_notes_copy_input() {
        let engine = engine();
        let signal = sine(440.0, 1.2, 20_000);
        let voices = vec![Voice::new(vec![NoteEvent::new(0, 10_000)])];

        // Not even peak limited when nothing is modified
        let output = engine.synthesize(&voices, &signal).unwrap();
        assert_eq!(output, signal);
        assert_eq!(engine.synthesize(&[], &signal).unwrap(), signal);
    }

    #[test]
    fn test_identity_note_is_seamless() {
        let engine = engine();
        let signal = sine(330.0, 0.5, 30_000);
        let note = NoteEvent::new(5_000, 12_000).with_pitch_shift(0.0);
        assert!(note.needs_processing());

        let output = engine.synthesize(&[Voice::new(vec![note])], &signal).unwrap();
        for (i, (a, b)) in output.iter().zip(&signal).enumerate() {
            assert!((a - b).abs() < 1e-6, "sample {}: {} vs {}", i, a, b);
        }
    }

    #[test]
    fn test_zero_volume_removes_region() {
        let engine = engine();
        let signal = sine(330.0, 0.5, 30_000);
        let voice =
            Voice::new(vec![NoteEvent::new(10_000, 8_000).with_pitch_shift(0.0)]).with_volume(0.0);

        let output = engine.synthesize(&[voice], &signal).unwrap();
        let hop = engine.selector().hop();

        // Fully faded interior is silent, outside is untouched
        assert!(output[10_000 + hop..18_000 - hop].iter().all(|s| s.abs() < 1e-6));
        assert_eq!(output[..10_000], signal[..10_000]);
        assert_eq!(output[18_000..], signal[18_000..]);
    }

    #[test]
    fn test_pitch_shift_outside_region_untouched() {
        let engine = engine();
        let signal = sine(440.0, 0.4, 40_000);
        let note = NoteEvent::new(10_000, 20_000).with_pitch_shift(5.0);

        let output = engine.synthesize(&[Voice::new(vec![note])], &signal).unwrap();
        assert_eq!(output.len(), signal.len());
        assert_eq!(output[..10_000], signal[..10_000]);
        assert_eq!(output[30_000..], signal[30_000..]);

        let changed = output[12_000..28_000]
            .iter()
            .zip(&signal[12_000..28_000])
            .any(|(a, b)| (a - b).abs() > 0.05);
        assert!(changed);
        assert!(output.iter().all(|s| s.is_finite() && s.abs() <= PEAK_CEILING));
    }

    #[test]
    fn test_limit_peak() {
        let mut samples = vec![0.5, -2.0, 1.0, 0.0];
        let gain = limit_peak(&mut samples);

        assert!((gain - 0.495).abs() < 1e-6);
        assert!((samples[1] + PEAK_CEILING).abs() < 1e-6);
        assert!((samples[0] / samples[2] - 0.5).abs() < 1e-6);

        let mut quiet = vec![0.1, -0.2];
        assert_eq!(limit_peak(&mut quiet), 1.0);
        assert_eq!(quiet, vec![0.1, -0.2]);
    }

    #[test]
    fn test_loud_input_is_limited() {
        let engine = engine();
        let signal = sine(220.0, 1.5, 20_000);
        let note = NoteEvent::new(0, 20_000).with_pitch_shift(0.0);

        let output = engine.synthesize(&[Voice::new(vec![note])], &signal).unwrap();
        let peak = output.iter().fold(0.0f32, |m, s| m.max(s.abs()));
        assert!((peak - PEAK_CEILING).abs() < 1e-4);
    }

    #[test]
    fn test_overlapping_notes_rejected() {
        let engine = engine();
        let signal = vec![0.1; 10_000];
        let voices = vec![
            Voice::new(vec![NoteEvent::new(0, 100)]),
            Voice::new(vec![
                NoteEvent::new(0, 5_000).with_pitch_shift(2.0),
                NoteEvent::new(4_000, 3_000),
            ]),
        ];

        assert!(matches!(
            engine.synthesize(&voices, &signal),
            Err(ResynthError::OverlappingNotes { voice: 1, note: 1 })
        ));
    }

    #[test]
    fn test_empty_input() {
        let engine = engine();
        assert!(matches!(
            engine.synthesize(&[], &[]),
            Err(ResynthError::EmptyInput)
        ));
        assert!(matches!(
            engine.time_stretch(&[], 2.0),
            Err(ResynthError::EmptyInput)
        ));
        for kind in [
            TransformKind::Identity,
            TransformKind::PitchShift { ratio: 2.0 },
            TransformKind::FormantShift { ratio: 1.2 },
        ] {
            assert!(matches!(
                engine.process_segment(&[], kind),
                Err(ResynthError::EmptyInput)
            ));
        }
    }

    #[test]
    fn test_notes_clamped_to_signal() {
        let engine = engine();
        let signal = sine(440.0, 0.3, 12_000);
        let voices = vec![Voice::new(vec![
            NoteEvent::new(8_000, 100_000).with_pitch_shift(3.0),
            NoteEvent::new(200_000, 10_000).with_pitch_shift(3.0),
        ])];

        let output = engine.synthesize(&voices, &signal).unwrap();
        assert_eq!(output.len(), signal.len());
        assert_eq!(output[..8_000], signal[..8_000]);
    }

    #[test]
    fn test_short_note_skipped() {
        let engine = engine();
        let signal = sine(440.0, 0.3, 12_000);
        let note = NoteEvent::new(1_000, 1_000).with_pitch_shift(7.0);

        let output = engine.synthesize(&[Voice::new(vec![note])], &signal).unwrap();
        assert_eq!(output, signal);
    }

    #[test]
    fn test_muted_voice_ignored() {
        let engine = engine();
        let signal = sine(440.0, 0.3, 20_000);
        let voice = Voice::new(vec![NoteEvent::new(0, 20_000).with_pitch_shift(7.0)]).muted();

        let output = engine.synthesize(&[voice], &signal).unwrap();
        assert_eq!(output, signal);
    }

    #[test]
    fn test_cancellation() {
        let engine = engine();
        let signal = sine(440.0, 0.3, 20_000);
        let voices = vec![Voice::new(vec![
            NoteEvent::new(0, 10_000).with_pitch_shift(2.0),
        ])];

        let token = CancellationToken::new();
        token.cancel();
        assert!(token.is_cancelled());
        assert!(matches!(
            engine.synthesize_with_cancel(&voices, &signal, &token),
            Err(ResynthError::Cancelled)
        ));
    }

    #[test]
    fn test_interleaved_layout() {
        let engine = engine();
        assert!(matches!(
            engine.synthesize_interleaved(&[], &[0.0; 5], 2),
            Err(ResynthError::InvalidChannelLayout {
                samples: 5,
                channels: 2
            })
        ));
        assert!(matches!(
            engine.synthesize_interleaved(&[], &[0.0; 4], 0),
            Err(ResynthError::InvalidChannelLayout { .. })
        ));
    }

    #[test]
    fn test_interleaved_keeps_channels_apart() {
        let engine = engine();
        let left = sine(440.0, 0.5, 16_000);
        let right = vec![0.0; 16_000];
        let stereo: Vec<f32> = left
            .iter()
            .zip(&right)
            .flat_map(|(&l, &r)| [l, r])
            .collect();

        let voices = vec![Voice::new(vec![
            NoteEvent::new(0, 16_000).with_pitch_shift(4.0),
        ])];
        let output = engine.synthesize_interleaved(&voices, &stereo, 2).unwrap();

        assert_eq!(output.len(), stereo.len());
        assert!(output.iter().skip(1).step_by(2).all(|s| s.abs() < 1e-6));
        assert!(output.iter().step_by(2).any(|s| s.abs() > 0.1));
    }

    #[test]
    fn test_crossfade_gain() {
        assert_eq!(crossfade_gain(0, 100, 0), 1.0);
        assert_eq!(crossfade_gain(0, 100, 10), 0.0);
        assert!((crossfade_gain(5, 100, 10) - 0.5).abs() < 1e-6);
        assert_eq!(crossfade_gain(50, 100, 10), 1.0);
        assert_eq!(crossfade_gain(99, 100, 10), 0.0);
    }
}
