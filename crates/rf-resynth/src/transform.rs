//! Transform selection and the shared STFT pipeline
//!
//! Every transform variant runs through one analysis / bin-processing /
//! overlap-add scaffold. Variants differ only in the [`SpectralProcessor`]
//! plugged into it and in the synthesis hop.

use num_complex::Complex;
use serde::{Deserialize, Serialize};

use crate::envelope::{EnvelopeExtractor, MAGNITUDE_FLOOR, sample_floored};
use crate::fft::SpectralTransform;
use crate::framer::Framer;
use crate::phase::{PhaseCursor, synthesis_offset};
use crate::{ResynthConfig, ResynthError, ResynthResult, semitones_to_ratio};

/// Ratios closer than this to 1.0 are treated as unity
pub const RATIO_EPSILON: f32 = 0.001;

/// Shortest supported time-stretch ratio
pub const MIN_STRETCH_RATIO: f32 = 0.25;

/// Longest supported time-stretch ratio
pub const MAX_STRETCH_RATIO: f32 = 4.0;

/// True when `ratio` is indistinguishable from 1.0
#[inline]
pub fn is_unity(ratio: f32) -> bool {
    (ratio - 1.0).abs() < RATIO_EPSILON
}

/// Transform applied to one segment
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum TransformKind {
    /// Verbatim copy
    Identity,
    /// Phase vocoder pitch shift, formants move with the pitch
    PitchShift { ratio: f32 },
    /// Pitch shift with the source envelope kept in place
    PitchShiftPreserveFormants { ratio: f32 },
    /// Formant-preserving pitch shift followed by an envelope remap
    PitchAndFormantShift { pitch_ratio: f32, formant_ratio: f32 },
    /// Envelope remap only, phase passes through
    FormantShift { ratio: f32 },
    /// Duration change without pitch change
    TimeStretch { ratio: f32 },
}

impl TransformKind {
    /// Pick the transform for a pitch and formant deviation in semitones
    pub fn select(pitch_semitones: f32, formant_semitones: f32, preserve_formants: bool) -> Self {
        let pitch_ratio = semitones_to_ratio(pitch_semitones);
        let formant_ratio = semitones_to_ratio(formant_semitones);

        match (!is_unity(pitch_ratio), !is_unity(formant_ratio)) {
            (false, false) => TransformKind::Identity,
            (true, false) if preserve_formants => {
                TransformKind::PitchShiftPreserveFormants { ratio: pitch_ratio }
            }
            (true, false) => TransformKind::PitchShift { ratio: pitch_ratio },
            (true, true) => TransformKind::PitchAndFormantShift {
                pitch_ratio,
                formant_ratio,
            },
            (false, true) => TransformKind::FormantShift {
                ratio: formant_ratio,
            },
        }
    }

    /// Collapse ratios within [`RATIO_EPSILON`] of unity
    pub fn normalized(self) -> Self {
        match self {
            TransformKind::PitchShift { ratio }
            | TransformKind::PitchShiftPreserveFormants { ratio }
            | TransformKind::FormantShift { ratio }
            | TransformKind::TimeStretch { ratio }
                if is_unity(ratio) =>
            {
                TransformKind::Identity
            }
            TransformKind::PitchAndFormantShift {
                pitch_ratio,
                formant_ratio,
            } => match (is_unity(pitch_ratio), is_unity(formant_ratio)) {
                (true, true) => TransformKind::Identity,
                (true, false) => TransformKind::FormantShift {
                    ratio: formant_ratio,
                },
                (false, true) => TransformKind::PitchShiftPreserveFormants { ratio: pitch_ratio },
                (false, false) => self,
            },
            other => other,
        }
    }

    /// True when the transform leaves the signal untouched
    pub fn is_identity(&self) -> bool {
        matches!(self.normalized(), TransformKind::Identity)
    }

    /// Output length for an input of `len` samples
    pub fn output_len(&self, len: usize) -> usize {
        match self.normalized() {
            TransformKind::TimeStretch { ratio } => (len as f64 * ratio as f64).round() as usize,
            _ => len,
        }
    }

    fn validate(&self) -> ResynthResult<()> {
        let ratios: &[f32] = match self {
            TransformKind::Identity => &[],
            TransformKind::PitchShift { ratio }
            | TransformKind::PitchShiftPreserveFormants { ratio }
            | TransformKind::FormantShift { ratio } => std::slice::from_ref(ratio),
            TransformKind::PitchAndFormantShift {
                pitch_ratio,
                formant_ratio,
            } => {
                if !pitch_ratio.is_finite() || *pitch_ratio <= 0.0 {
                    return Err(ResynthError::InvalidRatio(*pitch_ratio));
                }
                std::slice::from_ref(formant_ratio)
            }
            TransformKind::TimeStretch { ratio } => {
                if !(MIN_STRETCH_RATIO..=MAX_STRETCH_RATIO).contains(ratio) {
                    return Err(ResynthError::InvalidRatio(*ratio));
                }
                &[]
            }
        };

        for &ratio in ratios {
            if !ratio.is_finite() || ratio <= 0.0 {
                return Err(ResynthError::InvalidRatio(ratio));
            }
        }
        Ok(())
    }
}

/// Per-frame bin processing plugged into the STFT pipeline
///
/// Receives the forward transform of one analysis frame and must leave the
/// spectrum to synthesize in the same buffer. Frames arrive strictly in
/// temporal order.
pub trait SpectralProcessor {
    fn process_frame(&mut self, spectrum: &mut [Complex<f32>]) -> ResynthResult<()>;
}

/// What happens to the spectral envelope after the bins move
#[derive(Debug, Clone, Copy)]
enum FormantMode {
    /// Envelope moves with the pitch
    Free,
    /// Envelope stays where the source had it
    Preserve,
    /// Envelope stays, then gets remapped by the given ratio
    PreserveAndShift(f32),
}

/// Phase vocoder: pitch shift and/or time stretch with optional envelope work
struct PhaseVocoderProcessor {
    cursor: PhaseCursor,
    pitch_ratio: f32,
    formants: FormantMode,
    envelope: Option<EnvelopeExtractor>,
}

impl SpectralProcessor for PhaseVocoderProcessor {
    fn process_frame(&mut self, spectrum: &mut [Complex<f32>]) -> ResynthResult<()> {
        let envelope = match self.envelope.as_mut() {
            Some(extractor) => Some(extractor.extract(spectrum)?),
            None => None,
        };

        let analyzed = self.cursor.analyze(spectrum)?;
        let mut frame = if is_unity(self.pitch_ratio) {
            analyzed
        } else {
            analyzed.shift_pitch(self.pitch_ratio)
        };

        if let Some(env) = envelope {
            let ratio = self.pitch_ratio;
            for (bin, mag) in frame.magnitude.iter_mut().enumerate() {
                if *mag == 0.0 {
                    continue;
                }
                let target = env[bin].max(MAGNITUDE_FLOOR);

                // Flatten against the envelope at the source frequency, then
                // restore the envelope at the target frequency
                let mut gain = target / sample_floored(&env, bin as f32 / ratio);
                if let FormantMode::PreserveAndShift(formant_ratio) = self.formants {
                    gain *= sample_floored(&env, bin as f32 / formant_ratio) / target;
                }
                *mag *= gain;
            }
        }

        self.cursor.synthesize(&frame, spectrum)
    }
}

/// Envelope remap with the analysis phase passed through
struct FormantShiftProcessor {
    extractor: EnvelopeExtractor,
    ratio: f32,
}

impl SpectralProcessor for FormantShiftProcessor {
    fn process_frame(&mut self, spectrum: &mut [Complex<f32>]) -> ResynthResult<()> {
        let envelope = self.extractor.extract(spectrum)?;
        let size = spectrum.len();

        for (bin, &env) in envelope.iter().enumerate() {
            let gain = sample_floored(&envelope, bin as f32 / self.ratio) / env.max(MAGNITUDE_FLOOR);
            spectrum[bin] *= gain;
            if bin > 0 && bin < size - bin {
                spectrum[size - bin] *= gain;
            }
        }

        Ok(())
    }
}

/// Run `input` through analysis, `processor`, and overlap-add
///
/// The input is pre-padded by `size - hop` samples so every kept output
/// sample sees the full frame overlap; the padding is trimmed again. Output
/// frames sit `hop * stretch` apart, rounded per frame.
pub(crate) fn run_stft(
    framer: &Framer,
    fft: &mut SpectralTransform,
    input: &[f32],
    stretch: f64,
    out_len: usize,
    processor: &mut dyn SpectralProcessor,
) -> ResynthResult<Vec<f32>> {
    let size = framer.size();
    let hop_in = framer.hop();
    let hop_out = hop_in as f64 * stretch;
    let pad_in = size - hop_in;

    let mut padded = vec![0.0; pad_in + input.len()];
    padded[pad_in..].copy_from_slice(input);

    let num_frames = padded.len().div_ceil(hop_in);
    let half = size as f64 / 2.0;
    let pad_out = (half + (half - hop_in as f64) * stretch).round().max(0.0) as usize;

    let last_offset = synthesis_offset(num_frames.saturating_sub(1) as u64, hop_out);
    let mut output = vec![0.0; last_offset + size];
    if output.len() < pad_out + out_len {
        output.resize(pad_out + out_len, 0.0);
    }

    let norm = framer.norm_factor_for_hop(hop_out);
    for frame_idx in 0..num_frames {
        let mut spectrum = framer.extract_frame(&padded, frame_idx * hop_in);
        fft.forward(&mut spectrum)?;
        processor.process_frame(&mut spectrum)?;
        fft.inverse(&mut spectrum)?;
        let offset = synthesis_offset(frame_idx as u64, hop_out);
        framer.accumulate(&mut output, &spectrum, offset, norm);
    }

    log::trace!(
        "[Selector] {} frames, hop {} -> {:.2}, {} -> {} samples",
        num_frames,
        hop_in,
        hop_out,
        input.len(),
        out_len
    );

    output.drain(..pad_out);
    output.truncate(out_len);
    Ok(output)
}

/// Applies a [`TransformKind`] to sample segments
///
/// Holds the planned transform and framer for one configuration. `apply`
/// takes `&self` and builds all per-call state fresh, so one selector can be
/// shared between worker threads.
#[derive(Debug, Clone)]
pub struct TransformSelector {
    framer: Framer,
    fft: SpectralTransform,
    envelope_order: usize,
    preserve_formants: bool,
}

impl TransformSelector {
    /// Build selector for a validated configuration
    pub fn new(config: &ResynthConfig) -> ResynthResult<Self> {
        config.validate()?;
        Ok(Self {
            framer: Framer::new(config.fft_size, config.overlap)?,
            fft: SpectralTransform::new(config.fft_size)?,
            envelope_order: config.envelope_order,
            preserve_formants: config.preserve_formants,
        })
    }

    /// Transform length
    pub fn frame_size(&self) -> usize {
        self.framer.size()
    }

    /// Analysis hop
    pub fn hop(&self) -> usize {
        self.framer.hop()
    }

    /// Framer used by the pipeline
    pub fn framer(&self) -> &Framer {
        &self.framer
    }

    /// Transform for a note's pitch and formant deviation
    pub fn select(&self, pitch_semitones: f32, formant_semitones: f32) -> TransformKind {
        TransformKind::select(pitch_semitones, formant_semitones, self.preserve_formants)
    }

    /// Apply `kind` to `segment`
    ///
    /// Unity transforms and segments shorter than one frame come back as a
    /// verbatim copy. An empty segment is an error.
    pub fn apply(&self, segment: &[f32], kind: TransformKind) -> ResynthResult<Vec<f32>> {
        if segment.is_empty() {
            return Err(ResynthError::EmptyInput);
        }
        kind.validate()?;
        let kind = kind.normalized();

        if kind == TransformKind::Identity {
            return Ok(segment.to_vec());
        }
        if segment.len() < self.framer.size() {
            log::trace!(
                "[Selector] segment of {} samples shorter than frame {}, passing through",
                segment.len(),
                self.framer.size()
            );
            return Ok(segment.to_vec());
        }

        log::debug!("[Selector] {:?} over {} samples", kind, segment.len());

        let size = self.framer.size();
        let hop = self.framer.hop();
        let mut fft = self.fft.clone();

        let stretch = match kind {
            TransformKind::TimeStretch { ratio } => ratio as f64,
            _ => 1.0,
        };

        let envelope = || EnvelopeExtractor::with_transform(self.fft.clone(), self.envelope_order);
        let vocoder = |pitch_ratio: f32, formants: FormantMode| -> ResynthResult<PhaseVocoderProcessor> {
            let envelope = match formants {
                FormantMode::Free => None,
                FormantMode::Preserve | FormantMode::PreserveAndShift(_) => Some(envelope()?),
            };
            Ok(PhaseVocoderProcessor {
                cursor: PhaseCursor::new(size, hop, hop as f64 * stretch),
                pitch_ratio,
                formants,
                envelope,
            })
        };

        let mut processor: Box<dyn SpectralProcessor> = match kind {
            TransformKind::Identity => return Ok(segment.to_vec()),
            TransformKind::PitchShift { ratio } => Box::new(vocoder(ratio, FormantMode::Free)?),
            TransformKind::PitchShiftPreserveFormants { ratio } => {
                Box::new(vocoder(ratio, FormantMode::Preserve)?)
            }
            TransformKind::PitchAndFormantShift {
                pitch_ratio,
                formant_ratio,
            } => Box::new(vocoder(
                pitch_ratio,
                FormantMode::PreserveAndShift(formant_ratio),
            )?),
            TransformKind::FormantShift { ratio } => Box::new(FormantShiftProcessor {
                extractor: envelope()?,
                ratio,
            }),
            TransformKind::TimeStretch { .. } => Box::new(vocoder(1.0, FormantMode::Free)?),
        };

        run_stft(
            &self.framer,
            &mut fft,
            segment,
            stretch,
            kind.output_len(segment.len()),
            processor.as_mut(),
        )
    }
}
