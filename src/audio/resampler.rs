//! Streaming sample-rate conversion to 48 kHz.
//!
//! Decoded packets arrive in arbitrary sizes, so input is buffered per
//! channel and fed to rubato in fixed chunks. The tail is flushed with
//! `process_partial` and trimmed to the length the input actually covers.

use rubato::{FastFixedIn, PolynomialDegree, Resampler as RubatoResampler};
use tracing::debug;

use super::{CHANNELS, SAMPLE_RATE};
use crate::error::PipelineError;

const CHUNK_FRAMES: usize = 1024;

pub struct StreamResampler {
    inner: Option<FastFixedIn<f32>>,
    input_rate: u32,
    ratio: f64,
    pending: Vec<Vec<f32>>,
}

impl StreamResampler {
    pub fn new(input_rate: u32) -> Result<Self, PipelineError> {
        if input_rate == 0 {
            return Err(PipelineError::DecodeError("sample rate is zero".to_string()));
        }

        if input_rate == SAMPLE_RATE {
            return Ok(Self {
                inner: None,
                input_rate,
                ratio: 1.0,
                pending: vec![Vec::new(); CHANNELS],
            });
        }

        let ratio = SAMPLE_RATE as f64 / input_rate as f64;
        debug!("🔄 Resampling {}Hz -> {}Hz", input_rate, SAMPLE_RATE);

        let resampler = FastFixedIn::<f32>::new(
            ratio,
            1.0,
            PolynomialDegree::Septic,
            CHUNK_FRAMES,
            CHANNELS,
        )
        .map_err(|e| PipelineError::DecodeError(format!("resampler: {}", e)))?;

        Ok(Self {
            inner: Some(resampler),
            input_rate,
            ratio,
            pending: vec![Vec::with_capacity(CHUNK_FRAMES * 2); CHANNELS],
        })
    }

    pub fn input_rate(&self) -> u32 {
        self.input_rate
    }

    pub fn is_passthrough(&self) -> bool {
        self.inner.is_none()
    }

    /// Agrega muestras estéreo intercaladas y escribe en `out` lo que ya esté listo.
    pub fn push(&mut self, interleaved: &[f32], out: &mut Vec<f32>) -> Result<(), PipelineError> {
        let Some(resampler) = self.inner.as_mut() else {
            out.extend_from_slice(interleaved);
            return Ok(());
        };

        for frame in interleaved.chunks_exact(CHANNELS) {
            for (channel, sample) in frame.iter().enumerate() {
                self.pending[channel].push(*sample);
            }
        }

        loop {
            let needed = resampler.input_frames_next();
            if self.pending[0].len() < needed {
                break;
            }

            let chunk: Vec<Vec<f32>> = self
                .pending
                .iter_mut()
                .map(|channel| channel.drain(..needed).collect())
                .collect();

            let planar = resampler
                .process(&chunk, None)
                .map_err(|e| PipelineError::DecodeError(format!("resample: {}", e)))?;
            interleave_into(&planar, usize::MAX, out);
        }

        Ok(())
    }

    /// Procesa el resto pendiente al final del stream.
    pub fn flush(&mut self, out: &mut Vec<f32>) -> Result<(), PipelineError> {
        let Some(resampler) = self.inner.as_mut() else {
            return Ok(());
        };

        let remaining = self.pending[0].len();
        if remaining == 0 {
            return Ok(());
        }

        let planar = resampler
            .process_partial(Some(self.pending.as_slice()), None)
            .map_err(|e| PipelineError::DecodeError(format!("resample: {}", e)))?;
        let expected = (remaining as f64 * self.ratio).ceil() as usize;
        interleave_into(&planar, expected, out);

        for channel in &mut self.pending {
            channel.clear();
        }
        Ok(())
    }
}

/// Intercala hasta `limit` frames planos.
fn interleave_into(planar: &[Vec<f32>], limit: usize, out: &mut Vec<f32>) {
    let frames = planar.first().map_or(0, Vec::len).min(limit);
    out.reserve(frames * planar.len());
    for i in 0..frames {
        for channel in planar {
            out.push(channel[i]);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tone(frames: usize, rate: u32) -> Vec<f32> {
        (0..frames)
            .flat_map(|i| {
                let s = (i as f32 * 440.0 * std::f32::consts::TAU / rate as f32).sin() * 0.5;
                [s, s]
            })
            .collect()
    }

    #[test]
    fn native_rate_passes_through() {
        let mut resampler = StreamResampler::new(48_000).unwrap();
        assert!(resampler.is_passthrough());

        let input = tone(100, 48_000);
        let mut out = Vec::new();
        resampler.push(&input, &mut out).unwrap();
        resampler.flush(&mut out).unwrap();
        assert_eq!(out, input);
    }

    #[test]
    fn converts_one_second_of_44k1_to_about_48k_frames() {
        let mut resampler = StreamResampler::new(44_100).unwrap();
        let input = tone(44_100, 44_100);

        let mut out = Vec::new();
        // Paquetes de tamaño irregular, como los de un decoder real
        for packet in input.chunks(1152 * 2) {
            resampler.push(packet, &mut out).unwrap();
        }
        resampler.flush(&mut out).unwrap();

        let frames = out.len() / 2;
        assert!((47_500..=48_500).contains(&frames), "got {} frames", frames);
        assert!(out.iter().all(|s| s.is_finite()));
    }

    #[test]
    fn zero_rate_is_rejected() {
        assert!(matches!(
            StreamResampler::new(0),
            Err(PipelineError::DecodeError(_))
        ));
    }
}
