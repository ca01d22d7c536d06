use audiopus::{coder::Encoder as OpusEncoder, Application, Bitrate, Channels, SampleRate};
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::{fmt, str::FromStr};
use thiserror::Error;

use super::{FRAME_SAMPLES, PCM_FRAME_BYTES};
use crate::error::PipelineError;

/// Tamaño máximo recomendado para un paquete Opus
const MAX_OPUS_PACKET: usize = 4000;

/// Formato del payload de cada frame enviado al transporte.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FrameCodec {
    Opus,
    Pcm,
}

#[derive(Debug, Error)]
#[error("unknown frame codec '{0}' (expected opus or pcm)")]
pub struct UnknownCodec(String);

impl FromStr for FrameCodec {
    type Err = UnknownCodec;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "opus" => Ok(FrameCodec::Opus),
            "pcm" | "s16le" => Ok(FrameCodec::Pcm),
            other => Err(UnknownCodec(other.to_string())),
        }
    }
}

impl fmt::Display for FrameCodec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FrameCodec::Opus => write!(f, "opus"),
            FrameCodec::Pcm => write!(f, "pcm"),
        }
    }
}

/// Codifica frames de 20 ms (48 kHz, estéreo, f32 intercalado).
pub enum FrameEncoder {
    Opus {
        encoder: OpusEncoder,
        buffer: Vec<u8>,
    },
    Pcm,
}

impl FrameEncoder {
    pub fn new(codec: FrameCodec, bitrate: u32) -> Result<Self, PipelineError> {
        match codec {
            FrameCodec::Opus => {
                let mut encoder =
                    OpusEncoder::new(SampleRate::Hz48000, Channels::Stereo, Application::Audio)
                        .map_err(|e| PipelineError::DecodeError(format!("opus encoder: {}", e)))?;
                encoder
                    .set_bitrate(Bitrate::BitsPerSecond(bitrate as i32))
                    .map_err(|e| PipelineError::DecodeError(format!("opus bitrate: {}", e)))?;
                Ok(FrameEncoder::Opus {
                    encoder,
                    buffer: vec![0u8; MAX_OPUS_PACKET],
                })
            }
            FrameCodec::Pcm => Ok(FrameEncoder::Pcm),
        }
    }

    /// `samples` debe contener exactamente un frame intercalado.
    pub fn encode(&mut self, samples: &[f32]) -> Result<Bytes, PipelineError> {
        debug_assert_eq!(samples.len(), FRAME_SAMPLES * 2);
        match self {
            FrameEncoder::Opus { encoder, buffer } => {
                let len = encoder
                    .encode_float(samples, buffer)
                    .map_err(|e| PipelineError::DecodeError(format!("opus encode: {}", e)))?;
                Ok(Bytes::copy_from_slice(&buffer[..len]))
            }
            FrameEncoder::Pcm => {
                let mut out = Vec::with_capacity(PCM_FRAME_BYTES);
                for &sample in samples {
                    out.extend_from_slice(&f32_to_i16(sample).to_le_bytes());
                }
                Ok(Bytes::from(out))
            }
        }
    }
}

fn f32_to_i16(sample: f32) -> i16 {
    (sample.clamp(-1.0, 1.0) * i16::MAX as f32) as i16
}
