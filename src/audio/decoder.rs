//! Blocking decode stage of the transcode pipeline.
//!
//! Runs on tokio's blocking pool. Reads the async byte stream through
//! [`BlockingReader`], demuxes and decodes with symphonia, folds to stereo,
//! resamples to 48 kHz, cuts 20 ms frames, applies gain and hands encoded
//! frames to the [`PipelineFeed`]. The feed's bounded channel is what paces
//! this loop: once `read_ahead_frames` are waiting, `send` blocks.

use parking_lot::Mutex;
use std::{
    io::{self, Read},
    time::Duration,
};
use symphonia::core::{
    audio::SampleBuffer,
    codecs::{DecoderOptions, CODEC_TYPE_NULL},
    errors::Error as SymphoniaError,
    formats::FormatOptions,
    io::{MediaSourceStream, ReadOnlySource},
    meta::MetadataOptions,
    probe::Hint,
};
use tokio::{io::AsyncReadExt, runtime::Handle};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::{
    encoder::{FrameCodec, FrameEncoder},
    pipeline::{Frame, Gain, PipelineFeed},
    resampler::StreamResampler,
    CHANNELS, FRAME_SAMPLES,
};
use crate::{error::PipelineError, sources::ByteStream};

/// Paquetes corruptos seguidos que se toleran antes de abandonar el track
const MAX_CONSECUTIVE_DECODE_ERRORS: usize = 10;

const FRAME_LEN: usize = FRAME_SAMPLES * CHANNELS;

/// Adaptador `std::io::Read` sobre el stream asíncrono.
///
/// Cada lectura espera como máximo `read_timeout` y se aborta en cuanto
/// se cancela el pipeline.
pub(crate) struct BlockingReader {
    stream: Mutex<ByteStream>,
    handle: Handle,
    cancel: CancellationToken,
    read_timeout: Duration,
}

impl BlockingReader {
    pub(crate) fn new(
        stream: ByteStream,
        handle: Handle,
        cancel: CancellationToken,
        read_timeout: Duration,
    ) -> Self {
        Self {
            stream: Mutex::new(stream),
            handle,
            cancel,
            read_timeout,
        }
    }
}

impl Read for BlockingReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let stream = self.stream.get_mut();
        let cancel = &self.cancel;
        let read_timeout = self.read_timeout;

        self.handle.block_on(async move {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    Err(io::Error::new(io::ErrorKind::ConnectionAborted, "pipeline cancelled"))
                }
                read = tokio::time::timeout(read_timeout, stream.read(buf)) => match read {
                    Ok(result) => result,
                    Err(_) => Err(io::Error::new(io::ErrorKind::TimedOut, "no data from source")),
                },
            }
        })
    }
}

/// Todo lo que necesita el hilo de decodificación.
pub(crate) struct DecodeJob {
    pub reader: BlockingReader,
    pub hint: Option<String>,
    pub codec: FrameCodec,
    pub bitrate: u32,
    pub gain: Gain,
    pub label: String,
}

/// Punto de entrada del hilo bloqueante.
pub(crate) fn run(job: DecodeJob, feed: PipelineFeed) {
    let label = job.label.clone();
    match decode(job, &feed) {
        Ok(frames) => debug!("🏁 Decodificación terminada para {} ({} frames)", label, frames),
        Err(_) if feed.is_cancelled() => debug!("Decodificación cancelada para {}", label),
        Err(e) => {
            warn!("❌ Error en pipeline de {}: {}", label, e);
            feed.send_blocking(Err(e));
        }
    }
}

fn decode(job: DecodeJob, feed: &PipelineFeed) -> Result<u64, PipelineError> {
    let DecodeJob {
        reader,
        hint: format_hint,
        codec,
        bitrate,
        gain,
        ..
    } = job;

    let mut hint = Hint::new();
    if let Some(ext) = format_hint.as_deref() {
        hint.with_extension(ext);
    }

    let mss = MediaSourceStream::new(Box::new(ReadOnlySource::new(reader)), Default::default());
    let probed = symphonia::default::get_probe()
        .format(&hint, mss, &FormatOptions::default(), &MetadataOptions::default())
        .map_err(|e| map_symphonia(e, "probe"))?;

    let mut format = probed.format;
    let track = format
        .tracks()
        .iter()
        .find(|t| t.codec_params.codec != CODEC_TYPE_NULL)
        .ok_or_else(|| PipelineError::DecodeError("no audio track".to_string()))?;
    let track_id = track.id;

    let mut decoder = symphonia::default::get_codecs()
        .make(&track.codec_params, &DecoderOptions::default())
        .map_err(|e| map_symphonia(e, "codec"))?;

    let mut encoder = FrameEncoder::new(codec, bitrate)?;
    let mut resampler: Option<StreamResampler> = None;
    let mut framer = Framer::default();
    let mut emitter = Emitter {
        feed,
        encoder: &mut encoder,
        gain: &gain,
        sequence: 0,
    };

    let mut stereo = Vec::new();
    let mut resampled = Vec::new();
    let mut consecutive_errors = 0;

    loop {
        if feed.is_cancelled() {
            return Ok(emitter.sequence);
        }

        let packet = match format.next_packet() {
            Ok(packet) => packet,
            Err(SymphoniaError::IoError(e)) if e.kind() == io::ErrorKind::UnexpectedEof => break,
            Err(SymphoniaError::ResetRequired) => break,
            Err(e) => return Err(map_symphonia(e, "demux")),
        };

        if packet.track_id() != track_id {
            continue;
        }

        let decoded = match decoder.decode(&packet) {
            Ok(decoded) => {
                consecutive_errors = 0;
                decoded
            }
            Err(SymphoniaError::DecodeError(e)) => {
                consecutive_errors += 1;
                if consecutive_errors >= MAX_CONSECUTIVE_DECODE_ERRORS {
                    return Err(PipelineError::DecodeError(e.to_string()));
                }
                debug!("Paquete corrupto descartado: {}", e);
                continue;
            }
            Err(e) => return Err(map_symphonia(e, "decode")),
        };

        let spec = *decoded.spec();
        if decoded.frames() == 0 {
            continue;
        }

        let mut samples = SampleBuffer::<f32>::new(decoded.capacity() as u64, spec);
        samples.copy_interleaved_ref(decoded);

        let active = resampler_for(&mut resampler, spec.rate, &mut framer)?;

        stereo.clear();
        fold_to_stereo(samples.samples(), spec.channels.count(), &mut stereo);

        resampled.clear();
        active.push(&stereo, &mut resampled)?;
        framer.push(&resampled);

        while let Some(frame) = framer.pop() {
            if !emitter.emit(frame)? {
                return Ok(emitter.sequence);
            }
        }
    }

    if let Some(resampler) = resampler.as_mut() {
        resampled.clear();
        resampler.flush(&mut resampled)?;
        framer.push(&resampled);
    }

    while let Some(frame) = framer.pop() {
        if !emitter.emit(frame)? {
            return Ok(emitter.sequence);
        }
    }
    if let Some(frame) = framer.finish() {
        emitter.emit(frame)?;
    }

    Ok(emitter.sequence)
}

/// Resampler para `rate`. Si la frecuencia cambió a mitad del stream, el
/// anterior se vacía en `framer` antes de reemplazarlo.
fn resampler_for<'a>(
    slot: &'a mut Option<StreamResampler>,
    rate: u32,
    framer: &mut Framer,
) -> Result<&'a mut StreamResampler, PipelineError> {
    let resampler = match slot.take() {
        Some(current) if current.input_rate() == rate => current,
        Some(mut previous) => {
            debug!(
                "🔀 Frecuencia cambió {}Hz -> {}Hz, reconstruyendo resampler",
                previous.input_rate(),
                rate
            );
            let mut tail = Vec::new();
            previous.flush(&mut tail)?;
            framer.push(&tail);
            StreamResampler::new(rate)?
        }
        None => StreamResampler::new(rate)?,
    };
    Ok(slot.insert(resampler))
}

struct Emitter<'a> {
    feed: &'a PipelineFeed,
    encoder: &'a mut FrameEncoder,
    gain: &'a Gain,
    sequence: u64,
}

impl Emitter<'_> {
    /// Devuelve `false` si el consumidor ya no existe.
    fn emit(&mut self, mut samples: Vec<f32>) -> Result<bool, PipelineError> {
        self.gain.apply(&mut samples);
        let payload = self.encoder.encode(&samples)?;
        let frame = Frame {
            sequence: self.sequence,
            payload,
        };
        self.sequence += 1;
        Ok(self.feed.send_blocking(Ok(frame)))
    }
}

fn map_symphonia(err: SymphoniaError, stage: &str) -> PipelineError {
    match err {
        SymphoniaError::IoError(e) => match e.kind() {
            io::ErrorKind::TimedOut => PipelineError::Timeout(format!("{}: {}", stage, e)),
            io::ErrorKind::UnexpectedEof => {
                PipelineError::DecodeError(format!("{}: stream ended early", stage))
            }
            _ => PipelineError::SourceUnavailable(format!("{}: {}", stage, e)),
        },
        other => PipelineError::DecodeError(format!("{}: {}", stage, other)),
    }
}

/// Mono se duplica; más de dos canales se reducen a los dos frontales.
fn fold_to_stereo(interleaved: &[f32], channels: usize, out: &mut Vec<f32>) {
    match channels {
        0 => {}
        1 => {
            out.reserve(interleaved.len() * 2);
            for &s in interleaved {
                out.push(s);
                out.push(s);
            }
        }
        2 => out.extend_from_slice(interleaved),
        n => {
            out.reserve(interleaved.len() / n * 2);
            for frame in interleaved.chunks_exact(n) {
                out.push(frame[0]);
                out.push(frame[1]);
            }
        }
    }
}

/// Corta el audio en frames de 20 ms.
#[derive(Default)]
struct Framer {
    buffer: Vec<f32>,
}

impl Framer {
    fn push(&mut self, samples: &[f32]) {
        self.buffer.extend_from_slice(samples);
    }

    fn pop(&mut self) -> Option<Vec<f32>> {
        if self.buffer.len() < FRAME_LEN {
            return None;
        }
        let rest = self.buffer.split_off(FRAME_LEN);
        Some(std::mem::replace(&mut self.buffer, rest))
    }

    /// Último frame parcial, completado con silencio.
    fn finish(&mut self) -> Option<Vec<f32>> {
        if self.buffer.is_empty() {
            return None;
        }
        let mut frame = std::mem::take(&mut self.buffer);
        frame.resize(FRAME_LEN, 0.0);
        Some(frame)
    }
}
