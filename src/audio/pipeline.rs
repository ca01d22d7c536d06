//! # Transcode Pipeline
//!
//! Turns a track's lazy [`StreamHandle`](crate::sources::StreamHandle) into a
//! pull-based sequence of 20 ms [`Frame`]s.
//!
//! A producer runs ahead of the consumer through a bounded `flume` channel
//! holding at most `read_ahead_frames` frames. Every pull waits at most
//! `read_timeout`; a stalled source surfaces as [`PipelineError::Timeout`]
//! instead of hanging the session. Dropping a [`TranscodePipeline`] cancels
//! its producer and closes the channel, so no frame of an abandoned track can
//! reach the transport afterwards.

use async_trait::async_trait;
use bytes::Bytes;
use std::{
    sync::{
        atomic::{AtomicU32, Ordering},
        Arc,
    },
    time::Duration,
};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::{
    decoder::{self, BlockingReader, DecodeJob},
    encoder::FrameCodec,
};
use crate::{config::Config, error::PipelineError, sources::TrackDescriptor};

/// Un frame de 20 ms listo para enviar.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Posición dentro del track, empezando en 0
    pub sequence: u64,
    pub payload: Bytes,
}

pub type FrameResult = Result<Frame, PipelineError>;

/// Volumen compartido entre la sesión y el hilo de decodificación.
#[derive(Debug, Clone)]
pub struct Gain(Arc<AtomicU32>);

impl Gain {
    pub const MAX: f32 = 2.0;

    pub fn new(volume: f32) -> Self {
        Self(Arc::new(AtomicU32::new(volume.clamp(0.0, Self::MAX).to_bits())))
    }

    pub fn get(&self) -> f32 {
        f32::from_bits(self.0.load(Ordering::Relaxed))
    }

    pub fn set(&self, volume: f32) {
        self.0
            .store(volume.clamp(0.0, Self::MAX).to_bits(), Ordering::Relaxed);
    }

    pub fn apply(&self, samples: &mut [f32]) {
        let gain = self.get();
        if (gain - 1.0).abs() < f32::EPSILON {
            return;
        }
        for sample in samples {
            *sample = (*sample * gain).clamp(-1.0, 1.0);
        }
    }
}

/// Extremo productor de un pipeline.
pub struct PipelineFeed {
    tx: flume::Sender<FrameResult>,
    cancel: CancellationToken,
}

impl PipelineFeed {
    /// Espera espacio en el canal. `false` si el consumidor ya no existe.
    pub async fn send(&self, item: FrameResult) -> bool {
        if self.cancel.is_cancelled() {
            return false;
        }
        self.tx.send_async(item).await.is_ok()
    }

    /// Versión bloqueante para el hilo del decoder.
    pub fn send_blocking(&self, item: FrameResult) -> bool {
        if self.cancel.is_cancelled() {
            return false;
        }
        self.tx.send(item).is_ok()
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn cancellation(&self) -> CancellationToken {
        self.cancel.clone()
    }
}

/// Extremo consumidor: la sesión saca frames de aquí.
#[derive(Debug)]
pub struct TranscodePipeline {
    rx: flume::Receiver<FrameResult>,
    cancel: CancellationToken,
    read_timeout: Duration,
    primed: Option<Frame>,
    finished: bool,
}

impl TranscodePipeline {
    /// Crea un par productor/consumidor con `read_ahead` frames de margen.
    pub fn channel(read_ahead: usize, read_timeout: Duration) -> (PipelineFeed, Self) {
        let (tx, rx) = flume::bounded(read_ahead.max(1));
        let cancel = CancellationToken::new();
        (
            PipelineFeed {
                tx,
                cancel: cancel.clone(),
            },
            Self {
                rx,
                cancel,
                read_timeout,
                primed: None,
                finished: false,
            },
        )
    }

    /// Espera el primer frame (o el fin del stream) sin límite propio;
    /// quien llama decide el timeout de apertura.
    pub async fn prime(&mut self) -> Result<(), PipelineError> {
        if self.primed.is_some() || self.finished {
            return Ok(());
        }
        match self.rx.recv_async().await {
            Ok(Ok(frame)) => {
                self.primed = Some(frame);
                Ok(())
            }
            Ok(Err(e)) => {
                self.finished = true;
                Err(e)
            }
            Err(_) => {
                self.finished = true;
                Ok(())
            }
        }
    }

    /// Siguiente frame; `Ok(None)` es el fin del stream.
    pub async fn next_frame(&mut self) -> Result<Option<Frame>, PipelineError> {
        if let Some(frame) = self.primed.take() {
            return Ok(Some(frame));
        }
        if self.finished {
            return Ok(None);
        }

        match tokio::time::timeout(self.read_timeout, self.rx.recv_async()).await {
            Ok(Ok(Ok(frame))) => Ok(Some(frame)),
            Ok(Ok(Err(e))) => {
                self.finished = true;
                Err(e)
            }
            Ok(Err(_)) => {
                self.finished = true;
                Ok(None)
            }
            Err(_) => {
                self.finished = true;
                Err(PipelineError::Timeout(format!(
                    "no frame within {}",
                    humantime::format_duration(self.read_timeout)
                )))
            }
        }
    }
}

impl Drop for TranscodePipeline {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// Abre el audio de un track como pipeline de frames.
#[async_trait]
pub trait Transcoder: Send + Sync {
    /// Resuelve cuando el primer frame está disponible (o el stream terminó).
    async fn open(
        &self,
        track: &TrackDescriptor,
        gain: Gain,
    ) -> Result<TranscodePipeline, PipelineError>;
}

/// Transcoder real: symphonia + rubato + audiopus.
pub struct SymphoniaTranscoder {
    codec: FrameCodec,
    bitrate: u32,
    read_ahead: usize,
    read_timeout: Duration,
}

impl SymphoniaTranscoder {
    pub fn new(codec: FrameCodec, bitrate: u32) -> Self {
        Self {
            codec,
            bitrate,
            read_ahead: 5,
            read_timeout: Duration::from_secs(5),
        }
    }

    pub fn with_read_ahead(mut self, frames: usize) -> Self {
        self.read_ahead = frames;
        self
    }

    pub fn with_read_timeout(mut self, timeout: Duration) -> Self {
        self.read_timeout = timeout;
        self
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(config.frame_codec, config.opus_bitrate)
            .with_read_ahead(config.read_ahead_frames)
            .with_read_timeout(config.read_timeout)
    }
}

#[async_trait]
impl Transcoder for SymphoniaTranscoder {
    async fn open(
        &self,
        track: &TrackDescriptor,
        gain: Gain,
    ) -> Result<TranscodePipeline, PipelineError> {
        let handle = track.stream();
        debug!("📂 Abriendo {}", handle.describe());

        let stream = handle.open().await?;
        let (feed, mut pipeline) = TranscodePipeline::channel(self.read_ahead, self.read_timeout);

        let job = DecodeJob {
            reader: BlockingReader::new(
                stream,
                tokio::runtime::Handle::current(),
                feed.cancellation(),
                self.read_timeout,
            ),
            hint: handle.format_hint(),
            codec: self.codec,
            bitrate: self.bitrate,
            gain,
            label: track.title().to_string(),
        };
        tokio::task::spawn_blocking(move || decoder::run(job, feed));

        pipeline.prime().await?;
        Ok(pipeline)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        audio::{FRAME_SAMPLES, PCM_FRAME_BYTES},
        sources::{test_support::MemoryStream, SourceType},
    };
    use serenity::model::id::UserId;

    fn frame(sequence: u64) -> Frame {
        Frame {
            sequence,
            payload: Bytes::from_static(b"x"),
        }
    }

    /// WAV PCM 16 bits mínimo.
    fn wav_bytes(rate: u32, channels: u16, samples: &[i16]) -> Bytes {
        let data_len = (samples.len() * 2) as u32;
        let mut out = Vec::with_capacity(44 + data_len as usize);
        out.extend_from_slice(b"RIFF");
        out.extend_from_slice(&(36 + data_len).to_le_bytes());
        out.extend_from_slice(b"WAVEfmt ");
        out.extend_from_slice(&16u32.to_le_bytes());
        out.extend_from_slice(&1u16.to_le_bytes());
        out.extend_from_slice(&channels.to_le_bytes());
        out.extend_from_slice(&rate.to_le_bytes());
        out.extend_from_slice(&(rate * channels as u32 * 2).to_le_bytes());
        out.extend_from_slice(&(channels * 2).to_le_bytes());
        out.extend_from_slice(&16u16.to_le_bytes());
        out.extend_from_slice(b"data");
        out.extend_from_slice(&data_len.to_le_bytes());
        for s in samples {
            out.extend_from_slice(&s.to_le_bytes());
        }
        Bytes::from(out)
    }

    fn memory_track(data: Bytes) -> TrackDescriptor {
        TrackDescriptor::new(
            "memory",
            "memory://test",
            SourceType::File,
            UserId::new(1),
            Arc::new(MemoryStream(data)),
        )
    }

    #[test]
    fn gain_is_clamped_and_applied() {
        let gain = Gain::new(3.0);
        assert_eq!(gain.get(), 2.0);

        gain.set(0.5);
        let mut samples = [0.8, -0.4];
        gain.apply(&mut samples);
        assert_eq!(samples, [0.4, -0.2]);
    }

    #[tokio::test]
    async fn frames_arrive_in_order_then_end_of_stream() {
        let (feed, mut pipeline) = TranscodePipeline::channel(5, Duration::from_secs(1));
        tokio::spawn(async move {
            for i in 0..3 {
                feed.send(Ok(frame(i))).await;
            }
        });

        pipeline.prime().await.unwrap();
        for i in 0..3 {
            assert_eq!(pipeline.next_frame().await.unwrap(), Some(frame(i)));
        }
        assert_eq!(pipeline.next_frame().await.unwrap(), None);
        assert_eq!(pipeline.next_frame().await.unwrap(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn stalled_producer_times_out() {
        let (feed, mut pipeline) = TranscodePipeline::channel(5, Duration::from_secs(2));
        feed.send(Ok(frame(0))).await;

        assert_eq!(pipeline.next_frame().await.unwrap(), Some(frame(0)));
        let err = pipeline.next_frame().await.unwrap_err();
        assert!(matches!(err, PipelineError::Timeout(_)));
        drop(feed);
    }

    #[tokio::test]
    async fn producer_error_is_reported_once() {
        let (feed, mut pipeline) = TranscodePipeline::channel(5, Duration::from_secs(1));
        feed.send(Ok(frame(0))).await;
        feed.send(Err(PipelineError::DecodeError("bad".into()))).await;
        drop(feed);

        assert!(pipeline.next_frame().await.unwrap().is_some());
        assert!(pipeline.next_frame().await.is_err());
        assert_eq!(pipeline.next_frame().await.unwrap(), None);
    }

    #[tokio::test]
    async fn read_ahead_is_bounded_and_drop_cancels_producer() {
        let (feed, pipeline) = TranscodePipeline::channel(2, Duration::from_secs(1));
        assert!(feed.send(Ok(frame(0))).await);
        assert!(feed.send(Ok(frame(1))).await);

        // El canal está lleno: el tercer envío queda pendiente
        let third = tokio::time::timeout(Duration::from_millis(50), feed.send(Ok(frame(2)))).await;
        assert!(third.is_err());

        drop(pipeline);
        assert!(feed.is_cancelled());
        assert!(!feed.send(Ok(frame(3))).await);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn decodes_wav_into_48k_pcm_frames() {
        // 100 ms de tono mono a 44.1kHz
        let samples: Vec<i16> = (0..4410)
            .map(|i| ((i as f32 * 0.06).sin() * 8000.0) as i16)
            .collect();
        let track = memory_track(wav_bytes(44_100, 1, &samples));

        let transcoder = SymphoniaTranscoder::new(FrameCodec::Pcm, 96_000);
        let mut pipeline = transcoder.open(&track, Gain::new(1.0)).await.unwrap();

        let mut frames = Vec::new();
        while let Some(frame) = pipeline.next_frame().await.unwrap() {
            frames.push(frame);
        }

        // 4410 muestras -> ~4800 a 48kHz -> 5 frames (6 si sobra una cola)
        assert!((5..=6).contains(&frames.len()), "got {} frames", frames.len());
        for (i, frame) in frames.iter().enumerate() {
            assert_eq!(frame.sequence, i as u64);
            assert_eq!(frame.payload.len(), PCM_FRAME_BYTES);
        }
        assert_eq!(PCM_FRAME_BYTES, FRAME_SAMPLES * 2 * 2);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn garbage_input_fails_to_open() {
        let track = memory_track(Bytes::from_static(&[0x13; 4096]));
        let transcoder = SymphoniaTranscoder::new(FrameCodec::Pcm, 96_000);

        let err = transcoder.open(&track, Gain::new(1.0)).await.unwrap_err();
        assert!(matches!(err, PipelineError::DecodeError(_)));
    }
}
