//! # Error Taxonomy
//!
//! Typed errors for the playback core. Each family maps to one propagation
//! policy:
//!
//! - [`ResolutionError`]: terminal per request, the queue is never touched
//! - [`CommandError`]: terminal per request, no state mutation
//! - [`PipelineError`]: recovered inside the session (track dropped, queue advances)
//! - [`TransportError`]: fail-stop, the session goes idle until an explicit join
//!
//! [`EngineError`] is what the public command API returns.

use serde::Serialize;
use thiserror::Error;

use crate::audio::session::PlaybackState;

/// Fallos al convertir una consulta en tracks reproducibles.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ResolutionError {
    #[error("no results for '{0}'")]
    NotFound(String),
    #[error("content is region or age restricted: {0}")]
    RegionOrAgeRestricted(String),
    #[error("resolver timed out: {0}")]
    NetworkTimeout(String),
    #[error("malformed query or extractor response: {0}")]
    Malformed(String),
    #[error("extractor unavailable: {0}")]
    Unavailable(String),
}

/// Fallos en tiempo de ejecución del pipeline de transcodificación.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum PipelineError {
    #[error("source unavailable: {0}")]
    SourceUnavailable(String),
    #[error("decode error: {0}")]
    DecodeError(String),
    #[error("timed out waiting for audio: {0}")]
    Timeout(String),
}

/// Clase de [`PipelineError`], sin el detalle, para las notificaciones.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum PipelineErrorKind {
    SourceUnavailable,
    DecodeError,
    Timeout,
}

impl PipelineError {
    pub fn kind(&self) -> PipelineErrorKind {
        match self {
            PipelineError::SourceUnavailable(_) => PipelineErrorKind::SourceUnavailable,
            PipelineError::DecodeError(_) => PipelineErrorKind::DecodeError,
            PipelineError::Timeout(_) => PipelineErrorKind::Timeout,
        }
    }
}

/// Errores de la conexión de voz.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransportError {
    #[error("voice transport is not connected")]
    NotConnected,
    #[error("voice connection lost: {0}")]
    ConnectionLost(String),
}

/// Operación inválida para el estado actual de la sesión.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum CommandError {
    #[error("no voice session for this guild")]
    NoSession,
    #[error("not connected to a voice channel")]
    NotConnected,
    #[error("nothing is playing")]
    NothingPlaying,
    #[error("playback is not paused")]
    NotPaused,
    #[error("cannot do that while {0:?}")]
    InvalidState(PlaybackState),
    #[error("the queue is empty")]
    QueueEmpty,
    #[error("the queue is full (max {max} tracks)")]
    QueueFull { max: usize },
    #[error("index {index} out of range (queue has {len} tracks)")]
    IndexOutOfRange { index: usize, len: usize },
    #[error("volume must be between 0.0 and 2.0, got {0}")]
    InvalidVolume(f32),
    #[error("every track is longer than the {limit_secs}s limit")]
    TrackTooLong { limit_secs: u64 },
}

/// Error devuelto por la API de comandos.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum EngineError {
    #[error(transparent)]
    Resolution(#[from] ResolutionError),
    #[error(transparent)]
    Command(#[from] CommandError),
    #[error(transparent)]
    Transport(#[from] TransportError),
}

pub type EngineResult<T> = Result<T, EngineError>;
