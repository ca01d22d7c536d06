use serde::Serialize;
use serenity::model::id::GuildId;
use tokio::sync::mpsc;

use crate::{error::PipelineErrorKind, sources::TrackSummary};

/// Evento de reproducción dirigido a la capa de presentación.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum PlaybackEvent {
    /// Un track empezó a sonar (una vez por inicio, nunca al reanudar)
    NowPlaying(TrackSummary),
    /// Tracks agregados por un `play`, en el orden de la cola
    QueueAdded(Vec<TrackSummary>),
    /// El track se descartó por un fallo del pipeline
    PlaybackError {
        kind: PipelineErrorKind,
        track: TrackSummary,
        message: String,
    },
    Disconnected(DisconnectReason),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DisconnectReason {
    ConnectionLost(String),
    Left,
    IdleTimeout,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Notification {
    pub guild_id: GuildId,
    pub event: PlaybackEvent,
}

pub type NotificationSender = mpsc::UnboundedSender<Notification>;
pub type NotificationReceiver = mpsc::UnboundedReceiver<Notification>;
