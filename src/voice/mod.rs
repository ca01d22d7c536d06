//! # Voice Module
//!
//! Outbound side of a guild's voice connection.
//!
//! [`VoiceTransport`] owns the pacing clock (one frame per 20 ms slot) and the
//! connection health state. The actual network facility sits behind the
//! [`Connector`] / [`FrameSink`] traits; [`UdpConnector`] ships RTP-framed
//! datagrams to a configured endpoint. Connection loss is reported once on a
//! health channel and is never retried here; re-joining is an explicit
//! command.

pub mod transport;
pub mod udp;

use async_trait::async_trait;
use serenity::model::id::{ChannelId, GuildId};
use std::io;

use crate::audio::pipeline::Frame;

pub use transport::{TransportEvent, VoiceTransport};
pub use udp::UdpConnector;

/// Establece el enlace de red hacia un canal de voz.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, guild_id: GuildId, channel_id: ChannelId) -> io::Result<Box<dyn FrameSink>>;
}

/// Enlace abierto: recibe frames ya codificados.
#[async_trait]
pub trait FrameSink: Send {
    async fn send(&mut self, frame: &Frame) -> io::Result<()>;

    async fn close(&mut self) {}
}
