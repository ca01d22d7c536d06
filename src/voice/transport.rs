use parking_lot::Mutex as SyncMutex;
use serenity::model::id::{ChannelId, GuildId};
use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};
use tokio::{
    sync::{mpsc, Mutex},
    time::Instant,
};
use tracing::{debug, info, warn};

use super::{Connector, FrameSink};
use crate::{
    audio::{pipeline::Frame, FRAME_DURATION},
    error::TransportError,
};

/// Eventos de salud de la conexión.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    ConnectionLost { reason: String },
}

struct Link {
    sink: Option<Box<dyn FrameSink>>,
    /// Próximo instante en el que se puede enviar un frame
    next_slot: Option<Instant>,
}

/// Conexión de voz de un guild con envío a ritmo de 20 ms.
pub struct VoiceTransport {
    guild_id: GuildId,
    connector: Arc<dyn Connector>,
    link: Mutex<Link>,
    connected: AtomicBool,
    channel: SyncMutex<Option<ChannelId>>,
    connect_timeout: Duration,
    health: mpsc::UnboundedSender<TransportEvent>,
}

impl VoiceTransport {
    pub fn new(
        guild_id: GuildId,
        connector: Arc<dyn Connector>,
        connect_timeout: Duration,
    ) -> (Self, mpsc::UnboundedReceiver<TransportEvent>) {
        let (health, events) = mpsc::unbounded_channel();
        let transport = Self {
            guild_id,
            connector,
            link: Mutex::new(Link {
                sink: None,
                next_slot: None,
            }),
            connected: AtomicBool::new(false),
            channel: SyncMutex::new(None),
            connect_timeout,
            health,
        };
        (transport, events)
    }

    /// Conecta (o reconecta) al canal indicado.
    ///
    /// Si falla, el enlace anterior (si existe) queda intacto.
    pub async fn connect(&self, channel_id: ChannelId) -> Result<(), TransportError> {
        let mut link = self.link.lock().await;

        let sink = match tokio::time::timeout(
            self.connect_timeout,
            self.connector.connect(self.guild_id, channel_id),
        )
        .await
        {
            Ok(Ok(sink)) => sink,
            Ok(Err(e)) => {
                warn!("❌ No se pudo conectar al canal {}: {}", channel_id, e);
                return Err(TransportError::ConnectionLost(e.to_string()));
            }
            Err(_) => {
                warn!("⏰ Timeout conectando al canal {}", channel_id);
                return Err(TransportError::ConnectionLost("connect timed out".to_string()));
            }
        };

        if let Some(mut old) = link.sink.replace(sink) {
            old.close().await;
        }
        link.next_slot = None;
        *self.channel.lock() = Some(channel_id);
        self.connected.store(true, Ordering::SeqCst);

        info!("🔊 Conectado al canal de voz {} (guild {})", channel_id, self.guild_id);
        Ok(())
    }

    /// Desconexión voluntaria; no genera evento de salud.
    pub async fn disconnect(&self) {
        let mut link = self.link.lock().await;
        self.connected.store(false, Ordering::SeqCst);
        *self.channel.lock() = None;
        link.next_slot = None;
        if let Some(mut sink) = link.sink.take() {
            sink.close().await;
            info!("👋 Desconectado del canal de voz (guild {})", self.guild_id);
        }
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    pub fn current_channel(&self) -> Option<ChannelId> {
        *self.channel.lock()
    }

    /// Espera el siguiente slot de 20 ms y envía el frame.
    ///
    /// El reloj arranca con el primer envío. Tras un hueco de más de un
    /// intervalo (pausa, cambio de track lento) se re-ancla en vez de
    /// mandar una ráfaga para recuperar el tiempo perdido.
    pub async fn send_frame(&self, frame: &Frame) -> Result<(), TransportError> {
        if !self.is_connected() {
            return Err(TransportError::NotConnected);
        }

        let mut link = self.link.lock().await;

        let now = Instant::now();
        let slot = match link.next_slot {
            Some(slot) if now <= slot + FRAME_DURATION => slot,
            _ => now,
        };
        tokio::time::sleep_until(slot).await;

        if !self.is_connected() {
            return Err(TransportError::NotConnected);
        }
        let Some(sink) = link.sink.as_mut() else {
            return Err(TransportError::NotConnected);
        };

        if let Err(e) = sink.send(frame).await {
            let reason = e.to_string();
            link.sink = None;
            link.next_slot = None;
            drop(link);
            self.report_connection_lost(&reason);
            return Err(TransportError::ConnectionLost(reason));
        }

        link.next_slot = Some(slot + FRAME_DURATION);
        Ok(())
    }

    /// Marca la conexión como perdida. Solo el primer aviso emite evento.
    pub fn report_connection_lost(&self, reason: &str) {
        if self.connected.swap(false, Ordering::SeqCst) {
            warn!("📡 Conexión de voz perdida (guild {}): {}", self.guild_id, reason);
            *self.channel.lock() = None;
            let _ = self.health.send(TransportEvent::ConnectionLost {
                reason: reason.to_string(),
            });
        } else {
            debug!("Aviso de desconexión repetido ignorado: {}", reason);
        }
    }
}
