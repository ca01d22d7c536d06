use dashmap::DashMap;
use serenity::model::id::{ChannelId, GuildId, UserId};
use std::sync::Arc;
use tokio::{sync::mpsc, task::JoinHandle};
use tracing::{debug, info};

use super::{
    events::{DisconnectReason, NotificationReceiver, NotificationSender},
    pipeline::Transcoder,
    queue::{LoopMode, QueuePage},
    session::{NowPlaying, PlaybackState, VoiceSession},
};
use crate::{
    cache::ResolveCache,
    config::Config,
    error::{CommandError, EngineResult},
    sources::{SourceResolver, TrackDescriptor, TrackSummary},
    voice::Connector,
};

/// Registro de sesiones de voz, una por guild.
pub struct AudioPlayer {
    sessions: DashMap<GuildId, VoiceSession>,
    connector: Arc<dyn Connector>,
    transcoder: Arc<dyn Transcoder>,
    resolver: Arc<dyn SourceResolver>,
    cache: Option<Arc<ResolveCache>>,
    config: Arc<Config>,
    events: NotificationSender,
}

impl AudioPlayer {
    pub fn new(
        config: Arc<Config>,
        connector: Arc<dyn Connector>,
        transcoder: Arc<dyn Transcoder>,
        resolver: Arc<dyn SourceResolver>,
    ) -> (Self, NotificationReceiver) {
        let (events, notifications) = mpsc::unbounded_channel();
        let player = Self {
            sessions: DashMap::new(),
            connector,
            transcoder,
            resolver,
            cache: None,
            config,
            events,
        };
        (player, notifications)
    }

    /// Caché a limpiar en cada ciclo de mantenimiento.
    pub fn with_cache(mut self, cache: Arc<ResolveCache>) -> Self {
        self.cache = Some(cache);
        self
    }

    /// Une el bot a un canal, creando la sesión si no existe.
    pub async fn join(&self, guild_id: GuildId, channel_id: ChannelId) -> EngineResult<()> {
        let session = self
            .sessions
            .entry(guild_id)
            .or_insert_with(|| {
                debug!("Nueva sesión de voz para guild {}", guild_id);
                VoiceSession::new(
                    guild_id,
                    self.connector.clone(),
                    self.transcoder.clone(),
                    self.resolver.clone(),
                    self.events.clone(),
                    &self.config,
                )
            })
            .clone();

        session.join(channel_id).await
    }

    /// Sale del canal y destruye la sesión (la cola se pierde).
    pub async fn leave(&self, guild_id: GuildId) -> Result<(), CommandError> {
        let (_, session) = self
            .sessions
            .remove(&guild_id)
            .ok_or(CommandError::NoSession)?;
        session.leave().await;
        Ok(())
    }

    pub fn session(&self, guild_id: GuildId) -> Result<VoiceSession, CommandError> {
        self.sessions
            .get(&guild_id)
            .map(|s| s.clone())
            .ok_or(CommandError::NoSession)
    }

    pub fn active_sessions(&self) -> usize {
        self.sessions.len()
    }

    pub async fn play(
        &self,
        guild_id: GuildId,
        query: &str,
        requester: UserId,
    ) -> EngineResult<Vec<TrackSummary>> {
        self.session(guild_id)?.play(query, requester).await
    }

    /// Encola tracks ya resueltos (sin armar la reproducción).
    pub fn enqueue(
        &self,
        guild_id: GuildId,
        tracks: Vec<TrackDescriptor>,
    ) -> Result<Vec<TrackSummary>, CommandError> {
        self.session(guild_id)?.enqueue(tracks)
    }

    pub fn start(&self, guild_id: GuildId) -> Result<(), CommandError> {
        self.session(guild_id)?.start()
    }

    pub async fn skip(&self, guild_id: GuildId) -> Result<(), CommandError> {
        self.session(guild_id)?.skip().await
    }

    pub async fn skip_many(&self, guild_id: GuildId, count: usize) -> Result<(), CommandError> {
        self.session(guild_id)?.skip_many(count).await
    }

    pub async fn stop(&self, guild_id: GuildId) -> Result<(), CommandError> {
        self.session(guild_id)?.stop().await
    }

    pub async fn clear(&self, guild_id: GuildId) -> Result<usize, CommandError> {
        Ok(self.session(guild_id)?.clear().await)
    }

    pub fn pause(&self, guild_id: GuildId) -> Result<(), CommandError> {
        self.session(guild_id)?.pause()
    }

    pub fn resume(&self, guild_id: GuildId) -> Result<(), CommandError> {
        self.session(guild_id)?.resume()
    }

    pub fn set_loop(&self, guild_id: GuildId, mode: LoopMode) -> Result<(), CommandError> {
        self.session(guild_id)?.set_loop(mode);
        info!("🔁 Modo loop: {:?}", mode);
        Ok(())
    }

    pub fn set_volume(&self, guild_id: GuildId, volume: f32) -> Result<(), CommandError> {
        self.session(guild_id)?.set_volume(volume)
    }

    pub fn volume(&self, guild_id: GuildId) -> Option<f32> {
        self.session(guild_id).ok().map(|s| s.volume())
    }

    pub fn shuffle(&self, guild_id: GuildId) -> Result<(), CommandError> {
        self.session(guild_id)?.shuffle();
        Ok(())
    }

    pub fn remove(&self, guild_id: GuildId, index: usize) -> Result<TrackSummary, CommandError> {
        self.session(guild_id)?.remove(index)
    }

    pub fn move_track(&self, guild_id: GuildId, from: usize, to: usize) -> Result<(), CommandError> {
        self.session(guild_id)?.move_track(from, to)
    }

    pub fn remove_by_requester(&self, guild_id: GuildId, user_id: UserId) -> Result<usize, CommandError> {
        Ok(self.session(guild_id)?.remove_by_requester(user_id))
    }

    /// Cola actual
    pub fn list_queue(&self, guild_id: GuildId) -> Vec<TrackSummary> {
        self.session(guild_id)
            .map(|s| s.list_queue())
            .unwrap_or_default()
    }

    pub fn queue_page(
        &self,
        guild_id: GuildId,
        page: usize,
        per_page: usize,
    ) -> Result<QueuePage, CommandError> {
        Ok(self.session(guild_id)?.queue_page(page, per_page))
    }

    pub fn now_playing(&self, guild_id: GuildId) -> Option<NowPlaying> {
        self.session(guild_id).ok()?.now_playing()
    }

    pub fn state(&self, guild_id: GuildId) -> Option<PlaybackState> {
        self.session(guild_id).ok().map(|s| s.state())
    }

    /// Cierra las sesiones inactivas más allá de `idle_timeout`.
    ///
    /// Las sesiones ya desconectadas (conexión perdida) y sin cola se
    /// descartan sin evento: el aviso de desconexión ya se emitió.
    pub async fn reap_idle_sessions(&self) -> usize {
        let idle_timeout = self.config.idle_timeout;
        let expired: Vec<(GuildId, VoiceSession)> = self
            .sessions
            .iter()
            .filter(|entry| {
                entry
                    .value()
                    .idle_for()
                    .is_some_and(|idle| idle >= idle_timeout)
            })
            .map(|entry| (*entry.key(), entry.value().clone()))
            .collect();

        let mut reaped = 0;
        for (guild_id, candidate) in &expired {
            if self.reap_if_idle(*guild_id, candidate).await {
                reaped += 1;
            }
        }
        reaped
    }

    /// Quita `candidate` solo si sigue registrado y sigue inactivo.
    ///
    /// Entre el escaneo y la remoción la guild puede haber hecho leave + join
    /// o encolado algo; en ambos casos la sesión actual se conserva.
    async fn reap_if_idle(&self, guild_id: GuildId, candidate: &VoiceSession) -> bool {
        let idle_timeout = self.config.idle_timeout;
        let Some((_, session)) = self.sessions.remove_if(&guild_id, |_, current| {
            current.is_same(candidate)
                && current
                    .idle_for()
                    .is_some_and(|idle| idle >= idle_timeout)
        }) else {
            debug!("Sesión de guild {} ya no está inactiva, se conserva", guild_id);
            return false;
        };

        if session.is_connected() {
            info!(
                "💤 Desconectando guild {} tras {} de inactividad",
                guild_id,
                humantime::format_duration(idle_timeout)
            );
            session.disconnect(DisconnectReason::IdleTimeout).await;
        } else {
            debug!("Sesión desconectada descartada (guild {})", guild_id);
        }
        true
    }

    /// Tareas periódicas: sesiones inactivas y limpieza de caché.
    pub fn spawn_maintenance(self: &Arc<Self>) -> JoinHandle<()> {
        let player = Arc::downgrade(self);
        let period = self.config.maintenance_interval;

        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.tick().await;

            loop {
                interval.tick().await;
                let Some(player) = player.upgrade() else {
                    break;
                };

                let reaped = player.reap_idle_sessions().await;
                if let Some(cache) = &player.cache {
                    cache.cleanup_old_entries();
                }

                debug!(
                    "🧹 Tareas de mantenimiento completadas ({} sesiones cerradas, {} activas)",
                    reaped,
                    player.active_sessions()
                );
            }
        })
    }
}
