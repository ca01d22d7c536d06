//! # Voice Session
//!
//! One playback engine per guild: the queue, the engine state machine and
//! the voice transport for that guild.
//!
//! ## State machine
//!
//! ```text
//! Idle ──play/start──▶ Starting ──pipeline ready──▶ Playing ◀──resume── Paused
//!  ▲                      │                          │   └──pause──────▶  │
//!  │                      └── open failed ───────────┤                    │
//!  └──────── Stopping ◀── skip / stop / error ───────┴────────────────────┘
//! ```
//!
//! All state lives behind one `parking_lot::Mutex` that is never held across
//! an `.await`. Commands and engine transitions (track finished, pipeline
//! error, connection lost) take the same lock, and every one of them ends by
//! calling [`SessionInner::reevaluate`], the only place a track is popped
//! from the queue: if the session is `Idle`, autoplay is armed, the transport
//! is connected and the queue is non-empty, the head is popped and a track
//! task is spawned. Everything else is a no-op, which is what keeps "track
//! just ended" and "user just skipped" from advancing the queue twice.
//!
//! The track task owns the [`TranscodePipeline`] and does all the awaiting:
//! open (bounded by `open_timeout`), pull frames, and hand them to
//! [`VoiceTransport::send_frame`], whose 20 ms pacing is the backpressure
//! point. Skip and stop cancel the task's token, abort it and await it
//! before re-evaluating, so no frame of an abandoned track is sent after the
//! command returns.
//!
//! Completions carry a generation number; a completion whose generation no
//! longer matches the active track is stale and ignored.

use parking_lot::Mutex;
use serde::Serialize;
use serenity::model::id::{ChannelId, GuildId, UserId};
use std::{
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Weak,
    },
    time::Duration,
};
use tokio::{
    sync::{mpsc, watch},
    task::JoinHandle,
    time::Instant,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{
    events::{DisconnectReason, Notification, NotificationSender, PlaybackEvent},
    pipeline::{Gain, Transcoder},
    queue::{LoopMode, PlaybackQueue, QueuePage},
    FRAME_DURATION,
};
use crate::{
    config::Config,
    error::{CommandError, EngineError, PipelineError, ResolutionError, TransportError},
    sources::{SourceResolver, TrackDescriptor, TrackSummary},
    voice::{Connector, TransportEvent, VoiceTransport},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum PlaybackState {
    Idle,
    Starting,
    Playing,
    Paused,
    Stopping,
}

/// Vista del track en curso con su progreso.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NowPlaying {
    pub track: TrackSummary,
    pub state: PlaybackState,
    pub position: Duration,
    pub loop_mode: LoopMode,
    pub volume: f32,
}

impl NowPlaying {
    /// Fracción reproducida, si se conoce la duración.
    pub fn progress(&self) -> Option<f64> {
        let total = self.track.duration?.as_secs_f64();
        if total <= 0.0 {
            return None;
        }
        Some((self.position.as_secs_f64() / total).min(1.0))
    }
}

struct ActiveTrack {
    generation: u64,
    track: TrackDescriptor,
    cancel: CancellationToken,
    paused: watch::Sender<bool>,
    frames: Arc<AtomicU64>,
    task: Option<JoinHandle<()>>,
    /// Instante en que un skip arrancó este track
    skipped_into_at: Option<Instant>,
}

impl ActiveTrack {
    fn position(&self) -> Duration {
        FRAME_DURATION * self.frames.load(Ordering::Relaxed) as u32
    }

    fn abort(mut self) {
        self.cancel.cancel();
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

struct SessionState {
    queue: PlaybackQueue,
    phase: PlaybackState,
    active: Option<ActiveTrack>,
    generation: u64,
    autoplay: bool,
    connected: bool,
    idle_since: Instant,
}

enum Outcome {
    Finished,
    Failed(PipelineError),
    Transport(TransportError),
    Cancelled,
}

/// Un skip que llega dentro de esta ventana tras otro skip se une a él.
const SKIP_COALESCE_WINDOW: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Teardown {
    Skip,
    /// Descarta `n - 1` tracks pendientes además del actual
    SkipMany(usize),
    Stop,
    /// Como `Stop` pero sin desarmar la reproducción
    Clear,
}

impl Teardown {
    fn advances(self) -> bool {
        matches!(self, Teardown::Skip | Teardown::SkipMany(_))
    }
}

struct SessionInner {
    guild_id: GuildId,
    state: Mutex<SessionState>,
    transport: Arc<VoiceTransport>,
    transcoder: Arc<dyn Transcoder>,
    resolver: Arc<dyn SourceResolver>,
    events: NotificationSender,
    gain: Gain,
    max_track_duration: Duration,
    resolve_timeout: Duration,
    open_timeout: Duration,
}

/// Handle clonable a la sesión de voz de un guild.
#[derive(Clone)]
pub struct VoiceSession {
    inner: Arc<SessionInner>,
}

impl VoiceSession {
    pub fn new(
        guild_id: GuildId,
        connector: Arc<dyn Connector>,
        transcoder: Arc<dyn Transcoder>,
        resolver: Arc<dyn SourceResolver>,
        events: NotificationSender,
        config: &Config,
    ) -> Self {
        let (transport, health) = VoiceTransport::new(guild_id, connector, config.connect_timeout);

        let inner = Arc::new(SessionInner {
            guild_id,
            state: Mutex::new(SessionState {
                queue: PlaybackQueue::new(config.max_queue_size),
                phase: PlaybackState::Idle,
                active: None,
                generation: 0,
                autoplay: false,
                connected: false,
                idle_since: Instant::now(),
            }),
            transport: Arc::new(transport),
            transcoder,
            resolver,
            events,
            gain: Gain::new(config.default_volume),
            max_track_duration: config.max_track_duration(),
            resolve_timeout: config.resolve_timeout,
            open_timeout: config.open_timeout,
        });

        tokio::spawn(watch_health(Arc::downgrade(&inner), health));
        Self { inner }
    }

    pub fn guild_id(&self) -> GuildId {
        self.inner.guild_id
    }

    /// Acceso para la capa de red (p. ej. avisar una desconexión externa).
    pub fn transport(&self) -> &Arc<VoiceTransport> {
        &self.inner.transport
    }

    /// Conecta al canal y vuelve a evaluar la cola.
    pub async fn join(&self, channel_id: ChannelId) -> Result<(), EngineError> {
        self.inner.transport.connect(channel_id).await?;

        let mut st = self.inner.state.lock();
        st.connected = true;
        st.idle_since = Instant::now();
        self.inner.reevaluate(&mut st, false);
        Ok(())
    }

    /// Detiene todo y se desconecta. La cola se conserva.
    pub async fn leave(&self) {
        self.disconnect(DisconnectReason::Left).await;
    }

    pub(crate) async fn disconnect(&self, reason: DisconnectReason) {
        {
            let mut st = self.inner.state.lock();
            st.connected = false;
            st.autoplay = false;
        }
        self.inner.teardown(Teardown::Stop).await;
        self.inner.transport.disconnect().await;
        self.inner.emit(PlaybackEvent::Disconnected(reason));
    }

    /// Resuelve, encola y arma la reproducción automática.
    pub async fn play(&self, query: &str, requester: UserId) -> Result<Vec<TrackSummary>, EngineError> {
        if !self.is_connected() {
            return Err(CommandError::NotConnected.into());
        }

        let resolved = tokio::time::timeout(
            self.inner.resolve_timeout,
            self.inner.resolver.resolve(query, requester),
        )
        .await
        .map_err(|_| {
            ResolutionError::NetworkTimeout(format!(
                "no answer within {}",
                humantime::format_duration(self.inner.resolve_timeout)
            ))
        })??;

        let limit = self.inner.max_track_duration;
        let total = resolved.len();
        let accepted: Vec<TrackDescriptor> = resolved
            .into_iter()
            .filter(|t| t.duration().map_or(true, |d| d <= limit))
            .collect();

        if accepted.len() < total {
            warn!(
                "⏱️ {} track(s) descartados por superar {}",
                total - accepted.len(),
                humantime::format_duration(limit)
            );
            if accepted.is_empty() {
                return Err(CommandError::TrackTooLong {
                    limit_secs: limit.as_secs(),
                }
                .into());
            }
        }

        let mut st = self.inner.state.lock();
        let added = st.queue.enqueue_many(accepted)?;
        let summaries: Vec<TrackSummary> = added.iter().map(TrackDescriptor::summary).collect();
        if !summaries.is_empty() {
            self.inner
                .emit(PlaybackEvent::QueueAdded(summaries.clone()));
        }

        st.autoplay = true;
        self.inner.reevaluate(&mut st, false);
        Ok(summaries)
    }

    /// Encola tracks ya resueltos sin armar la reproducción.
    pub fn enqueue(&self, tracks: Vec<TrackDescriptor>) -> Result<Vec<TrackSummary>, CommandError> {
        let mut st = self.inner.state.lock();
        let added = st.queue.enqueue_many(tracks)?;
        let summaries: Vec<TrackSummary> = added.iter().map(TrackDescriptor::summary).collect();
        if !summaries.is_empty() {
            self.inner
                .emit(PlaybackEvent::QueueAdded(summaries.clone()));
        }
        self.inner.reevaluate(&mut st, false);
        Ok(summaries)
    }

    /// Arma la reproducción con lo que ya hay en cola.
    pub fn start(&self) -> Result<(), CommandError> {
        let mut st = self.inner.state.lock();
        if !st.connected {
            return Err(CommandError::NotConnected);
        }
        if st.phase == PlaybackState::Idle && st.queue.is_empty() {
            return Err(CommandError::QueueEmpty);
        }

        st.autoplay = true;
        self.inner.reevaluate(&mut st, false);
        Ok(())
    }

    pub async fn skip(&self) -> Result<(), CommandError> {
        if self.inner.teardown(Teardown::Skip).await {
            Ok(())
        } else {
            Err(CommandError::NothingPlaying)
        }
    }

    /// Salta `count` tracks: el actual y los `count - 1` siguientes.
    pub async fn skip_many(&self, count: usize) -> Result<(), CommandError> {
        if count <= 1 {
            return self.skip().await;
        }
        if self.inner.teardown(Teardown::SkipMany(count)).await {
            Ok(())
        } else {
            Err(CommandError::NothingPlaying)
        }
    }

    /// Detiene el track actual y desarma la reproducción; la cola no se toca.
    pub async fn stop(&self) -> Result<(), CommandError> {
        if self.inner.teardown(Teardown::Stop).await {
            info!("⏹️ Reproducción detenida");
            Ok(())
        } else {
            Err(CommandError::NothingPlaying)
        }
    }

    /// Vacía la cola y detiene el track actual.
    pub async fn clear(&self) -> usize {
        let removed = self.inner.state.lock().queue.clear();
        self.inner.teardown(Teardown::Clear).await;
        removed
    }

    pub fn pause(&self) -> Result<(), CommandError> {
        let mut st = self.inner.state.lock();
        match st.phase {
            PlaybackState::Playing => {}
            PlaybackState::Idle => return Err(CommandError::NothingPlaying),
            other => return Err(CommandError::InvalidState(other)),
        }

        if let Some(active) = &st.active {
            active.paused.send_replace(true);
        }
        st.phase = PlaybackState::Paused;
        info!("⏸️ Reproducción pausada");
        Ok(())
    }

    pub fn resume(&self) -> Result<(), CommandError> {
        let mut st = self.inner.state.lock();
        match st.phase {
            PlaybackState::Paused => {}
            PlaybackState::Idle => return Err(CommandError::NothingPlaying),
            _ => return Err(CommandError::NotPaused),
        }

        if let Some(active) = &st.active {
            active.paused.send_replace(false);
        }
        st.phase = PlaybackState::Playing;
        info!("▶️ Reproducción reanudada");
        Ok(())
    }

    pub fn set_loop(&self, mode: LoopMode) {
        let mut st = self.inner.state.lock();
        st.queue.set_loop_mode(mode);
    }

    pub fn list_queue(&self) -> Vec<TrackSummary> {
        self.inner.state.lock().queue.list()
    }

    pub fn queue_page(&self, page: usize, per_page: usize) -> QueuePage {
        self.inner.state.lock().queue.page(page, per_page)
    }

    pub fn total_duration(&self) -> Duration {
        self.inner.state.lock().queue.total_duration()
    }

    pub fn now_playing(&self) -> Option<NowPlaying> {
        let st = self.inner.state.lock();
        let active = st.active.as_ref()?;
        Some(NowPlaying {
            track: active.track.summary(),
            state: st.phase,
            position: active.position(),
            loop_mode: st.queue.loop_mode(),
            volume: self.inner.gain.get(),
        })
    }

    pub fn set_volume(&self, volume: f32) -> Result<(), CommandError> {
        if !(0.0..=Gain::MAX).contains(&volume) {
            return Err(CommandError::InvalidVolume(volume));
        }
        self.inner.gain.set(volume);
        info!("🔊 Volumen ajustado a {}%", (volume * 100.0) as u32);
        Ok(())
    }

    pub fn volume(&self) -> f32 {
        self.inner.gain.get()
    }

    pub fn remove(&self, index: usize) -> Result<TrackSummary, CommandError> {
        let mut st = self.inner.state.lock();
        st.queue.remove_at(index).map(|t| t.summary())
    }

    pub fn move_track(&self, from: usize, to: usize) -> Result<(), CommandError> {
        self.inner.state.lock().queue.move_track(from, to)
    }

    pub fn shuffle(&self) {
        self.inner.state.lock().queue.shuffle();
    }

    pub fn remove_by_requester(&self, user_id: UserId) -> usize {
        self.inner.state.lock().queue.remove_by_requester(user_id)
    }

    pub fn state(&self) -> PlaybackState {
        self.inner.state.lock().phase
    }

    pub fn is_connected(&self) -> bool {
        self.inner.state.lock().connected && self.inner.transport.is_connected()
    }

    /// Tiempo inactivo con la cola vacía, si aplica.
    pub fn idle_for(&self) -> Option<Duration> {
        let st = self.inner.state.lock();
        if st.phase == PlaybackState::Idle && st.queue.is_empty() {
            Some(st.idle_since.elapsed())
        } else {
            None
        }
    }

    /// `true` si ambos handles apuntan a la misma sesión.
    pub(crate) fn is_same(&self, other: &VoiceSession) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl SessionInner {
    fn emit(&self, event: PlaybackEvent) {
        let _ = self.events.send(Notification {
            guild_id: self.guild_id,
            event,
        });
    }

    fn set_idle(st: &mut SessionState) {
        st.phase = PlaybackState::Idle;
        st.idle_since = Instant::now();
    }

    /// Única regla de admisión: si está inactiva, armada, conectada y hay cola,
    /// arranca el siguiente track. En cualquier otro caso no hace nada.
    fn reevaluate(self: &Arc<Self>, st: &mut SessionState, by_skip: bool) {
        if st.phase != PlaybackState::Idle
            || !st.autoplay
            || !st.connected
            || !self.transport.is_connected()
        {
            return;
        }

        let Some(track) = st.queue.pop() else {
            debug!("📭 Cola vacía para guild {}", self.guild_id);
            return;
        };

        st.generation += 1;
        let generation = st.generation;
        let cancel = CancellationToken::new();
        let (paused, paused_rx) = watch::channel(false);
        let frames = Arc::new(AtomicU64::new(0));

        debug!("🎬 Iniciando {} (generación {})", track.title(), generation);
        let task = tokio::spawn(self.clone().run_track(
            generation,
            track.clone(),
            cancel.clone(),
            paused_rx,
            frames.clone(),
        ));

        st.active = Some(ActiveTrack {
            generation,
            track,
            cancel,
            paused,
            frames,
            task: Some(task),
            skipped_into_at: by_skip.then(Instant::now),
        });
        st.phase = PlaybackState::Starting;
    }

    async fn run_track(
        self: Arc<Self>,
        generation: u64,
        track: TrackDescriptor,
        cancel: CancellationToken,
        paused: watch::Receiver<bool>,
        frames: Arc<AtomicU64>,
    ) {
        let outcome = self
            .stream_track(generation, &track, &cancel, paused, &frames)
            .await;
        self.finish(generation, outcome);
    }

    async fn stream_track(
        &self,
        generation: u64,
        track: &TrackDescriptor,
        cancel: &CancellationToken,
        mut paused: watch::Receiver<bool>,
        frames: &AtomicU64,
    ) -> Outcome {
        let open = tokio::time::timeout(
            self.open_timeout,
            self.transcoder.open(track, self.gain.clone()),
        );
        let mut pipeline = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Outcome::Cancelled,
            opened = open => match opened {
                Ok(Ok(pipeline)) => pipeline,
                Ok(Err(e)) => return Outcome::Failed(e),
                Err(_) => {
                    return Outcome::Failed(PipelineError::Timeout(format!(
                        "pipeline not ready within {}",
                        humantime::format_duration(self.open_timeout)
                    )))
                }
            },
        };

        if !self.mark_playing(generation) {
            return Outcome::Cancelled;
        }

        loop {
            loop {
                let is_paused = *paused.borrow_and_update();
                if !is_paused {
                    break;
                }
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => return Outcome::Cancelled,
                    changed = paused.changed() => {
                        if changed.is_err() {
                            return Outcome::Cancelled;
                        }
                    }
                }
            }

            let next = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Outcome::Cancelled,
                next = pipeline.next_frame() => next,
            };
            let frame = match next {
                Ok(Some(frame)) => frame,
                Ok(None) => return Outcome::Finished,
                Err(e) => return Outcome::Failed(e),
            };

            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Outcome::Cancelled,
                sent = self.transport.send_frame(&frame) => {
                    if let Err(e) = sent {
                        return Outcome::Transport(e);
                    }
                }
            }
            frames.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// `Starting -> Playing`; emite `NowPlaying` una sola vez por inicio.
    fn mark_playing(&self, generation: u64) -> bool {
        let mut st = self.state.lock();
        if st.phase != PlaybackState::Starting {
            return false;
        }
        let Some(active) = st.active.as_ref().filter(|a| a.generation == generation) else {
            return false;
        };

        info!("🎵 Reproduciendo: {}", active.track.title());
        let summary = active.track.summary();
        st.phase = PlaybackState::Playing;
        self.emit(PlaybackEvent::NowPlaying(summary));
        true
    }

    fn finish(self: &Arc<Self>, generation: u64, outcome: Outcome) {
        let mut st = self.state.lock();
        let current = st.active.as_ref().map(|a| a.generation);
        if current != Some(generation) {
            debug!("Finalización obsoleta ignorada (generación {})", generation);
            return;
        }
        // Skip/stop en curso: quien lo inició termina la transición
        if st.phase == PlaybackState::Stopping {
            return;
        }

        match outcome {
            Outcome::Cancelled => return,
            Outcome::Finished => {
                st.active = None;
                if let Some(track) = st.queue.current() {
                    debug!("✅ Terminado: {}", track.title());
                }
                st.queue.finish_current();
            }
            Outcome::Failed(e) => {
                st.active = None;
                if let Some(track) = st.queue.discard_current() {
                    warn!("❌ Error reproduciendo {}: {}", track.title(), e);
                    self.emit(PlaybackEvent::PlaybackError {
                        kind: e.kind(),
                        track: track.summary(),
                        message: e.to_string(),
                    });
                }
            }
            Outcome::Transport(TransportError::ConnectionLost(reason)) => {
                self.connection_lost(&mut st, &reason);
                return;
            }
            // La transición la completa el watcher de salud (o `leave`)
            Outcome::Transport(TransportError::NotConnected) => return,
        }

        Self::set_idle(&mut st);
        self.reevaluate(&mut st, false);
    }

    /// Falla y se detiene: descarta el track en curso (sin re-encolar),
    /// desarma la reproducción y avisa una sola vez.
    fn connection_lost(&self, st: &mut SessionState, reason: &str) {
        if !st.connected {
            return;
        }
        st.connected = false;
        st.autoplay = false;

        if let Some(active) = st.active.take() {
            info!("🗑️ Track descartado por desconexión: {}", active.track.title());
            active.abort();
            st.queue.discard_current();
        }
        Self::set_idle(st);

        self.emit(PlaybackEvent::Disconnected(DisconnectReason::ConnectionLost(
            reason.to_string(),
        )));
    }

    /// Corta el track activo. Devuelve `false` si no había nada que cortar.
    async fn teardown(self: &Arc<Self>, mode: Teardown) -> bool {
        let (task, generation) = {
            let mut st = self.state.lock();
            if mode == Teardown::Stop {
                st.autoplay = false;
            }

            if st.phase == PlaybackState::Idle {
                return false;
            }

            if let Teardown::SkipMany(count) = mode {
                let dropped = st.queue.drop_front(count - 1);
                debug!("⏭️ {} track(s) pendientes saltados", dropped);
            }

            match st.phase {
                // Se une al corte que ya está en curso
                PlaybackState::Stopping => return true,
                PlaybackState::Starting
                    if mode == Teardown::Skip
                        && st
                            .active
                            .as_ref()
                            .and_then(|a| a.skipped_into_at)
                            .is_some_and(|at| at.elapsed() < SKIP_COALESCE_WINDOW) =>
                {
                    return true
                }
                _ => {}
            }

            let Some(active) = st.active.as_mut() else {
                return false;
            };
            active.cancel.cancel();
            let task = active.task.take();
            let generation = active.generation;
            st.phase = PlaybackState::Stopping;
            (task, generation)
        };

        if let Some(task) = task {
            task.abort();
            let _ = task.await;
        }

        let mut st = self.state.lock();
        let still_active = st.active.as_ref().map(|a| a.generation) == Some(generation);
        if still_active && st.phase == PlaybackState::Stopping {
            st.active = None;
            if let Some(track) = st.queue.discard_current() {
                if mode.advances() {
                    info!("⏭️ Saltado: {}", track.title());
                } else {
                    debug!("Detenido: {}", track.title());
                }
            }
            Self::set_idle(&mut st);
            self.reevaluate(&mut st, mode.advances());
        }
        true
    }
}

/// Consume los eventos de salud del transporte mientras la sesión exista.
async fn watch_health(session: Weak<SessionInner>, mut health: mpsc::UnboundedReceiver<TransportEvent>) {
    while let Some(event) = health.recv().await {
        let Some(inner) = session.upgrade() else {
            break;
        };
        match event {
            TransportEvent::ConnectionLost { reason } => {
                let mut st = inner.state.lock();
                inner.connection_lost(&mut st, &reason);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        audio::pipeline::{Frame, TranscodePipeline},
        error::PipelineErrorKind,
        sources::{test_support::track, MockSourceResolver},
        voice::test_support::RecordingConnector,
    };
    use async_trait::async_trait;
    use bytes::Bytes;
    use pretty_assertions::assert_eq;
    use std::collections::HashMap;

    #[derive(Clone)]
    enum Script {
        /// N frames y fin del stream
        Frames(u64),
        /// Nunca termina por sí solo
        Endless,
        FailOpen(PipelineError),
        HangOpen,
        FailAfter(u64, PipelineError),
    }

    #[derive(Default)]
    struct ScriptedTranscoder {
        scripts: HashMap<String, Script>,
        opens: Mutex<Vec<String>>,
    }

    impl ScriptedTranscoder {
        fn with(mut self, title: &str, script: Script) -> Self {
            self.scripts.insert(title.to_string(), script);
            self
        }

        fn opens(&self) -> Vec<String> {
            self.opens.lock().clone()
        }
    }

    #[async_trait]
    impl Transcoder for ScriptedTranscoder {
        async fn open(
            &self,
            track: &TrackDescriptor,
            _gain: Gain,
        ) -> Result<TranscodePipeline, PipelineError> {
            let title = track.title().to_string();
            self.opens.lock().push(title.clone());
            let script = self
                .scripts
                .get(&title)
                .cloned()
                .unwrap_or(Script::Frames(3));

            let (limit, failure) = match script {
                Script::FailOpen(e) => return Err(e),
                Script::HangOpen => {
                    std::future::pending::<()>().await;
                    unreachable!()
                }
                Script::Frames(n) => (Some(n), None),
                Script::Endless => (None, None),
                Script::FailAfter(n, e) => (Some(n), Some(e)),
            };

            let (feed, mut pipeline) = TranscodePipeline::channel(5, Duration::from_secs(5));
            tokio::spawn(async move {
                let mut sequence = 0;
                while limit.map_or(true, |n| sequence < n) {
                    let frame = Frame {
                        sequence,
                        payload: Bytes::from(format!("{}:{}", title, sequence)),
                    };
                    if !feed.send(Ok(frame)).await {
                        return;
                    }
                    sequence += 1;
                }
                if let Some(e) = failure {
                    feed.send(Err(e)).await;
                }
            });

            pipeline.prime().await?;
            Ok(pipeline)
        }
    }

    struct Harness {
        session: VoiceSession,
        connector: RecordingConnector,
        transcoder: Arc<ScriptedTranscoder>,
        events: mpsc::UnboundedReceiver<Notification>,
    }

    impl Harness {
        async fn joined(transcoder: ScriptedTranscoder) -> Self {
            Self::joined_with(transcoder, MockSourceResolver::new()).await
        }

        async fn joined_with(transcoder: ScriptedTranscoder, resolver: MockSourceResolver) -> Self {
            let config = Config {
                open_timeout: Duration::from_secs(2),
                resolve_timeout: Duration::from_secs(2),
                max_song_duration: 600,
                ..Config::default()
            };
            let connector = RecordingConnector::new();
            let transcoder = Arc::new(transcoder);
            let (tx, events) = mpsc::unbounded_channel();

            let session = VoiceSession::new(
                GuildId::new(1),
                Arc::new(connector.clone()),
                transcoder.clone(),
                Arc::new(resolver),
                tx,
                &config,
            );
            session.join(ChannelId::new(2)).await.unwrap();

            Self {
                session,
                connector,
                transcoder,
                events,
            }
        }

        fn enqueue(&self, titles: &[&str]) {
            self.session
                .enqueue(titles.iter().map(|t| track(t)).collect())
                .unwrap();
        }

        async fn next_event(&mut self) -> PlaybackEvent {
            tokio::time::timeout(Duration::from_secs(30), self.events.recv())
                .await
                .expect("no event within 30s")
                .expect("event channel closed")
                .event
        }

        async fn expect_now_playing(&mut self, title: &str) {
            match self.next_event().await {
                PlaybackEvent::NowPlaying(summary) => assert_eq!(summary.title, title),
                other => panic!("expected NowPlaying({}), got {:?}", title, other),
            }
        }

        /// Deja correr el reloj y verifica que no llegó ningún evento.
        async fn expect_silence(&mut self) {
            tokio::time::sleep(Duration::from_secs(5)).await;
            if let Ok(n) = self.events.try_recv() {
                panic!("unexpected event {:?}", n.event);
            }
        }

        fn drain_queue_added(&mut self) {
            while let Ok(n) = self.events.try_recv() {
                assert!(matches!(n.event, PlaybackEvent::QueueAdded(_)));
            }
        }

        async fn wait_for_state(&self, state: PlaybackState) {
            for _ in 0..1000 {
                if self.session.state() == state {
                    return;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
            panic!("session never reached {:?}", state);
        }

        fn queue_titles(&self) -> Vec<String> {
            self.session.list_queue().into_iter().map(|t| t.title).collect()
        }
    }

    #[tokio::test(start_paused = true)]
    async fn play_skip_and_drain_to_idle() {
        let mut h = Harness::joined(
            ScriptedTranscoder::default()
                .with("A", Script::Endless)
                .with("B", Script::Frames(3)),
        )
        .await;
        h.enqueue(&["A", "B"]);
        h.drain_queue_added();

        h.session.start().unwrap();
        h.expect_now_playing("A").await;
        assert_eq!(h.queue_titles(), vec!["B"]);

        h.session.skip().await.unwrap();
        h.expect_now_playing("B").await;
        assert!(h.queue_titles().is_empty());

        h.wait_for_state(PlaybackState::Idle).await;
        assert!(h.session.now_playing().is_none());
        h.expect_silence().await;
    }

    #[tokio::test(start_paused = true)]
    async fn no_stale_frames_after_skip() {
        let mut h = Harness::joined(
            ScriptedTranscoder::default()
                .with("A", Script::Endless)
                .with("B", Script::Frames(4)),
        )
        .await;
        h.enqueue(&["A", "B"]);
        h.session.start().unwrap();
        h.drain_queue_added();
        h.expect_now_playing("A").await;

        tokio::time::sleep(Duration::from_millis(200)).await;
        h.session.skip().await.unwrap();
        let cut = h.connector.sent_count();

        h.expect_now_playing("B").await;
        h.wait_for_state(PlaybackState::Idle).await;

        let after: Vec<Bytes> = h.connector.payloads().split_off(cut);
        let expected: Vec<Bytes> = (0..4).map(|i| Bytes::from(format!("B:{}", i))).collect();
        assert_eq!(after, expected);
    }

    #[tokio::test(start_paused = true)]
    async fn repeat_all_cycles_in_insertion_order() {
        let mut h = Harness::joined(
            ScriptedTranscoder::default()
                .with("A", Script::Frames(2))
                .with("B", Script::Frames(2)),
        )
        .await;
        h.enqueue(&["A", "B"]);
        h.drain_queue_added();
        h.session.set_loop(LoopMode::Queue);
        h.session.start().unwrap();

        h.expect_now_playing("A").await;
        h.expect_now_playing("B").await;
        h.expect_now_playing("A").await;
        assert_eq!(h.queue_titles(), vec!["B"]);
        assert_eq!(
            h.session.now_playing().map(|n| n.track.title),
            Some("A".to_string())
        );

        h.session.stop().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn double_skip_advances_one_position() {
        let mut h = Harness::joined(
            ScriptedTranscoder::default()
                .with("A", Script::Endless)
                .with("B", Script::Endless),
        )
        .await;
        h.enqueue(&["A", "B"]);
        h.drain_queue_added();
        h.session.start().unwrap();
        h.expect_now_playing("A").await;

        let (first, second) = tokio::join!(h.session.skip(), h.session.skip());
        assert_eq!((first, second), (Ok(()), Ok(())));

        h.expect_now_playing("B").await;
        h.expect_silence().await;
        assert_eq!(h.session.state(), PlaybackState::Playing);
        assert_eq!(
            h.session.now_playing().map(|n| n.track.title),
            Some("B".to_string())
        );
        assert_eq!(h.transcoder.opens(), vec!["A", "B"]);
    }

    #[tokio::test(start_paused = true)]
    async fn back_to_back_skips_coalesce() {
        let mut h = Harness::joined(
            ScriptedTranscoder::default()
                .with("A", Script::Endless)
                .with("B", Script::Endless)
                .with("C", Script::Endless),
        )
        .await;
        h.enqueue(&["A", "B", "C"]);
        h.drain_queue_added();
        h.session.start().unwrap();
        h.expect_now_playing("A").await;

        h.session.skip().await.unwrap();
        // B todavía está en Starting: este skip se une al anterior
        h.session.skip().await.unwrap();

        h.expect_now_playing("B").await;
        assert_eq!(h.queue_titles(), vec!["C"]);
        h.session.stop().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn late_skip_cuts_a_hung_open() {
        let mut h = Harness::joined(
            ScriptedTranscoder::default()
                .with("A", Script::Endless)
                .with("B", Script::HangOpen)
                .with("C", Script::Endless),
        )
        .await;
        h.enqueue(&["A", "B", "C"]);
        h.drain_queue_added();
        h.session.start().unwrap();
        h.expect_now_playing("A").await;

        h.session.skip().await.unwrap();
        tokio::time::sleep(Duration::from_millis(1500)).await;
        assert_eq!(h.session.state(), PlaybackState::Starting);

        // Fuera de la ventana de coalescencia: corta B antes de su timeout
        h.session.skip().await.unwrap();
        h.expect_now_playing("C").await;
        assert_eq!(h.transcoder.opens(), vec!["A", "B", "C"]);
        h.session.stop().await.unwrap();
        h.expect_silence().await;
    }

    #[tokio::test(start_paused = true)]
    async fn skip_many_jumps_over_pending_tracks() {
        let mut h = Harness::joined(
            ScriptedTranscoder::default()
                .with("A", Script::Endless)
                .with("D", Script::Endless),
        )
        .await;
        h.enqueue(&["A", "B", "C", "D"]);
        h.drain_queue_added();
        h.session.start().unwrap();
        h.expect_now_playing("A").await;

        h.session.skip_many(3).await.unwrap();
        h.expect_now_playing("D").await;
        assert!(h.queue_titles().is_empty());
        assert_eq!(h.transcoder.opens(), vec!["A", "D"]);
        h.session.stop().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn skip_many_while_idle_keeps_the_queue() {
        let mut h = Harness::joined(ScriptedTranscoder::default()).await;
        h.enqueue(&["A", "B"]);
        h.drain_queue_added();

        assert_eq!(h.session.skip_many(2).await, Err(CommandError::NothingPlaying));
        assert_eq!(h.queue_titles(), vec!["A", "B"]);
        assert!(h.transcoder.opens().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn pipeline_error_reports_once_and_advances() {
        let mut h = Harness::joined(
            ScriptedTranscoder::default()
                .with("A", Script::FailAfter(3, PipelineError::DecodeError("corrupt".into())))
                .with("B", Script::Frames(2)),
        )
        .await;
        h.enqueue(&["A", "B"]);
        h.drain_queue_added();
        h.session.set_loop(LoopMode::Queue);
        h.session.start().unwrap();

        h.expect_now_playing("A").await;
        match h.next_event().await {
            PlaybackEvent::PlaybackError { kind, track, .. } => {
                assert_eq!(kind, PipelineErrorKind::DecodeError);
                assert_eq!(track.title, "A");
            }
            other => panic!("expected PlaybackError, got {:?}", other),
        }
        h.expect_now_playing("B").await;

        // El track fallido nunca vuelve, ni con loop de cola
        assert!(h.queue_titles().iter().all(|t| t != "A"));
        h.session.stop().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn failed_and_hung_opens_never_stick_in_starting() {
        let mut h = Harness::joined(
            ScriptedTranscoder::default()
                .with("A", Script::FailOpen(PipelineError::SourceUnavailable("gone".into())))
                .with("B", Script::HangOpen)
                .with("C", Script::Frames(2)),
        )
        .await;
        h.enqueue(&["A", "B", "C"]);
        h.drain_queue_added();
        h.session.start().unwrap();

        let mut errors = Vec::new();
        for _ in 0..2 {
            match h.next_event().await {
                PlaybackEvent::PlaybackError { kind, track, .. } => errors.push((kind, track.title)),
                other => panic!("expected PlaybackError, got {:?}", other),
            }
        }
        assert_eq!(
            errors,
            vec![
                (PipelineErrorKind::SourceUnavailable, "A".to_string()),
                (PipelineErrorKind::Timeout, "B".to_string()),
            ]
        );
        h.expect_now_playing("C").await;
    }

    #[tokio::test(start_paused = true)]
    async fn pause_and_resume_keep_the_same_track() {
        let mut h = Harness::joined(ScriptedTranscoder::default().with("A", Script::Endless)).await;
        h.enqueue(&["A"]);
        h.drain_queue_added();
        h.session.start().unwrap();
        h.expect_now_playing("A").await;
        let id = h.session.now_playing().map(|n| n.track.id);

        tokio::time::sleep(Duration::from_millis(100)).await;
        h.session.pause().unwrap();
        assert_eq!(h.session.state(), PlaybackState::Paused);

        tokio::time::sleep(Duration::from_millis(50)).await;
        let paused_at = h.connector.sent_count();
        let position = h.session.now_playing().map(|n| n.position);
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(h.connector.sent_count(), paused_at);
        assert_eq!(h.session.now_playing().map(|n| n.position), position);

        h.session.resume().unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(h.connector.sent_count() > paused_at);
        assert_eq!(h.session.now_playing().map(|n| n.track.id), id);

        h.expect_silence().await;
        assert_eq!(h.transcoder.opens(), vec!["A"]);
        h.session.stop().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn stop_while_paused_keeps_the_queue() {
        let mut h = Harness::joined(
            ScriptedTranscoder::default()
                .with("A", Script::Endless)
                .with("B", Script::Endless),
        )
        .await;
        h.enqueue(&["A", "B"]);
        h.drain_queue_added();
        h.session.start().unwrap();
        h.expect_now_playing("A").await;

        h.session.pause().unwrap();
        h.session.stop().await.unwrap();

        assert_eq!(h.session.state(), PlaybackState::Idle);
        assert!(h.session.now_playing().is_none());
        assert_eq!(h.queue_titles(), vec!["B"]);
        h.expect_silence().await;
    }

    #[tokio::test(start_paused = true)]
    async fn clear_empties_queue_and_stops_current() {
        let mut h = Harness::joined(
            ScriptedTranscoder::default()
                .with("A", Script::Endless)
                .with("B", Script::Endless),
        )
        .await;
        h.enqueue(&["A", "B"]);
        h.drain_queue_added();
        h.session.start().unwrap();
        h.expect_now_playing("A").await;

        assert_eq!(h.session.clear().await, 1);
        assert_eq!(h.session.state(), PlaybackState::Idle);
        assert!(h.queue_titles().is_empty());
        h.expect_silence().await;
    }

    #[tokio::test(start_paused = true)]
    async fn clear_right_after_skip_stops_the_starting_track() {
        let mut h = Harness::joined(
            ScriptedTranscoder::default()
                .with("A", Script::Endless)
                .with("B", Script::HangOpen),
        )
        .await;
        h.enqueue(&["A", "B", "C"]);
        h.drain_queue_added();
        h.session.start().unwrap();
        h.expect_now_playing("A").await;

        h.session.skip().await.unwrap();
        assert_eq!(h.session.state(), PlaybackState::Starting);

        assert_eq!(h.session.clear().await, 1);
        assert_eq!(h.session.state(), PlaybackState::Idle);
        assert!(h.session.now_playing().is_none());
        assert!(h.queue_titles().is_empty());
        // Ni NowPlaying ni el timeout de apertura de B
        h.expect_silence().await;
        assert_eq!(h.transcoder.opens(), vec!["A", "B"]);
    }

    #[tokio::test(start_paused = true)]
    async fn connection_loss_while_playing_fails_stop() {
        let mut h = Harness::joined(
            ScriptedTranscoder::default()
                .with("A", Script::Endless)
                .with("B", Script::Endless),
        )
        .await;
        h.enqueue(&["A", "B"]);
        h.drain_queue_added();
        h.session.start().unwrap();
        h.expect_now_playing("A").await;

        h.connector.fail_after(Some(h.connector.sent_count() + 3));

        match h.next_event().await {
            PlaybackEvent::Disconnected(DisconnectReason::ConnectionLost(_)) => {}
            other => panic!("expected Disconnected, got {:?}", other),
        }
        h.wait_for_state(PlaybackState::Idle).await;
        assert_eq!(h.queue_titles(), vec!["B"]);
        assert!(!h.session.is_connected());
        h.expect_silence().await;
    }

    #[tokio::test(start_paused = true)]
    async fn external_disconnect_report_is_handled_once() {
        let mut h = Harness::joined(ScriptedTranscoder::default().with("A", Script::Endless)).await;
        h.enqueue(&["A", "B"]);
        h.drain_queue_added();
        h.session.start().unwrap();
        h.expect_now_playing("A").await;

        h.session.transport().report_connection_lost("kicked");
        h.session.transport().report_connection_lost("kicked again");

        assert_eq!(
            h.next_event().await,
            PlaybackEvent::Disconnected(DisconnectReason::ConnectionLost("kicked".into()))
        );
        h.wait_for_state(PlaybackState::Idle).await;
        h.expect_silence().await;
        assert_eq!(h.queue_titles(), vec!["B"]);

        // Nada suena hasta un join explícito + start
        h.session.join(ChannelId::new(2)).await.unwrap();
        assert_eq!(h.connector.connects(), 2);
        h.expect_silence().await;
        h.session.start().unwrap();
        h.expect_now_playing("B").await;
    }

    #[tokio::test(start_paused = true)]
    async fn invalid_commands_do_not_mutate_state() {
        let h = Harness::joined(ScriptedTranscoder::default().with("A", Script::Endless)).await;

        assert_eq!(h.session.pause(), Err(CommandError::NothingPlaying));
        assert_eq!(h.session.resume(), Err(CommandError::NothingPlaying));
        assert_eq!(h.session.skip().await, Err(CommandError::NothingPlaying));
        assert_eq!(h.session.start(), Err(CommandError::QueueEmpty));
        assert_eq!(h.session.remove(0), Err(CommandError::IndexOutOfRange { index: 0, len: 0 }));
        assert_eq!(h.session.set_volume(2.5), Err(CommandError::InvalidVolume(2.5)));

        h.enqueue(&["A"]);
        h.session.start().unwrap();
        h.wait_for_state(PlaybackState::Playing).await;
        assert_eq!(h.session.resume(), Err(CommandError::NotPaused));
        h.session.stop().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn play_resolves_enqueues_and_starts() {
        let mut resolver = MockSourceResolver::new();
        resolver
            .expect_resolve()
            .withf(|query, _| query == "mix")
            .times(1)
            .returning(|_, _| Ok(vec![track("A"), track("B")]));
        resolver
            .expect_resolve()
            .withf(|query, _| query == "missing")
            .returning(|q, _| Err(ResolutionError::NotFound(q.to_string())));

        let mut h = Harness::joined_with(
            ScriptedTranscoder::default()
                .with("A", Script::Endless)
                .with("B", Script::Endless),
            resolver,
        )
        .await;

        let added = h.session.play("mix", UserId::new(5)).await.unwrap();
        assert_eq!(added.len(), 2);
        match h.next_event().await {
            PlaybackEvent::QueueAdded(tracks) => {
                let titles: Vec<&str> = tracks.iter().map(|t| t.title.as_str()).collect();
                assert_eq!(titles, vec!["A", "B"]);
            }
            other => panic!("expected QueueAdded, got {:?}", other),
        }
        h.expect_now_playing("A").await;

        let err = h.session.play("missing", UserId::new(5)).await.unwrap_err();
        assert_eq!(err, EngineError::Resolution(ResolutionError::NotFound("missing".into())));
        assert_eq!(h.queue_titles(), vec!["B"]);
        h.expect_silence().await;
        h.session.stop().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn play_rejects_overlong_tracks_and_requires_connection() {
        let mut resolver = MockSourceResolver::new();
        resolver
            .expect_resolve()
            .returning(|_, _| Ok(vec![track("Long").with_duration(Duration::from_secs(3600))]));

        let h = Harness::joined_with(ScriptedTranscoder::default(), resolver).await;
        assert_eq!(
            h.session.play("long", UserId::new(5)).await,
            Err(EngineError::Command(CommandError::TrackTooLong { limit_secs: 600 }))
        );
        assert!(h.queue_titles().is_empty());

        h.session.leave().await;
        assert_eq!(
            h.session.play("anything", UserId::new(5)).await,
            Err(EngineError::Command(CommandError::NotConnected))
        );
    }

    struct HangingResolver;

    #[async_trait]
    impl SourceResolver for HangingResolver {
        async fn resolve(&self, _: &str, _: UserId) -> Result<Vec<TrackDescriptor>, ResolutionError> {
            std::future::pending().await
        }
    }

    #[tokio::test(start_paused = true)]
    async fn hung_resolver_times_out() {
        let config = Config {
            resolve_timeout: Duration::from_secs(3),
            ..Config::default()
        };
        let (tx, mut events) = mpsc::unbounded_channel();
        let session = VoiceSession::new(
            GuildId::new(9),
            Arc::new(RecordingConnector::new()),
            Arc::new(ScriptedTranscoder::default()),
            Arc::new(HangingResolver),
            tx,
            &config,
        );
        session.join(ChannelId::new(1)).await.unwrap();

        let err = session.play("anything", UserId::new(1)).await.unwrap_err();
        assert!(matches!(
            err,
            EngineError::Resolution(ResolutionError::NetworkTimeout(_))
        ));
        assert!(events.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn volume_and_progress_are_reported() {
        let mut h = Harness::joined(ScriptedTranscoder::default().with("A", Script::Endless)).await;
        h.session
            .enqueue(vec![track("A").with_duration(Duration::from_secs(10))])
            .unwrap();
        h.drain_queue_added();
        h.session.set_volume(1.5).unwrap();
        h.session.start().unwrap();
        h.expect_now_playing("A").await;

        tokio::time::sleep(Duration::from_secs(1)).await;
        let now = h.session.now_playing().unwrap();
        assert_eq!(now.volume, 1.5);
        assert!(now.position >= Duration::from_millis(900));
        assert!(now.progress().is_some_and(|p| p > 0.05 && p < 0.2));
        h.session.stop().await.unwrap();
    }
}
