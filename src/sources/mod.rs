//! # Sources Module
//!
//! Boundary to the external media-extraction services. A [`SourceResolver`]
//! turns a user query or URL into zero or more [`TrackDescriptor`]s; each
//! descriptor carries a lazy [`StreamHandle`] that is only opened when the
//! track reaches the head of the queue, so short-lived stream URLs never
//! expire while waiting and skipped tracks never cost a network round-trip.
//!
//! ## Backends
//!
//! - [`YtDlpResolver`]: searches and page URLs (YouTube, SoundCloud, ...) through `yt-dlp`
//! - [`DirectUrlResolver`]: direct audio file URLs and local files
//!
//! [`SourceManager`] routes between them and caches resolutions.

pub mod direct_url;
pub mod stream;
pub mod ytdlp;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use serenity::model::id::UserId;
use std::{
    fmt,
    pin::Pin,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};
use tokio::io::AsyncRead;
use tracing::{debug, info};

use crate::{
    cache::ResolveCache,
    config::Config,
    error::{PipelineError, ResolutionError},
};

pub use direct_url::DirectUrlResolver;
pub use stream::{FileStream, HttpStream};
pub use ytdlp::{YtDlpResolver, YtDlpStream};

/// Flujo de bytes crudo (contenedor sin decodificar) de un track.
pub type ByteStream = Pin<Box<dyn AsyncRead + Send>>;

/// Handle diferido para abrir el audio de un track.
#[async_trait]
pub trait StreamHandle: Send + Sync {
    /// Abre el flujo de bytes. Se llama una vez por reproducción.
    async fn open(&self) -> Result<ByteStream, PipelineError>;

    /// Extensión del contenedor, si se conoce (ayuda al probe del demuxer).
    fn format_hint(&self) -> Option<String> {
        None
    }

    /// Descripción corta para logs.
    fn describe(&self) -> String;
}

/// Contrato del resolvedor consumido por el motor.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait SourceResolver: Send + Sync {
    /// Resuelve una consulta en tracks, en el orden en que deben encolarse.
    async fn resolve(
        &self,
        query: &str,
        requester: UserId,
    ) -> Result<Vec<TrackDescriptor>, ResolutionError>;
}

/// Identidad única de un track dentro del proceso.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct TrackId(u64);

impl TrackId {
    fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        Self(NEXT.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for TrackId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum SourceType {
    YtDlp,
    DirectUrl,
    File,
}

impl SourceType {
    pub fn as_str(&self) -> &'static str {
        match self {
            SourceType::YtDlp => "ytdlp",
            SourceType::DirectUrl => "direct",
            SourceType::File => "file",
        }
    }
}

/// Representa un track encolable: metadatos + handle diferido del audio.
#[derive(Clone)]
pub struct TrackDescriptor {
    id: TrackId,
    title: String,
    url: String,
    artist: Option<String>,
    thumbnail: Option<String>,
    duration: Option<Duration>,
    source_type: SourceType,
    requested_by: UserId,
    added_at: DateTime<Utc>,
    stream: Arc<dyn StreamHandle>,
}

impl TrackDescriptor {
    pub fn new(
        title: impl Into<String>,
        url: impl Into<String>,
        source_type: SourceType,
        requested_by: UserId,
        stream: Arc<dyn StreamHandle>,
    ) -> Self {
        Self {
            id: TrackId::next(),
            title: title.into(),
            url: url.into(),
            artist: None,
            thumbnail: None,
            duration: None,
            source_type,
            requested_by,
            added_at: Utc::now(),
            stream,
        }
    }

    // Getters
    pub fn id(&self) -> TrackId {
        self.id
    }
    pub fn title(&self) -> &str {
        &self.title
    }
    pub fn url(&self) -> &str {
        &self.url
    }
    pub fn artist(&self) -> Option<&str> {
        self.artist.as_deref()
    }
    pub fn thumbnail(&self) -> Option<&str> {
        self.thumbnail.as_deref()
    }
    pub fn duration(&self) -> Option<Duration> {
        self.duration
    }
    pub fn source_type(&self) -> SourceType {
        self.source_type
    }
    pub fn requested_by(&self) -> UserId {
        self.requested_by
    }
    pub fn added_at(&self) -> DateTime<Utc> {
        self.added_at
    }
    pub fn stream(&self) -> &Arc<dyn StreamHandle> {
        &self.stream
    }

    // Setters
    pub fn with_artist(mut self, artist: impl Into<String>) -> Self {
        self.artist = Some(artist.into());
        self
    }

    pub fn with_duration(mut self, duration: Duration) -> Self {
        self.duration = Some(duration);
        self
    }

    pub fn with_thumbnail(mut self, thumbnail: impl Into<String>) -> Self {
        self.thumbnail = Some(thumbnail.into());
        self
    }

    /// Copia para otro solicitante, con identidad nueva (usado por la caché).
    pub fn for_requester(&self, requested_by: UserId) -> Self {
        Self {
            id: TrackId::next(),
            requested_by,
            added_at: Utc::now(),
            ..self.clone()
        }
    }

    pub fn summary(&self) -> TrackSummary {
        TrackSummary {
            id: self.id,
            title: self.title.clone(),
            url: self.url.clone(),
            artist: self.artist.clone(),
            duration: self.duration,
            requested_by: self.requested_by,
            source: self.source_type,
        }
    }
}

impl fmt::Debug for TrackDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TrackDescriptor")
            .field("id", &self.id)
            .field("title", &self.title)
            .field("url", &self.url)
            .field("duration", &self.duration)
            .field("requested_by", &self.requested_by)
            .field("stream", &self.stream.describe())
            .finish()
    }
}

/// Vista serializable de un track para notificaciones y listados.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TrackSummary {
    pub id: TrackId,
    pub title: String,
    pub url: String,
    pub artist: Option<String>,
    pub duration: Option<Duration>,
    pub requested_by: UserId,
    pub source: SourceType,
}

/// Manager para todas las fuentes de música
pub struct SourceManager {
    ytdlp: YtDlpResolver,
    direct_url: DirectUrlResolver,
    cache: Arc<ResolveCache>,
}

impl SourceManager {
    pub fn new(config: &Config, http: reqwest::Client) -> Self {
        Self {
            ytdlp: YtDlpResolver::new(&config.ytdlp_path, config.max_playlist_size, http.clone()),
            direct_url: DirectUrlResolver::new(http),
            cache: Arc::new(ResolveCache::new_resolve_cache(config.cache_size, config.cache_ttl)),
        }
    }

    pub fn cache(&self) -> Arc<ResolveCache> {
        self.cache.clone()
    }

    /// Verifica que las herramientas externas estén disponibles
    pub async fn verify_dependencies(&self) -> anyhow::Result<()> {
        self.ytdlp.verify_dependencies().await
    }
}

#[async_trait]
impl SourceResolver for SourceManager {
    async fn resolve(
        &self,
        query: &str,
        requester: UserId,
    ) -> Result<Vec<TrackDescriptor>, ResolutionError> {
        let query = query.trim();
        if query.is_empty() {
            return Err(ResolutionError::Malformed("empty query".to_string()));
        }

        if let Some(cached) = self.cache.get(query) {
            debug!("💾 Resolución en caché para: {}", query);
            return Ok(cached.iter().map(|t| t.for_requester(requester)).collect());
        }

        let tracks = if self.direct_url.is_valid_url(query) {
            self.direct_url.resolve(query, requester).await?
        } else {
            self.ytdlp.resolve(query, requester).await?
        };

        info!("🔍 {} track(s) resueltos para: {}", tracks.len(), query);
        if !tracks.is_empty() {
            self.cache.put(query.to_string(), tracks.clone());
        }

        Ok(tracks)
    }
}
