use anyhow::Result;
use async_trait::async_trait;
use serde::Deserialize;
use serenity::model::id::UserId;
use regex::Regex;
use std::{
    sync::{Arc, OnceLock},
    time::Duration,
};
use tracing::{debug, error, info, warn};

use super::{stream::HttpStream, ByteStream, SourceResolver, SourceType, StreamHandle, TrackDescriptor};
use crate::error::{PipelineError, ResolutionError};

/// Formatos que symphonia sabe demultiplexar, en orden de preferencia.
const AUDIO_FORMAT: &str = "bestaudio[ext=m4a]/bestaudio[acodec=mp3]/bestaudio[ext=ogg]/bestaudio";

/// Cliente de yt-dlp: búsquedas, URLs de páginas y playlists.
pub struct YtDlpResolver {
    binary: String,
    max_playlist_size: usize,
    http: reqwest::Client,
}

impl YtDlpResolver {
    pub fn new(binary: &str, max_playlist_size: usize, http: reqwest::Client) -> Self {
        Self {
            binary: binary.to_string(),
            max_playlist_size,
            http,
        }
    }

    /// Verifica que yt-dlp esté disponible
    pub async fn verify_dependencies(&self) -> Result<()> {
        let output = tokio::process::Command::new(&self.binary)
            .arg("--version")
            .output()
            .await;

        match output {
            Ok(output) if output.status.success() => {
                let version = String::from_utf8_lossy(&output.stdout);
                info!("✅ yt-dlp versión: {}", version.trim());
                Ok(())
            }
            _ => {
                error!("❌ yt-dlp no encontrado. Instala con: pip install yt-dlp");
                anyhow::bail!("yt-dlp no disponible ({})", self.binary)
            }
        }
    }

    /// Las consultas que no son URL se buscan en YouTube.
    fn target_for(query: &str) -> String {
        if is_url(query) {
            query.to_string()
        } else {
            format!("ytsearch1:{}", query)
        }
    }

    fn build_tracks(
        &self,
        info: YtDlpInfo,
        requester: UserId,
    ) -> Vec<TrackDescriptor> {
        let entries = match info.entries {
            Some(entries) => entries.into_iter().flatten().collect(),
            None => vec![info],
        };

        let total = entries.len();
        let tracks: Vec<TrackDescriptor> = entries
            .into_iter()
            .filter_map(|entry| self.entry_to_track(entry, requester))
            .take(self.max_playlist_size)
            .collect();

        if tracks.len() < total {
            debug!(
                "📋 {} de {} entradas descartadas o truncadas",
                total - tracks.len(),
                total
            );
        }

        tracks
    }

    fn entry_to_track(&self, entry: YtDlpInfo, requester: UserId) -> Option<TrackDescriptor> {
        let page_url = entry.page_url()?;
        let stream = Arc::new(YtDlpStream {
            binary: self.binary.clone(),
            page_url: page_url.clone(),
            http: self.http.clone(),
        });

        let mut track = TrackDescriptor::new(
            entry.title.clone().unwrap_or_else(|| "Unknown".to_string()),
            page_url,
            SourceType::YtDlp,
            requester,
            stream,
        );

        if let Some(artist) = entry.uploader.or(entry.channel) {
            track = track.with_artist(artist);
        }

        if let Some(duration) = entry.duration.filter(|d| d.is_finite() && *d > 0.0) {
            track = track.with_duration(Duration::from_secs_f64(duration));
        }

        if let Some(thumbnail) = entry.thumbnail {
            track = track.with_thumbnail(thumbnail);
        }

        Some(track)
    }
}

#[async_trait]
impl SourceResolver for YtDlpResolver {
    async fn resolve(
        &self,
        query: &str,
        requester: UserId,
    ) -> Result<Vec<TrackDescriptor>, ResolutionError> {
        let target = Self::target_for(query);
        info!("🔍 Resolviendo con yt-dlp: {}", target);

        let output = tokio::process::Command::new(&self.binary)
            .args([
                "-J",
                "--flat-playlist",
                "--no-warnings",
                "--socket-timeout",
                "15",
                "--playlist-end",
                &self.max_playlist_size.to_string(),
            ])
            .arg(&target)
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| ResolutionError::Unavailable(format!("{}: {}", self.binary, e)))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            warn!("yt-dlp falló para {}: {}", query, stderr.trim());
            return Err(classify_stderr(query, &stderr));
        }

        let info = parse_info(&output.stdout)?;
        Ok(self.build_tracks(info, requester))
    }
}

/// Stream diferido: pide a yt-dlp una URL fresca justo antes de reproducir.
pub struct YtDlpStream {
    binary: String,
    page_url: String,
    http: reqwest::Client,
}

impl YtDlpStream {
    async fn stream_url(&self) -> Result<String, PipelineError> {
        let output = tokio::process::Command::new(&self.binary)
            .args(["-f", AUDIO_FORMAT, "-g", "--no-playlist", "--no-warnings"])
            .arg(&self.page_url)
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| PipelineError::SourceUnavailable(format!("{}: {}", self.binary, e)))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(PipelineError::SourceUnavailable(format!(
                "yt-dlp could not extract a stream: {}",
                stderr.trim()
            )));
        }

        String::from_utf8_lossy(&output.stdout)
            .lines()
            .map(str::trim)
            .find(|line| is_url(line))
            .map(str::to_string)
            .ok_or_else(|| {
                PipelineError::SourceUnavailable("yt-dlp returned no stream URL".to_string())
            })
    }
}

#[async_trait]
impl StreamHandle for YtDlpStream {
    async fn open(&self) -> Result<ByteStream, PipelineError> {
        let url = self.stream_url().await?;
        debug!("🎯 URL de stream obtenida para {}", self.page_url);
        HttpStream::fetch(&self.http, &url).await
    }

    fn describe(&self) -> String {
        format!("yt-dlp {}", self.page_url)
    }
}

/// Respuesta de `yt-dlp -J`: un video o una playlist con entradas planas.
#[derive(Debug, Deserialize)]
struct YtDlpInfo {
    id: Option<String>,
    ie_key: Option<String>,
    title: Option<String>,
    url: Option<String>,
    webpage_url: Option<String>,
    original_url: Option<String>,
    duration: Option<f64>,
    uploader: Option<String>,
    channel: Option<String>,
    thumbnail: Option<String>,
    entries: Option<Vec<Option<YtDlpInfo>>>,
}

impl YtDlpInfo {
    fn page_url(&self) -> Option<String> {
        if let Some(url) = [&self.webpage_url, &self.original_url, &self.url]
            .into_iter()
            .flatten()
            .find(|u| is_url(u))
        {
            return Some(url.clone());
        }

        // Entradas planas de YouTube a veces solo traen el id
        match (self.ie_key.as_deref(), self.id.as_deref()) {
            (Some("Youtube"), Some(id)) => Some(format!("https://www.youtube.com/watch?v={}", id)),
            _ => None,
        }
    }
}

fn parse_info(stdout: &[u8]) -> Result<YtDlpInfo, ResolutionError> {
    serde_json::from_slice(stdout)
        .map_err(|e| ResolutionError::Malformed(format!("unexpected yt-dlp output: {}", e)))
}

fn is_url(s: &str) -> bool {
    s.starts_with("http://") || s.starts_with("https://")
}

/// Quita el prefijo `ERROR: [extractor] id:` de una línea de yt-dlp.
fn clean_error_line(line: &str) -> String {
    static PREFIX: OnceLock<Option<Regex>> = OnceLock::new();
    let prefix = PREFIX.get_or_init(|| Regex::new(r"^ERROR:\s*(?:\[[^\]]+\]\s*[\w-]+:\s*)?").ok());

    match prefix {
        Some(re) => re.replace(line.trim(), "").into_owned(),
        None => line.trim().to_string(),
    }
}

/// Traduce el stderr de yt-dlp a la taxonomía de errores de resolución.
fn classify_stderr(query: &str, stderr: &str) -> ResolutionError {
    let lower = stderr.to_lowercase();
    let detail = clean_error_line(
        stderr
            .lines()
            .rev()
            .find(|l| l.contains("ERROR"))
            .unwrap_or(stderr),
    );

    if lower.contains("sign in to confirm your age")
        || lower.contains("age-restricted")
        || lower.contains("age restricted")
        || lower.contains("not available in your country")
        || lower.contains("blocked it in your country")
        || lower.contains("geo restriction")
        || lower.contains("private video")
    {
        ResolutionError::RegionOrAgeRestricted(detail)
    } else if lower.contains("unsupported url") || lower.contains("is not a valid url") {
        ResolutionError::Malformed(detail)
    } else if lower.contains("timed out")
        || lower.contains("temporary failure in name resolution")
        || lower.contains("connection reset")
        || lower.contains("unable to download webpage")
    {
        ResolutionError::NetworkTimeout(detail)
    } else {
        if detail.is_empty() {
            return ResolutionError::NotFound(query.to_string());
        }
        ResolutionError::NotFound(detail)
    }
}
