use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::{str::FromStr, time::Duration};

use crate::audio::encoder::FrameCodec;

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    // Extractor
    pub ytdlp_path: String,

    // Cola
    pub max_queue_size: usize,
    pub max_playlist_size: usize,
    pub max_song_duration: u64, // En segundos

    // Audio
    pub default_volume: f32,
    pub frame_codec: FrameCodec,
    pub opus_bitrate: u32,
    pub read_ahead_frames: usize,

    // Timeouts
    #[serde(with = "humantime_serde_compat")]
    pub resolve_timeout: Duration,
    #[serde(with = "humantime_serde_compat")]
    pub open_timeout: Duration,
    #[serde(with = "humantime_serde_compat")]
    pub read_timeout: Duration,
    #[serde(with = "humantime_serde_compat")]
    pub connect_timeout: Duration,
    #[serde(with = "humantime_serde_compat")]
    pub idle_timeout: Duration,
    #[serde(with = "humantime_serde_compat")]
    pub maintenance_interval: Duration,

    // Caché de resoluciones
    pub cache_size: usize,
    #[serde(with = "humantime_serde_compat")]
    pub cache_ttl: Duration,

    // Red de voz
    pub voice_endpoint: Option<String>,

    // Rendimiento
    pub worker_threads: usize,
}

impl Config {
    pub fn load() -> Result<Self> {
        dotenvy::dotenv().ok();

        let defaults = Self::default();
        let config = Self {
            ytdlp_path: std::env::var("YTDLP_PATH").unwrap_or(defaults.ytdlp_path),

            max_queue_size: env_or("MAX_QUEUE_SIZE", defaults.max_queue_size)?,
            max_playlist_size: env_or("MAX_PLAYLIST_SIZE", defaults.max_playlist_size)?,
            max_song_duration: env_or("MAX_SONG_DURATION", defaults.max_song_duration)?,

            default_volume: env_or("DEFAULT_VOLUME", defaults.default_volume)?,
            frame_codec: env_or("FRAME_CODEC", defaults.frame_codec)?,
            opus_bitrate: env_or("OPUS_BITRATE", defaults.opus_bitrate)?,
            read_ahead_frames: env_or("READ_AHEAD_FRAMES", defaults.read_ahead_frames)?,

            resolve_timeout: env_duration_or("RESOLVE_TIMEOUT", defaults.resolve_timeout)?,
            open_timeout: env_duration_or("OPEN_TIMEOUT", defaults.open_timeout)?,
            read_timeout: env_duration_or("READ_TIMEOUT", defaults.read_timeout)?,
            connect_timeout: env_duration_or("CONNECT_TIMEOUT", defaults.connect_timeout)?,
            idle_timeout: env_duration_or("IDLE_TIMEOUT", defaults.idle_timeout)?,
            maintenance_interval: env_duration_or(
                "MAINTENANCE_INTERVAL",
                defaults.maintenance_interval,
            )?,

            cache_size: env_or("CACHE_SIZE", defaults.cache_size)?,
            cache_ttl: env_duration_or("CACHE_TTL", defaults.cache_ttl)?,

            voice_endpoint: std::env::var("VOICE_ENDPOINT")
                .ok()
                .filter(|s| !s.trim().is_empty()),

            worker_threads: match std::env::var("WORKER_THREADS") {
                Ok(val) if !val.trim().is_empty() => val.parse()?,
                _ => num_cpus::get(),
            },
        };

        config.validate()?;

        Ok(config)
    }

    /// Validates configuration values for correctness.
    ///
    /// # Validation Rules
    ///
    /// - Volume must be between 0.0 and 2.0
    /// - Opus bitrate must be between 8kbps and 510kbps
    /// - Queue, playlist, cache and read-ahead sizes must be > 0
    /// - Every timeout must be non-zero
    pub fn validate(&self) -> Result<()> {
        if !(0.0..=2.0).contains(&self.default_volume) {
            anyhow::bail!(
                "Default volume must be between 0.0 and 2.0, got: {}",
                self.default_volume
            );
        }

        if self.opus_bitrate > 510_000 {
            anyhow::bail!("Opus bitrate cannot exceed 510kbps, got: {}", self.opus_bitrate);
        }

        if self.opus_bitrate < 8_000 {
            anyhow::bail!("Opus bitrate too low, minimum 8kbps, got: {}", self.opus_bitrate);
        }

        if self.max_queue_size == 0 {
            anyhow::bail!("Max queue size must be greater than 0");
        }

        if self.max_playlist_size == 0 {
            anyhow::bail!("Max playlist size must be greater than 0");
        }

        if self.max_song_duration == 0 {
            anyhow::bail!("Max song duration must be greater than 0");
        }

        if self.read_ahead_frames == 0 {
            anyhow::bail!("Read-ahead must hold at least one frame");
        }

        if self.cache_size == 0 {
            anyhow::bail!("Cache size must be greater than 0");
        }

        for (name, value) in [
            ("resolve_timeout", self.resolve_timeout),
            ("open_timeout", self.open_timeout),
            ("read_timeout", self.read_timeout),
            ("connect_timeout", self.connect_timeout),
            ("idle_timeout", self.idle_timeout),
            ("maintenance_interval", self.maintenance_interval),
        ] {
            if value.is_zero() {
                anyhow::bail!("{} must be greater than 0", name);
            }
        }

        Ok(())
    }

    /// Returns a summary of the current configuration for logging.
    pub fn summary(&self) -> String {
        format!(
            "Config Summary:\n  \
            Extractor: {}\n  \
            Audio: {}% vol, {:?} frames @ {}kbps, {} frames read-ahead\n  \
            Limits: {} queue, {} playlist, {}s max duration\n  \
            Timeouts: resolve {}, open {}, read {}, connect {}, idle {}\n  \
            Cache: {} entries, ttl {}\n  \
            Voice endpoint: {}",
            self.ytdlp_path,
            (self.default_volume * 100.0) as u32,
            self.frame_codec,
            self.opus_bitrate / 1000,
            self.read_ahead_frames,
            self.max_queue_size,
            self.max_playlist_size,
            self.max_song_duration,
            humantime::format_duration(self.resolve_timeout),
            humantime::format_duration(self.open_timeout),
            humantime::format_duration(self.read_timeout),
            humantime::format_duration(self.connect_timeout),
            humantime::format_duration(self.idle_timeout),
            self.cache_size,
            humantime::format_duration(self.cache_ttl),
            self.voice_endpoint.as_deref().unwrap_or("none"),
        )
    }

    pub fn max_track_duration(&self) -> Duration {
        Duration::from_secs(self.max_song_duration)
    }
}

/// Default configuration values.
///
/// Used as fallbacks when environment variables are not provided.
impl Default for Config {
    fn default() -> Self {
        Self {
            ytdlp_path: "yt-dlp".to_string(),

            max_queue_size: 1000,
            max_playlist_size: 100,
            max_song_duration: 7200, // 2 horas

            default_volume: 0.5,
            frame_codec: FrameCodec::Opus,
            opus_bitrate: 96_000, // 96kbps (Discord default)
            read_ahead_frames: 5, // 100ms

            resolve_timeout: Duration::from_secs(30),
            open_timeout: Duration::from_secs(15),
            read_timeout: Duration::from_secs(5),
            connect_timeout: Duration::from_secs(10),
            idle_timeout: Duration::from_secs(300),
            maintenance_interval: Duration::from_secs(60),

            cache_size: 100,
            cache_ttl: Duration::from_secs(3600),

            voice_endpoint: None,

            worker_threads: num_cpus::get(),
        }
    }
}

fn env_or<T>(key: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match std::env::var(key) {
        Ok(val) if !val.trim().is_empty() => val
            .trim()
            .parse()
            .with_context(|| format!("invalid value for {}: {}", key, val)),
        _ => Ok(default),
    }
}

/// Acepta "30s", "5m", "1h 30m" o segundos sin unidad.
fn env_duration_or(key: &str, default: Duration) -> Result<Duration> {
    match std::env::var(key) {
        Ok(val) if !val.trim().is_empty() => parse_duration(val.trim())
            .with_context(|| format!("invalid duration for {}: {}", key, val)),
        _ => Ok(default),
    }
}

fn parse_duration(raw: &str) -> Result<Duration> {
    if let Ok(secs) = raw.parse::<u64>() {
        return Ok(Duration::from_secs(secs));
    }
    Ok(humantime::parse_duration(raw)?)
}

/// Serializa duraciones como texto legible ("5m", "30s").
mod humantime_serde_compat {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&humantime::format_duration(*value).to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let raw = String::deserialize(deserializer)?;
        super::parse_duration(&raw).map_err(serde::de::Error::custom)
    }
}
