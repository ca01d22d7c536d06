use async_trait::async_trait;
use serenity::model::id::UserId;
use std::{path::PathBuf, sync::Arc};

use super::{
    stream::{extension_of, FileStream, HttpStream},
    SourceResolver, SourceType, TrackDescriptor,
};
use crate::error::ResolutionError;

const AUDIO_EXTENSIONS: [&str; 7] = ["mp3", "wav", "ogg", "flac", "m4a", "aac", "mp4"];

/// URLs directas a archivos de audio y rutas locales.
pub struct DirectUrlResolver {
    http: reqwest::Client,
}

impl DirectUrlResolver {
    pub fn new(http: reqwest::Client) -> Self {
        Self { http }
    }

    pub fn is_valid_url(&self, query: &str) -> bool {
        if let Some(path) = local_path(query) {
            return path.is_absolute();
        }

        if query.starts_with("http://") || query.starts_with("https://") {
            return extension_of(query)
                .is_some_and(|ext| AUDIO_EXTENSIONS.contains(&ext.as_str()));
        }

        false
    }
}

#[async_trait]
impl SourceResolver for DirectUrlResolver {
    async fn resolve(
        &self,
        query: &str,
        requester: UserId,
    ) -> Result<Vec<TrackDescriptor>, ResolutionError> {
        if let Some(path) = local_path(query) {
            if !tokio::fs::try_exists(&path).await.unwrap_or(false) {
                return Err(ResolutionError::NotFound(path.display().to_string()));
            }
            let title = title_from_path(&path.to_string_lossy());
            let track = TrackDescriptor::new(
                title,
                format!("file://{}", path.display()),
                SourceType::File,
                requester,
                Arc::new(FileStream::new(path)),
            );
            return Ok(vec![track]);
        }

        let parsed = url::Url::parse(query)
            .map_err(|e| ResolutionError::Malformed(format!("{}: {}", query, e)))?;

        let title = title_from_path(parsed.path());
        let track = TrackDescriptor::new(
            title,
            query,
            SourceType::DirectUrl,
            requester,
            Arc::new(HttpStream::new(self.http.clone(), query)),
        );
        Ok(vec![track])
    }
}

fn local_path(query: &str) -> Option<PathBuf> {
    if let Some(rest) = query.strip_prefix("file://") {
        return Some(PathBuf::from(rest));
    }
    if query.starts_with('/') {
        return Some(PathBuf::from(query));
    }
    None
}

/// Nombre legible a partir del último segmento de la ruta.
fn title_from_path(path: &str) -> String {
    let Some(last) = path.rsplit('/').find(|s| !s.is_empty()) else {
        return "Unknown".to_string();
    };
    let stem = last.rsplit_once('.').map_or(last, |(stem, _)| stem);
    let decoded = url::form_urlencoded::parse(stem.as_bytes())
        .map(|(k, v)| if v.is_empty() { k.into_owned() } else { format!("{}={}", k, v) })
        .collect::<Vec<_>>()
        .join("&");
    if decoded.trim().is_empty() {
        "Unknown".to_string()
    } else {
        decoded
    }
}
