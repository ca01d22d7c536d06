use async_trait::async_trait;
use futures::TryStreamExt;
use std::path::PathBuf;
use tokio_util::io::StreamReader;
use tracing::debug;

use super::{ByteStream, StreamHandle};
use crate::error::PipelineError;

/// Audio servido por HTTP(S). La petición se hace al abrir, no al encolar.
pub struct HttpStream {
    client: reqwest::Client,
    url: String,
}

impl HttpStream {
    pub fn new(client: reqwest::Client, url: impl Into<String>) -> Self {
        Self {
            client,
            url: url.into(),
        }
    }

    /// Abre una URL arbitraria con el cliente dado.
    pub(crate) async fn fetch(client: &reqwest::Client, url: &str) -> Result<ByteStream, PipelineError> {
        let response = client
            .get(url)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    PipelineError::Timeout(format!("HTTP request timed out: {}", e))
                } else {
                    PipelineError::SourceUnavailable(format!("HTTP request failed: {}", e))
                }
            })?
            .error_for_status()
            .map_err(|e| PipelineError::SourceUnavailable(format!("HTTP error: {}", e)))?;

        debug!(
            "🌐 Stream HTTP abierto ({} bytes anunciados)",
            response
                .content_length()
                .map_or("?".to_string(), |len| len.to_string())
        );

        let body = response.bytes_stream().map_err(std::io::Error::other);
        Ok(Box::pin(StreamReader::new(body)))
    }
}

#[async_trait]
impl StreamHandle for HttpStream {
    async fn open(&self) -> Result<ByteStream, PipelineError> {
        Self::fetch(&self.client, &self.url).await
    }

    fn format_hint(&self) -> Option<String> {
        extension_of(&self.url)
    }

    fn describe(&self) -> String {
        format!("http {}", self.url)
    }
}

/// Archivo local.
pub struct FileStream {
    path: PathBuf,
}

impl FileStream {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl StreamHandle for FileStream {
    async fn open(&self) -> Result<ByteStream, PipelineError> {
        let file = tokio::fs::File::open(&self.path).await.map_err(|e| {
            PipelineError::SourceUnavailable(format!("{}: {}", self.path.display(), e))
        })?;
        Ok(Box::pin(file))
    }

    fn format_hint(&self) -> Option<String> {
        self.path
            .extension()
            .and_then(|ext| ext.to_str())
            .map(|ext| ext.to_ascii_lowercase())
    }

    fn describe(&self) -> String {
        format!("file {}", self.path.display())
    }
}

/// Extensión del último segmento de una URL, sin query string.
pub(crate) fn extension_of(url: &str) -> Option<String> {
    let path = url::Url::parse(url)
        .map(|u| u.path().to_string())
        .unwrap_or_else(|_| url.split(['?', '#']).next().unwrap_or(url).to_string());
    let last = path.rsplit('/').next()?;
    let (_, ext) = last.rsplit_once('.')?;
    if ext.is_empty() || ext.len() > 5 {
        return None;
    }
    Some(ext.to_ascii_lowercase())
}
