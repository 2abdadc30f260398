use std::sync::Arc;

use async_trait::async_trait;
use axum::body::Bytes;
use futures::stream::BoxStream;
use serde::Serialize;
use thiserror::Error;

use crate::cookies::SessionCookie;

pub mod ytdlp;

pub type ByteStream = BoxStream<'static, Result<Bytes, UpstreamError>>;

#[derive(Debug, Error)]
pub enum UpstreamError {
    #[error("bot detection triggered: {0}")]
    BotDetected(String),
    #[error("access blocked: {0}")]
    AccessBlocked(String),
    #[error("video unavailable: {0}")]
    VideoUnavailable(String),
    #[error("cookies rejected: {0}")]
    InvalidCookies(String),
    #[error("no answer after {0} seconds")]
    Timeout(u64),
    #[error("extraction engine unavailable: {0}")]
    EngineUnavailable(String),
    #[error("{0}")]
    Unknown(String),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Thumbnail {
    pub url: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VideoFormat {
    pub itag: String,
    pub quality_label: Option<String>,
    pub container: Option<String>,
    pub has_video: bool,
    pub has_audio: bool,
    pub bitrate: Option<f64>,
    pub content_length: Option<u64>,
}

impl VideoFormat {
    pub fn is_combined(&self) -> bool {
        self.has_video && self.has_audio
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct VideoInfo {
    pub title: String,
    pub thumbnails: Vec<Thumbnail>,
    pub duration_seconds: u64,
    pub author: String,
    pub formats: Vec<VideoFormat>,
}

impl VideoInfo {
    /// Formats that carry both a video and an audio track.
    pub fn combined_formats(&self) -> impl Iterator<Item = &VideoFormat> {
        self.formats.iter().filter(|format| format.is_combined())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamKind {
    VideoAndAudio,
    AudioOnly,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DownloadOptions {
    pub kind: StreamKind,
}

#[async_trait]
pub trait Upstream: Send + Sync {
    async fn create_session(&self) -> Result<Arc<dyn UpstreamSession>, UpstreamError>;
}

#[async_trait]
pub trait UpstreamSession: Send + Sync {
    /// Sets the cookies used when a call brings none of its own.
    async fn set_cookies(&self, cookies: Vec<SessionCookie>) -> Result<(), UpstreamError>;

    async fn get_basic_info(
        &self,
        url: &str,
        cookies: Option<&[SessionCookie]>,
    ) -> Result<VideoInfo, UpstreamError>;

    /// Starts streaming the highest quality rendition of `options.kind`.
    ///
    /// The returned stream may end with an error item.
    async fn download(
        &self,
        url: &str,
        options: DownloadOptions,
        cookies: Option<&[SessionCookie]>,
    ) -> Result<ByteStream, UpstreamError>;
}
