use std::{
    cmp::Ordering,
    io::{ErrorKind, Write},
    path::PathBuf,
    process::Stdio,
    sync::Arc,
    time::Duration,
};

use async_trait::async_trait;
use axum::body::Bytes;
use futures::{StreamExt, stream};
use serde::Deserialize;
use tempfile::NamedTempFile;
use tokio::{
    io::AsyncReadExt,
    process::{Child, ChildStdout, Command},
    sync::RwLock,
    task::JoinHandle,
    time::timeout,
};
use tokio_util::io::ReaderStream;
use tracing::{debug, info};

use super::{
    ByteStream, DownloadOptions, StreamKind, Thumbnail, Upstream, UpstreamError, UpstreamSession,
    VideoFormat, VideoInfo,
};
use crate::cookies::{SessionCookie, to_netscape};

const COMBINED_SELECTOR: &str = "best[vcodec!=none][acodec!=none]/best";
const AUDIO_SELECTOR: &str = "bestaudio/best";

#[derive(Debug, Clone)]
pub struct YtDlpConfig {
    pub binary: PathBuf,
    pub user_agent: Option<String>,
    pub command_timeout: Duration,
    pub idle_timeout: Duration,
}

/// Drives the `yt-dlp` executable.
pub struct YtDlp {
    config: YtDlpConfig,
}

impl YtDlp {
    pub fn new(config: YtDlpConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl Upstream for YtDlp {
    async fn create_session(&self) -> Result<Arc<dyn UpstreamSession>, UpstreamError> {
        let output = run_yt_dlp(&self.config, vec!["--version".to_string()]).await?;
        let version = String::from_utf8_lossy(&output.stdout).trim().to_string();
        info!("Using yt-dlp {version} from {:?}", self.config.binary);

        Ok(Arc::new(YtDlpSession {
            config: self.config.clone(),
            cookies: RwLock::new(Arc::new(Vec::new())),
        }))
    }
}

pub struct YtDlpSession {
    config: YtDlpConfig,
    cookies: RwLock<Arc<Vec<SessionCookie>>>,
}

impl YtDlpSession {
    /// Writes the cookies for one call into a private jar file.
    ///
    /// yt-dlp rewrites the jar it is given, so every call gets its own copy.
    async fn cookie_jar(
        &self,
        overrides: Option<&[SessionCookie]>,
    ) -> Result<Option<NamedTempFile>, UpstreamError> {
        let defaults = Arc::clone(&*self.cookies.read().await);
        let cookies = overrides.unwrap_or(defaults.as_slice());
        if cookies.is_empty() {
            return Ok(None);
        }

        let contents = to_netscape(cookies)
            .map_err(|error| UpstreamError::InvalidCookies(error.to_string()))?;
        tokio::task::spawn_blocking(move || write_cookie_jar(&contents))
            .await
            .map_err(|error| UpstreamError::Unknown(format!("cookie jar task failed: {error}")))?
            .map(Some)
            .map_err(|error| UpstreamError::Unknown(format!("could not write cookie jar: {error}")))
    }

    fn base_args(&self, cookie_jar: Option<&NamedTempFile>) -> Vec<String> {
        let mut args = vec!["--no-playlist".to_string(), "--no-warnings".to_string()];
        if let Some(user_agent) = &self.config.user_agent {
            args.push("--user-agent".to_string());
            args.push(user_agent.clone());
        }
        if let Some(jar) = cookie_jar {
            args.push("--cookies".to_string());
            args.push(jar.path().to_string_lossy().into_owned());
        }
        args
    }
}

#[async_trait]
impl UpstreamSession for YtDlpSession {
    async fn set_cookies(&self, cookies: Vec<SessionCookie>) -> Result<(), UpstreamError> {
        to_netscape(&cookies).map_err(|error| UpstreamError::InvalidCookies(error.to_string()))?;
        *self.cookies.write().await = Arc::new(cookies);
        Ok(())
    }

    async fn get_basic_info(
        &self,
        url: &str,
        cookies: Option<&[SessionCookie]>,
    ) -> Result<VideoInfo, UpstreamError> {
        let cookie_jar = self.cookie_jar(cookies).await?;
        let mut args = self.base_args(cookie_jar.as_ref());
        args.push("-J".to_string());
        args.push(url.to_string());

        let output = run_yt_dlp(&self.config, args).await?;
        let info: YtDlpVideoInfo = serde_json::from_slice(&output.stdout).map_err(|error| {
            UpstreamError::Unknown(format!("yt-dlp returned unexpected JSON: {error}"))
        })?;

        Ok(info.into())
    }

    async fn download(
        &self,
        url: &str,
        options: DownloadOptions,
        cookies: Option<&[SessionCookie]>,
    ) -> Result<ByteStream, UpstreamError> {
        let cookie_jar = self.cookie_jar(cookies).await?;
        let mut args = self.base_args(cookie_jar.as_ref());
        args.extend([
            "--no-progress".to_string(),
            "-f".to_string(),
            format_selector(options.kind).to_string(),
            "-o".to_string(),
            "-".to_string(),
            url.to_string(),
        ]);

        let mut child = Command::new(&self.config.binary)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|error| spawn_error(&self.config, error))?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| UpstreamError::Unknown("yt-dlp stdout was not captured".to_string()))?;
        let mut stderr = child
            .stderr
            .take()
            .ok_or_else(|| UpstreamError::Unknown("yt-dlp stderr was not captured".to_string()))?;
        let stderr = tokio::spawn(async move {
            let mut buffer = Vec::new();
            if let Err(error) = stderr.read_to_end(&mut buffer).await {
                debug!("Could not read yt-dlp stderr: {error}");
            }
            buffer
        });

        debug!("yt-dlp stream started for {url}");

        let transfer = Transfer {
            reader: ReaderStream::new(stdout),
            child,
            stderr,
            idle_timeout: self.config.idle_timeout,
            _cookie_jar: cookie_jar,
        };

        Ok(stream::unfold(Some(transfer), |transfer| async move {
            transfer?.next_chunk().await
        })
        .boxed())
    }
}

/// A running `yt-dlp -o -` process. Dropping it kills the process.
struct Transfer {
    reader: ReaderStream<ChildStdout>,
    child: Child,
    stderr: JoinHandle<Vec<u8>>,
    idle_timeout: Duration,
    _cookie_jar: Option<NamedTempFile>,
}

impl Transfer {
    async fn next_chunk(mut self) -> Option<(Result<Bytes, UpstreamError>, Option<Self>)> {
        let next = timeout(self.idle_timeout, self.reader.next()).await;
        match next {
            Ok(Some(Ok(chunk))) => Some((Ok(chunk), Some(self))),
            Ok(Some(Err(error))) => Some((
                Err(UpstreamError::Unknown(format!(
                    "reading yt-dlp output failed: {error}"
                ))),
                None,
            )),
            Ok(None) => self.finish().await.err().map(|error| (Err(error), None)),
            Err(_) => Some((Err(UpstreamError::Timeout(self.idle_timeout.as_secs())), None)),
        }
    }

    async fn finish(mut self) -> Result<(), UpstreamError> {
        let status = self.child.wait().await.map_err(|error| {
            UpstreamError::Unknown(format!("waiting for yt-dlp failed: {error}"))
        })?;
        if status.success() {
            return Ok(());
        }

        let stderr = self.stderr.await.unwrap_or_default();
        Err(classify_failure(&stderr))
    }
}

fn write_cookie_jar(contents: &str) -> std::io::Result<NamedTempFile> {
    let mut file = tempfile::Builder::new()
        .prefix("yt-relay-cookies-")
        .suffix(".txt")
        .tempfile()?;
    file.write_all(contents.as_bytes())?;
    file.flush()?;
    Ok(file)
}

fn format_selector(kind: StreamKind) -> &'static str {
    match kind {
        StreamKind::VideoAndAudio => COMBINED_SELECTOR,
        StreamKind::AudioOnly => AUDIO_SELECTOR,
    }
}

async fn run_yt_dlp(
    config: &YtDlpConfig,
    args: Vec<String>,
) -> Result<std::process::Output, UpstreamError> {
    let command_future = Command::new(&config.binary)
        .args(args)
        .stdin(Stdio::null())
        .kill_on_drop(true)
        .output();
    let output = timeout(config.command_timeout, command_future)
        .await
        .map_err(|_| UpstreamError::Timeout(config.command_timeout.as_secs()))?
        .map_err(|error| spawn_error(config, error))?;

    if !output.status.success() {
        return Err(classify_failure(&output.stderr));
    }

    Ok(output)
}

fn spawn_error(config: &YtDlpConfig, error: std::io::Error) -> UpstreamError {
    if error.kind() == ErrorKind::NotFound {
        UpstreamError::EngineUnavailable(format!(
            "{:?} is not installed. Install yt-dlp and restart the server.",
            config.binary
        ))
    } else {
        UpstreamError::EngineUnavailable(format!("could not run {:?}: {error}", config.binary))
    }
}

/// Maps yt-dlp's stderr onto the upstream error kinds.
fn classify_failure(stderr: &[u8]) -> UpstreamError {
    let text = String::from_utf8_lossy(stderr);
    let lines = || text.lines().map(str::trim).filter(|line| !line.is_empty());
    let message = lines()
        .filter(|line| line.starts_with("ERROR"))
        .next_back()
        .or_else(|| lines().next_back())
        .unwrap_or("yt-dlp could not complete the request")
        .to_string();
    let lower = text.to_lowercase();

    if lower.contains("sign in to confirm") || lower.contains("not a bot") {
        UpstreamError::BotDetected(message)
    } else if lower.contains("http error 429")
        || lower.contains("too many requests")
        || lower.contains("http error 403")
        || lower.contains("try again later")
    {
        UpstreamError::AccessBlocked(message)
    } else if lower.contains("video unavailable")
        || lower.contains("private video")
        || lower.contains("has been removed")
        || lower.contains("is not available")
        || lower.contains("members-only")
    {
        UpstreamError::VideoUnavailable(message)
    } else {
        UpstreamError::Unknown(message)
    }
}

#[derive(Debug, Deserialize)]
struct YtDlpVideoInfo {
    title: Option<String>,
    thumbnail: Option<String>,
    #[serde(default)]
    thumbnails: Vec<YtDlpThumbnail>,
    duration: Option<f64>,
    uploader: Option<String>,
    channel: Option<String>,
    #[serde(default)]
    formats: Vec<YtDlpFormat>,
}

#[derive(Debug, Deserialize)]
struct YtDlpThumbnail {
    url: String,
}

#[derive(Debug, Deserialize)]
struct YtDlpFormat {
    format_id: String,
    ext: Option<String>,
    vcodec: Option<String>,
    acodec: Option<String>,
    height: Option<u32>,
    fps: Option<f32>,
    format_note: Option<String>,
    tbr: Option<f64>,
    filesize: Option<f64>,
    filesize_approx: Option<f64>,
}

impl YtDlpFormat {
    fn has_video(&self) -> bool {
        matches!(self.vcodec.as_deref(), Some(value) if value != "none")
    }

    fn has_audio(&self) -> bool {
        matches!(self.acodec.as_deref(), Some(value) if value != "none")
    }

    fn quality_label(&self) -> Option<String> {
        match (self.height, self.fps) {
            (Some(height), Some(fps)) if self.has_video() && fps > 30.0 => {
                Some(format!("{height}p{}", fps.round() as u32))
            }
            (Some(height), _) if self.has_video() => Some(format!("{height}p")),
            _ => self.format_note.clone(),
        }
    }
}

impl From<&YtDlpFormat> for VideoFormat {
    fn from(format: &YtDlpFormat) -> Self {
        Self {
            itag: format.format_id.clone(),
            quality_label: format.quality_label(),
            container: format.ext.clone(),
            has_video: format.has_video(),
            has_audio: format.has_audio(),
            bitrate: format.tbr,
            content_length: format
                .filesize
                .or(format.filesize_approx)
                .map(|bytes| bytes as u64),
        }
    }
}

impl From<YtDlpVideoInfo> for VideoInfo {
    fn from(info: YtDlpVideoInfo) -> Self {
        // yt-dlp lists thumbnails worst first; the preferred one comes first here.
        let mut thumbnails: Vec<Thumbnail> = Vec::new();
        if let Some(url) = info.thumbnail {
            thumbnails.push(Thumbnail { url });
        }
        for thumbnail in info.thumbnails.into_iter().rev() {
            if thumbnails.iter().all(|known| known.url != thumbnail.url) {
                thumbnails.push(Thumbnail { url: thumbnail.url });
            }
        }

        let mut formats: Vec<&YtDlpFormat> = info
            .formats
            .iter()
            .filter(|format| format.has_video() || format.has_audio())
            .collect();
        formats.sort_by(|a, b| {
            b.height
                .unwrap_or_default()
                .cmp(&a.height.unwrap_or_default())
                .then_with(|| {
                    b.tbr
                        .unwrap_or_default()
                        .partial_cmp(&a.tbr.unwrap_or_default())
                        .unwrap_or(Ordering::Equal)
                })
        });

        Self {
            title: info
                .title
                .filter(|value| !value.trim().is_empty())
                .unwrap_or_else(|| "Untitled".to_string()),
            thumbnails,
            duration_seconds: info
                .duration
                .filter(|seconds| *seconds > 0.0)
                .map(|seconds| seconds.round() as u64)
                .unwrap_or_default(),
            author: info
                .uploader
                .or(info.channel)
                .unwrap_or_else(|| "Unknown".to_string()),
            formats: formats.into_iter().map(VideoFormat::from).collect(),
        }
    }
}
