use std::{
    io,
    path::{Path, PathBuf},
    sync::Arc,
};

use axum::{
    Json, Router,
    body::{Body, Bytes},
    extract::{Query, State},
    handler::HandlerWithoutStateExt,
    http::{
        HeaderMap, HeaderValue, StatusCode, Uri,
        header::{CONTENT_DISPOSITION, CONTENT_TYPE},
    },
    response::{Html, IntoResponse, Response},
    routing::get,
};
use chrono::{DateTime, Utc};
use futures::{StreamExt, stream};
use serde::{Deserialize, Serialize};
use tower_http::services::ServeDir;
use tracing::{info, warn};
use url::Url;
use uuid::Uuid;

use crate::{
    cookies::{SessionCookie, parse_cookie_override},
    error::ApiError,
    filename::download_filename,
    session::{SessionManager, SessionPhase},
    upstream::{DownloadOptions, StreamKind, UpstreamError, VideoFormat},
};

const YOUTUBE_HOSTS: [&str; 8] = [
    "youtube.com",
    "www.youtube.com",
    "m.youtube.com",
    "music.youtube.com",
    "gaming.youtube.com",
    "youtube-nocookie.com",
    "www.youtube-nocookie.com",
    "youtu.be",
];

const PATH_ID_PREFIXES: [&str; 4] = ["shorts", "embed", "v", "live"];

#[derive(Clone)]
pub struct AppState {
    pub session: Arc<SessionManager>,
    pub client_build_dir: PathBuf,
}

#[derive(Debug, Default, Deserialize)]
pub struct VideoQuery {
    url: Option<String>,
    cookies: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct DownloadQuery {
    url: Option<String>,
    format: Option<String>,
    cookies: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum OutputFormat {
    Mp4,
    Mp3,
}

impl OutputFormat {
    fn parse(value: Option<&str>) -> Result<Self, ApiError> {
        match value.map(str::trim).filter(|value| !value.is_empty()) {
            None => Ok(Self::Mp4),
            Some(value) if value.eq_ignore_ascii_case("mp4") => Ok(Self::Mp4),
            Some(value) if value.eq_ignore_ascii_case("mp3") => Ok(Self::Mp3),
            Some(value) => Err(ApiError::bad_request(format!(
                "Unsupported format '{value}'. Use mp4 or mp3."
            ))),
        }
    }

    fn extension(self) -> &'static str {
        match self {
            Self::Mp4 => "mp4",
            Self::Mp3 => "mp3",
        }
    }

    fn stream_kind(self) -> StreamKind {
        match self {
            Self::Mp4 => StreamKind::VideoAndAudio,
            Self::Mp3 => StreamKind::AudioOnly,
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct HealthResponse {
    status: &'static str,
    message: &'static str,
    session_ready: bool,
    session_state: SessionPhase,
    #[serde(skip_serializing_if = "Option::is_none")]
    session_attempts: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    last_error: Option<String>,
    timestamp: DateTime<Utc>,
}

#[derive(Debug, Serialize)]
struct VideoInfoResponse {
    title: String,
    thumbnail: Option<String>,
    duration: u64,
    author: String,
    formats: Vec<VideoFormat>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct FormatSummary {
    itag: String,
    quality: Option<String>,
    container: Option<String>,
    has_video: bool,
    has_audio: bool,
}

impl From<&VideoFormat> for FormatSummary {
    fn from(format: &VideoFormat) -> Self {
        Self {
            itag: format.itag.clone(),
            quality: format.quality_label.clone(),
            container: format.container.clone(),
            has_video: format.has_video,
            has_audio: format.has_audio,
        }
    }
}

/// A validated video request: the URL to hand upstream and the cookie
/// override, if the caller sent one.
struct VideoRequest {
    url: Url,
    cookies: Option<Vec<SessionCookie>>,
}

impl VideoRequest {
    fn cookies(&self) -> Option<&[SessionCookie]> {
        self.cookies.as_deref()
    }
}

pub fn router(state: AppState) -> Router {
    let index = state.client_build_dir.join("index.html");
    let frontend = ServeDir::new(&state.client_build_dir).fallback(
        (move |uri: Uri| {
            let index = index.clone();
            async move { frontend_entry(&index, uri).await }
        })
        .into_service(),
    );

    Router::new()
        .route("/api/health", get(health))
        .route("/api/video-info", get(video_info))
        .route("/api/formats", get(list_formats))
        .route("/api/download", get(download))
        .fallback_service(frontend)
        .with_state(state)
}

async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    let phase = state.session.phase().await;
    let failure = state.session.last_failure().await;

    Json(HealthResponse {
        status: "OK",
        message: "Server is running",
        session_ready: phase == SessionPhase::Ready,
        session_state: phase,
        session_attempts: failure.as_ref().map(|(attempts, _)| *attempts),
        last_error: failure.map(|(_, message)| message),
        timestamp: Utc::now(),
    })
}

async fn video_info(
    State(state): State<AppState>,
    Query(query): Query<VideoQuery>,
) -> Result<Json<VideoInfoResponse>, ApiError> {
    let request = validate_request(query.url.as_deref(), query.cookies.as_deref())?;
    let session = state.session.ready_session().await?;

    let info = session
        .get_basic_info(request.url.as_str(), request.cookies())
        .await
        .inspect_err(|error| warn!("Video info lookup failed for {}: {error}", request.url))?;

    Ok(Json(VideoInfoResponse {
        thumbnail: info.thumbnails.first().map(|thumbnail| thumbnail.url.clone()),
        formats: info.combined_formats().cloned().collect(),
        title: info.title,
        duration: info.duration_seconds,
        author: info.author,
    }))
}

async fn list_formats(
    State(state): State<AppState>,
    Query(query): Query<VideoQuery>,
) -> Result<Json<Vec<FormatSummary>>, ApiError> {
    let request = validate_request(query.url.as_deref(), query.cookies.as_deref())?;
    let session = state.session.ready_session().await?;

    let info = session
        .get_basic_info(request.url.as_str(), request.cookies())
        .await
        .inspect_err(|error| warn!("Format lookup failed for {}: {error}", request.url))?;

    Ok(Json(info.combined_formats().map(FormatSummary::from).collect()))
}

async fn download(
    State(state): State<AppState>,
    Query(query): Query<DownloadQuery>,
) -> Result<Response, ApiError> {
    let request = validate_request(query.url.as_deref(), query.cookies.as_deref())?;
    let format = OutputFormat::parse(query.format.as_deref())?;
    let session = state.session.ready_session().await?;

    let info = session
        .get_basic_info(request.url.as_str(), request.cookies())
        .await
        .inspect_err(|error| warn!("Download lookup failed for {}: {error}", request.url))?;
    let filename = download_filename(&info.title, format.extension());

    let mut upstream = session
        .download(
            request.url.as_str(),
            DownloadOptions {
                kind: format.stream_kind(),
            },
            request.cookies(),
        )
        .await?;

    // Nothing is committed until the first chunk arrives, so an early
    // upstream refusal still becomes a JSON error.
    let first = match upstream.next().await {
        Some(Ok(chunk)) => Some(chunk),
        Some(Err(error)) => {
            warn!("Download of {} failed before streaming: {error}", request.url);
            return Err(error.into());
        }
        None => None,
    };

    let download_id = Uuid::new_v4();
    info!("Streaming {filename} for {} (download {download_id})", request.url);

    let body = stream::iter(first.map(Ok::<Bytes, UpstreamError>))
        .chain(upstream)
        .map(move |item| {
            item.map_err(|error| {
                warn!("Download {download_id} aborted after headers were sent: {error}");
                io::Error::other(error)
            })
        });

    let mut headers = HeaderMap::new();
    headers.insert(
        CONTENT_TYPE,
        HeaderValue::from_static("application/octet-stream"),
    );
    headers.insert(
        CONTENT_DISPOSITION,
        HeaderValue::from_str(&format!("attachment; filename=\"{filename}\""))
            .map_err(|_| ApiError::internal("Could not build the download header."))?,
    );

    Ok((headers, Body::from_stream(body)).into_response())
}

async fn frontend_entry(index: &Path, uri: Uri) -> Response {
    if !uri.path().starts_with("/api/")
        && let Ok(html) = tokio::fs::read_to_string(index).await
    {
        return Html(html).into_response();
    }

    (
        StatusCode::NOT_FOUND,
        Json(serde_json::json!({
            "error": "Not Found",
            "message": "The requested resource does not exist",
            "path": uri.path(),
        })),
    )
        .into_response()
}

fn validate_request(url: Option<&str>, cookies: Option<&str>) -> Result<VideoRequest, ApiError> {
    let raw = url
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .ok_or_else(ApiError::missing_url)?;
    let url = validate_video_url(raw).ok_or_else(ApiError::invalid_url)?;

    let cookies = match cookies.map(str::trim).filter(|value| !value.is_empty()) {
        Some(raw) => parse_cookie_override(raw)?,
        None => None,
    };

    Ok(VideoRequest { url, cookies })
}

/// Accepts watch, short, embed and live links on YouTube hosts as well as
/// `youtu.be` links.
fn validate_video_url(input: &str) -> Option<Url> {
    let parsed = Url::parse(input).ok()?;
    if !matches!(parsed.scheme(), "http" | "https") {
        return None;
    }

    let host = parsed.host_str()?.to_ascii_lowercase();
    if !YOUTUBE_HOSTS.contains(&host.as_str()) {
        return None;
    }

    let mut segments = parsed
        .path_segments()
        .map(|segments| segments.filter(|segment| !segment.is_empty()).collect::<Vec<_>>())
        .unwrap_or_default()
        .into_iter();

    let id = if host == "youtu.be" {
        segments.next().map(ToString::to_string)
    } else if let Some((_, id)) = parsed.query_pairs().find(|(key, _)| key == "v") {
        Some(id.into_owned())
    } else {
        match (segments.next(), segments.next()) {
            (Some(prefix), Some(id)) if PATH_ID_PREFIXES.contains(&prefix) => Some(id.to_string()),
            _ => None,
        }
    }?;

    is_video_id(&id).then_some(parsed)
}

fn is_video_id(value: &str) -> bool {
    !value.is_empty()
        && value
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use axum::body::to_bytes;
    use serde_json::Value;
    use tokio::sync::Notify;

    use super::*;
    use crate::session::tests::{FakeUpstream, quick_retry, wait_for_phase};

    const WATCH_URL: &str = "https://www.youtube.com/watch?v=abc";

    fn bot() -> UpstreamError {
        UpstreamError::BotDetected("Sign in to confirm you're not a bot".into())
    }

    fn reset() -> UpstreamError {
        UpstreamError::Unknown("connection reset".into())
    }

    async fn ready_state(upstream: FakeUpstream) -> (AppState, Arc<FakeUpstream>) {
        let upstream = upstream.into_arc();
        let session = SessionManager::start(upstream.clone(), Vec::new(), quick_retry());
        wait_for_phase(&session, SessionPhase::Ready).await;
        let state = AppState {
            session,
            client_build_dir: PathBuf::from("missing-client-build"),
        };
        (state, upstream)
    }

    fn info_query(url: &str) -> Query<VideoQuery> {
        Query(VideoQuery {
            url: Some(url.to_string()),
            cookies: None,
        })
    }

    fn download_query(url: &str, format: Option<&str>) -> Query<DownloadQuery> {
        Query(DownloadQuery {
            url: Some(url.to_string()),
            format: format.map(ToString::to_string),
            cookies: None,
        })
    }

    async fn body_bytes(response: Response) -> Bytes {
        to_bytes(response.into_body(), usize::MAX).await.unwrap()
    }

    #[test]
    fn accepts_youtube_video_urls() {
        for url in [
            WATCH_URL,
            "https://youtube.com/watch?v=dQw4w9WgXcQ&t=42",
            "http://m.youtube.com/watch?feature=share&v=dQw4w9WgXcQ",
            "https://music.youtube.com/watch?v=dQw4w9WgXcQ",
            "https://youtu.be/dQw4w9WgXcQ?si=xyz",
            "https://www.youtube.com/shorts/a1B2c3D4e5_",
            "https://www.youtube-nocookie.com/embed/dQw4w9WgXcQ",
            "https://www.youtube.com/live/dQw4w9WgXcQ",
        ] {
            assert!(validate_video_url(url).is_some(), "{url}");
        }
    }

    #[test]
    fn rejects_other_urls() {
        for url in [
            "not a url",
            "ftp://www.youtube.com/watch?v=abc",
            "https://vimeo.com/watch?v=abc",
            "https://www.youtube.com.evil.test/watch?v=abc",
            "https://www.youtube.com/watch",
            "https://www.youtube.com/watch?v=",
            "https://www.youtube.com/watch?v=abc%20def",
            "https://www.youtube.com/@channel",
            "https://youtu.be/",
        ] {
            assert!(validate_video_url(url).is_none(), "{url}");
        }
    }

    #[test]
    fn output_format_defaults_to_mp4() {
        assert_eq!(OutputFormat::parse(None).unwrap(), OutputFormat::Mp4);
        assert_eq!(OutputFormat::parse(Some(" ")).unwrap(), OutputFormat::Mp4);
        assert_eq!(OutputFormat::parse(Some("MP3")).unwrap(), OutputFormat::Mp3);
        assert_eq!(
            OutputFormat::parse(Some("flac")).unwrap_err().status,
            StatusCode::BAD_REQUEST
        );
    }

    #[tokio::test]
    async fn missing_url_is_rejected() {
        let (state, _) = ready_state(FakeUpstream::default()).await;

        let error = video_info(State(state.clone()), Query(VideoQuery::default()))
            .await
            .err()
            .unwrap();
        assert_eq!(error.status, StatusCode::BAD_REQUEST);
        assert!(error.message.contains("required"));

        let error = list_formats(State(state.clone()), Query(VideoQuery::default()))
            .await
            .err()
            .unwrap();
        assert_eq!(error.status, StatusCode::BAD_REQUEST);
        assert!(error.message.contains("required"));

        let error = download(State(state), download_query("   ", None))
            .await
            .err()
            .unwrap();
        assert!(error.message.contains("required"));
    }

    #[tokio::test]
    async fn invalid_url_and_cookies_are_rejected() {
        let (state, upstream) = ready_state(FakeUpstream::default()).await;

        let error = list_formats(State(state.clone()), info_query("https://example.com/v"))
            .await
            .err()
            .unwrap();
        assert_eq!(error.status, StatusCode::BAD_REQUEST);
        assert_eq!(error.message, "Invalid YouTube URL");

        let query = Query(VideoQuery {
            url: Some(WATCH_URL.to_string()),
            cookies: Some("{not json".to_string()),
        });
        let error = video_info(State(state), query).await.err().unwrap();
        assert_eq!(error.status, StatusCode::BAD_REQUEST);
        assert!(error.message.starts_with("Invalid cookies parameter"));
        assert!(upstream.session.seen_cookies.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn unavailable_until_session_is_ready() {
        let gate = Arc::new(Notify::new());
        let upstream = FakeUpstream {
            gate: Some(Arc::clone(&gate)),
            ..Default::default()
        }
        .into_arc();
        let session = SessionManager::start(upstream, Vec::new(), quick_retry());
        let state = AppState {
            session: Arc::clone(&session),
            client_build_dir: PathBuf::from("missing-client-build"),
        };

        let error = video_info(State(state.clone()), info_query(WATCH_URL))
            .await
            .err()
            .unwrap();
        assert_eq!(error.status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(error.code, Some("SESSION_NOT_READY"));

        gate.notify_one();
        wait_for_phase(&session, SessionPhase::Ready).await;
        let Json(info) = video_info(State(state), info_query(WATCH_URL)).await.unwrap();
        assert_eq!(info.title, "Weird!! Title??");
    }

    #[tokio::test]
    async fn video_info_is_stable_across_calls() {
        let (state, _) = ready_state(FakeUpstream::default()).await;

        let first = video_info(State(state.clone()), info_query(WATCH_URL))
            .await
            .unwrap()
            .into_response();
        let second = video_info(State(state), info_query(WATCH_URL))
            .await
            .unwrap()
            .into_response();

        let first = body_bytes(first).await;
        assert_eq!(first, body_bytes(second).await);

        let parsed: Value = serde_json::from_slice(&first).unwrap();
        assert_eq!(parsed["duration"], 212);
        assert_eq!(parsed["thumbnail"], "https://i.ytimg.com/vi/abc/hqdefault.jpg");
        let formats = parsed["formats"].as_array().unwrap();
        assert_eq!(formats.len(), 1);
        assert_eq!(formats[0]["itag"], "18");
        assert_eq!(formats[0]["qualityLabel"], "360p");
    }

    #[tokio::test]
    async fn formats_lists_combined_streams() {
        let (state, _) = ready_state(FakeUpstream::default()).await;

        let response = list_formats(State(state), info_query(WATCH_URL))
            .await
            .unwrap()
            .into_response();
        let parsed: Value = serde_json::from_slice(&body_bytes(response).await).unwrap();
        assert_eq!(
            parsed,
            serde_json::json!([{
                "itag": "18",
                "quality": "360p",
                "container": "mp4",
                "hasVideo": true,
                "hasAudio": true,
            }])
        );
    }

    #[tokio::test]
    async fn upstream_info_errors_are_mapped() {
        let (state, _) = ready_state(FakeUpstream {
            info_error: Some(bot as fn() -> UpstreamError),
            ..Default::default()
        })
        .await;

        let error = video_info(State(state), info_query(WATCH_URL))
            .await
            .err()
            .unwrap();
        assert_eq!(error.status, StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(error.code, Some("BOT_DETECTION"));
        assert!(error.hint.is_some());
    }

    #[tokio::test]
    async fn download_streams_with_attachment_headers() {
        let (state, _) = ready_state(FakeUpstream {
            chunks: vec![Ok(&b"abc"[..]), Ok(&b"def"[..])],
            ..Default::default()
        })
        .await;

        let response = download(State(state), download_query(WATCH_URL, None))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers().get(CONTENT_DISPOSITION).unwrap(),
            "attachment; filename=\"Weird_Title.mp4\""
        );
        assert_eq!(
            response.headers().get(CONTENT_TYPE).unwrap(),
            "application/octet-stream"
        );
        assert_eq!(body_bytes(response).await, Bytes::from_static(b"abcdef"));
    }

    #[tokio::test]
    async fn audio_download_uses_mp3_name() {
        let (state, _) = ready_state(FakeUpstream {
            chunks: vec![Ok(&b"id3"[..])],
            ..Default::default()
        })
        .await;

        let response = download(State(state), download_query(WATCH_URL, Some("mp3")))
            .await
            .unwrap();
        assert_eq!(
            response.headers().get(CONTENT_DISPOSITION).unwrap(),
            "attachment; filename=\"Weird_Title.mp3\""
        );
    }

    #[tokio::test]
    async fn bot_detection_before_first_byte_is_json_error() {
        let (state, _) = ready_state(FakeUpstream {
            chunks: vec![Err(bot as fn() -> UpstreamError), Ok(&b"never"[..])],
            ..Default::default()
        })
        .await;

        let error = download(State(state), download_query(WATCH_URL, None))
            .await
            .err()
            .unwrap();
        let response = error.into_response();
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        let parsed: Value = serde_json::from_slice(&body_bytes(response).await).unwrap();
        assert_eq!(parsed["code"], "BOT_DETECTION");
    }

    #[tokio::test]
    async fn failure_after_headers_aborts_body() {
        let (state, _) = ready_state(FakeUpstream {
            chunks: vec![Ok(&b"partial"[..]), Err(reset as fn() -> UpstreamError)],
            ..Default::default()
        })
        .await;

        let response = download(State(state), download_query(WATCH_URL, None))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert!(to_bytes(response.into_body(), usize::MAX).await.is_err());
    }

    #[tokio::test]
    async fn cookie_override_is_scoped_to_the_request() {
        let (state, upstream) = ready_state(FakeUpstream::default()).await;

        let query = Query(VideoQuery {
            url: Some(WATCH_URL.to_string()),
            cookies: Some(r#"[{"name":"SID","value":"override"}]"#.to_string()),
        });
        video_info(State(state.clone()), query).await.unwrap();
        video_info(State(state), info_query(WATCH_URL)).await.unwrap();

        let seen = upstream.session.seen_cookies.lock().unwrap().clone();
        assert_eq!(seen.len(), 2);
        let scoped = seen[0].as_ref().unwrap();
        assert_eq!(scoped[0].name, "SID");
        assert_eq!(scoped[0].value, "override");
        assert_eq!(scoped[0].domain, ".youtube.com");
        assert!(seen[1].is_none());
        assert!(upstream.session.default_cookies.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn health_reports_session_state() {
        let (state, _) = ready_state(FakeUpstream::default()).await;

        let response = health(State(state)).await.into_response();
        let parsed: Value = serde_json::from_slice(&body_bytes(response).await).unwrap();
        assert_eq!(parsed["status"], "OK");
        assert_eq!(parsed["sessionReady"], true);
        assert_eq!(parsed["sessionState"], "ready");
        assert!(parsed.get("lastError").is_none());
        assert!(
            DateTime::parse_from_rfc3339(parsed["timestamp"].as_str().unwrap()).is_ok()
        );
    }

    #[tokio::test]
    async fn health_reports_failures() {
        let upstream = FakeUpstream {
            failures_before_ready: 100,
            ..Default::default()
        }
        .into_arc();
        let retry = crate::session::RetryPolicy {
            delay: Duration::from_secs(60),
            max_attempts: None,
        };
        let session = SessionManager::start(upstream, Vec::new(), retry);
        wait_for_phase(&session, SessionPhase::Failed).await;
        let state = AppState {
            session,
            client_build_dir: PathBuf::from("missing-client-build"),
        };

        let response = health(State(state)).await.into_response();
        let parsed: Value = serde_json::from_slice(&body_bytes(response).await).unwrap();
        assert_eq!(parsed["status"], "OK");
        assert_eq!(parsed["sessionReady"], false);
        assert_eq!(parsed["sessionState"], "failed");
        assert_eq!(parsed["sessionAttempts"], 1);
    }

    #[tokio::test]
    async fn frontend_serves_index_or_json_404() {
        let build = tempfile::tempdir().unwrap();
        let index = build.path().join("index.html");

        let response = frontend_entry(&index, Uri::from_static("/some/page")).await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        let parsed: Value = serde_json::from_slice(&body_bytes(response).await).unwrap();
        assert_eq!(parsed["path"], "/some/page");

        tokio::fs::write(&index, "<html>app</html>").await.unwrap();
        let response = frontend_entry(&index, Uri::from_static("/some/page")).await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_bytes(response).await, Bytes::from_static(b"<html>app</html>"));

        let response = frontend_entry(&index, Uri::from_static("/api/nope")).await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }
}
