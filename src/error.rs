use axum::{
    Json,
    http::{HeaderValue, StatusCode, header::RETRY_AFTER},
    response::{IntoResponse, Response},
};
use serde::Serialize;

use crate::{cookies::CookieError, session::SessionNotReady, upstream::UpstreamError};

const COOKIE_HINT: &str = "Export your cookies from a browser where you are signed in to YouTube \
     into cookies.txt, or send them in the cookies parameter, then try again.";

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ErrorBody {
    error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    code: Option<&'static str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    hint: Option<&'static str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    retry_after_seconds: Option<u64>,
}

#[derive(Debug)]
pub struct ApiError {
    pub status: StatusCode,
    pub message: String,
    pub code: Option<&'static str>,
    pub hint: Option<&'static str>,
    pub retry_after_seconds: Option<u64>,
}

impl ApiError {
    fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
            code: None,
            hint: None,
            retry_after_seconds: None,
        }
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, message)
    }

    pub fn missing_url() -> Self {
        Self::bad_request("YouTube URL is required")
    }

    pub fn invalid_url() -> Self {
        Self::bad_request("Invalid YouTube URL")
    }

    fn with_code(mut self, code: &'static str) -> Self {
        self.code = Some(code);
        self
    }

    fn with_hint(mut self, hint: &'static str) -> Self {
        self.hint = Some(hint);
        self
    }

    fn with_retry_after(mut self, seconds: u64) -> Self {
        self.retry_after_seconds = Some(seconds);
        self
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = Json(ErrorBody {
            error: self.message,
            code: self.code,
            hint: self.hint,
            retry_after_seconds: self.retry_after_seconds,
        });

        let mut response = (self.status, body).into_response();
        if let Some(seconds) = self.retry_after_seconds
            && let Ok(value) = HeaderValue::from_str(&seconds.to_string())
        {
            response.headers_mut().insert(RETRY_AFTER, value);
        }

        response
    }
}

impl From<SessionNotReady> for ApiError {
    fn from(error: SessionNotReady) -> Self {
        Self::new(
            StatusCode::SERVICE_UNAVAILABLE,
            "The YouTube session is still starting. Try again in a few seconds.",
        )
        .with_code("SESSION_NOT_READY")
        .with_retry_after(error.retry_after_seconds)
    }
}

impl From<CookieError> for ApiError {
    fn from(error: CookieError) -> Self {
        Self::bad_request(format!("Invalid cookies parameter: {error}"))
    }
}

impl From<UpstreamError> for ApiError {
    fn from(error: UpstreamError) -> Self {
        match error {
            UpstreamError::BotDetected(_) => Self::new(
                StatusCode::TOO_MANY_REQUESTS,
                "YouTube asked to confirm this request is not from a bot.",
            )
            .with_code("BOT_DETECTION")
            .with_hint(COOKIE_HINT),
            UpstreamError::AccessBlocked(_) => Self::new(
                StatusCode::TOO_MANY_REQUESTS,
                "YouTube is blocking requests from this server right now.",
            )
            .with_code("ACCESS_BLOCKED")
            .with_hint(COOKIE_HINT),
            UpstreamError::VideoUnavailable(_) => {
                Self::bad_request("This video is unavailable. It may be private, removed or region locked.")
                    .with_code("VIDEO_UNAVAILABLE")
            }
            UpstreamError::InvalidCookies(message) => {
                Self::bad_request(format!("Invalid cookies parameter: {message}"))
            }
            UpstreamError::Timeout(seconds) => Self::new(
                StatusCode::GATEWAY_TIMEOUT,
                format!("YouTube did not answer within {seconds} seconds."),
            )
            .with_code("UPSTREAM_TIMEOUT"),
            UpstreamError::EngineUnavailable(_) => {
                Self::internal("The video extraction engine is not available on this server.")
                    .with_code("UPSTREAM_ERROR")
            }
            UpstreamError::Unknown(message) => {
                Self::internal(format!("Failed to process the video: {message}"))
                    .with_code("UPSTREAM_ERROR")
            }
        }
    }
}
