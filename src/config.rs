use std::{path::PathBuf, time::Duration};

use crate::{session::RetryPolicy, upstream::ytdlp::YtDlpConfig};

const DEFAULT_BIND_ADDR: &str = "127.0.0.1:5000";
const DEFAULT_COOKIES_PATH: &str = "cookies.txt";
const DEFAULT_CLIENT_BUILD_DIR: &str = "client/build";
const DEFAULT_YT_DLP_PATH: &str = "yt-dlp";
const DEFAULT_SESSION_RETRY_SECONDS: u64 = 5;
const DEFAULT_YT_DLP_TIMEOUT_SECONDS: u64 = 180;
const DEFAULT_STREAM_IDLE_TIMEOUT_SECONDS: u64 = 60;

#[derive(Debug, Clone)]
pub struct Config {
    pub bind_addr: String,
    pub allowed_origins: Vec<String>,
    pub cookies_path: PathBuf,
    pub client_build_dir: PathBuf,
    pub yt_dlp_path: PathBuf,
    pub user_agent: Option<String>,
    pub session_retry: Duration,
    pub session_max_attempts: Option<u32>,
    pub command_timeout: Duration,
    pub stream_idle_timeout: Duration,
}

impl Config {
    pub fn from_env() -> Self {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let text = |name: &str| {
            lookup(name).and_then(|value| non_empty(&value).map(ToString::to_string))
        };
        let seconds = |name: &str, default: u64| {
            text(name)
                .and_then(|value| value.parse::<u64>().ok())
                .unwrap_or(default)
        };

        Self {
            bind_addr: resolve_bind_addr(text("APP_ADDR"), text("PORT")),
            allowed_origins: text("ALLOWED_ORIGINS")
                .map(|value| {
                    value
                        .split(',')
                        .map(str::trim)
                        .filter(|origin| !origin.is_empty())
                        .map(ToString::to_string)
                        .collect()
                })
                .unwrap_or_default(),
            cookies_path: text("COOKIES_PATH")
                .unwrap_or_else(|| DEFAULT_COOKIES_PATH.to_string())
                .into(),
            client_build_dir: text("CLIENT_BUILD_DIR")
                .unwrap_or_else(|| DEFAULT_CLIENT_BUILD_DIR.to_string())
                .into(),
            yt_dlp_path: text("YT_DLP_PATH")
                .unwrap_or_else(|| DEFAULT_YT_DLP_PATH.to_string())
                .into(),
            user_agent: text("USER_AGENT"),
            session_retry: Duration::from_secs(
                text("SESSION_RETRY_SECONDS")
                    .and_then(|value| value.parse::<u64>().ok())
                    .filter(|value| *value > 0)
                    .unwrap_or(DEFAULT_SESSION_RETRY_SECONDS),
            ),
            session_max_attempts: text("SESSION_MAX_ATTEMPTS")
                .and_then(|value| value.parse::<u32>().ok())
                .filter(|value| *value > 0),
            command_timeout: Duration::from_secs(seconds(
                "YT_DLP_TIMEOUT_SECONDS",
                DEFAULT_YT_DLP_TIMEOUT_SECONDS,
            )),
            stream_idle_timeout: Duration::from_secs(seconds(
                "STREAM_IDLE_TIMEOUT_SECONDS",
                DEFAULT_STREAM_IDLE_TIMEOUT_SECONDS,
            )),
        }
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            delay: self.session_retry,
            max_attempts: self.session_max_attempts,
        }
    }

    pub fn yt_dlp(&self) -> YtDlpConfig {
        YtDlpConfig {
            binary: self.yt_dlp_path.clone(),
            user_agent: self.user_agent.clone(),
            command_timeout: self.command_timeout,
            idle_timeout: self.stream_idle_timeout,
        }
    }
}

fn resolve_bind_addr(configured: Option<String>, port: Option<String>) -> String {
    if let Some(configured) = configured {
        return configured;
    }

    if let Some(port) = port.and_then(|value| value.parse::<u16>().ok()) {
        return format!("0.0.0.0:{port}");
    }

    DEFAULT_BIND_ADDR.to_string()
}

fn non_empty(value: &str) -> Option<&str> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed)
    }
}
