mod config;
mod cookies;
mod error;
mod filename;
mod routes;
mod session;
mod upstream;

use std::{collections::HashSet, sync::Arc};

use axum::http::{HeaderValue, Method, header::CONTENT_DISPOSITION};
use tokio::net::TcpListener;
use tower_http::{
    cors::{AllowOrigin, Any, CorsLayer},
    trace::TraceLayer,
};
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;
use url::Url;

use crate::{
    config::Config,
    error::ApiError,
    routes::AppState,
    session::SessionManager,
    upstream::{Upstream, ytdlp::YtDlp},
};

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("yt_relay=info,tower_http=info")),
        )
        .init();

    if let Err(error) = run(Config::from_env()).await {
        eprintln!("Server error: {}", error.message);
        std::process::exit(1);
    }
}

async fn run(config: Config) -> Result<(), ApiError> {
    let cookies = cookies::load_cookies(&config.cookies_path).await;
    let upstream: Arc<dyn Upstream> = Arc::new(YtDlp::new(config.yt_dlp()));
    let session = SessionManager::start(upstream, cookies, config.retry_policy());

    if !config.client_build_dir.join("index.html").is_file() {
        warn!(
            "No client build at {}. Only the API will be served.",
            config.client_build_dir.display()
        );
    }

    let cors = build_cors_layer(&config.allowed_origins)?;
    let app = routes::router(AppState {
        session,
        client_build_dir: config.client_build_dir.clone(),
    })
    .layer(TraceLayer::new_for_http())
    .layer(cors);

    let addr = &config.bind_addr;
    let listener = TcpListener::bind(addr)
        .await
        .map_err(|error| ApiError::internal(format!("Could not bind {addr}: {error}")))?;

    info!("Server running on http://{addr}");

    axum::serve(listener, app)
        .await
        .map_err(|error| ApiError::internal(format!("HTTP server error: {error}")))
}

/// Any origin when none are configured, otherwise an exact allow-list.
fn build_cors_layer(configured: &[String]) -> Result<CorsLayer, ApiError> {
    let layer = CorsLayer::new()
        .allow_methods([Method::GET])
        .allow_headers(Any)
        .expose_headers([CONTENT_DISPOSITION]);

    if configured.is_empty() {
        info!("ALLOWED_ORIGINS is not set. Accepting requests from any origin.");
        return Ok(layer.allow_origin(Any));
    }

    let normalized_origins = configured
        .iter()
        .map(|origin| {
            normalize_origin(origin).ok_or_else(|| {
                ApiError::internal(format!(
                    "Invalid origin in ALLOWED_ORIGINS: {origin}. Use values like https://example.com"
                ))
            })
        })
        .collect::<Result<HashSet<_>, _>>()?;
    let allowed_origins = Arc::new(normalized_origins);
    info!(
        "CORS allow-list loaded with {} origin(s): {:?}",
        allowed_origins.len(),
        allowed_origins
    );

    let allow_origin = AllowOrigin::predicate(move |origin: &HeaderValue, _| {
        let normalized = origin.to_str().ok().and_then(normalize_origin);
        let allowed = normalized
            .as_ref()
            .is_some_and(|value| allowed_origins.contains(value));
        debug!("CORS origin check raw={origin:?} normalized={normalized:?} allowed={allowed}");
        allowed
    });

    Ok(layer.allow_origin(allow_origin))
}

fn normalize_origin(value: &str) -> Option<String> {
    let parsed = Url::parse(value).ok()?;
    let host = parsed.host_str()?.to_ascii_lowercase();
    let scheme = parsed.scheme();
    let default_port = match scheme {
        "http" => 80,
        "https" => 443,
        _ => return None,
    };

    if parsed.path() != "/" || parsed.query().is_some() || parsed.fragment().is_some() {
        return None;
    }

    match parsed.port().filter(|port| *port != default_port) {
        Some(port) => Some(format!("{scheme}://{host}:{port}")),
        None => Some(format!("{scheme}://{host}")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalizes_origins() {
        assert_eq!(
            normalize_origin("https://Example.com/").as_deref(),
            Some("https://example.com")
        );
        assert_eq!(
            normalize_origin("http://localhost:3000").as_deref(),
            Some("http://localhost:3000")
        );
        assert_eq!(
            normalize_origin("https://example.com:443").as_deref(),
            Some("https://example.com")
        );
        assert_eq!(normalize_origin("https://example.com/app"), None);
        assert_eq!(normalize_origin("ftp://example.com"), None);
        assert_eq!(normalize_origin("example.com"), None);
    }

    #[test]
    fn rejects_invalid_configured_origin() {
        let error = build_cors_layer(&["not an origin".to_string()]).unwrap_err();
        assert!(error.message.contains("not an origin"));
        assert!(build_cors_layer(&["http://localhost:3000".to_string()]).is_ok());
        assert!(build_cors_layer(&[]).is_ok());
    }
}
