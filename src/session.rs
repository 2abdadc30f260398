use std::{sync::Arc, time::Duration};

use serde::Serialize;
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::{error, info, warn};

use crate::{
    cookies::SessionCookie,
    upstream::{Upstream, UpstreamSession},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub delay: Duration,
    /// `None` retries forever.
    pub max_attempts: Option<u32>,
}

#[derive(Debug, Error)]
#[error("upstream session is not ready")]
pub struct SessionNotReady {
    pub retry_after_seconds: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionPhase {
    Uninitialized,
    Ready,
    Failed,
}

enum SessionState {
    Uninitialized,
    Ready(Arc<dyn UpstreamSession>),
    Failed { attempts: u32, last_error: String },
}

pub struct SessionManager {
    state: RwLock<SessionState>,
    retry: RetryPolicy,
}

impl SessionManager {
    /// Spawns session creation on the runtime and returns immediately.
    pub fn start(
        upstream: Arc<dyn Upstream>,
        cookies: Vec<SessionCookie>,
        retry: RetryPolicy,
    ) -> Arc<Self> {
        let manager = Arc::new(Self {
            state: RwLock::new(SessionState::Uninitialized),
            retry,
        });
        tokio::spawn(Arc::clone(&manager).initialize(upstream, cookies));
        manager
    }

    async fn initialize(
        self: Arc<Self>,
        upstream: Arc<dyn Upstream>,
        mut cookies: Vec<SessionCookie>,
    ) {
        let mut attempts = 0;

        loop {
            attempts += 1;
            match upstream.create_session().await {
                Ok(session) => {
                    if !cookies.is_empty() {
                        let count = cookies.len();
                        match session.set_cookies(std::mem::take(&mut cookies)).await {
                            Ok(()) => info!("Attached {count} cookie(s) to the upstream session"),
                            Err(error) => warn!(
                                "Could not attach cookies to the upstream session, continuing without them: {error}"
                            ),
                        }
                    }

                    *self.state.write().await = SessionState::Ready(session);
                    info!("Upstream session ready after {attempts} attempt(s)");
                    return;
                }
                Err(failure) => {
                    let last_error = failure.to_string();
                    warn!("Upstream session attempt {attempts} failed: {last_error}");
                    *self.state.write().await = SessionState::Failed {
                        attempts,
                        last_error,
                    };

                    if self.retry.max_attempts.is_some_and(|max| attempts >= max) {
                        error!("Giving up on the upstream session after {attempts} attempt(s)");
                        return;
                    }

                    info!(
                        "Retrying upstream session in {} second(s)",
                        self.retry.delay.as_secs_f32()
                    );
                    tokio::time::sleep(self.retry.delay).await;
                }
            }
        }
    }

    pub async fn ready_session(&self) -> Result<Arc<dyn UpstreamSession>, SessionNotReady> {
        match &*self.state.read().await {
            SessionState::Ready(session) => Ok(Arc::clone(session)),
            SessionState::Uninitialized | SessionState::Failed { .. } => Err(SessionNotReady {
                retry_after_seconds: self.retry.delay.as_secs().max(1),
            }),
        }
    }

    pub async fn phase(&self) -> SessionPhase {
        match &*self.state.read().await {
            SessionState::Uninitialized => SessionPhase::Uninitialized,
            SessionState::Ready(_) => SessionPhase::Ready,
            SessionState::Failed { .. } => SessionPhase::Failed,
        }
    }

    /// Attempt count and message of the latest failure, if the session is failed.
    pub async fn last_failure(&self) -> Option<(u32, String)> {
        match &*self.state.read().await {
            SessionState::Failed {
                attempts,
                last_error,
            } => Some((*attempts, last_error.clone())),
            _ => None,
        }
    }
}
