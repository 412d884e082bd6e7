use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc,
};

use reqwest::Client;
use shared::protocol::{RefreshRequest, RefreshResponse};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::{
    error::RefreshError,
    gateway::error_message_from_body,
    session::{AuthPhase, RefreshCompletion, SessionContext},
};

/// Exchanges the refresh token for a new access token.
///
/// One refresh runs at a time, on its own task: a caller that gives up
/// waiting does not abandon the exchange halfway, and callers rejected with
/// a token that has since been renewed pick up the renewed token instead of
/// refreshing again.
pub struct RefreshOrchestrator {
    inner: Arc<RefreshInner>,
}

struct RefreshInner {
    http: Client,
    refresh_url: String,
    session: Arc<SessionContext>,
    inflight: Mutex<()>,
    attempts: AtomicU64,
}

impl RefreshOrchestrator {
    pub fn new(http: Client, api_root: &str, session: Arc<SessionContext>) -> Self {
        Self {
            inner: Arc::new(RefreshInner {
                http,
                refresh_url: format!("{api_root}/auth/refresh"),
                session,
                inflight: Mutex::new(()),
                attempts: AtomicU64::new(0),
            }),
        }
    }

    pub fn attempts(&self) -> u64 {
        self.inner.attempts.load(Ordering::SeqCst)
    }

    pub async fn refresh(&self) -> Result<String, RefreshError> {
        let inner = Arc::clone(&self.inner);
        join(tokio::spawn(async move {
            let _guard = inner.inflight.lock().await;
            inner.refresh_locked().await
        }))
        .await
    }

    pub async fn refresh_after_rejection(
        &self,
        rejected_token: &str,
    ) -> Result<String, RefreshError> {
        let inner = Arc::clone(&self.inner);
        let rejected_token = rejected_token.to_string();
        join(tokio::spawn(async move {
            let _guard = inner.inflight.lock().await;
            match inner.session.access_token().await {
                None => return Err(RefreshError::SessionCleared),
                Some(current) if current != rejected_token => {
                    debug!("refresh: token already renewed by a concurrent caller");
                    return Ok(current);
                }
                Some(_) => {}
            }
            inner.refresh_locked().await
        }))
        .await
    }
}

async fn join(
    task: tokio::task::JoinHandle<Result<String, RefreshError>>,
) -> Result<String, RefreshError> {
    match task.await {
        Ok(result) => result,
        Err(err) => Err(RefreshError::Interrupted(err.to_string())),
    }
}

impl RefreshInner {
    async fn refresh_locked(&self) -> Result<String, RefreshError> {
        if self.session.phase().await == AuthPhase::Unauthenticated {
            return Err(RefreshError::SessionCleared);
        }
        let Some(refresh_token) = self.session.begin_refresh().await else {
            return Err(RefreshError::MissingRefreshToken);
        };

        let attempt = self.attempts.fetch_add(1, Ordering::SeqCst) + 1;
        debug!(attempt, "refresh: requesting new access token");

        match self.exchange(refresh_token.clone()).await {
            Ok(renewed) => {
                let access_token = renewed.access_token.clone();
                match self
                    .session
                    .complete_refresh(
                        &refresh_token,
                        renewed.access_token,
                        renewed.refresh_token,
                    )
                    .await
                {
                    Ok(RefreshCompletion::Applied) => {
                        info!(attempt, "refresh: access token renewed");
                        Ok(access_token)
                    }
                    Ok(RefreshCompletion::Superseded) => {
                        debug!(attempt, "refresh: session replaced while refreshing");
                        self.session
                            .access_token()
                            .await
                            .ok_or(RefreshError::SessionCleared)
                    }
                    Err(source) => {
                        self.session.fail_refresh(&refresh_token).await;
                        Err(RefreshError::Storage { source })
                    }
                }
            }
            Err(err) => {
                warn!(attempt, %err, "refresh: failed, clearing session");
                self.session.fail_refresh(&refresh_token).await;
                Err(err)
            }
        }
    }

    async fn exchange(&self, refresh_token: String) -> Result<RefreshResponse, RefreshError> {
        let response = self
            .http
            .post(&self.refresh_url)
            .json(&RefreshRequest { refresh_token })
            .send()
            .await
            .map_err(RefreshError::Network)?;

        let status = response.status();
        if !status.is_success() {
            let body = response.bytes().await.unwrap_or_default();
            return Err(RefreshError::Rejected {
                status: status.as_u16(),
                message: error_message_from_body(status, &body),
            });
        }

        let body = response.bytes().await.map_err(RefreshError::Network)?;
        let renewed: RefreshResponse =
            serde_json::from_slice(&body).map_err(|err| RefreshError::Decode(err.to_string()))?;
        if renewed.access_token.is_empty() {
            return Err(RefreshError::Decode(
                "refresh response carried an empty access token".into(),
            ));
        }
        Ok(renewed)
    }
}
