use std::{fmt, sync::Arc};

use shared::domain::{Credential, Identity};
use storage::SessionStore;
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::error::ClientError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthPhase {
    Unauthenticated,
    Authenticated,
    Refreshing,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthTransition {
    LoggedIn,
    RefreshStarted,
    RefreshSucceeded,
    RefreshFailed,
    LoggedOut,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("invalid auth transition {transition:?} from {from:?}")]
pub struct InvalidTransition {
    pub from: AuthPhase,
    pub transition: AuthTransition,
}

impl AuthPhase {
    pub fn transition(self, transition: AuthTransition) -> Result<Self, InvalidTransition> {
        use AuthPhase::*;
        use AuthTransition::*;

        match (self, transition) {
            (_, LoggedIn) => Ok(Authenticated),
            (Authenticated, RefreshStarted) => Ok(Refreshing),
            (Refreshing, RefreshSucceeded) => Ok(Authenticated),
            (Refreshing, RefreshFailed) => Ok(Unauthenticated),
            (_, LoggedOut) => Ok(Unauthenticated),
            (from, transition) => Err(InvalidTransition { from, transition }),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum RefreshCompletion {
    Applied,
    Superseded,
}

struct SessionState {
    credential: Option<Credential>,
    phase: AuthPhase,
}

/// The one shared, mutable piece of client state: the current credential and
/// where it is in its lifecycle. Handed explicitly to the gateway, the
/// refresh orchestrator and every live channel.
///
/// Every mutation writes the durable store first; the cached copy only
/// changes once the store accepted the write.
pub struct SessionContext {
    store: Arc<dyn SessionStore>,
    state: RwLock<SessionState>,
}

impl fmt::Debug for SessionContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionContext").finish_non_exhaustive()
    }
}

impl SessionContext {
    pub async fn restore(store: Arc<dyn SessionStore>) -> Result<Arc<Self>, ClientError> {
        let credential = store.load().await.map_err(ClientError::storage)?;
        let phase = if credential.is_some() {
            AuthPhase::Authenticated
        } else {
            AuthPhase::Unauthenticated
        };
        if let Some(credential) = &credential {
            info!(
                participant_id = credential.identity.participant_id.0,
                "session: restored persisted credential"
            );
        }
        Ok(Arc::new(Self {
            store,
            state: RwLock::new(SessionState { credential, phase }),
        }))
    }

    pub async fn phase(&self) -> AuthPhase {
        self.state.read().await.phase
    }

    pub async fn credential(&self) -> Option<Credential> {
        self.state.read().await.credential.clone()
    }

    pub async fn access_token(&self) -> Option<String> {
        self.state
            .read()
            .await
            .credential
            .as_ref()
            .map(|credential| credential.access_token.clone())
    }

    pub async fn identity(&self) -> Option<Identity> {
        self.state
            .read()
            .await
            .credential
            .as_ref()
            .map(|credential| credential.identity.clone())
    }

    pub async fn can_refresh(&self) -> bool {
        self.state
            .read()
            .await
            .credential
            .as_ref()
            .is_some_and(Credential::can_refresh)
    }

    pub async fn is_authenticated(&self) -> bool {
        self.state.read().await.credential.is_some()
    }

    pub(crate) async fn establish(&self, credential: Credential) -> Result<(), ClientError> {
        let mut guard = self.state.write().await;
        let next = guard
            .phase
            .transition(AuthTransition::LoggedIn)
            .map_err(|err| ClientError::Auth(err.to_string()))?;
        self.store
            .save(&credential)
            .await
            .map_err(ClientError::storage)?;
        info!(
            participant_id = credential.identity.participant_id.0,
            "session: established"
        );
        guard.credential = Some(credential);
        guard.phase = next;
        Ok(())
    }

    /// Moves into `Refreshing` and hands back the refresh token to submit.
    /// `None` when there is nothing to refresh with; the phase is untouched.
    pub(crate) async fn begin_refresh(&self) -> Option<String> {
        let mut guard = self.state.write().await;
        let refresh_token = guard
            .credential
            .as_ref()
            .filter(|credential| credential.can_refresh())
            .and_then(|credential| credential.refresh_token.clone())?;
        match guard.phase.transition(AuthTransition::RefreshStarted) {
            Ok(next) => {
                guard.phase = next;
                Some(refresh_token)
            }
            Err(err) => {
                warn!(%err, "session: refresh requested outside authenticated phase");
                None
            }
        }
    }

    pub(crate) async fn complete_refresh(
        &self,
        submitted_refresh_token: &str,
        access_token: String,
        rotated_refresh_token: Option<String>,
    ) -> anyhow::Result<RefreshCompletion> {
        let mut guard = self.state.write().await;
        let Some(current) = guard
            .credential
            .as_ref()
            .filter(|current| holds_refresh_token(current, submitted_refresh_token))
            .filter(|_| guard.phase == AuthPhase::Refreshing)
        else {
            return Ok(RefreshCompletion::Superseded);
        };
        let next_phase = guard
            .phase
            .transition(AuthTransition::RefreshSucceeded)
            .map_err(anyhow::Error::from)?;

        let mut renewed = current.clone();
        renewed.access_token = access_token;
        if let Some(rotated) = rotated_refresh_token {
            renewed.refresh_token = Some(rotated);
        }
        self.store.save(&renewed).await?;
        debug!("session: access token renewed");
        guard.credential = Some(renewed);
        guard.phase = next_phase;
        Ok(RefreshCompletion::Applied)
    }

    pub(crate) async fn fail_refresh(&self, submitted_refresh_token: &str) {
        let mut guard = self.state.write().await;
        let superseded = guard.credential.as_ref().is_some_and(|current| {
            guard.phase != AuthPhase::Refreshing
                || !holds_refresh_token(current, submitted_refresh_token)
        });
        if superseded {
            debug!("session: ignoring failure of a superseded refresh");
            return;
        }
        if let Err(err) = self.store.clear().await {
            warn!(%err, "session: failed to erase persisted credential after refresh failure");
        }
        guard.credential = None;
        guard.phase = guard
            .phase
            .transition(AuthTransition::RefreshFailed)
            .unwrap_or(AuthPhase::Unauthenticated);
        warn!("session: cleared after refresh failure");
    }

    pub async fn invalidate(&self) -> Result<(), ClientError> {
        let mut guard = self.state.write().await;
        let cleared = self.store.clear().await.map_err(ClientError::storage);
        guard.credential = None;
        guard.phase = AuthPhase::Unauthenticated;
        info!("session: invalidated");
        cleared
    }
}

fn holds_refresh_token(credential: &Credential, refresh_token: &str) -> bool {
    credential.refresh_token.as_deref() == Some(refresh_token)
}

#[cfg(test)]
#[path = "tests/session_tests.rs"]
mod tests;
