use std::sync::Arc;

use reqwest::Client;
use shared::{
    domain::{ConversationId, Credential, Identity},
    protocol::{LoginRequest, LoginResponse},
};
use storage::SessionStore;
use tracing::{info, warn};

pub mod channel;
pub mod config;
pub mod conversation;
pub mod error;
pub mod gateway;
pub mod history;
pub mod refresh;
pub mod session;
pub mod timeline;

pub use channel::{ChannelState, CloseReason, LiveChannel};
pub use config::{load_settings, ClientSettings, ReconnectSettings};
pub use conversation::{ConversationEvent, ConversationView};
pub use error::{ClientError, RefreshError};
pub use gateway::{ApiResponse, Gateway, MultipartPayload, RequestBody, RequestDescriptor};
pub use history::HistoryLoader;
pub use refresh::RefreshOrchestrator;
pub use session::{AuthPhase, AuthTransition, SessionContext};
pub use timeline::Timeline;

pub struct ChatClient {
    settings: ClientSettings,
    session: Arc<SessionContext>,
    gateway: Arc<Gateway>,
}

impl ChatClient {
    pub async fn new(
        settings: ClientSettings,
        store: Arc<dyn SessionStore>,
    ) -> Result<Self, ClientError> {
        let session = SessionContext::restore(store).await?;
        let http = Client::builder()
            .timeout(settings.request_timeout())
            .build()
            .map_err(ClientError::Network)?;
        let api_root = settings.api_root();
        let refresher = Arc::new(RefreshOrchestrator::new(
            http.clone(),
            &api_root,
            Arc::clone(&session),
        ));
        let gateway = Arc::new(Gateway::new(
            http,
            api_root,
            Arc::clone(&session),
            refresher,
        ));
        Ok(Self {
            settings,
            session,
            gateway,
        })
    }

    pub fn settings(&self) -> &ClientSettings {
        &self.settings
    }

    pub fn session(&self) -> &Arc<SessionContext> {
        &self.session
    }

    pub fn gateway(&self) -> &Arc<Gateway> {
        &self.gateway
    }

    pub fn history(&self) -> HistoryLoader {
        HistoryLoader::new(
            Arc::clone(&self.gateway),
            self.settings.history_page_size,
            self.settings.history_max_pages,
        )
    }

    pub async fn login(&self, username: &str, password: &str) -> Result<Identity, ClientError> {
        let request = RequestDescriptor::post("/auth/login").json(&LoginRequest {
            username: username.to_string(),
            password: password.to_string(),
        })?;
        let body = match self.gateway.execute(&request, false).await? {
            ApiResponse::Body(body) => body,
            ApiResponse::Empty => {
                return Err(ClientError::Decode("login response had no body".into()))
            }
        };
        let login: LoginResponse =
            serde_json::from_value(body).map_err(|err| ClientError::Decode(err.to_string()))?;
        if login.access_token.is_empty() {
            return Err(ClientError::Decode(
                "login response carried an empty access token".into(),
            ));
        }

        let identity = login.user.clone();
        self.session
            .establish(Credential {
                access_token: login.access_token,
                refresh_token: login.refresh_token.filter(|token| !token.is_empty()),
                identity: login.user,
            })
            .await?;
        info!(participant_id = identity.participant_id.0, "auth: logged in");
        Ok(identity)
    }

    /// Tells the server (best effort) and erases the local session either way.
    pub async fn logout(&self) -> Result<(), ClientError> {
        if self.session.is_authenticated().await {
            let request = RequestDescriptor::post("/auth/logout");
            if let Err(err) = self.gateway.execute(&request, false).await {
                warn!(%err, "auth: server logout failed, clearing local session anyway");
            }
        }
        self.session.invalidate().await?;
        info!("auth: logged out");
        Ok(())
    }

    pub async fn open_conversation(
        &self,
        conversation_id: ConversationId,
    ) -> Result<ConversationView, ClientError> {
        let live_root = self
            .settings
            .live_root()
            .map_err(|err| ClientError::Channel(err.to_string()))?;
        ConversationView::open(
            conversation::ViewDependencies {
                session: Arc::clone(&self.session),
                gateway: Arc::clone(&self.gateway),
                history: self.history(),
                live_root,
                reconnect: self.settings.reconnect.clone(),
                pending_read_ttl: self.settings.pending_read_ttl(),
            },
            conversation_id,
        )
        .await
    }
}

#[cfg(test)]
#[path = "tests/support.rs"]
mod test_support;

#[cfg(test)]
#[path = "tests/lib_tests.rs"]
mod tests;
