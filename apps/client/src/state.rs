use std::sync::Arc;

use anyhow::Result;

use crate::config::Config;
use crate::credentials::CredentialSource;
use crate::login::{HttpHandshakeApi, LoginFlowController};
use crate::realtime::{ConnectionManager, WsConnector};

/// Long-lived client components, built once at startup and shared by clone.
#[derive(Clone)]
pub struct AppState {
    pub config: Config,
    pub connection: ConnectionManager,
    pub login: LoginFlowController,
}

impl AppState {
    pub fn build(config: Config, credentials: Arc<dyn CredentialSource>) -> Result<Self> {
        let connector = Arc::new(WsConnector::new(config.request_timeout()));
        let connection = ConnectionManager::new(
            config.ws_url.clone(),
            config.reconnect_policy(),
            Arc::clone(&credentials),
            connector,
        );

        let api = HttpHandshakeApi::new(
            config.api_base_url.clone(),
            credentials,
            config.request_timeout(),
        )?;
        let login = LoginFlowController::new(Arc::new(api), config.login_flow_config());

        Ok(Self {
            config,
            connection,
            login,
        })
    }
}
