//! Client facade for the Parley chat backend: sign-in, conversation
//! history, sending, read receipts and the real-time channel, kept in sync
//! through one [`ChatClient`] handle.

pub mod chat;
pub mod config;
pub mod error;

pub use chat::ChatClient;
pub use config::ClientConfig;
pub use error::ClientError;

use std::sync::Arc;

use parley_api::ApiClient;
use parley_session::{FileCredentialStore, ReqwestTransport, SessionGateway};
use parley_sync::SystemClock;

/// Production wiring: HTTP transport and a credential file.
pub type DefaultClient = ChatClient<ReqwestTransport, FileCredentialStore>;

impl DefaultClient {
    pub fn from_config(config: &ClientConfig) -> Result<Self, ClientError> {
        let transport = ReqwestTransport::new(config.api_url.clone(), config.timeout)?;
        let store = FileCredentialStore::new(&config.credentials_path);
        let api = ApiClient::new(SessionGateway::new(transport, store));
        Ok(ChatClient::new(api, Arc::new(SystemClock), config.page_size))
    }
}
