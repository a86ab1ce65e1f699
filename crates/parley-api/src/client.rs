use serde::de::DeserializeOwned;
use serde_json::Value;

use parley_session::{ApiRequest, CredentialStore, SessionGateway, Transport};
use parley_types::ApiError;
use parley_types::api::unwrap_envelope;

/// Typed access to the chat backend.
pub struct ApiClient<T, S> {
    gateway: SessionGateway<T, S>,
}

impl<T, S> Clone for ApiClient<T, S> {
    fn clone(&self) -> Self {
        Self {
            gateway: self.gateway.clone(),
        }
    }
}

impl<T, S> ApiClient<T, S>
where
    T: Transport,
    S: CredentialStore,
{
    pub fn new(gateway: SessionGateway<T, S>) -> Self {
        Self { gateway }
    }

    pub fn gateway(&self) -> &SessionGateway<T, S> {
        &self.gateway
    }

    /// Issue `request` and return the unwrapped payload.
    pub(crate) async fn payload(
        &self,
        request: ApiRequest,
        key: Option<&str>,
    ) -> Result<Value, ApiError> {
        let response = self.gateway.issue(request).await?;
        unwrap_envelope(response.body, key)
    }

    /// Issue `request` and decode the unwrapped payload as `D`.
    pub(crate) async fn fetch<D: DeserializeOwned>(
        &self,
        request: ApiRequest,
        key: Option<&str>,
    ) -> Result<D, ApiError> {
        let path = request.path.clone();
        let payload = self.payload(request, key).await?;
        serde_json::from_value(payload).map_err(|e| ApiError::Decode(format!("{}: {}", path, e)))
    }

    /// Issue `request` for its side effect only.
    pub(crate) async fn execute(&self, request: ApiRequest) -> Result<(), ApiError> {
        self.payload(request, None).await.map(|_| ())
    }
}
