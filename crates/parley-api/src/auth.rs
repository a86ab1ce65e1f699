use serde_json::Value;
use tracing::info;

use parley_session::{ApiRequest, CredentialStore, Transport};
use parley_types::ApiError;
use parley_types::api::{LoginRequest, RegisterRequest, WireTokens, WireUser, paths};
use parley_types::models::{Credential, UserProfile};

use crate::client::ApiClient;

impl<T, S> ApiClient<T, S>
where
    T: Transport,
    S: CredentialStore,
{
    /// Exchange credentials for tokens and install them in the gateway.
    pub async fn login(&self, email: &str, password: &str) -> Result<Option<UserProfile>, ApiError> {
        let request = ApiRequest::post(paths::LOGIN).json(&LoginRequest {
            email: email.to_string(),
            password: password.to_string(),
        })?;
        let tokens: WireTokens = self.fetch(request, None).await?;
        self.sign_in(tokens)
    }

    /// Create an account. Signs in as well when the server issues tokens.
    pub async fn register(&self, request: RegisterRequest) -> Result<Option<UserProfile>, ApiError> {
        let request = ApiRequest::post(paths::REGISTER).json(&request)?;
        let payload = self.payload(request, None).await?;

        if payload.get("accessToken").is_some() {
            let tokens: WireTokens = serde_json::from_value(payload)?;
            return self.sign_in(tokens);
        }
        let user = match payload {
            Value::Object(mut map) => map.remove("user").unwrap_or(Value::Object(map)),
            other => other,
        };
        let user: WireUser = serde_json::from_value(user)?;
        Ok(Some(user.into_profile()?))
    }

    /// Forget the local session. The backend keeps no session to end.
    pub fn logout(&self) {
        self.gateway().logout();
    }

    fn sign_in(&self, tokens: WireTokens) -> Result<Option<UserProfile>, ApiError> {
        self.gateway()
            .login(Credential::new(tokens.access_token, tokens.refresh_token))?;
        let profile = tokens.user.map(WireUser::into_profile).transpose()?;
        if let Some(profile) = &profile {
            info!("Signed in as {}", profile.username);
        }
        Ok(profile)
    }
}
