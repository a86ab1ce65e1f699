use std::sync::Arc;

use bytes::Bytes;

use parley_session::{ApiRequest, CredentialStore, Transport, UploadPart, UploadProgress};
use parley_types::api::{UpdateProfileRequest, WireUser, paths};
use parley_types::models::{UserId, UserProfile, UserSummary};
use parley_types::ApiError;

use crate::client::ApiClient;

const AVATAR_FIELD: &str = "profilePicture";

impl<T, S> ApiClient<T, S>
where
    T: Transport,
    S: CredentialStore,
{
    pub async fn profile(&self) -> Result<UserProfile, ApiError> {
        let user: WireUser = self
            .fetch(ApiRequest::get(paths::PROFILE), Some("user"))
            .await?;
        user.into_profile()
    }

    pub async fn update_profile(&self, update: &UpdateProfileRequest) -> Result<UserProfile, ApiError> {
        let request = ApiRequest::put(paths::PROFILE).json(update)?;
        let user: WireUser = self.fetch(request, Some("user")).await?;
        user.into_profile()
    }

    pub async fn change_avatar(
        &self,
        file_name: &str,
        mime: &str,
        data: Bytes,
        progress: Option<Arc<UploadProgress>>,
    ) -> Result<UserProfile, ApiError> {
        let request = ApiRequest::put(paths::PROFILE_PICTURE).upload(UploadPart {
            field: AVATAR_FIELD.into(),
            file_name: file_name.into(),
            mime: mime.into(),
            data,
            progress,
        });
        let user: WireUser = self.fetch(request, Some("user")).await?;
        user.into_profile()
    }

    pub async fn user(&self, id: &UserId) -> Result<UserSummary, ApiError> {
        let user: WireUser = self
            .fetch(ApiRequest::get(paths::user(id)), Some("user"))
            .await?;
        user.into_summary()
    }

    pub async fn search_users(&self, query: &str) -> Result<Vec<UserSummary>, ApiError> {
        let request = ApiRequest::get(paths::SEARCH_USERS).query("query", query);
        let users: Vec<WireUser> = self.fetch(request, Some("users")).await?;
        users.into_iter().map(WireUser::into_summary).collect()
    }
}
