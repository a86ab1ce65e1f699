use parley_session::{ApiRequest, CredentialStore, Transport};
use parley_types::ApiError;
use parley_types::api::{WireFriendRequest, WireFriendshipStatus, WireUser, paths};
use parley_types::models::{FriendRequest, FriendshipStatus, UserId, UserSummary};

use crate::client::ApiClient;

impl<T, S> ApiClient<T, S>
where
    T: Transport,
    S: CredentialStore,
{
    pub async fn friends(&self) -> Result<Vec<UserSummary>, ApiError> {
        let users: Vec<WireUser> = self
            .fetch(ApiRequest::get(paths::FRIENDS), Some("friends"))
            .await?;
        users.into_iter().map(WireUser::into_summary).collect()
    }

    /// Requests other users sent us.
    pub async fn pending_requests(&self) -> Result<Vec<FriendRequest>, ApiError> {
        self.requests(paths::PENDING_REQUESTS).await
    }

    /// Requests we sent that are still open.
    pub async fn sent_requests(&self) -> Result<Vec<FriendRequest>, ApiError> {
        self.requests(paths::SENT_REQUESTS).await
    }

    async fn requests(&self, path: &str) -> Result<Vec<FriendRequest>, ApiError> {
        let wire: Vec<WireFriendRequest> =
            self.fetch(ApiRequest::get(path), Some("requests")).await?;
        wire.into_iter().map(WireFriendRequest::into_request).collect()
    }

    pub async fn send_friend_request(&self, user: &UserId) -> Result<(), ApiError> {
        self.execute(ApiRequest::post(paths::send_friend_request(user)))
            .await
    }

    pub async fn accept_friend_request(&self, request_id: &str) -> Result<(), ApiError> {
        self.execute(ApiRequest::put(paths::accept_friend_request(request_id)))
            .await
    }

    pub async fn reject_friend_request(&self, request_id: &str) -> Result<(), ApiError> {
        self.execute(ApiRequest::post(paths::reject_friend_request(request_id)))
            .await
    }

    pub async fn cancel_friend_request(&self, request_id: &str) -> Result<(), ApiError> {
        self.execute(ApiRequest::delete(paths::cancel_friend_request(request_id)))
            .await
    }

    pub async fn remove_friend(&self, friend: &UserId) -> Result<(), ApiError> {
        self.execute(ApiRequest::delete(paths::remove_friend(friend)))
            .await
    }

    pub async fn friendship_status(&self, user: &UserId) -> Result<FriendshipStatus, ApiError> {
        let status: WireFriendshipStatus = self
            .fetch(ApiRequest::get(paths::friendship_status(user)), None)
            .await?;
        Ok(status.into_status())
    }
}
