use thiserror::Error;

use parley_realtime::RealtimeError;
use parley_sync::SyncError;
use parley_types::ApiError;

#[derive(Debug, Error)]
pub enum ClientError {
    #[error(transparent)]
    Api(#[from] ApiError),

    #[error(transparent)]
    Sync(#[from] SyncError),

    #[error(transparent)]
    Realtime(#[from] RealtimeError),

    /// No signed-in user yet; call `sign_in` or `resume` first.
    #[error("no active session")]
    NoSession,
}

impl ClientError {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Api(e) if e.is_cancelled())
    }
}
