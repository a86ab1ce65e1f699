use std::sync::{Arc, Mutex, PoisonError, RwLock};

use tokio::sync::{broadcast, oneshot, watch};
use tracing::{debug, info, warn};

use parley_types::ApiError;
use parley_types::api::{RefreshRequest, WireTokens, paths, unwrap_envelope};
use parley_types::models::Credential;

use crate::credentials::CredentialStore;
use crate::tracker::RequestTracker;
use crate::transport::{ApiRequest, ApiResponse, Transport};

/// Session lifecycle notifications for the UI layer.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    SignedIn,
    Refreshed,
    SignedOut,
    /// The credential was rejected and could not be renewed. Sign in again.
    Terminated { reason: String },
}

type Waiter = oneshot::Sender<Result<String, ApiError>>;

enum RefreshState {
    Idle,
    /// Everyone waiting on the exchange, initiator included.
    InFlight(Vec<Waiter>),
}

/// Attaches the bearer credential to every call and renews it at most once
/// per expiry episode.
pub struct SessionGateway<T, S> {
    inner: Arc<Inner<T, S>>,
}

impl<T, S> Clone for SessionGateway<T, S> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

struct Inner<T, S> {
    transport: T,
    store: S,
    credential: RwLock<Option<Credential>>,
    refresh: Mutex<RefreshState>,
    tracker: Arc<RequestTracker>,
    events: broadcast::Sender<SessionEvent>,
}

impl<T, S> Inner<T, S>
where
    S: CredentialStore,
{
    /// In-memory credential, falling back to the durable store.
    fn current(&self) -> Result<Option<Credential>, ApiError> {
        if let Some(credential) = self
            .credential
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
        {
            return Ok(Some(credential.clone()));
        }
        let stored = self.store.load()?;
        if let Some(credential) = &stored {
            debug!("Restored credential from store");
            *self.credential.write().unwrap_or_else(PoisonError::into_inner) =
                Some(credential.clone());
        }
        Ok(stored)
    }

    fn install(&self, credential: &Credential) {
        *self.credential.write().unwrap_or_else(PoisonError::into_inner) = Some(credential.clone());
        if let Err(e) = self.store.save(credential) {
            warn!("Credential kept in memory only: {}", e);
        }
    }

    fn wipe(&self) {
        *self.credential.write().unwrap_or_else(PoisonError::into_inner) = None;
        if let Err(e) = self.store.clear() {
            warn!("Failed to clear stored credential: {}", e);
        }
    }

    fn terminate(&self, reason: &str) {
        warn!("Session terminated: {}", reason);
        self.wipe();
        let _ = self.events.send(SessionEvent::Terminated {
            reason: reason.to_string(),
        });
    }
}

impl<T, S> SessionGateway<T, S>
where
    T: Transport,
    S: CredentialStore,
{
    pub fn new(transport: T, store: S) -> Self {
        let (events, _) = broadcast::channel(64);
        Self {
            inner: Arc::new(Inner {
                transport,
                store,
                credential: RwLock::new(None),
                refresh: Mutex::new(RefreshState::Idle),
                tracker: Arc::new(RequestTracker::new()),
                events,
            }),
        }
    }

    pub fn transport(&self) -> &T {
        &self.inner.transport
    }

    /// Install a freshly issued credential.
    pub fn login(&self, credential: Credential) -> Result<(), ApiError> {
        {
            let _refresh = self.inner.refresh.lock().unwrap_or_else(PoisonError::into_inner);
            *self
                .inner
                .credential
                .write()
                .unwrap_or_else(PoisonError::into_inner) = Some(credential.clone());
        }
        self.inner.store.save(&credential)?;
        info!("Signed in");
        let _ = self.inner.events.send(SessionEvent::SignedIn);
        Ok(())
    }

    pub fn logout(&self) {
        self.inner.wipe();
        info!("Signed out");
        let _ = self.inner.events.send(SessionEvent::SignedOut);
    }

    pub fn credential(&self) -> Option<Credential> {
        match self.inner.current() {
            Ok(credential) => credential,
            Err(e) => {
                warn!("Cannot read credential: {}", e);
                None
            }
        }
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<SessionEvent> {
        self.inner.events.subscribe()
    }

    pub fn subscribe_loading(&self) -> watch::Receiver<bool> {
        self.inner.tracker.subscribe()
    }

    pub fn is_loading(&self) -> bool {
        self.inner.tracker.is_loading()
    }

    pub fn in_flight(&self) -> usize {
        self.inner.tracker.in_flight()
    }

    /// Abort every outstanding call and force the loading flag off.
    pub fn cancel_all(&self) {
        debug!("Cancelling {} outstanding request(s)", self.in_flight());
        self.inner.tracker.cancel_all();
    }

    /// Send `request` with the current bearer token. A 401 is recovered
    /// through the refresh protocol and only surfaces if renewal fails.
    pub async fn issue(&self, request: ApiRequest) -> Result<ApiResponse, ApiError> {
        let guard = self.inner.tracker.begin();
        let caller = request.cancel.clone().unwrap_or_default();
        tokio::select! {
            _ = guard.token().cancelled() => Err(ApiError::Cancelled),
            _ = caller.cancelled() => Err(ApiError::Cancelled),
            result = self.run(&request) => result,
        }
    }

    async fn run(&self, request: &ApiRequest) -> Result<ApiResponse, ApiError> {
        let used = self.inner.current()?.map(|c| c.access_token);
        let response = self.send(request, used.as_deref()).await?;
        if !response.is_unauthorized() {
            return finish(request, response);
        }

        let Some(used) = used else {
            // Nothing to renew; this is a plain rejection (bad login etc).
            return finish(request, response);
        };
        let fresh = self.recover(request, &used, &response).await?;

        let retry = self.send(request, Some(&fresh)).await?;
        if retry.is_unauthorized() {
            warn!(
                "{} {} rejected again after refresh",
                request.method, request.path
            );
            return Err(ApiError::Unauthorized(retry.error_message()));
        }
        finish(request, retry)
    }

    async fn send(&self, request: &ApiRequest, bearer: Option<&str>) -> Result<ApiResponse, ApiError> {
        self.inner
            .transport
            .execute(request, bearer)
            .await
            .inspect_err(|e| warn!("{} {} failed: {}", request.method, request.path, e))
    }

    /// Obtain a usable access token after `used` was rejected.
    async fn recover(
        &self,
        request: &ApiRequest,
        used: &str,
        response: &ApiResponse,
    ) -> Result<String, ApiError> {
        let reason = response.error_message();
        if request.path.trim_start_matches('/') == paths::REFRESH {
            self.inner.terminate(&reason);
            return Err(ApiError::Unauthorized(reason));
        }
        let current = self.inner.current()?;
        if current.as_ref().and_then(|c| c.refresh_token.as_ref()).is_none() {
            self.inner.terminate(&reason);
            return Err(ApiError::Unauthorized(reason));
        }

        let rx = {
            let mut state = self.inner.refresh.lock().unwrap_or_else(PoisonError::into_inner);
            // Login and refresh install credentials under this lock, so this
            // read is ordered against any install that landed after our send.
            let latest = self
                .inner
                .credential
                .read()
                .unwrap_or_else(PoisonError::into_inner)
                .as_ref()
                .map(|c| c.access_token.clone());
            if let Some(latest) = latest.filter(|t| t != used) {
                debug!("{} raced a completed refresh, retrying", request.path);
                return Ok(latest);
            }

            let (tx, rx) = oneshot::channel();
            match &mut *state {
                RefreshState::InFlight(waiters) => {
                    debug!("{} queued behind refresh", request.path);
                    waiters.push(tx);
                }
                RefreshState::Idle => {
                    *state = RefreshState::InFlight(vec![tx]);
                    self.spawn_refresh();
                }
            }
            rx
        };

        rx.await.unwrap_or(Err(ApiError::Cancelled))
    }

    /// The exchange runs detached so one caller giving up cannot strand the
    /// rest of the queue. It is tracked like any other request.
    fn spawn_refresh(&self) {
        let gateway = self.clone();
        let guard = self.inner.tracker.begin();
        tokio::spawn(async move {
            let outcome = tokio::select! {
                _ = guard.token().cancelled() => Err(ApiError::Cancelled),
                result = gateway.exchange() => result,
            };
            gateway.settle(outcome);
            drop(guard);
        });
    }

    async fn exchange(&self) -> Result<Credential, ApiError> {
        let refresh_token = self
            .inner
            .current()?
            .and_then(|c| c.refresh_token)
            .ok_or_else(|| ApiError::Unauthorized("no refresh token".into()))?;

        info!("Refreshing access token");
        let request = ApiRequest::post(paths::REFRESH).json(&RefreshRequest {
            refresh_token: refresh_token.clone(),
        })?;
        let response = self.send(&request, None).await?;
        if response.is_unauthorized() {
            return Err(ApiError::Unauthorized(response.error_message()));
        }
        let response = finish(&request, response)?;

        let tokens: WireTokens = serde_json::from_value(unwrap_envelope(response.body, None)?)?;
        Ok(Credential::new(
            tokens.access_token,
            tokens.refresh_token.or(Some(refresh_token)),
        ))
    }

    /// Resolve the whole queue at once. Draining and returning to idle happen
    /// under a single lock so no request can slip between them.
    fn settle(&self, outcome: Result<Credential, ApiError>) {
        let waiters = {
            let mut state = self.inner.refresh.lock().unwrap_or_else(PoisonError::into_inner);
            if let Ok(credential) = &outcome {
                self.inner.install(credential);
            }
            match std::mem::replace(&mut *state, RefreshState::Idle) {
                RefreshState::InFlight(waiters) => waiters,
                RefreshState::Idle => Vec::new(),
            }
        };

        let result = match outcome {
            Ok(credential) => {
                info!("Access token refreshed, releasing {} request(s)", waiters.len());
                let _ = self.inner.events.send(SessionEvent::Refreshed);
                Ok(credential.access_token)
            }
            Err(e) if e.is_cancelled() => {
                debug!("Refresh cancelled");
                Err(e)
            }
            Err(e) => {
                self.inner.terminate(&format!("refresh failed: {}", e));
                Err(e)
            }
        };

        for waiter in waiters {
            let _ = waiter.send(result.clone());
        }
    }
}

fn finish(request: &ApiRequest, response: ApiResponse) -> Result<ApiResponse, ApiError> {
    if response.is_success() {
        return Ok(response);
    }
    let err = ApiError::status(response.status, response.error_message());
    warn!("{} {} failed: {}", request.method, request.path, err);
    Err(err)
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use serde_json::{Value, json};
    use tokio::sync::Notify;
    use tokio_util::sync::CancellationToken;

    use parley_types::StatusClass;

    use super::*;
    use crate::credentials::MemoryCredentialStore;

    #[derive(Default)]
    struct FakeTransport {
        refresh_calls: AtomicUsize,
        unauthorized: AtomicUsize,
        /// Holds the refresh exchange until the test releases it.
        gate: Notify,
        refresh_fails: bool,
    }

    fn reply(status: u16, body: Value) -> Result<ApiResponse, ApiError> {
        Ok(ApiResponse { status, body })
    }

    impl Transport for FakeTransport {
        async fn execute(
            &self,
            request: &ApiRequest,
            bearer: Option<&str>,
        ) -> Result<ApiResponse, ApiError> {
            match request.path.as_str() {
                paths::REFRESH => {
                    self.refresh_calls.fetch_add(1, Ordering::SeqCst);
                    self.gate.notified().await;
                    if self.refresh_fails {
                        reply(401, json!({ "message": "refresh token expired" }))
                    } else {
                        reply(
                            200,
                            json!({ "data": { "accessToken": "fresh", "refreshToken": "r2" } }),
                        )
                    }
                }
                "slow" => {
                    tokio::time::sleep(Duration::from_secs(60)).await;
                    reply(200, Value::Null)
                }
                "conflict" => reply(409, json!({ "message": "already friends" })),
                path if bearer == Some("fresh") => reply(200, json!({ "data": path })),
                _ => {
                    self.unauthorized.fetch_add(1, Ordering::SeqCst);
                    reply(401, json!({ "message": "jwt expired" }))
                }
            }
        }
    }

    fn gateway(
        transport: FakeTransport,
        credential: Credential,
    ) -> SessionGateway<FakeTransport, MemoryCredentialStore> {
        SessionGateway::new(transport, MemoryCredentialStore::with(credential))
    }

    async fn release_after(transport: &FakeTransport, rejections: usize) {
        while transport.unauthorized.load(Ordering::SeqCst) < rejections {
            tokio::task::yield_now().await;
        }
        transport.gate.notify_one();
    }

    #[tokio::test]
    async fn concurrent_expiry_shares_one_refresh() {
        let gw = gateway(
            FakeTransport::default(),
            Credential::new("stale", Some("r1".into())),
        );
        let mut events = gw.subscribe_events();

        let (a, b, ()) = tokio::join!(
            gw.issue(ApiRequest::get("a")),
            gw.issue(ApiRequest::get("b")),
            release_after(gw.transport(), 2),
        );

        assert_eq!(a.unwrap().body, json!({ "data": "a" }));
        assert_eq!(b.unwrap().body, json!({ "data": "b" }));
        assert_eq!(gw.transport().refresh_calls.load(Ordering::SeqCst), 1);

        let credential = gw.credential().unwrap();
        assert_eq!(credential.access_token, "fresh");
        assert_eq!(credential.refresh_token.as_deref(), Some("r2"));
        assert_eq!(events.recv().await.unwrap(), SessionEvent::Refreshed);

        assert_eq!(gw.in_flight(), 0);
        assert!(!gw.is_loading());
    }

    #[tokio::test]
    async fn failed_refresh_rejects_everyone_and_ends_session() {
        let transport = FakeTransport {
            refresh_fails: true,
            ..Default::default()
        };
        let gw = gateway(transport, Credential::new("stale", Some("r1".into())));
        let mut events = gw.subscribe_events();

        let (a, b, ()) = tokio::join!(
            gw.issue(ApiRequest::get("a")),
            gw.issue(ApiRequest::get("b")),
            release_after(gw.transport(), 2),
        );

        assert!(matches!(a, Err(ApiError::Unauthorized(_))));
        assert_eq!(a, b);
        assert_eq!(gw.transport().refresh_calls.load(Ordering::SeqCst), 1);
        assert!(gw.credential().is_none());
        assert!(matches!(
            events.recv().await.unwrap(),
            SessionEvent::Terminated { .. }
        ));
        assert_eq!(gw.in_flight(), 0);
    }

    #[tokio::test]
    async fn missing_refresh_token_terminates_without_exchange() {
        let gw = gateway(FakeTransport::default(), Credential::new("stale", None));

        let result = gw.issue(ApiRequest::get("profile")).await;

        assert!(matches!(result, Err(ApiError::Unauthorized(_))));
        assert_eq!(gw.transport().refresh_calls.load(Ordering::SeqCst), 0);
        assert!(gw.credential().is_none());
    }

    #[tokio::test]
    async fn stored_credential_is_used_after_restart() {
        let gw = gateway(FakeTransport::default(), Credential::new("fresh", None));
        let response = gw.issue(ApiRequest::get("friends")).await.unwrap();
        assert_eq!(response.body, json!({ "data": "friends" }));
    }

    #[tokio::test]
    async fn non_401_errors_are_classified_not_retried() {
        let gw = gateway(
            FakeTransport::default(),
            Credential::new("fresh", Some("r1".into())),
        );

        let err = gw.issue(ApiRequest::post("conflict")).await.unwrap_err();

        assert_eq!(
            err,
            ApiError::Status {
                status: 409,
                class: StatusClass::Conflict,
                message: "already friends".into(),
            }
        );
        assert_eq!(gw.transport().refresh_calls.load(Ordering::SeqCst), 0);
        assert_eq!(gw.in_flight(), 0);
    }

    #[tokio::test]
    async fn bulk_cancel_resets_and_next_request_completes() {
        let gw = gateway(FakeTransport::default(), Credential::new("fresh", None));
        let mut loading = gw.subscribe_loading();

        let cancel = async {
            loading.wait_for(|busy| *busy).await.unwrap();
            gw.cancel_all();
        };
        let (result, ()) = tokio::join!(gw.issue(ApiRequest::get("slow")), cancel);

        assert_eq!(result.unwrap_err(), ApiError::Cancelled);
        assert_eq!(gw.in_flight(), 0);
        assert!(!gw.is_loading());

        // Idempotent with nothing pending.
        gw.cancel_all();

        let response = gw.issue(ApiRequest::get("after")).await.unwrap();
        assert_eq!(response.body, json!({ "data": "after" }));
        assert_eq!(gw.in_flight(), 0);
        assert!(!gw.is_loading());
    }

    #[tokio::test]
    async fn caller_token_cancels_one_request() {
        let gw = gateway(FakeTransport::default(), Credential::new("fresh", None));
        let token = CancellationToken::new();
        token.cancel();

        let result = gw
            .issue(ApiRequest::get("slow").cancel_with(token))
            .await;

        assert!(result.unwrap_err().is_cancelled());
        assert_eq!(gw.in_flight(), 0);
    }

    #[tokio::test]
    async fn login_during_refresh_serves_new_requests_directly() {
        let gw = gateway(FakeTransport::default(), Credential::new("stale", Some("r1".into())));

        let first = tokio::spawn({
            let gw = gw.clone();
            async move { gw.issue(ApiRequest::get("profile")).await }
        });
        while gw.transport().refresh_calls.load(Ordering::SeqCst) == 0 {
            tokio::task::yield_now().await;
        }

        gw.login(Credential::new("fresh", Some("r9".into()))).unwrap();
        let second = gw.issue(ApiRequest::get("friends")).await.unwrap();
        assert_eq!(second.body, json!({ "data": "friends" }));

        gw.transport().gate.notify_one();
        let first = first.await.unwrap().unwrap();
        assert_eq!(first.body, json!({ "data": "profile" }));
        assert_eq!(gw.transport().refresh_calls.load(Ordering::SeqCst), 1);
        assert_eq!(gw.in_flight(), 0);
    }

    #[tokio::test]
    async fn logout_clears_store() {
        let gw = gateway(FakeTransport::default(), Credential::new("fresh", None));
        let mut events = gw.subscribe_events();
        gw.logout();
        assert!(gw.credential().is_none());
        assert_eq!(events.recv().await.unwrap(), SessionEvent::SignedOut);

        gw.login(Credential::new("again", None)).unwrap();
        assert_eq!(gw.credential().unwrap().access_token, "again");
    }
}
