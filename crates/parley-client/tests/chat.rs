//! Facade flows against an in-memory backend.

use std::sync::Arc;

use chrono::{TimeZone, Utc};
use serde_json::{Value, json};

use parley_api::ApiClient;
use parley_client::{ChatClient, ClientError};
use parley_session::{
    ApiRequest, ApiResponse, MemoryCredentialStore, Method, RequestBody, SessionGateway,
    Transport,
};
use parley_sync::ManualClock;
use parley_types::ApiError;
use parley_types::events::RealtimeEvent;
use parley_types::models::{Message, MessageContent, MessageId, UserId, UserSummary};

struct Backend;

fn wire(id: &str, sender: &str, receiver: &str, body: &str, at: &str) -> Value {
    json!({
        "_id": id,
        "sender": sender,
        "receiver": receiver,
        "messageType": "text",
        "content": body,
        "createdAt": at,
    })
}

fn ok(body: Value) -> Result<ApiResponse, ApiError> {
    Ok(ApiResponse { status: 200, body })
}

impl Transport for Backend {
    async fn execute(
        &self,
        request: &ApiRequest,
        _bearer: Option<&str>,
    ) -> Result<ApiResponse, ApiError> {
        let page = request
            .query
            .iter()
            .find(|(k, _)| k == "page")
            .map(|(_, v)| v.as_str());

        match (request.method, request.path.as_str(), page) {
            (Method::Post, "auth/login", _) => ok(json!({
                "success": true,
                "data": {
                    "accessToken": "a1",
                    "refreshToken": "r1",
                    "user": { "_id": "me", "username": "me" },
                }
            })),
            (Method::Get, "messages/conversations", _) => ok(json!({
                "conversations": [{
                    "friend": { "_id": "bob", "username": "bob" },
                    "lastMessage": wire("m3", "bob", "me", "three", "2024-03-01T09:03:00Z"),
                    "unreadCount": 2,
                }]
            })),
            (Method::Get, "friends", _) => ok(json!({
                "friends": [{ "_id": "bob", "username": "bob" }]
            })),
            // Newest first, as the server sends them.
            (Method::Get, "messages/conversation/bob", Some("1")) => ok(json!({
                "data": {
                    "messages": [
                        wire("m3", "bob", "me", "three", "2024-03-01T09:03:00Z"),
                        wire("m2", "me", "bob", "two", "2024-03-01T09:02:00Z"),
                    ],
                    "pagination": { "totalPages": 2 },
                }
            })),
            (Method::Get, "messages/conversation/bob", Some("2")) => ok(json!({
                "data": {
                    "messages": [wire("m1", "bob", "me", "one", "2024-03-01T09:01:00Z")],
                    "pagination": { "totalPages": 2 },
                }
            })),
            (Method::Post, "messages/text/bob", _) => {
                let RequestBody::Json(body) = &request.body else {
                    return ok(Value::Null);
                };
                let content = body["content"].as_str().unwrap_or_default();
                if content == "fail" {
                    return Ok(ApiResponse {
                        status: 422,
                        body: json!({ "message": "content rejected" }),
                    });
                }
                ok(json!({
                    "message": wire("m10", "me", "bob", content, "2024-03-01T10:00:02Z")
                }))
            }
            (Method::Delete, "messages/m2", _) => Ok(ApiResponse {
                status: 403,
                body: json!({ "message": "not yours" }),
            }),
            (Method::Delete, _, _) | (Method::Put, _, _) => ok(json!({ "success": true })),
            _ => Ok(ApiResponse {
                status: 404,
                body: json!({ "message": "no such route" }),
            }),
        }
    }
}

type TestClient = ChatClient<Backend, MemoryCredentialStore>;

fn client() -> TestClient {
    let clock = Arc::new(ManualClock::new(
        Utc.with_ymd_and_hms(2024, 3, 1, 10, 0, 0).unwrap(),
    ));
    let gateway = SessionGateway::new(Backend, MemoryCredentialStore::new());
    ChatClient::new(ApiClient::new(gateway), clock, 20)
}

async fn signed_in() -> TestClient {
    let client = client();
    client.sign_in("me@example.com", "secret").await.unwrap();
    client
}

fn bob() -> UserId {
    UserId::from("bob")
}

fn ids(client: &TestClient) -> Vec<String> {
    client
        .read(|sync| {
            sync.messages(&bob())
                .iter()
                .map(|m| m.id.as_str().to_string())
                .collect()
        })
        .unwrap()
}

fn inbound(id: &str, from: &str, body: &str) -> Message {
    Message {
        id: MessageId::from(id),
        sender: UserId::from(from),
        receiver: UserId::from("me"),
        content: MessageContent::Text { body: body.into() },
        created_at: Utc.with_ymd_and_hms(2024, 3, 1, 9, 30, 0).unwrap(),
        read: false,
        read_at: None,
    }
}

#[tokio::test]
async fn history_pages_merge_oldest_first() {
    let client = signed_in().await;

    let added = client
        .select_conversation(UserSummary::unknown(bob()))
        .await
        .unwrap();
    assert_eq!(added, 2);
    assert_eq!(ids(&client), ["m2", "m3"]);

    assert_eq!(client.load_more(&bob()).await.unwrap(), 1);
    assert_eq!(ids(&client), ["m1", "m2", "m3"]);

    // The server said two pages; there is nothing further to ask for.
    assert_eq!(client.load_more(&bob()).await.unwrap(), 0);
}

#[tokio::test]
async fn confirmed_send_is_stored_once() {
    let client = signed_in().await;
    client
        .select_conversation(UserSummary::unknown(bob()))
        .await
        .unwrap();

    let sent = client.send_text(&bob(), "hello").await.unwrap();
    assert_eq!(sent.id, MessageId::from("m10"));
    assert!(client.pending(&bob()).is_empty());

    // The push echo of our own send arrives afterwards.
    client
        .apply(RealtimeEvent::MessageReceived(sent.clone()))
        .unwrap();
    assert_eq!(ids(&client), ["m2", "m3", "m10"]);
}

#[tokio::test]
async fn rejected_send_leaves_no_trace() {
    let client = signed_in().await;
    client
        .select_conversation(UserSummary::unknown(bob()))
        .await
        .unwrap();

    let err = client.send_text(&bob(), "fail").await.unwrap_err();

    assert!(matches!(
        err,
        ClientError::Api(ApiError::Status { status: 422, .. })
    ));
    assert!(client.pending(&bob()).is_empty());
    assert_eq!(ids(&client), ["m2", "m3"]);
}

#[tokio::test]
async fn refused_delete_is_rolled_back() {
    let client = signed_in().await;
    client
        .select_conversation(UserSummary::unknown(bob()))
        .await
        .unwrap();

    let err = client
        .delete_message(&MessageId::from("m2"))
        .await
        .unwrap_err();
    assert_eq!(err.to_string(), "forbidden (403): not yours");
    assert_eq!(ids(&client), ["m2", "m3"]);

    client.delete_message(&MessageId::from("m3")).await.unwrap();
    assert_eq!(ids(&client), ["m2"]);

    // A late echo of the deleted message must not bring it back.
    let mut echo = inbound("m3", "bob", "three");
    echo.created_at = Utc.with_ymd_and_hms(2024, 3, 1, 9, 3, 0).unwrap();
    client.apply(RealtimeEvent::MessageReceived(echo)).unwrap();
    assert_eq!(ids(&client), ["m2"]);
}

#[tokio::test]
async fn push_events_drive_unread_and_presence() {
    let client = signed_in().await;
    client.refresh_listings().await.unwrap();
    assert_eq!(client.read(|sync| sync.total_unread()).unwrap(), 2);

    client
        .apply(RealtimeEvent::MessageReceived(inbound("c1", "carol", "hey")))
        .unwrap();
    client
        .apply(RealtimeEvent::OnlineUsers(vec![UserId::from("carol")]))
        .unwrap();

    let carol = UserId::from("carol");
    client
        .read(|sync| {
            assert_eq!(sync.total_unread(), 3);
            assert_eq!(sync.is_online(&carol), Some(true));
            assert!(!sync.conversation(&bob()).unwrap().counterpart().is_online);
            assert_eq!(sync.sorted_conversations()[0].counterpart().id, carol);
        })
        .unwrap();

    client
        .apply(RealtimeEvent::TypingStarted {
            user_id: carol.clone(),
            username: Some("Carol".into()),
        })
        .unwrap();
    let typing = client
        .read(|sync| sync.typing(&carol).cloned())
        .unwrap()
        .unwrap();
    assert!(typing.is_typing);
    assert_eq!(typing.display_name.as_deref(), Some("Carol"));
}

#[tokio::test]
async fn mark_all_read_clears_the_badge() {
    let client = signed_in().await;
    client.refresh_listings().await.unwrap();
    client
        .apply(RealtimeEvent::MessageReceived(inbound("b9", "bob", "ping")))
        .unwrap();
    assert_eq!(client.read(|sync| sync.total_unread()).unwrap(), 3);

    client.mark_all_read(&bob()).await.unwrap();

    assert_eq!(client.read(|sync| sync.total_unread()).unwrap(), 0);
    let read = client
        .read(|sync| sync.messages(&bob()).iter().all(|m| m.read))
        .unwrap();
    assert!(read);
}

#[tokio::test]
async fn nothing_works_before_sign_in() {
    let client = client();

    assert!(matches!(
        client.load_history(&bob(), 1).await,
        Err(ClientError::NoSession)
    ));
    assert!(matches!(
        client.apply(RealtimeEvent::UserOnline { user_id: bob() }),
        Err(ClientError::NoSession)
    ));
    assert!(matches!(client.resume().await, Err(ClientError::NoSession)));
    assert!(client.profile().is_none());
}

#[tokio::test]
async fn sign_out_drops_state() {
    let client = signed_in().await;
    assert_eq!(client.profile().unwrap().id, UserId::from("me"));

    client.sign_out().await;

    assert!(client.profile().is_none());
    assert!(client.gateway().credential().is_none());
}

#[tokio::test]
async fn peer_read_receipt_marks_only_our_messages() {
    let client = signed_in().await;
    client
        .select_conversation(UserSummary::unknown(bob()))
        .await
        .unwrap();

    client
        .apply(RealtimeEvent::AllMessagesRead {
            reader: bob(),
            read_at: None,
        })
        .unwrap();

    let read: Vec<(String, bool)> = client
        .read(|sync| {
            sync.messages(&bob())
                .iter()
                .map(|m| (m.id.as_str().to_string(), m.read))
                .collect()
        })
        .unwrap();
    // m2 is ours to bob; m3 is bob's to us and stays unread.
    assert_eq!(read, [("m2".to_string(), true), ("m3".to_string(), false)]);
}
