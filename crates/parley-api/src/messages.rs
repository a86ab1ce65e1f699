use std::sync::Arc;

use bytes::Bytes;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use parley_session::{ApiRequest, CredentialStore, Transport, UploadPart, UploadProgress};
use parley_types::ApiError;
use parley_types::api::{
    Pagination, SendLinkRequest, SendTextRequest, WireConversation, WireMessage, paths,
    unwrap_envelope,
};
use parley_types::models::{
    ConversationSummary, HistoryPage, Message, MessageId, MessageKind, UserId,
};

use crate::client::ApiClient;

/// File attached to a media message.
#[derive(Debug, Clone)]
pub struct MediaUpload {
    pub kind: MessageKind,
    pub file_name: String,
    pub mime: String,
    pub data: Bytes,
}

impl<T, S> ApiClient<T, S>
where
    T: Transport,
    S: CredentialStore,
{
    pub async fn conversations(&self) -> Result<Vec<ConversationSummary>, ApiError> {
        let wire: Vec<WireConversation> = self
            .fetch(ApiRequest::get(paths::CONVERSATIONS), Some("conversations"))
            .await?;
        wire.into_iter().map(WireConversation::into_summary).collect()
    }

    /// One page of history with `counterpart`, oldest first.
    pub async fn history(
        &self,
        counterpart: &UserId,
        page: u32,
        limit: u32,
        cancel: Option<CancellationToken>,
    ) -> Result<HistoryPage, ApiError> {
        let mut request = ApiRequest::get(paths::history(counterpart))
            .query("page", page)
            .query("limit", limit);
        if let Some(token) = cancel {
            request = request.cancel_with(token);
        }
        let response = self.gateway().issue(request).await?;
        let page = history_page(response.body, page, limit)?;
        debug!(
            "History {} page {}: {} messages, more={}",
            counterpart,
            page.page,
            page.messages.len(),
            page.has_more
        );
        Ok(page)
    }

    pub async fn send_text(&self, counterpart: &UserId, content: &str) -> Result<Message, ApiError> {
        let request = ApiRequest::post(paths::send_message(MessageKind::Text, counterpart)).json(
            &SendTextRequest {
                content: content.to_string(),
            },
        )?;
        self.sent(request).await
    }

    pub async fn send_link(&self, counterpart: &UserId, url: &str) -> Result<Message, ApiError> {
        let request = ApiRequest::post(paths::send_message(MessageKind::Link, counterpart))
            .json(&SendLinkRequest {
                url: url.to_string(),
            })?;
        self.sent(request).await
    }

    /// Upload a file as an image, video, audio or document message.
    pub async fn send_media(
        &self,
        counterpart: &UserId,
        upload: MediaUpload,
        progress: Option<Arc<UploadProgress>>,
    ) -> Result<Message, ApiError> {
        if !upload.kind.is_upload() {
            return Err(ApiError::status(
                400,
                format!("{} messages are not uploads", upload.kind),
            ));
        }
        let request = ApiRequest::post(paths::send_message(upload.kind, counterpart)).upload(
            UploadPart {
                field: upload.kind.as_str().to_string(),
                file_name: upload.file_name,
                mime: upload.mime,
                data: upload.data,
                progress,
            },
        );
        self.sent(request).await
    }

    pub async fn mark_read(&self, message: &MessageId) -> Result<(), ApiError> {
        self.execute(ApiRequest::put(paths::mark_read(message))).await
    }

    pub async fn mark_all_read(&self, counterpart: &UserId) -> Result<(), ApiError> {
        self.execute(ApiRequest::put(paths::mark_all_read(counterpart)))
            .await
    }

    pub async fn delete_message(&self, message: &MessageId) -> Result<(), ApiError> {
        self.execute(ApiRequest::delete(paths::delete_message(message)))
            .await
    }

    async fn sent(&self, request: ApiRequest) -> Result<Message, ApiError> {
        let wire: WireMessage = self.fetch(request, Some("message")).await?;
        wire.into_message()
    }
}

/// Normalize a history response body.
///
/// Accepts a bare array, `{ data: [...] }`, `{ messages: [...] }` and
/// `{ data: { messages, pagination } }`, with `pagination` or `hasMore`
/// at either level. Without any paging hint a full page implies more.
pub fn history_page(body: Value, page: u32, limit: u32) -> Result<HistoryPage, ApiError> {
    let mut hints = PageHints::default();
    hints.collect(&body);

    let payload = unwrap_envelope(body, Some("messages"))?;
    hints.collect(&payload);
    let payload = match payload {
        Value::Object(mut map) => map.remove("messages").unwrap_or(Value::Array(Vec::new())),
        other => other,
    };

    let wire: Vec<WireMessage> = serde_json::from_value(payload)
        .map_err(|e| ApiError::Decode(format!("history page {}: {}", page, e)))?;
    let messages = wire
        .into_iter()
        .map(WireMessage::into_message)
        .collect::<Result<Vec<_>, _>>()?;

    let has_more = match (hints.total_pages, hints.has_more) {
        (None, None) => limit > 0 && messages.len() >= limit as usize,
        (total, flag) => total.is_some_and(|t| t > page) || flag.unwrap_or(false),
    };

    Ok(HistoryPage {
        page,
        messages,
        has_more,
    })
}

#[derive(Debug, Default)]
struct PageHints {
    total_pages: Option<u32>,
    has_more: Option<bool>,
}

impl PageHints {
    fn collect(&mut self, value: &Value) {
        let Value::Object(map) = value else {
            return;
        };
        if let Some(pagination) = map.get("pagination") {
            if let Ok(p) = serde_json::from_value::<Pagination>(pagination.clone()) {
                self.total_pages = self.total_pages.or(p.total_pages);
            }
        }
        if let Some(flag) = map.get("hasMore").and_then(Value::as_bool) {
            self.has_more = Some(flag);
        }
    }
}
