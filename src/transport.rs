//! Downstream seam between the access layer and the Gmail API
//!
//! The access layer only needs two things from a transport: run one
//! [`Operation`], or run a homogeneous group of them as one provider batch
//! call and report a result per item. Errors must already be mapped into
//! [`GmailError`] so the retry policy can classify them.

use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use google_gmail1::api::{
    BatchDeleteMessagesRequest, BatchModifyMessagesRequest, Draft, Label, Message,
    ModifyMessageRequest,
};
use serde_json::{json, Value};
use std::future::Future;
use std::io::Cursor;
use std::time::Duration;
use tracing::{debug, warn};

use crate::auth::GmailHub;
use crate::error::{GmailError, Result};
use crate::request::{BatchKey, Operation};

const SCOPE_MODIFY: &str = "https://www.googleapis.com/auth/gmail.modify";
const SCOPE_LABELS: &str = "https://www.googleapis.com/auth/gmail.labels";
const SCOPE_FULL: &str = "https://mail.google.com/";

/// Concurrent per-item calls for groups without a batch endpoint
const PER_ITEM_CONCURRENCY: usize = 10;

/// Transport used by the access layer. Implementations must be safe to call
/// concurrently from many tasks.
#[async_trait]
pub trait GmailTransport: Send + Sync {
    /// Execute a single operation and return the provider's response body
    async fn call(&self, operation: &Operation) -> Result<Value>;

    /// Execute operations sharing `key` as one provider batch call.
    ///
    /// `Err` means the whole call failed and no item took effect; `Ok` carries
    /// exactly one result per operation, in order.
    async fn call_batch(&self, key: &BatchKey, operations: &[Operation]) -> Result<Vec<Result<Value>>>;
}

/// Production transport over the `google-gmail1` hub
pub struct GmailApiTransport {
    hub: GmailHub,
    user_id: String,
    call_timeout: Duration,
}

impl GmailApiTransport {
    pub fn new(hub: GmailHub) -> Self {
        Self {
            hub,
            user_id: "me".to_string(),
            call_timeout: Duration::from_secs(30),
        }
    }

    pub fn with_call_timeout(mut self, timeout: Duration) -> Self {
        self.call_timeout = timeout;
        self
    }

    /// Wrap an API call in a timeout to prevent indefinite hangs
    async fn timed<T, F>(&self, method: &str, call: F) -> Result<T>
    where
        F: Future<Output = std::result::Result<T, google_gmail1::Error>>,
    {
        match tokio::time::timeout(self.call_timeout, call).await {
            Ok(result) => result.map_err(GmailError::from),
            Err(_) => {
                warn!("Gmail API {} call timed out after {:?}", method, self.call_timeout);
                Err(GmailError::NetworkError(format!(
                    "{} timed out after {:?}",
                    method, self.call_timeout
                )))
            }
        }
    }

    fn non_empty(ids: &[String]) -> Option<Vec<String>> {
        if ids.is_empty() {
            None
        } else {
            Some(ids.to_vec())
        }
    }
}

/// Minimal RFC 822 message for a draft
fn rfc822(to: Option<&str>, subject: &str, body: &str) -> Vec<u8> {
    let mut raw = String::new();
    if let Some(to) = to {
        raw.push_str(&format!("To: {}\r\n", to));
    }
    raw.push_str(&format!("Subject: {}\r\n", subject));
    raw.push_str("Content-Type: text/plain; charset=\"UTF-8\"\r\n\r\n");
    raw.push_str(body);
    raw.into_bytes()
}

#[async_trait]
impl GmailTransport for GmailApiTransport {
    async fn call(&self, operation: &Operation) -> Result<Value> {
        let users = self.hub.users();
        let user = self.user_id.as_str();
        debug!("Dispatching {}", operation.method());

        match operation {
            Operation::ListMessages {
                query,
                label_ids,
                max_results,
                page_token,
            } => {
                let mut call = users.messages_list(user).max_results(*max_results);
                if let Some(query) = query {
                    call = call.q(query);
                }
                for label in label_ids {
                    call = call.add_label_ids(label);
                }
                if let Some(token) = page_token {
                    call = call.page_token(token);
                }
                let (_, response) = self
                    .timed("messages.list", call.add_scope(SCOPE_MODIFY).doit())
                    .await?;
                Ok(serde_json::to_value(response)?)
            }
            Operation::GetMessage { id, format } => {
                let call = users
                    .messages_get(user, id)
                    .format(format.as_str())
                    .add_scope(SCOPE_MODIFY);
                let (_, message) = self.timed("messages.get", call.doit()).await?;
                Ok(serde_json::to_value(message)?)
            }
            Operation::GetAttachment {
                message_id,
                attachment_id,
            } => {
                let call = users
                    .messages_attachments_get(user, message_id, attachment_id)
                    .add_scope(SCOPE_MODIFY);
                let (_, body) = self.timed("messages.attachments.get", call.doit()).await?;
                Ok(serde_json::to_value(body)?)
            }
            Operation::ListLabels => {
                let call = users.labels_list(user).add_scope(SCOPE_LABELS);
                let (_, response) = self.timed("labels.list", call.doit()).await?;
                Ok(serde_json::to_value(response)?)
            }
            Operation::ModifyMessage {
                id,
                add_label_ids,
                remove_label_ids,
            } => {
                let request = ModifyMessageRequest {
                    add_label_ids: Self::non_empty(add_label_ids),
                    remove_label_ids: Self::non_empty(remove_label_ids),
                };
                let call = users
                    .messages_modify(request, user, id)
                    .add_scope(SCOPE_MODIFY);
                let (_, message) = self.timed("messages.modify", call.doit()).await?;
                Ok(serde_json::to_value(message)?)
            }
            Operation::TrashMessage { id } => {
                let call = users.messages_trash(user, id).add_scope(SCOPE_MODIFY);
                let (_, message) = self.timed("messages.trash", call.doit()).await?;
                Ok(serde_json::to_value(message)?)
            }
            Operation::DeleteMessage { id } => {
                let call = users.messages_delete(user, id).add_scope(SCOPE_FULL);
                self.timed("messages.delete", call.doit()).await?;
                Ok(json!({ "id": id }))
            }
            Operation::CreateLabel { name } => {
                let label = Label {
                    name: Some(name.clone()),
                    label_list_visibility: Some("labelShow".to_string()),
                    message_list_visibility: Some("show".to_string()),
                    ..Default::default()
                };
                let call = users.labels_create(label, user).add_scope(SCOPE_LABELS);
                let (_, created) = self.timed("labels.create", call.doit()).await?;
                Ok(serde_json::to_value(created)?)
            }
            Operation::CreateDraft {
                thread_id,
                to,
                subject,
                body,
            } => {
                let draft = Draft {
                    message: Some(Message {
                        thread_id: thread_id.clone(),
                        ..Default::default()
                    }),
                    ..Default::default()
                };
                let mime_type: mime::Mime = "message/rfc822"
                    .parse()
                    .map_err(|e| GmailError::InvalidMessageFormat(format!("{}", e)))?;
                let raw = Cursor::new(rfc822(to.as_deref(), subject, body));
                let call = users
                    .drafts_create(draft, user)
                    .add_scope(SCOPE_MODIFY)
                    .upload(raw, mime_type);
                let (_, created) = self.timed("drafts.create", call).await?;
                Ok(serde_json::to_value(created)?)
            }
        }
    }

    async fn call_batch(&self, key: &BatchKey, operations: &[Operation]) -> Result<Vec<Result<Value>>> {
        let ids: Vec<String> = operations
            .iter()
            .filter_map(|op| op.message_id().map(str::to_string))
            .collect();
        if ids.len() != operations.len() {
            return Err(GmailError::BadRequest(format!(
                "batch {} contains operations without a message id",
                key
            )));
        }

        let users = self.hub.users();
        let user = self.user_id.as_str();
        debug!("Dispatching {} batch of {} messages", key, ids.len());

        match key {
            BatchKey::Modify { add, remove } => {
                let request = BatchModifyMessagesRequest {
                    ids: Some(ids.clone()),
                    add_label_ids: Self::non_empty(add),
                    remove_label_ids: Self::non_empty(remove),
                };
                let call = users
                    .messages_batch_modify(request, user)
                    .add_scope(SCOPE_MODIFY);
                self.timed("messages.batchModify", call.doit()).await?;
                Ok(ids.into_iter().map(|id| Ok(json!({ "id": id }))).collect())
            }
            BatchKey::Delete => {
                let request = BatchDeleteMessagesRequest { ids: Some(ids.clone()) };
                let call = users
                    .messages_batch_delete(request, user)
                    .add_scope(SCOPE_FULL);
                self.timed("messages.batchDelete", call.doit()).await?;
                Ok(ids.into_iter().map(|id| Ok(json!({ "id": id }))).collect())
            }
            BatchKey::Trash => {
                // No batch endpoint for trash: issue the group concurrently, keep order
                let results = stream::iter(operations.iter().cloned())
                    .map(|op| async move { self.call(&op).await })
                    .buffered(PER_ITEM_CONCURRENCY)
                    .collect::<Vec<_>>()
                    .await;
                Ok(results)
            }
        }
    }
}
