//! Typed mailbox operations built on the access layer
//!
//! Every call here goes through [`GmailAccessLayer`], so it is cached, rate
//! limited, quota checked and retried like any other request. Bulk mutations
//! go through the batch executor.

use chrono::{Duration as ChronoDuration, Utc};
use futures::stream::{self, StreamExt};
use std::sync::Arc;
use tracing::{debug, info};

use crate::access_layer::GmailAccessLayer;
use crate::error::{GmailError, Result};
use crate::models::{
    decode_attachment, find_attachments, parse_label, parse_labels, parse_message, parse_message_page,
    AttachmentInfo, LabelInfo, MessageMetadata,
};
use crate::request::{ensure_all_succeeded, MessageFormat, Operation, Outcome};

/// Page size for `messages.list` (the API allows up to 500)
const LIST_PAGE_SIZE: u32 = 100;

/// Concurrent message fetches
const FETCH_CONCURRENCY: usize = 20;

#[derive(Clone)]
pub struct Mailbox {
    layer: Arc<GmailAccessLayer>,
}

impl Mailbox {
    pub fn new(layer: Arc<GmailAccessLayer>) -> Self {
        Self { layer }
    }

    pub fn layer(&self) -> &GmailAccessLayer {
        &self.layer
    }

    /// List message ids matching `query`, following page tokens until
    /// `limit` ids are collected or the listing ends
    pub async fn list_message_ids(&self, query: &str, limit: Option<usize>) -> Result<Vec<String>> {
        let mut all_ids = Vec::new();
        let mut page_token: Option<String> = None;

        loop {
            let response = self
                .layer
                .call(Operation::ListMessages {
                    query: Some(query.to_string()),
                    label_ids: vec![],
                    max_results: LIST_PAGE_SIZE,
                    page_token: page_token.take(),
                })
                .await?;

            let page = parse_message_page(&response);
            all_ids.extend(page.ids);

            if let Some(limit) = limit {
                if all_ids.len() >= limit {
                    all_ids.truncate(limit);
                    break;
                }
            }

            page_token = page.next_page_token;
            if page_token.is_none() {
                break;
            }
        }

        debug!("Query {:?} matched {} messages", query, all_ids.len());
        Ok(all_ids)
    }

    /// Headers only
    pub async fn get_metadata(&self, id: &str) -> Result<MessageMetadata> {
        self.get_with_format(id, MessageFormat::Metadata).await
    }

    /// Headers plus decoded plain-text body
    pub async fn get_message(&self, id: &str) -> Result<MessageMetadata> {
        self.get_with_format(id, MessageFormat::Full).await
    }

    async fn get_with_format(&self, id: &str, format: MessageFormat) -> Result<MessageMetadata> {
        let response = self
            .layer
            .call(Operation::GetMessage {
                id: id.to_string(),
                format,
            })
            .await?;
        parse_message(&response)
    }

    /// Attachments referenced by a message; fetches the full payload
    pub async fn list_attachments(&self, id: &str) -> Result<Vec<AttachmentInfo>> {
        let response = self
            .layer
            .call(Operation::GetMessage {
                id: id.to_string(),
                format: MessageFormat::Full,
            })
            .await?;
        Ok(find_attachments(&response))
    }

    /// Raw bytes of one attachment
    pub async fn download_attachment(&self, message_id: &str, attachment_id: &str) -> Result<Vec<u8>> {
        let response = self
            .layer
            .call(Operation::GetAttachment {
                message_id: message_id.to_string(),
                attachment_id: attachment_id.to_string(),
            })
            .await?;
        let bytes = decode_attachment(&response)?;
        debug!(
            "Downloaded attachment {} of message {} ({} bytes)",
            attachment_id,
            message_id,
            bytes.len()
        );
        Ok(bytes)
    }

    /// Fetch up to `limit` messages received in the last `days` days, with bodies
    pub async fn fetch_recent(&self, days: i64, limit: usize) -> Result<Vec<MessageMetadata>> {
        let since = (Utc::now() - ChronoDuration::days(days)).format("%Y/%m/%d");
        let query = format!("after:{}", since);
        let ids = self.list_message_ids(&query, Some(limit)).await?;

        let messages: Vec<Result<MessageMetadata>> = stream::iter(ids)
            .map(|id| async move { self.get_message(&id).await })
            .buffered(FETCH_CONCURRENCY)
            .collect()
            .await;

        messages.into_iter().collect()
    }

    pub async fn list_labels(&self) -> Result<Vec<LabelInfo>> {
        let response = self.layer.call(Operation::ListLabels).await?;
        Ok(parse_labels(&response))
    }

    pub async fn create_label(&self, name: &str) -> Result<LabelInfo> {
        let response = self
            .layer
            .call(Operation::CreateLabel {
                name: name.to_string(),
            })
            .await?;
        parse_label(&response).ok_or_else(|| {
            GmailError::InvalidMessageFormat(format!("labels.create response missing id or name: {}", response))
        })
    }

    /// Find a label by name, creating it if missing
    pub async fn ensure_label(&self, name: &str) -> Result<LabelInfo> {
        if let Some(existing) = self
            .list_labels()
            .await?
            .into_iter()
            .find(|label| label.name.eq_ignore_ascii_case(name))
        {
            return Ok(existing);
        }
        info!("Creating label {:?}", name);
        self.create_label(name).await
    }

    /// Add `label_id` to a message, optionally taking it out of the inbox
    pub async fn move_message(&self, id: &str, label_id: &str, archive: bool) -> Result<()> {
        let remove_label_ids = if archive {
            vec!["INBOX".to_string()]
        } else {
            vec![]
        };
        self.layer
            .call(Operation::ModifyMessage {
                id: id.to_string(),
                add_label_ids: vec![label_id.to_string()],
                remove_label_ids,
            })
            .await?;
        Ok(())
    }

    /// Apply the same label change to many messages through the batch executor
    pub async fn relabel(&self, ids: &[String], add: &[String], remove: &[String]) -> Result<Vec<Outcome>> {
        let requests = ids
            .iter()
            .map(|id| {
                self.layer.request(Operation::ModifyMessage {
                    id: id.clone(),
                    add_label_ids: add.to_vec(),
                    remove_label_ids: remove.to_vec(),
                })
            })
            .collect();
        ensure_all_succeeded(self.layer.submit_batch(requests).await)
    }

    pub async fn trash_message(&self, id: &str) -> Result<()> {
        let request = self
            .layer
            .request(Operation::TrashMessage { id: id.to_string() })
            .with_idempotency_key(format!("trash:{}", id));
        self.layer.execute(request).await.into_result()?;
        Ok(())
    }

    /// Move every message matching `query` to the trash; returns how many were trashed
    pub async fn trash_matching(&self, query: &str) -> Result<usize> {
        let ids = self.list_message_ids(query, None).await?;
        let requests = ids
            .iter()
            .map(|id| {
                self.layer
                    .request(Operation::TrashMessage { id: id.clone() })
                    .with_idempotency_key(format!("trash:{}", id))
            })
            .collect();
        let outcomes = ensure_all_succeeded(self.layer.submit_batch(requests).await)?;
        info!("Trashed {} messages matching {:?}", outcomes.len(), query);
        Ok(outcomes.len())
    }

    /// Permanently delete every message matching `query`; returns how many were deleted
    pub async fn delete_matching(&self, query: &str) -> Result<usize> {
        let ids = self.list_message_ids(query, None).await?;
        let requests = ids
            .iter()
            .map(|id| {
                self.layer
                    .request(Operation::DeleteMessage { id: id.clone() })
                    .with_idempotency_key(format!("delete:{}", id))
            })
            .collect();
        let outcomes = ensure_all_succeeded(self.layer.submit_batch(requests).await)?;
        info!("Permanently deleted {} messages matching {:?}", outcomes.len(), query);
        Ok(outcomes.len())
    }

    /// Save an auto-generated reply as a draft; returns the draft id
    pub async fn save_draft_reply(
        &self,
        subject: &str,
        body: &str,
        thread_id: Option<&str>,
        to: Option<&str>,
    ) -> Result<String> {
        let response = self
            .layer
            .call(Operation::CreateDraft {
                thread_id: thread_id.map(str::to_string),
                to: to.map(str::to_string),
                subject: format!("Re: {}", subject),
                body: format!("Auto-generated reply:\n{}", body),
            })
            .await?;
        response
            .get("id")
            .and_then(|id| id.as_str())
            .map(str::to_string)
            .ok_or_else(|| GmailError::InvalidMessageFormat("drafts.create response missing id".to_string()))
    }
}
