//! Common test utilities and fixtures

#![allow(dead_code)]

use async_trait::async_trait;
use gmail_access::config::Config;
use gmail_access::error::{GmailError, Result};
use gmail_access::request::{BatchKey, Operation};
use gmail_access::transport::GmailTransport;
use gmail_access::GmailAccessLayer;
use mockall::mock;
use serde_json::{json, Value};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::Notify;

// Mock implementation of GmailTransport for testing
mock! {
    pub Transport {}

    #[async_trait::async_trait]
    impl GmailTransport for Transport {
        async fn call(&self, operation: &Operation) -> Result<Value>;
        async fn call_batch(&self, key: &BatchKey, operations: &[Operation]) -> Result<Vec<Result<Value>>>;
    }
}

/// Create mock Gmail API message response (JSON)
pub fn mock_gmail_message_response(id: &str, from: &str, subject: &str) -> Value {
    json!({
        "id": id,
        "threadId": format!("thread_{}", id),
        "labelIds": ["INBOX", "UNREAD"],
        "snippet": "Email snippet...",
        "internalDate": "1700000000000",
        "payload": {
            "mimeType": "text/plain",
            "headers": [
                {"name": "From", "value": from},
                {"name": "To", "value": "me@example.com"},
                {"name": "Subject", "value": subject},
                {"name": "Date", "value": "Tue, 14 Nov 2023 22:13:20 +0000"}
            ]
        }
    })
}

/// Transport with scripted responses and a record of every call.
///
/// Scripted results are consumed first; once a script is empty, calls get a
/// plausible default response for their operation.
#[derive(Default)]
pub struct FakeTransport {
    singles: Mutex<VecDeque<Result<Value>>>,
    batches: Mutex<VecDeque<Result<Vec<Result<Value>>>>>,
    /// Every single call, in order
    pub calls: Mutex<Vec<Operation>>,
    /// Item count of every batch call, in order
    pub batch_sizes: Mutex<Vec<usize>>,
    /// Pages returned for `messages.list`, keyed by incoming page token
    pages: Mutex<Vec<(Option<String>, Value)>>,
    labels: Mutex<Vec<Value>>,
    /// `messages.attachments.get` bodies keyed by attachment id
    attachments: Mutex<Vec<(String, Value)>>,
}

impl FakeTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn push_single(&self, result: Result<Value>) {
        self.singles.lock().unwrap().push_back(result);
    }

    pub fn push_batch(&self, result: Result<Vec<Result<Value>>>) {
        self.batches.lock().unwrap().push_back(result);
    }

    /// Serve `ids` for a list call carrying `token`, pointing at `next`
    pub fn add_page(&self, token: Option<&str>, ids: &[&str], next: Option<&str>) {
        let messages: Vec<Value> = ids.iter().map(|id| json!({"id": id, "threadId": id})).collect();
        let mut page = json!({ "messages": messages });
        if let Some(next) = next {
            page["nextPageToken"] = json!(next);
        }
        self.pages
            .lock()
            .unwrap()
            .push((token.map(str::to_string), page));
    }

    pub fn add_label(&self, id: &str, name: &str) {
        self.labels
            .lock()
            .unwrap()
            .push(json!({"id": id, "name": name, "type": "user"}));
    }

    /// Serve `data` (already base64url encoded) for `attachment_id`
    pub fn add_attachment(&self, attachment_id: &str, data: &str, size: u64) {
        self.attachments.lock().unwrap().push((
            attachment_id.to_string(),
            json!({"attachmentId": attachment_id, "size": size, "data": data}),
        ));
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }

    pub fn calls_for(&self, method: &str) -> usize {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|op| op.method() == method)
            .count()
    }

    pub fn batch_call_count(&self) -> usize {
        self.batch_sizes.lock().unwrap().len()
    }

    fn default_response(&self, operation: &Operation) -> Result<Value> {
        match operation {
            Operation::GetMessage { id, .. } => Ok(mock_gmail_message_response(
                id,
                "Sender <sender@example.com>",
                &format!("Subject {}", id),
            )),
            Operation::ListMessages { page_token, .. } => Ok(self
                .pages
                .lock()
                .unwrap()
                .iter()
                .find(|(token, _)| token == page_token)
                .map(|(_, page)| page.clone())
                .unwrap_or_else(|| json!({}))),
            Operation::ListLabels => Ok(json!({ "labels": self.labels.lock().unwrap().clone() })),
            Operation::GetAttachment { attachment_id, .. } => Ok(self
                .attachments
                .lock()
                .unwrap()
                .iter()
                .find(|(id, _)| id == attachment_id)
                .map(|(_, body)| body.clone())
                .unwrap_or_else(|| json!({ "size": 0 }))),
            Operation::CreateLabel { name } => {
                let label = json!({"id": format!("Label_{}", name), "name": name, "type": "user"});
                self.labels.lock().unwrap().push(label.clone());
                Ok(label)
            }
            Operation::CreateDraft { .. } => Ok(json!({"id": "draft_1", "message": {"id": "m_draft"}})),
            Operation::ModifyMessage { id, .. }
            | Operation::TrashMessage { id }
            | Operation::DeleteMessage { id } => Ok(json!({ "id": id })),
        }
    }
}

#[async_trait]
impl GmailTransport for FakeTransport {
    async fn call(&self, operation: &Operation) -> Result<Value> {
        self.calls.lock().unwrap().push(operation.clone());
        let scripted = self.singles.lock().unwrap().pop_front();
        match scripted {
            Some(result) => result,
            None => self.default_response(operation),
        }
    }

    async fn call_batch(&self, _key: &BatchKey, operations: &[Operation]) -> Result<Vec<Result<Value>>> {
        self.batch_sizes.lock().unwrap().push(operations.len());
        let scripted = self.batches.lock().unwrap().pop_front();
        match scripted {
            Some(result) => result,
            None => Ok(operations
                .iter()
                .map(|op| Ok(json!({ "id": op.message_id().unwrap_or_default() })))
                .collect()),
        }
    }
}

/// Transport that parks the first call of one method until released.
///
/// Every `messages.modify` bumps a label version; message reads report the
/// version current when they reached the transport.
pub struct GatedTransport {
    held_method: &'static str,
    held: AtomicBool,
    labels_version: AtomicU64,
    /// Notified once the held call has reached the transport
    pub arrived: Notify,
    /// Lets the held call return
    pub release: Notify,
    pub calls: Mutex<Vec<Operation>>,
}

impl GatedTransport {
    pub fn new(held_method: &'static str) -> Arc<Self> {
        Arc::new(Self {
            held_method,
            held: AtomicBool::new(false),
            labels_version: AtomicU64::new(0),
            arrived: Notify::new(),
            release: Notify::new(),
            calls: Mutex::new(Vec::new()),
        })
    }

    pub fn calls_for(&self, method: &str) -> usize {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|op| op.method() == method)
            .count()
    }
}

#[async_trait]
impl GmailTransport for GatedTransport {
    async fn call(&self, operation: &Operation) -> Result<Value> {
        self.calls.lock().unwrap().push(operation.clone());
        if let Operation::ModifyMessage { .. } = operation {
            self.labels_version.fetch_add(1, Ordering::SeqCst);
        }
        let version = self.labels_version.load(Ordering::SeqCst);

        if operation.method() == self.held_method && !self.held.swap(true, Ordering::SeqCst) {
            self.arrived.notify_one();
            self.release.notified().await;
        }

        Ok(json!({
            "id": operation.message_id().unwrap_or_default(),
            "labels_version": version,
        }))
    }

    async fn call_batch(&self, _key: &BatchKey, operations: &[Operation]) -> Result<Vec<Result<Value>>> {
        let mut results = Vec::with_capacity(operations.len());
        for operation in operations {
            results.push(self.call(operation).await);
        }
        Ok(results)
    }
}

/// Defaults with fast, deterministic retries
pub fn test_config() -> Config {
    let mut config = Config::default();
    config.retry.base_delay_ms = 10;
    config.retry.max_delay_ms = 200;
    config.retry.jitter = false;
    config
}

pub async fn build_layer(transport: Arc<dyn GmailTransport>, config: Config) -> GmailAccessLayer {
    GmailAccessLayer::new(transport, config).await.unwrap()
}

pub fn server_error() -> GmailError {
    GmailError::ServerError {
        status: 503,
        message: "Service unavailable".to_string(),
    }
}

pub fn get_message(id: &str) -> Operation {
    Operation::GetMessage {
        id: id.to_string(),
        format: gmail_access::MessageFormat::Full,
    }
}

pub fn add_label(id: &str, label: &str) -> Operation {
    Operation::ModifyMessage {
        id: id.to_string(),
        add_label_ids: vec![label.to_string()],
        remove_label_ids: vec![],
    }
}
