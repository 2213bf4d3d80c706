//! Typed requests flowing through the access layer and the outcomes they resolve to

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use uuid::Uuid;

use crate::config::CostConfig;
use crate::error::{GmailError, Result};

/// Gmail message representation to request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum MessageFormat {
    /// Only ids and labels
    Minimal,
    /// Headers without body
    #[default]
    Metadata,
    /// Full payload including body parts
    Full,
}

impl MessageFormat {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageFormat::Minimal => "minimal",
            MessageFormat::Metadata => "metadata",
            MessageFormat::Full => "full",
        }
    }
}

/// Whether an operation reads, mutates, or removes remote state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationKind {
    Read,
    Write,
    Delete,
}

impl OperationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            OperationKind::Read => "read",
            OperationKind::Write => "write",
            OperationKind::Delete => "delete",
        }
    }

    pub fn is_read(&self) -> bool {
        matches!(self, OperationKind::Read)
    }
}

/// A single logical Gmail API call
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "method", rename_all = "snake_case")]
pub enum Operation {
    ListMessages {
        query: Option<String>,
        label_ids: Vec<String>,
        max_results: u32,
        page_token: Option<String>,
    },
    GetMessage {
        id: String,
        format: MessageFormat,
    },
    ListLabels,
    GetAttachment {
        message_id: String,
        attachment_id: String,
    },
    ModifyMessage {
        id: String,
        add_label_ids: Vec<String>,
        remove_label_ids: Vec<String>,
    },
    TrashMessage {
        id: String,
    },
    DeleteMessage {
        id: String,
    },
    CreateLabel {
        name: String,
    },
    CreateDraft {
        thread_id: Option<String>,
        to: Option<String>,
        subject: String,
        body: String,
    },
}

impl Operation {
    /// Gmail API method name, used for cost lookup and usage stats
    pub fn method(&self) -> &'static str {
        match self {
            Operation::ListMessages { .. } => "messages.list",
            Operation::GetMessage { .. } => "messages.get",
            Operation::ListLabels => "labels.list",
            Operation::GetAttachment { .. } => "messages.attachments.get",
            Operation::ModifyMessage { .. } => "messages.modify",
            Operation::TrashMessage { .. } => "messages.trash",
            Operation::DeleteMessage { .. } => "messages.delete",
            Operation::CreateLabel { .. } => "labels.create",
            Operation::CreateDraft { .. } => "drafts.create",
        }
    }

    pub fn kind(&self) -> OperationKind {
        match self {
            Operation::ListMessages { .. }
            | Operation::GetMessage { .. }
            | Operation::ListLabels
            | Operation::GetAttachment { .. } => OperationKind::Read,
            Operation::ModifyMessage { .. }
            | Operation::CreateLabel { .. }
            | Operation::CreateDraft { .. } => OperationKind::Write,
            Operation::TrashMessage { .. } | Operation::DeleteMessage { .. } => {
                OperationKind::Delete
            }
        }
    }

    /// Resource path this operation addresses, e.g. `messages/abc` or `labels`
    pub fn resource(&self) -> String {
        match self {
            Operation::ListMessages { .. } => "messages".to_string(),
            Operation::GetMessage { id, .. }
            | Operation::ModifyMessage { id, .. }
            | Operation::TrashMessage { id }
            | Operation::DeleteMessage { id } => format!("messages/{}", id),
            Operation::GetAttachment {
                message_id,
                attachment_id,
            } => format!("messages/{}/attachments/{}", message_id, attachment_id),
            Operation::ListLabels | Operation::CreateLabel { .. } => "labels".to_string(),
            Operation::CreateDraft { .. } => "drafts".to_string(),
        }
    }

    /// Message id targeted by a per-message operation
    pub fn message_id(&self) -> Option<&str> {
        match self {
            Operation::GetMessage { id, .. }
            | Operation::ModifyMessage { id, .. }
            | Operation::TrashMessage { id }
            | Operation::DeleteMessage { id } => Some(id),
            Operation::GetAttachment { message_id, .. } => Some(message_id),
            _ => None,
        }
    }

    /// Compatibility key for the provider's batch endpoints, `None` when the
    /// operation must be dispatched on its own
    pub fn batch_key(&self) -> Option<BatchKey> {
        match self {
            Operation::ModifyMessage {
                add_label_ids,
                remove_label_ids,
                ..
            } => {
                let mut add = add_label_ids.clone();
                let mut remove = remove_label_ids.clone();
                add.sort();
                add.dedup();
                remove.sort();
                remove.dedup();
                Some(BatchKey::Modify { add, remove })
            }
            Operation::TrashMessage { .. } => Some(BatchKey::Trash),
            Operation::DeleteMessage { .. } => Some(BatchKey::Delete),
            _ => None,
        }
    }
}

/// Groups operations that one provider batch call can carry together
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum BatchKey {
    /// `messages.batchModify` with identical label changes
    Modify {
        add: Vec<String>,
        remove: Vec<String>,
    },
    /// Trash has no batch endpoint; items go out together but succeed per item
    Trash,
    /// `messages.batchDelete`
    Delete,
}

impl fmt::Display for BatchKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BatchKey::Modify { add, remove } => {
                write!(f, "modify(+[{}] -[{}])", add.join(","), remove.join(","))
            }
            BatchKey::Trash => write!(f, "trash"),
            BatchKey::Delete => write!(f, "delete"),
        }
    }
}

/// Cache key derived from operation kind and parameters.
///
/// The key is the canonical serialized request itself rather than a digest,
/// so two requests share a fingerprint only if their parameters are equal.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Fingerprint(String);

impl Fingerprint {
    pub fn of(kind: OperationKind, operation: &Operation) -> Self {
        let params = serde_json::to_string(operation).unwrap_or_else(|_| format!("{:?}", operation));
        Fingerprint(format!("{}:{}", kind.as_str(), params))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// One logical action handed to the access layer. Immutable once built.
#[derive(Debug, Clone)]
pub struct Request {
    id: Uuid,
    operation: Operation,
    kind: OperationKind,
    idempotency_key: Option<String>,
    cost: u32,
}

impl Request {
    /// Build a request with an explicit cost estimate in quota units
    pub fn new(operation: Operation, cost: u32) -> Self {
        Self {
            id: Uuid::new_v4(),
            kind: operation.kind(),
            operation,
            idempotency_key: None,
            cost,
        }
    }

    /// Build a request costed from the default cost table
    pub fn with_default_cost(operation: Operation) -> Self {
        let cost = CostConfig::default().units_for(&operation);
        Self::new(operation, cost)
    }

    /// Attach an idempotency key; retried writes that find their effect
    /// already applied then count as success
    pub fn with_idempotency_key(mut self, key: impl Into<String>) -> Self {
        self.idempotency_key = Some(key.into());
        self
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn operation(&self) -> &Operation {
        &self.operation
    }

    pub fn kind(&self) -> OperationKind {
        self.kind
    }

    pub fn idempotency_key(&self) -> Option<&str> {
        self.idempotency_key.as_deref()
    }

    pub fn cost(&self) -> u32 {
        self.cost
    }

    pub fn method(&self) -> &'static str {
        self.operation.method()
    }

    pub fn resource(&self) -> String {
        self.operation.resource()
    }

    pub fn fingerprint(&self) -> Fingerprint {
        Fingerprint::of(self.kind, &self.operation)
    }
}

/// Final result for one request: exactly one per submitted request
#[derive(Debug, Clone)]
pub struct Outcome {
    pub request: Request,
    pub result: std::result::Result<Value, GmailError>,
    /// Transport attempts made for this request (0 for cache hits and local rejections)
    pub attempts: u32,
    pub served_from_cache: bool,
}

impl Outcome {
    pub fn success(request: Request, value: Value, attempts: u32) -> Self {
        Self {
            request,
            result: Ok(value),
            attempts,
            served_from_cache: false,
        }
    }

    pub fn failure(request: Request, error: GmailError, attempts: u32) -> Self {
        Self {
            request,
            result: Err(error),
            attempts,
            served_from_cache: false,
        }
    }

    pub fn cached(request: Request, value: Value) -> Self {
        Self {
            request,
            result: Ok(value),
            attempts: 0,
            served_from_cache: true,
        }
    }

    pub fn is_success(&self) -> bool {
        self.result.is_ok()
    }

    pub fn value(&self) -> Option<&Value> {
        self.result.as_ref().ok()
    }

    pub fn error(&self) -> Option<&GmailError> {
        self.result.as_ref().err()
    }

    pub fn into_result(self) -> Result<Value> {
        self.result
    }
}

/// Turn a batch's outcome list into an error when any item failed.
///
/// The error carries the full list so callers can tell which items succeeded.
pub fn ensure_all_succeeded(outcomes: Vec<Outcome>) -> Result<Vec<Outcome>> {
    let failed = outcomes.iter().filter(|o| !o.is_success()).count();
    if failed == 0 {
        Ok(outcomes)
    } else {
        Err(GmailError::BatchPartialFailure { failed, outcomes })
    }
}
