//! Mailbox types parsed from Gmail API response bodies

use base64::{
    engine::general_purpose::{STANDARD, URL_SAFE_NO_PAD},
    Engine as _,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{GmailError, Result};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageMetadata {
    pub id: String,
    pub thread_id: String,
    pub sender_email: String,
    pub sender_domain: String,
    pub sender_name: String,
    pub subject: String,
    pub recipients: Vec<String>,
    pub date_received: DateTime<Utc>,
    pub labels: Vec<String>,
    pub has_unsubscribe: bool,
    pub snippet: String,
    /// Plain-text body, present when the message was fetched in full format
    pub body: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LabelInfo {
    pub id: String,
    pub name: String,
    /// `system` or `user`
    pub label_type: Option<String>,
}

/// A file attached to a message, as referenced from its payload
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttachmentInfo {
    pub filename: String,
    pub attachment_id: String,
    pub mime_type: String,
    /// Size in bytes as reported by the provider
    pub size: u64,
}

/// One page of `messages.list`
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MessagePage {
    pub ids: Vec<String>,
    pub next_page_token: Option<String>,
}

fn str_field(value: &Value, key: &str) -> Option<String> {
    value.get(key).and_then(Value::as_str).map(str::to_string)
}

/// Parse a `messages.get` body into [`MessageMetadata`]
pub fn parse_message(msg: &Value) -> Result<MessageMetadata> {
    let id = str_field(msg, "id")
        .ok_or_else(|| GmailError::InvalidMessageFormat("Missing message ID".to_string()))?;

    let thread_id = str_field(msg, "threadId")
        .ok_or_else(|| GmailError::InvalidMessageFormat("Missing thread ID".to_string()))?;

    let labels = msg
        .get("labelIds")
        .and_then(Value::as_array)
        .map(|ids| {
            ids.iter()
                .filter_map(|id| id.as_str().map(str::to_string))
                .collect()
        })
        .unwrap_or_default();

    let payload = msg.get("payload");
    let headers = payload
        .and_then(|p| p.get("headers"))
        .and_then(Value::as_array)
        .map(Vec::as_slice)
        .unwrap_or_default();

    let mut sender_email = String::new();
    let mut sender_name = String::new();
    let mut subject = String::new();
    let mut recipients = Vec::new();
    let mut date_str = String::new();
    let mut has_unsubscribe = false;

    for header in headers {
        if let (Some(name), Some(value)) = (str_field(header, "name"), str_field(header, "value")) {
            match name.to_lowercase().as_str() {
                "from" => {
                    // Parse "Name <email@example.com>" format
                    if let Some((name_part, email_part)) = parse_email_header(&value) {
                        sender_name = name_part;
                        sender_email = email_part;
                    } else {
                        sender_email = value;
                    }
                }
                "subject" => subject = value,
                "to" | "cc" => recipients.push(value),
                "date" => date_str = value,
                "list-unsubscribe" => has_unsubscribe = true,
                _ => {}
            }
        }
    }

    let sender_domain = sender_email
        .split('@')
        .nth(1)
        .unwrap_or("")
        .to_string();

    let date_received = parse_date(&date_str)
        .ok()
        .or_else(|| internal_date(msg))
        .unwrap_or_else(Utc::now);

    Ok(MessageMetadata {
        id,
        thread_id,
        sender_email,
        sender_domain,
        sender_name,
        subject,
        recipients,
        date_received,
        labels,
        has_unsubscribe,
        snippet: str_field(msg, "snippet").unwrap_or_default(),
        body: payload.and_then(plain_text_body),
    })
}

/// Parse a `labels.list` body
pub fn parse_labels(response: &Value) -> Vec<LabelInfo> {
    response
        .get("labels")
        .and_then(Value::as_array)
        .map(|labels| labels.iter().filter_map(parse_label).collect())
        .unwrap_or_default()
}

/// Parse a single label resource, e.g. a `labels.create` body
pub fn parse_label(label: &Value) -> Option<LabelInfo> {
    Some(LabelInfo {
        id: str_field(label, "id")?,
        name: str_field(label, "name")?,
        label_type: str_field(label, "type"),
    })
}

/// Parse a `messages.list` body
pub fn parse_message_page(response: &Value) -> MessagePage {
    let ids = response
        .get("messages")
        .and_then(Value::as_array)
        .map(|messages| {
            messages
                .iter()
                .filter_map(|m| str_field(m, "id"))
                .collect()
        })
        .unwrap_or_default();

    MessagePage {
        ids,
        next_page_token: str_field(response, "nextPageToken"),
    }
}

/// Attachments referenced anywhere in a full-format message's part tree.
///
/// Only parts with both a filename and an attachment id count; inline
/// bodies small enough to travel in the message itself are skipped.
pub fn find_attachments(msg: &Value) -> Vec<AttachmentInfo> {
    let mut found = Vec::new();
    if let Some(payload) = msg.get("payload") {
        collect_attachments(payload, &mut found);
    }
    found
}

fn collect_attachments(part: &Value, found: &mut Vec<AttachmentInfo>) {
    let filename = str_field(part, "filename").filter(|name| !name.is_empty());
    let body = part.get("body");
    let attachment_id = body.and_then(|b| str_field(b, "attachmentId"));

    if let (Some(filename), Some(attachment_id)) = (filename, attachment_id) {
        found.push(AttachmentInfo {
            filename,
            attachment_id,
            mime_type: str_field(part, "mimeType").unwrap_or_default(),
            size: body
                .and_then(|b| b.get("size"))
                .and_then(Value::as_u64)
                .unwrap_or(0),
        });
    }

    if let Some(parts) = part.get("parts").and_then(Value::as_array) {
        for child in parts {
            collect_attachments(child, found);
        }
    }
}

/// Raw bytes of a `messages.attachments.get` body
pub fn decode_attachment(response: &Value) -> Result<Vec<u8>> {
    let data = response
        .get("data")
        .and_then(Value::as_str)
        .ok_or_else(|| GmailError::InvalidMessageFormat("Attachment has no data".to_string()))?;
    decode_base64(data)
        .ok_or_else(|| GmailError::InvalidMessageFormat("Attachment data is not base64".to_string()))
}

/// Parse email header in "Name <email@example.com>" format
fn parse_email_header(header: &str) -> Option<(String, String)> {
    let start = header.find('<')?;
    let end = header.find('>')?;
    if end < start {
        return None;
    }
    let name = header[..start].trim().trim_matches('"').to_string();
    let email = header[start + 1..end].trim().to_string();
    Some((name, email))
}

/// Parse RFC 2822 date string
fn parse_date(date_str: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc2822(date_str)
        .map(|dt| dt.with_timezone(&Utc))
        .or_else(|_| DateTime::parse_from_rfc3339(date_str).map(|dt| dt.with_timezone(&Utc)))
        .map_err(|e| GmailError::InvalidMessageFormat(format!("Invalid date format: {}", e)))
}

/// `internalDate` is milliseconds since epoch, serialized as a string
fn internal_date(msg: &Value) -> Option<DateTime<Utc>> {
    let raw = msg.get("internalDate")?;
    let millis = match raw {
        Value::String(s) => s.parse::<i64>().ok()?,
        other => other.as_i64()?,
    };
    DateTime::from_timestamp_millis(millis)
}

/// Decode base64url data, tolerating padding and the standard alphabet
fn decode_base64(data: &str) -> Option<Vec<u8>> {
    let trimmed = data.trim_end_matches('=');
    URL_SAFE_NO_PAD
        .decode(trimmed)
        .or_else(|_| STANDARD.decode(data))
        .ok()
}

fn decode_body_data(data: &str) -> Option<String> {
    let bytes = decode_base64(data)?;
    Some(String::from_utf8_lossy(&bytes).into_owned())
}

/// First text/plain body in the part tree, or the top-level body
fn plain_text_body(part: &Value) -> Option<String> {
    let mime_type = part.get("mimeType").and_then(Value::as_str).unwrap_or("");
    let data = part
        .get("body")
        .and_then(|b| b.get("data"))
        .and_then(Value::as_str);

    if let Some(data) = data {
        if mime_type.is_empty() || mime_type == "text/plain" {
            return decode_body_data(data);
        }
    }

    part.get("parts")
        .and_then(Value::as_array)?
        .iter()
        .find_map(plain_text_body)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn message_fixture() -> Value {
        json!({
            "id": "m1",
            "threadId": "t1",
            "labelIds": ["INBOX", "UNREAD"],
            "snippet": "Your order has shipped",
            "internalDate": "1700000000000",
            "payload": {
                "mimeType": "multipart/alternative",
                "headers": [
                    {"name": "From", "value": "\"Shop\" <orders@shop.example>"},
                    {"name": "To", "value": "me@example.com"},
                    {"name": "Subject", "value": "Order shipped"},
                    {"name": "Date", "value": "Tue, 14 Nov 2023 22:13:20 +0000"},
                    {"name": "List-Unsubscribe", "value": "<mailto:u@shop.example>"}
                ],
                "parts": [
                    {"mimeType": "text/html", "body": {"data": "PGI-aGk8L2I-"}},
                    {"mimeType": "text/plain", "body": {"data": "SGVsbG8gd29ybGQ"}}
                ]
            }
        })
    }

    #[test]
    fn test_parse_message() {
        let metadata = parse_message(&message_fixture()).unwrap();
        assert_eq!(metadata.id, "m1");
        assert_eq!(metadata.thread_id, "t1");
        assert_eq!(metadata.sender_email, "orders@shop.example");
        assert_eq!(metadata.sender_name, "Shop");
        assert_eq!(metadata.sender_domain, "shop.example");
        assert_eq!(metadata.subject, "Order shipped");
        assert_eq!(metadata.recipients, vec!["me@example.com"]);
        assert_eq!(metadata.labels, vec!["INBOX", "UNREAD"]);
        assert!(metadata.has_unsubscribe);
        assert_eq!(metadata.date_received.timestamp(), 1_700_000_000);
        assert_eq!(metadata.body.as_deref(), Some("Hello world"));
    }

    #[test]
    fn test_parse_message_missing_id() {
        let err = parse_message(&json!({"threadId": "t"})).unwrap_err();
        assert!(matches!(err, GmailError::InvalidMessageFormat(_)));
    }

    #[test]
    fn test_internal_date_fallback() {
        let msg = json!({"id": "a", "threadId": "b", "internalDate": "1700000000000"});
        let metadata = parse_message(&msg).unwrap();
        assert_eq!(metadata.date_received.timestamp(), 1_700_000_000);
        assert!(metadata.body.is_none());
    }

    #[test]
    fn test_find_attachments_walks_nested_parts() {
        let msg = json!({
            "id": "m1",
            "payload": {
                "mimeType": "multipart/mixed",
                "filename": "",
                "parts": [
                    {"mimeType": "text/plain", "filename": "", "body": {"data": "aGk"}},
                    {
                        "mimeType": "multipart/related",
                        "parts": [{
                            "mimeType": "image/png",
                            "filename": "logo.png",
                            "body": {"attachmentId": "att2", "size": 2048}
                        }]
                    },
                    {
                        "mimeType": "application/pdf",
                        "filename": "invoice.pdf",
                        "body": {"attachmentId": "att1", "size": 51200}
                    }
                ]
            }
        });

        let found = find_attachments(&msg);
        assert_eq!(found.len(), 2);
        assert_eq!(found[0].filename, "logo.png");
        assert_eq!(found[0].attachment_id, "att2");
        assert_eq!(found[1].mime_type, "application/pdf");
        assert_eq!(found[1].size, 51200);

        assert!(find_attachments(&json!({"id": "m2"})).is_empty());
    }

    #[test]
    fn test_decode_attachment_alphabets() {
        // 0xfb 0xff encodes as "-_8" in base64url and "+/8=" in standard
        assert_eq!(decode_attachment(&json!({"data": "-_8"})).unwrap(), vec![0xfb, 0xff]);
        assert_eq!(decode_attachment(&json!({"data": "+/8="})).unwrap(), vec![0xfb, 0xff]);
        assert!(matches!(
            decode_attachment(&json!({"size": 0})),
            Err(GmailError::InvalidMessageFormat(_))
        ));
    }

    #[test]
    fn test_parse_email_header() {
        assert_eq!(
            parse_email_header("Jane Doe <jane@example.com>"),
            Some(("Jane Doe".to_string(), "jane@example.com".to_string()))
        );
        assert_eq!(parse_email_header("jane@example.com"), None);
    }

    #[test]
    fn test_parse_labels_and_page() {
        let labels = parse_labels(&json!({
            "labels": [
                {"id": "INBOX", "name": "INBOX", "type": "system"},
                {"id": "Label_1", "name": "Receipts", "type": "user"},
                {"name": "no id"}
            ]
        }));
        assert_eq!(labels.len(), 2);
        assert_eq!(labels[1].name, "Receipts");

        let page = parse_message_page(&json!({
            "messages": [{"id": "a", "threadId": "x"}, {"id": "b", "threadId": "y"}],
            "nextPageToken": "p2"
        }));
        assert_eq!(page.ids, vec!["a", "b"]);
        assert_eq!(page.next_page_token.as_deref(), Some("p2"));
        assert_eq!(parse_message_page(&json!({})), MessagePage::default());
    }
}
