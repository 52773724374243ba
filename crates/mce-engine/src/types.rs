//! ---
//! mce_section: "02-pipeline-data-model"
//! mce_subsection: "module"
//! mce_type: "source"
//! mce_scope: "code"
//! mce_description: "Pipeline message schema and retry work items."
//! mce_version: "v0.1.0"
//! mce_owner: "tbd"
//! ---
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

/// Total attempts the arbiter may spend on a single retry ticket.
pub const MAX_RETRY_ATTEMPTS: u32 = 2;

/// A raw message as produced by the upstream source API.
///
/// Field names follow the source wire schema; the body travels under the
/// wire name `message`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub id: String,
    pub source: String,
    pub title: String,
    pub creation_date: String,
    #[serde(rename = "message")]
    pub body: String,
    pub tags: Vec<String>,
    pub author: String,
}

/// A message the enrichment API has stamped with a processing date.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessedMessage {
    #[serde(flatten)]
    pub message: Message,
    pub processing_date: String,
}

impl ProcessedMessage {
    pub fn id(&self) -> &str {
        &self.message.id
    }
}

/// One page of the cursor-paginated source feed. A `null` cursor means the
/// feed has no continuation; it is distinct from cursor `0`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageBatch {
    pub results: Vec<Message>,
    pub cursor: Option<i64>,
}

/// Payload carried by a retry ticket. The variant doubles as the service
/// tag, so the arbiter's per-service branch is exhaustive by construction.
#[derive(Debug, Clone)]
pub enum RetryPayload {
    Processing(Message),
    Storage(ProcessedMessage),
}

impl RetryPayload {
    /// Stable identifier of the carried message. The only polymorphism a
    /// payload has to offer.
    pub fn message_id(&self) -> &str {
        match self {
            RetryPayload::Processing(message) => &message.id,
            RetryPayload::Storage(record) => record.id(),
        }
    }

    /// Service tag used in logs and metrics labels.
    pub fn service(&self) -> &'static str {
        match self {
            RetryPayload::Processing(_) => "processing",
            RetryPayload::Storage(_) => "storage",
        }
    }
}

/// Work item consumed by the retry arbiter.
#[derive(Debug)]
pub struct RetryTicket {
    pub(crate) attempts: u32,
    pub(crate) max_attempts: u32,
    pub(crate) payload: RetryPayload,
    /// Recovered records from processing retries are forwarded here.
    /// Storage tickets carry no reply path; their success is terminal.
    pub(crate) reply: Option<mpsc::Sender<ProcessedMessage>>,
}

impl RetryTicket {
    /// Ticket for a failed enrichment call. The recovered record is fed
    /// back into the processed stream through `reply`.
    pub fn processing(message: Message, reply: mpsc::Sender<ProcessedMessage>) -> Self {
        Self {
            attempts: 0,
            max_attempts: MAX_RETRY_ATTEMPTS,
            payload: RetryPayload::Processing(message),
            reply: Some(reply),
        }
    }

    /// Ticket for a failed storage call.
    pub fn storage(record: ProcessedMessage) -> Self {
        Self {
            attempts: 0,
            max_attempts: MAX_RETRY_ATTEMPTS,
            payload: RetryPayload::Storage(record),
            reply: None,
        }
    }

    pub fn message_id(&self) -> &str {
        self.payload.message_id()
    }

    pub fn service(&self) -> &'static str {
        self.payload.service()
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_message() -> Message {
        Message {
            id: "message-id-1".into(),
            source: "MessagingSystem".into(),
            title: "Message Title 1".into(),
            creation_date: "2030-08-24T17:16:52.228009".into(),
            body: "test message 1".into(),
            tags: vec!["random".into(), "tags".into()],
            author: "Test Author 1".into(),
        }
    }

    #[test]
    fn message_round_trips_through_json() {
        let message = sample_message();
        let json = serde_json::to_string(&message).expect("serialises");
        let back: Message = serde_json::from_str(&json).expect("deserialises");
        assert_eq!(message, back);
    }

    #[test]
    fn message_body_uses_wire_name() {
        let value = serde_json::to_value(sample_message()).expect("serialises");
        assert!(value.get("message").is_some());
        assert!(value.get("body").is_none());
        assert!(value.get("creation_date").is_some());
    }

    #[test]
    fn processed_message_flattens_and_round_trips() {
        let record = ProcessedMessage {
            message: sample_message(),
            processing_date: "2030-08-24T17:20:00.000000".into(),
        };
        let value = serde_json::to_value(&record).expect("serialises");
        assert_eq!(value["id"], "message-id-1");
        assert_eq!(value["processing_date"], "2030-08-24T17:20:00.000000");

        let back: ProcessedMessage =
            serde_json::from_value(value).expect("deserialises");
        assert_eq!(record, back);
    }

    #[test]
    fn batch_cursor_distinguishes_null_from_zero() {
        let with_null: MessageBatch =
            serde_json::from_str(r#"{"results": [], "cursor": null}"#).expect("parses");
        assert_eq!(with_null.cursor, None);

        let with_zero: MessageBatch =
            serde_json::from_str(r#"{"results": [], "cursor": 0}"#).expect("parses");
        assert_eq!(with_zero.cursor, Some(0));
    }

    #[test]
    fn ticket_exposes_id_and_service_tag() {
        let (reply, _keep) = mpsc::channel(1);
        let ticket = RetryTicket::processing(sample_message(), reply);
        assert_eq!(ticket.message_id(), "message-id-1");
        assert_eq!(ticket.service(), "processing");
        assert_eq!(ticket.attempts(), 0);

        let record = ProcessedMessage {
            message: sample_message(),
            processing_date: "T1".into(),
        };
        let ticket = RetryTicket::storage(record);
        assert_eq!(ticket.service(), "storage");
        assert!(ticket.reply.is_none());
    }
}
