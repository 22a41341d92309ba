use async_nats::HeaderMap;
use bytes::Bytes;

/// Header carrying the publisher's message identifier
pub const MSG_ID_HEADER: &str = "Msg-Id";

/// JetStream's own deduplication header, used when `Msg-Id` is absent
pub const NATS_MSG_ID_HEADER: &str = "Nats-Msg-Id";

/// Request type for consuming a single NATS message through Tower.
///
/// This owns all the message data, allowing it to be passed through
/// Tower middleware layers and across task boundaries without lifetime concerns.
#[derive(Debug, Clone)]
pub struct ConsumeRequest {
    /// The NATS subject the message was published to
    pub subject: String,
    /// The message payload
    pub payload: Bytes,
    /// Optional headers (message id and trace context)
    pub headers: Option<HeaderMap>,
    /// How many times the broker has delivered this message, starting at 1
    pub delivery_attempt: Option<u64>,
}

impl ConsumeRequest {
    pub fn new(subject: String, payload: Bytes, headers: Option<HeaderMap>) -> Self {
        Self {
            subject,
            payload,
            headers,
            delivery_attempt: None,
        }
    }

    pub fn with_delivery_attempt(mut self, delivery_attempt: Option<u64>) -> Self {
        self.delivery_attempt = delivery_attempt;
        self
    }

    /// Message identifier from the `Msg-Id` header, falling back to `Nats-Msg-Id`.
    pub fn msg_id(&self) -> Option<String> {
        let headers = self.headers.as_ref()?;
        [MSG_ID_HEADER, NATS_MSG_ID_HEADER]
            .into_iter()
            .filter_map(|name| headers.get(name))
            .map(|value| value.as_str().trim())
            .find(|value| !value.is_empty())
            .map(str::to_string)
    }
}

/// How a consumed message is settled with the broker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeliveryOutcome {
    /// Processed successfully, never redeliver
    Ack,
    /// Transient failure, redeliver after a backoff
    Nak(Option<String>),
    /// Permanent failure, never redeliver
    Term(Option<String>),
}

impl DeliveryOutcome {
    pub fn ack() -> Self {
        Self::Ack
    }

    pub fn nak(reason: impl Into<String>) -> Self {
        Self::Nak(Some(reason.into()))
    }

    pub fn term(reason: impl Into<String>) -> Self {
        Self::Term(Some(reason.into()))
    }

    pub fn is_ack(&self) -> bool {
        matches!(self, Self::Ack)
    }

    pub fn is_nak(&self) -> bool {
        matches!(self, Self::Nak(_))
    }

    pub fn is_term(&self) -> bool {
        matches!(self, Self::Term(_))
    }

    pub fn reason(&self) -> Option<&str> {
        match self {
            Self::Ack => None,
            Self::Nak(reason) | Self::Term(reason) => reason.as_deref(),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Ack => "ack",
            Self::Nak(_) => "nak",
            Self::Term(_) => "term",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_consume_request_new() {
        let req = ConsumeRequest::new("test.subject".to_string(), Bytes::from("payload"), None);

        assert_eq!(req.subject, "test.subject");
        assert_eq!(req.payload, Bytes::from("payload"));
        assert!(req.headers.is_none());
        assert!(req.delivery_attempt.is_none());
        assert!(req.msg_id().is_none());
    }

    #[test]
    fn test_msg_id_prefers_msg_id_header() {
        let mut headers = HeaderMap::new();
        headers.insert(NATS_MSG_ID_HEADER, "nats-id");
        headers.insert(MSG_ID_HEADER, "upload-42");

        let req = ConsumeRequest::new("b_log.uploaded".to_string(), Bytes::new(), Some(headers));
        assert_eq!(req.msg_id().as_deref(), Some("upload-42"));
    }

    #[test]
    fn test_msg_id_falls_back_to_nats_msg_id() {
        let mut headers = HeaderMap::new();
        headers.insert(NATS_MSG_ID_HEADER, "nats-id");

        let req = ConsumeRequest::new("b_log.uploaded".to_string(), Bytes::new(), Some(headers));
        assert_eq!(req.msg_id().as_deref(), Some("nats-id"));
    }

    #[test]
    fn test_msg_id_ignores_blank_values() {
        let mut headers = HeaderMap::new();
        headers.insert(MSG_ID_HEADER, "  ");

        let req = ConsumeRequest::new("b_log.uploaded".to_string(), Bytes::new(), Some(headers));
        assert!(req.msg_id().is_none());
    }

    #[test]
    fn test_delivery_outcome_variants() {
        assert!(DeliveryOutcome::ack().is_ack());
        assert_eq!(DeliveryOutcome::ack().as_str(), "ack");

        let nak = DeliveryOutcome::nak("artifact missing");
        assert!(nak.is_nak());
        assert_eq!(nak.reason(), Some("artifact missing"));
        assert_eq!(nak.as_str(), "nak");

        let term = DeliveryOutcome::term("bad json");
        assert!(term.is_term());
        assert!(!term.is_nak());
        assert_eq!(term.reason(), Some("bad json"));
        assert_eq!(term.as_str(), "term");

        assert!(DeliveryOutcome::Nak(None).reason().is_none());
    }
}
