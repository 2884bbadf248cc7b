use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A logical channel multiplexed over the single realtime connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Topic {
    Status,
    Progress,
    Record,
    Error,
    Success,
    /// Routed by `data.action` rather than `type`.
    VerificationCodeRequired,
}

impl Topic {
    pub const ALL: [Topic; 6] = [
        Topic::Status,
        Topic::Progress,
        Topic::Record,
        Topic::Error,
        Topic::Success,
        Topic::VerificationCodeRequired,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Topic::Status => "status",
            Topic::Progress => "progress",
            Topic::Record => "record",
            Topic::Error => "error",
            Topic::Success => "success",
            Topic::VerificationCodeRequired => "verification_code_required",
        }
    }

    pub fn parse(name: &str) -> Option<Topic> {
        Topic::ALL.into_iter().find(|t| t.as_str() == name)
    }
}

impl std::fmt::Display for Topic {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Wire wrapper `{ type, data, timestamp }` for one topic payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope<T = Value> {
    #[serde(rename = "type")]
    pub topic: Topic,
    pub data: T,
    pub timestamp: i64,
}

impl<T> Envelope<T> {
    /// Wraps `data` stamped with the current epoch-ms time.
    pub fn now(topic: Topic, data: T) -> Self {
        Self {
            topic,
            data,
            timestamp: chrono::Utc::now().timestamp_millis(),
        }
    }
}

/// Inbound frame before the topic name is resolved.
#[derive(Debug, Deserialize)]
struct InboundFrame {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    data: Value,
    #[serde(default)]
    timestamp: Option<i64>,
}

/// Outcome of decoding one text frame.
#[derive(Debug, PartialEq)]
pub enum Decoded {
    Message(Envelope),
    /// Well-formed frame whose `type` names no known topic.
    UnknownTopic(String),
}

impl Envelope {
    /// Decodes a text frame. `Err` means the payload is malformed.
    pub fn decode(text: &str) -> Result<Decoded, serde_json::Error> {
        let frame: InboundFrame = serde_json::from_str(text)?;
        Ok(match Topic::parse(&frame.kind) {
            Some(topic) => Decoded::Message(Envelope {
                topic,
                data: frame.data,
                timestamp: frame.timestamp.unwrap_or_default(),
            }),
            None => Decoded::UnknownTopic(frame.kind),
        })
    }

    /// Topic named by `data.action`, if the payload carries one we know.
    pub fn action_topic(&self) -> Option<Topic> {
        self.data
            .get("action")
            .and_then(Value::as_str)
            .and_then(Topic::parse)
    }
}
