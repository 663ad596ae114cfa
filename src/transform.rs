//! Payload transform.
//!
//! Pure encode/decode between typed payloads plus metadata and the wire
//! representation (bytes + AMQP basic properties). The declared content
//! type drives decoding; a body that cannot be parsed as declared is a
//! [`BusError::Decode`].

use std::collections::BTreeMap;

use lapin::types::{AMQPValue, FieldTable, LongString};
use lapin::BasicProperties;
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::BusError;

/// Content type stamped on JSON payloads.
pub const CONTENT_TYPE_JSON: &str = "application/json";
const CONTENT_TYPE_TEXT: &str = "text/plain";
const CONTENT_TYPE_BINARY: &str = "application/octet-stream";

/// A message body.
///
/// Strings and raw bytes pass through unmodified; anything serializable
/// travels as JSON with the content type set accordingly.
#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    /// UTF-8 text, `text/plain`.
    Text(String),
    /// Raw bytes, `application/octet-stream`.
    Binary(Vec<u8>),
    /// JSON document, `application/json`.
    Json(serde_json::Value),
}

impl Payload {
    /// Build a JSON payload from any serializable value.
    pub fn json<T: Serialize>(value: &T) -> Result<Self, BusError> {
        serde_json::to_value(value)
            .map(Payload::Json)
            .map_err(|err| BusError::Serialization(err.to_string()))
    }

    /// Deserialize a JSON payload into a concrete type.
    pub fn parse<T: DeserializeOwned>(&self) -> Result<T, BusError> {
        match self {
            Payload::Json(value) => serde_json::from_value(value.clone())
                .map_err(|err| BusError::decode(err.to_string())),
            Payload::Text(text) => {
                serde_json::from_str(text).map_err(|err| BusError::decode(err.to_string()))
            }
            Payload::Binary(_) => Err(BusError::decode("binary payload is not JSON")),
        }
    }

    /// Borrow the text body, if this is a text payload.
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Payload::Text(text) => Some(text),
            _ => None,
        }
    }

    /// Borrow the JSON document, if this is a JSON payload.
    pub fn as_json(&self) -> Option<&serde_json::Value> {
        match self {
            Payload::Json(value) => Some(value),
            _ => None,
        }
    }
}

impl From<&str> for Payload {
    fn from(text: &str) -> Self {
        Payload::Text(text.to_string())
    }
}

impl From<String> for Payload {
    fn from(text: String) -> Self {
        Payload::Text(text)
    }
}

impl From<Vec<u8>> for Payload {
    fn from(bytes: Vec<u8>) -> Self {
        Payload::Binary(bytes)
    }
}

impl From<serde_json::Value> for Payload {
    fn from(value: serde_json::Value) -> Self {
        Payload::Json(value)
    }
}

/// Publish-side message metadata, mapped onto AMQP basic properties.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MessageMeta {
    /// Override the content type derived from the payload.
    pub content_type: Option<String>,
    /// Correlation id for request/response tracing.
    pub correlation_id: Option<String>,
    /// Reply-to queue for request/response patterns.
    pub reply_to: Option<String>,
    /// Application-level message id.
    pub message_id: Option<String>,
    /// Per-message TTL in milliseconds, as the AMQP string form.
    pub expiration: Option<String>,
    /// Persist the message to disk on durable queues.
    pub persistent: bool,
    /// Application headers.
    pub headers: BTreeMap<String, String>,
}

impl MessageMeta {
    /// Set the correlation id.
    pub fn with_correlation_id(mut self, id: impl Into<String>) -> Self {
        self.correlation_id = Some(id.into());
        self
    }

    /// Set the reply-to queue.
    pub fn with_reply_to(mut self, queue: impl Into<String>) -> Self {
        self.reply_to = Some(queue.into());
        self
    }

    /// Set the message id.
    pub fn with_message_id(mut self, id: impl Into<String>) -> Self {
        self.message_id = Some(id.into());
        self
    }

    /// Set a per-message TTL in milliseconds.
    pub fn with_expiration_ms(mut self, ttl_ms: u64) -> Self {
        self.expiration = Some(ttl_ms.to_string());
        self
    }

    /// Override the content type.
    pub fn with_content_type(mut self, content_type: impl Into<String>) -> Self {
        self.content_type = Some(content_type.into());
        self
    }

    /// Mark the message persistent.
    pub fn with_persistent(mut self, persistent: bool) -> Self {
        self.persistent = persistent;
        self
    }

    /// Add an application header.
    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(key.into(), value.into());
        self
    }
}

/// Encode a payload and its metadata into wire bytes and properties.
pub(crate) fn encode(
    payload: Payload,
    meta: &MessageMeta,
) -> Result<(Vec<u8>, BasicProperties), BusError> {
    let (bytes, default_type) = match payload {
        Payload::Text(text) => (text.into_bytes(), CONTENT_TYPE_TEXT),
        Payload::Binary(bytes) => (bytes, CONTENT_TYPE_BINARY),
        Payload::Json(value) => (
            serde_json::to_vec(&value).map_err(|err| BusError::Serialization(err.to_string()))?,
            CONTENT_TYPE_JSON,
        ),
    };

    let content_type = meta
        .content_type
        .clone()
        .unwrap_or_else(|| default_type.to_string());
    let mut properties = BasicProperties::default().with_content_type(content_type.into());

    if let Some(id) = &meta.correlation_id {
        properties = properties.with_correlation_id(id.as_str().into());
    }
    if let Some(queue) = &meta.reply_to {
        properties = properties.with_reply_to(queue.as_str().into());
    }
    if let Some(id) = &meta.message_id {
        properties = properties.with_message_id(id.as_str().into());
    }
    if let Some(ttl) = &meta.expiration {
        properties = properties.with_expiration(ttl.as_str().into());
    }
    if meta.persistent {
        properties = properties.with_delivery_mode(2);
    }
    if !meta.headers.is_empty() {
        let mut table = FieldTable::default();
        for (key, value) in &meta.headers {
            table.insert(
                key.as_str().into(),
                AMQPValue::LongString(LongString::from(value.clone())),
            );
        }
        properties = properties.with_headers(table);
    }

    Ok((bytes, properties))
}

/// Decode wire bytes according to the declared content type.
pub(crate) fn decode(properties: &BasicProperties, data: &[u8]) -> Result<Payload, BusError> {
    let content_type = properties
        .content_type()
        .as_ref()
        .map(|value| value.as_str());

    match content_type {
        Some(CONTENT_TYPE_JSON) => serde_json::from_slice(data)
            .map(Payload::Json)
            .map_err(|err| BusError::decode(format!("invalid JSON body: {err}"))),
        Some(CONTENT_TYPE_BINARY) => Ok(Payload::Binary(data.to_vec())),
        _ => match std::str::from_utf8(data) {
            Ok(text) => Ok(Payload::Text(text.to_string())),
            Err(_) => Err(BusError::decode("textual body is not valid UTF-8")),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use serde_json::json;

    fn round_trip(payload: Payload) -> Payload {
        let (bytes, properties) = encode(payload, &MessageMeta::default()).unwrap();
        decode(&properties, &bytes).unwrap()
    }

    #[test]
    fn test_text_round_trip() {
        let payload = Payload::from("hello there");
        assert_eq!(round_trip(payload.clone()), payload);
    }

    #[test]
    fn test_binary_round_trip() {
        let payload = Payload::from(vec![0u8, 159, 146, 150]);
        assert_eq!(round_trip(payload.clone()), payload);
    }

    #[test]
    fn test_json_round_trip() {
        let payload = Payload::Json(json!({"amount": 42, "currency": "EUR"}));
        assert_eq!(round_trip(payload.clone()), payload);
    }

    #[test]
    fn test_json_sets_content_type() {
        let (_, properties) =
            encode(Payload::Json(json!({"a": 1})), &MessageMeta::default()).unwrap();
        assert_eq!(
            properties.content_type().as_ref().map(|c| c.as_str()),
            Some(CONTENT_TYPE_JSON)
        );
    }

    #[test]
    fn test_declared_json_must_parse() {
        let properties = BasicProperties::default().with_content_type(CONTENT_TYPE_JSON.into());
        let err = decode(&properties, b"this is not json").unwrap_err();
        assert!(matches!(err, BusError::Decode(_)));
    }

    #[test]
    fn test_undeclared_content_type_decodes_as_text() {
        let decoded = decode(&BasicProperties::default(), b"plain enough").unwrap();
        assert_eq!(decoded, Payload::Text("plain enough".to_string()));
    }

    #[test]
    fn test_undeclared_invalid_utf8_is_a_decode_error() {
        let err = decode(&BasicProperties::default(), &[0xff, 0xfe, 0xfd]).unwrap_err();
        assert!(matches!(err, BusError::Decode(_)));
    }

    #[test]
    fn test_meta_maps_onto_properties() {
        let meta = MessageMeta::default()
            .with_correlation_id("corr-1")
            .with_reply_to("replies")
            .with_message_id("msg-9")
            .with_expiration_ms(1500)
            .with_persistent(true)
            .with_header("tenant", "acme");

        let (_, properties) = encode(Payload::from("x"), &meta).unwrap();

        assert_eq!(
            properties.correlation_id().as_ref().map(|v| v.as_str()),
            Some("corr-1")
        );
        assert_eq!(
            properties.reply_to().as_ref().map(|v| v.as_str()),
            Some("replies")
        );
        assert_eq!(
            properties.message_id().as_ref().map(|v| v.as_str()),
            Some("msg-9")
        );
        assert_eq!(
            properties.expiration().as_ref().map(|v| v.as_str()),
            Some("1500")
        );
        assert_eq!(properties.delivery_mode(), &Some(2));
        let headers = properties.headers().as_ref().unwrap();
        assert!(headers.inner().iter().any(|(key, _)| key.as_str() == "tenant"));
    }

    #[test]
    fn test_content_type_override_wins() {
        let meta = MessageMeta::default().with_content_type(CONTENT_TYPE_JSON);
        let (_, properties) = encode(Payload::from("{\"a\":1}"), &meta).unwrap();
        assert_eq!(
            properties.content_type().as_ref().map(|c| c.as_str()),
            Some(CONTENT_TYPE_JSON)
        );
    }

    #[test]
    fn test_typed_parse() {
        #[derive(Debug, PartialEq, Serialize, Deserialize)]
        struct Order {
            id: u32,
            sku: String,
        }

        let order = Order {
            id: 7,
            sku: "A-99".into(),
        };
        let payload = Payload::json(&order).unwrap();
        let parsed: Order = round_trip(payload).parse().unwrap();
        assert_eq!(parsed, order);
    }
}
