//! Feed Codec
//!
//! JSON encoding and decoding for the Finnhub trade stream.
//!
//! Inbound messages are single JSON objects discriminated by their `type`
//! field. Trade batches are decoded record by record so one bad record does
//! not discard the rest of the batch.

use super::messages::{FeedMessage, FeedRequest, TradeRecord};

/// Codec errors.
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    /// JSON encoding/decoding failed.
    #[error("JSON codec error: {0}")]
    Json(#[from] serde_json::Error),

    /// Message lacks a string `type` field.
    #[error("message has no type field")]
    MissingType,

    /// Invalid message format.
    #[error("invalid message format: {0}")]
    InvalidFormat(String),
}

/// JSON codec for the Finnhub stream.
#[derive(Debug, Default, Clone, Copy)]
pub struct FeedCodec;

impl FeedCodec {
    /// Create a new codec.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }

    /// Decode an inbound text frame.
    ///
    /// # Errors
    ///
    /// Returns an error if the frame is not a JSON object with a `type`
    /// field, or a `trade` message has no `data` array.
    pub fn decode(&self, text: &str) -> Result<FeedMessage, CodecError> {
        let value: serde_json::Value = serde_json::from_str(text.trim())?;

        let Some(object) = value.as_object() else {
            return Err(CodecError::InvalidFormat(format!(
                "expected JSON object, got: {}...",
                truncate(text, 50)
            )));
        };

        let msg_type = object
            .get("type")
            .and_then(serde_json::Value::as_str)
            .ok_or(CodecError::MissingType)?;

        match msg_type {
            "trade" => {
                let Some(data) = object.get("data").and_then(serde_json::Value::as_array) else {
                    return Err(CodecError::InvalidFormat(
                        "trade message without data array".to_string(),
                    ));
                };

                let mut records = Vec::with_capacity(data.len());
                let mut malformed = 0;
                for raw in data {
                    match TradeRecord::deserialize_value(raw) {
                        Ok(record) => records.push(record),
                        Err(e) => {
                            tracing::debug!(error = %e, "Skipping malformed trade record");
                            malformed += 1;
                        }
                    }
                }

                Ok(FeedMessage::Trades { records, malformed })
            }
            "ping" => Ok(FeedMessage::Ping),
            "error" => Ok(FeedMessage::Error {
                msg: object
                    .get("msg")
                    .and_then(serde_json::Value::as_str)
                    .unwrap_or_default()
                    .to_string(),
            }),
            other => Ok(FeedMessage::Other {
                kind: other.to_string(),
            }),
        }
    }

    /// Encode an outbound request.
    ///
    /// # Errors
    ///
    /// Returns an error if JSON serialization fails.
    pub fn encode(&self, request: &FeedRequest<'_>) -> Result<String, CodecError> {
        Ok(serde_json::to_string(request)?)
    }
}

impl TradeRecord {
    fn deserialize_value(value: &serde_json::Value) -> Result<Self, serde_json::Error> {
        <Self as serde::Deserialize>::deserialize(value)
    }
}

fn truncate(text: &str, max_chars: usize) -> &str {
    text.char_indices()
        .nth(max_chars)
        .map_or(text, |(idx, _)| &text[..idx])
}
