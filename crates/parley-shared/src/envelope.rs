//! Field-tagged JSON envelope used on the wire for messages and presence:
//!
//! ```json
//! {"name": "<id>", "fields": {"text": {"stringValue": "..."}, "isKyle": {"booleanValue": false}}}
//! ```
//!
//! The tagged representation stops at this module. Callers convert to and
//! from [`ChatMessage`] immediately.

use serde::{Deserialize, Serialize};

use crate::error::EnvelopeError;
use crate::protocol::ChatMessage;
use crate::types::Party;

/// A single tagged value. Decoding is lenient in the same way as the mobile
/// client: numbers may arrive as strings and strings as integers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum TaggedValue {
    StringValue(String),
    BooleanValue(bool),
    DoubleValue(f64),
    IntegerValue(String),
}

impl TaggedValue {
    pub fn as_string(&self) -> Option<&str> {
        match self {
            TaggedValue::StringValue(s) | TaggedValue::IntegerValue(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            TaggedValue::DoubleValue(d) => Some(*d),
            TaggedValue::IntegerValue(s) | TaggedValue::StringValue(s) => s.parse().ok(),
            TaggedValue::BooleanValue(_) => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            TaggedValue::BooleanValue(b) => Some(*b),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Fields {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<TaggedValue>,
    /// Operator flag; the wire name predates the operator terminology.
    #[serde(rename = "isKyle", default, skip_serializing_if = "Option::is_none")]
    pub is_operator: Option<TaggedValue>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<TaggedValue>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub room: Option<TaggedValue>,
    #[serde(rename = "chatId", default, skip_serializing_if = "Option::is_none")]
    pub chat_id: Option<TaggedValue>,
    #[serde(rename = "imageBase64", default, skip_serializing_if = "Option::is_none")]
    pub image_base64: Option<TaggedValue>,
    #[serde(rename = "lastActive", default, skip_serializing_if = "Option::is_none")]
    pub last_active: Option<TaggedValue>,
}

impl Fields {
    pub fn text(&self) -> Option<&str> {
        self.text.as_ref().and_then(TaggedValue::as_string)
    }

    pub fn is_operator(&self) -> bool {
        self.is_operator
            .as_ref()
            .and_then(TaggedValue::as_bool)
            .unwrap_or(false)
    }

    pub fn timestamp(&self) -> Option<f64> {
        self.timestamp.as_ref().and_then(TaggedValue::as_f64)
    }

    pub fn room(&self) -> Option<&str> {
        self.room.as_ref().and_then(TaggedValue::as_string)
    }

    pub fn chat_id(&self) -> Option<&str> {
        self.chat_id.as_ref().and_then(TaggedValue::as_string)
    }

    /// Empty image strings are treated as absent.
    pub fn image_base64(&self) -> Option<&str> {
        self.image_base64
            .as_ref()
            .and_then(TaggedValue::as_string)
            .filter(|s| !s.is_empty())
    }

    pub fn last_active(&self) -> Option<f64> {
        self.last_active.as_ref().and_then(TaggedValue::as_f64)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Document {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fields: Option<Fields>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DocumentList {
    #[serde(default)]
    pub documents: Vec<Document>,
}

impl Document {
    pub fn from_message(message: &ChatMessage) -> Self {
        let fields = Fields {
            text: Some(TaggedValue::StringValue(message.text.clone())),
            is_operator: Some(TaggedValue::BooleanValue(message.is_operator())),
            timestamp: Some(TaggedValue::DoubleValue(message.timestamp)),
            room: Some(TaggedValue::StringValue(message.room.clone())),
            chat_id: Some(TaggedValue::StringValue(message.chat_id.clone())),
            image_base64: message
                .image_base64
                .as_ref()
                .map(|img| TaggedValue::StringValue(img.clone())),
            last_active: None,
        };
        Self {
            name: Some(message.id.clone()),
            fields: Some(fields),
        }
    }

    pub fn to_message(&self) -> Result<ChatMessage, EnvelopeError> {
        let id = self.name.clone().ok_or(EnvelopeError::MissingField("name"))?;
        let fields = self.fields.as_ref().ok_or(EnvelopeError::MissingField("fields"))?;

        Ok(ChatMessage {
            id,
            text: fields.text().unwrap_or_default().to_string(),
            sender: Party::from_operator_flag(fields.is_operator()),
            timestamp: fields.timestamp().unwrap_or(0.0),
            room: fields.room().unwrap_or_default().to_string(),
            chat_id: fields.chat_id().unwrap_or_default().to_string(),
            image_base64: fields.image_base64().map(str::to_string),
        })
    }

    pub fn presence(last_active: f64) -> Self {
        Self {
            name: None,
            fields: Some(Fields {
                last_active: Some(TaggedValue::DoubleValue(last_active)),
                ..Fields::default()
            }),
        }
    }

    pub fn last_active(&self) -> Option<f64> {
        self.fields.as_ref().and_then(Fields::last_active)
    }
}

impl DocumentList {
    pub fn from_messages<'a>(messages: impl IntoIterator<Item = &'a ChatMessage>) -> Self {
        Self {
            documents: messages.into_iter().map(Document::from_message).collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample() -> ChatMessage {
        ChatMessage {
            id: "m1".into(),
            text: "hello".into(),
            sender: Party::Operator,
            timestamp: 1_700_000_000.25,
            room: "user@example.com".into(),
            chat_id: "c1".into(),
            image_base64: None,
        }
    }

    #[test]
    fn test_wire_shape() {
        let value = serde_json::to_value(Document::from_message(&sample())).unwrap();
        assert_eq!(
            value,
            json!({
                "name": "m1",
                "fields": {
                    "text": {"stringValue": "hello"},
                    "isKyle": {"booleanValue": true},
                    "timestamp": {"doubleValue": 1_700_000_000.25},
                    "room": {"stringValue": "user@example.com"},
                    "chatId": {"stringValue": "c1"}
                }
            })
        );
    }

    #[test]
    fn test_parse_mobile_payload() {
        let doc: Document = serde_json::from_value(json!({
            "name": "42",
            "fields": {
                "text": {"stringValue": "hi"},
                "timestamp": {"integerValue": "1700000000"},
                "room": {"stringValue": "u@x.io"},
                "imageBase64": {"stringValue": ""}
            }
        }))
        .unwrap();

        let msg = doc.to_message().unwrap();
        assert_eq!(msg.id, "42");
        assert_eq!(msg.sender, Party::User);
        assert_eq!(msg.timestamp, 1_700_000_000.0);
        assert_eq!(msg.chat_id, "");
        assert_eq!(msg.image_base64, None);
    }

    #[test]
    fn test_missing_name_rejected() {
        let doc = Document {
            name: None,
            fields: Some(Fields::default()),
        };
        assert!(matches!(
            doc.to_message(),
            Err(EnvelopeError::MissingField("name"))
        ));
    }

    #[test]
    fn test_presence_roundtrip() {
        let doc = Document::presence(12.5);
        let json = serde_json::to_string(&doc).unwrap();
        assert_eq!(json, r#"{"fields":{"lastActive":{"doubleValue":12.5}}}"#);
        let back: Document = serde_json::from_str(&json).unwrap();
        assert_eq!(back.last_active(), Some(12.5));

        let empty: Document = serde_json::from_str("{}").unwrap();
        assert_eq!(empty.last_active(), None);
    }
}
