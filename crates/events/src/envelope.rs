//! Bus envelope: `{ transactionId, worldId, channelId?, type, body }`.
//!
//! Bodies are closed sum types implementing [`MessageBody`], encoded with serde's
//! adjacent tagging (`tag = "type"`, `content = "body"`). The envelope keeps the
//! tag and the raw body side by side so a handler can check `type` before paying
//! for a full decode.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as JsonValue};

use atlas_core::{ChannelId, Classified, ErrorKind, TransactionId, WorldId};

/// A closed set of command or event bodies sharing one topic.
pub trait MessageBody: Serialize + DeserializeOwned + Send + Sync + 'static {
    /// Every `type` tag this sum type decodes.
    const TYPES: &'static [&'static str];

    fn type_tag(&self) -> &'static str;

    fn accepts(tag: &str) -> bool {
        Self::TYPES.contains(&tag)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Envelope<B> {
    pub transaction_id: TransactionId,
    pub world_id: WorldId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channel_id: Option<ChannelId>,
    #[serde(rename = "type")]
    pub kind: String,
    pub body: B,
}

/// Envelope with an undecoded body.
pub type RawEnvelope = Envelope<JsonValue>;

#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    #[error("envelope type {found} is not one of {expected:?}")]
    UnexpectedType {
        found: String,
        expected: &'static [&'static str],
    },

    #[error("malformed body: {0}")]
    Body(#[from] serde_json::Error),
}

impl Classified for DecodeError {
    fn kind(&self) -> ErrorKind {
        ErrorKind::BadInput
    }
}

impl<B: MessageBody> Envelope<B> {
    /// Build a typed envelope; `kind` always mirrors the body's tag.
    pub fn new(
        transaction_id: TransactionId,
        world_id: WorldId,
        channel_id: Option<ChannelId>,
        body: B,
    ) -> Self {
        Self {
            transaction_id,
            world_id,
            channel_id,
            kind: body.type_tag().to_string(),
            body,
        }
    }

    pub fn into_raw(self) -> Result<RawEnvelope, serde_json::Error> {
        let tagged = serde_json::to_value(&self.body)?;
        let body = match tagged {
            JsonValue::Object(mut map) => map.remove("body").unwrap_or(JsonValue::Null),
            _ => JsonValue::Null,
        };
        Ok(Envelope {
            transaction_id: self.transaction_id,
            world_id: self.world_id,
            channel_id: self.channel_id,
            kind: self.kind,
            body,
        })
    }
}

impl RawEnvelope {
    pub fn from_slice(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(bytes)
    }

    /// Whether this envelope carries one of `B`'s tags.
    pub fn is<B: MessageBody>(&self) -> bool {
        B::accepts(&self.kind)
    }

    /// Decode the body into `B`.
    pub fn decode<B: MessageBody>(&self) -> Result<Envelope<B>, DecodeError> {
        if !self.is::<B>() {
            return Err(DecodeError::UnexpectedType {
                found: self.kind.clone(),
                expected: B::TYPES,
            });
        }
        let mut tagged = Map::with_capacity(2);
        tagged.insert("type".into(), JsonValue::String(self.kind.clone()));
        if !self.body.is_null() {
            tagged.insert("body".into(), self.body.clone());
        }
        let body = serde_json::from_value(JsonValue::Object(tagged))?;
        Ok(Envelope {
            transaction_id: self.transaction_id,
            world_id: self.world_id,
            channel_id: self.channel_id,
            kind: self.kind.clone(),
            body,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use atlas_core::CharacterId;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    #[serde(tag = "type", content = "body", rename_all = "SCREAMING_SNAKE_CASE")]
    enum ChairCommand {
        Use { character_id: CharacterId, chair_id: u32 },
        Cancel { character_id: CharacterId },
    }

    impl MessageBody for ChairCommand {
        const TYPES: &'static [&'static str] = &["USE", "CANCEL"];

        fn type_tag(&self) -> &'static str {
            match self {
                ChairCommand::Use { .. } => "USE",
                ChairCommand::Cancel { .. } => "CANCEL",
            }
        }
    }

    #[test]
    fn wire_shape_matches_envelope_contract() {
        let tx = TransactionId::new();
        let env = Envelope::new(
            tx,
            WorldId(1),
            Some(ChannelId(2)),
            ChairCommand::Use {
                character_id: CharacterId(7),
                chair_id: 3010000,
            },
        );
        let json = serde_json::to_value(env.into_raw().unwrap()).unwrap();
        assert_eq!(json["transactionId"], tx.to_string());
        assert_eq!(json["worldId"], 1);
        assert_eq!(json["channelId"], 2);
        assert_eq!(json["type"], "USE");
        assert_eq!(json["body"]["character_id"], 7);
    }

    #[test]
    fn decode_checks_the_tag_first() {
        let raw: RawEnvelope = serde_json::from_value(serde_json::json!({
            "transactionId": TransactionId::new().to_string(),
            "worldId": 0,
            "type": "SIT",
            "body": {}
        }))
        .unwrap();
        assert!(!raw.is::<ChairCommand>());
        assert!(matches!(
            raw.decode::<ChairCommand>(),
            Err(DecodeError::UnexpectedType { .. })
        ));
        assert_eq!(raw.channel_id, None);
    }

    #[test]
    fn malformed_body_is_bad_input() {
        let raw: RawEnvelope = serde_json::from_value(serde_json::json!({
            "transactionId": TransactionId::new().to_string(),
            "worldId": 0,
            "type": "CANCEL",
            "body": { "character_id": "seven" }
        }))
        .unwrap();
        let err = raw.decode::<ChairCommand>().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::BadInput);
    }
}
