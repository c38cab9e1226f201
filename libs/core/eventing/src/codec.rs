//! Wire codecs for typed payloads.
//!
//! A codec turns payload bytes into a typed value and back. Two codecs ship
//! with the crate:
//! - [`Json`] for any `serde` type
//! - [`Proto`] for any `prost` message

use crate::error::EventError;
use serde::{Serialize, de::DeserializeOwned};
use strum::{AsRefStr, Display};

/// Wire encoding of a payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, AsRefStr)]
#[strum(serialize_all = "snake_case")]
pub enum Encoding {
    Json,
    Proto,
}

/// Encoder/decoder pair for payloads of type `T`.
pub trait Codec<T>: Send + Sync + 'static {
    const ENCODING: Encoding;

    /// Decode payload bytes into a fresh `T`.
    fn decode(payload: &[u8]) -> Result<T, EventError>;

    /// Encode a value into payload bytes.
    fn encode(value: &T) -> Result<Vec<u8>, EventError>;
}

/// JSON codec backed by `serde_json`.
#[derive(Debug, Clone, Copy, Default)]
pub struct Json;

impl<T> Codec<T> for Json
where
    T: Serialize + DeserializeOwned,
{
    const ENCODING: Encoding = Encoding::Json;

    fn decode(payload: &[u8]) -> Result<T, EventError> {
        Ok(serde_json::from_slice(payload)?)
    }

    fn encode(value: &T) -> Result<Vec<u8>, EventError> {
        let bytes = serde_json::to_vec(value)?;
        // `None`/unit values serialize to null; an event must carry a value
        if bytes == b"null" {
            return Err(EventError::Serialization(
                "refusing to encode an empty (null) message".to_string(),
            ));
        }
        Ok(bytes)
    }
}

/// Protobuf codec backed by `prost`.
#[derive(Debug, Clone, Copy, Default)]
pub struct Proto;

impl<T> Codec<T> for Proto
where
    T: prost::Message + Default,
{
    const ENCODING: Encoding = Encoding::Proto;

    fn decode(payload: &[u8]) -> Result<T, EventError> {
        Ok(T::decode(payload)?)
    }

    /// A message whose fields all hold defaults encodes to zero bytes and is
    /// still a valid event.
    fn encode(value: &T) -> Result<Vec<u8>, EventError> {
        Ok(value.encode_to_vec())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Ping {
        id: u32,
        note: String,
    }

    #[derive(Clone, PartialEq, prost::Message)]
    struct PingProto {
        #[prost(uint32, tag = "1")]
        id: u32,
        #[prost(string, tag = "2")]
        note: String,
    }

    #[test]
    fn test_json_reencode_is_byte_equal() {
        let payload = br#"{"id":7,"note":"hello"}"#;
        let value: Ping = <Json as Codec<Ping>>::decode(payload).unwrap();
        let bytes = <Json as Codec<Ping>>::encode(&value).unwrap();
        assert_eq!(bytes, payload.to_vec());
    }

    #[test]
    fn test_json_rejects_null_output() {
        let err = <Json as Codec<Option<Ping>>>::encode(&None).unwrap_err();
        assert!(matches!(err, EventError::Serialization(_)));
    }

    #[test]
    fn test_json_decode_error_is_serialization() {
        let err = <Json as Codec<Ping>>::decode(b"not json").unwrap_err();
        assert!(matches!(err, EventError::Serialization(_)));
    }

    #[test]
    fn test_proto_reencode_is_byte_equal() {
        let original = PingProto {
            id: 42,
            note: "hi".to_string(),
        };
        let bytes = <Proto as Codec<PingProto>>::encode(&original).unwrap();
        let decoded: PingProto = <Proto as Codec<PingProto>>::decode(&bytes).unwrap();
        assert_eq!(decoded, original);
        assert_eq!(<Proto as Codec<PingProto>>::encode(&decoded).unwrap(), bytes);
    }

    #[test]
    fn test_proto_default_message_is_empty_but_valid() {
        let bytes = <Proto as Codec<PingProto>>::encode(&PingProto::default()).unwrap();
        assert!(bytes.is_empty());
        let decoded: PingProto = <Proto as Codec<PingProto>>::decode(&bytes).unwrap();
        assert_eq!(decoded, PingProto::default());
    }

    #[test]
    fn test_encoding_names() {
        assert_eq!(Encoding::Json.to_string(), "json");
        assert_eq!(Encoding::Proto.as_ref(), "proto");
    }
}
