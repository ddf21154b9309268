//! Serde helpers for opaque payloads.
//!
//! Request and response bodies are arbitrary bytes but travel inside JSON
//! frames, so they are encoded as standard base64 strings.

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use serde::de::{self, Deserializer, Visitor};
use serde::Serializer;
use std::fmt;

/// Serialize a byte vector as a base64 string.
pub fn serialize<S>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error>
where
    S: Serializer,
{
    serializer.serialize_str(&STANDARD.encode(bytes))
}

/// Deserialize a byte vector from a base64 string.
///
/// A JSON `null` decodes to an empty vector so that bodies can be omitted.
pub fn deserialize<'de, D>(deserializer: D) -> Result<Vec<u8>, D::Error>
where
    D: Deserializer<'de>,
{
    struct Base64Visitor;

    impl<'de> Visitor<'de> for Base64Visitor {
        type Value = Vec<u8>;

        fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
            formatter.write_str("a base64 encoded string")
        }

        fn visit_str<E: de::Error>(self, v: &str) -> Result<Self::Value, E> {
            STANDARD.decode(v).map_err(E::custom)
        }

        fn visit_none<E: de::Error>(self) -> Result<Self::Value, E> {
            Ok(Vec::new())
        }

        fn visit_unit<E: de::Error>(self) -> Result<Self::Value, E> {
            Ok(Vec::new())
        }
    }

    deserializer.deserialize_any(Base64Visitor)
}

#[cfg(test)]
mod tests {
    use serde::{Deserialize, Serialize};

    #[derive(Serialize, Deserialize, Debug, PartialEq)]
    struct Holder {
        #[serde(with = "super", default)]
        body: Vec<u8>,
    }

    #[test]
    fn test_body_is_base64_text() {
        let h = Holder {
            body: vec![0, 1, 2, 255],
        };
        let json = serde_json::to_string(&h).unwrap();
        assert_eq!(json, r#"{"body":"AAEC/w=="}"#);
        let back: Holder = serde_json::from_str(&json).unwrap();
        assert_eq!(back, h);
    }

    #[test]
    fn test_null_and_missing_body() {
        let h: Holder = serde_json::from_str(r#"{"body":null}"#).unwrap();
        assert!(h.body.is_empty());
        let h: Holder = serde_json::from_str("{}").unwrap();
        assert!(h.body.is_empty());
    }

    #[test]
    fn test_invalid_base64_rejected() {
        assert!(serde_json::from_str::<Holder>(r#"{"body":"***"}"#).is_err());
    }
}
