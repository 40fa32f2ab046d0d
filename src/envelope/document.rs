use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use serde::de::{self, Deserializer, Visitor};
use serde::ser::Serializer;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::LimeError;

/// MIME media type identifying a document schema, e.g.
/// `application/vnd.lime.ping+json`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MediaType(String);

impl MediaType {
    pub const TEXT_PLAIN: &'static str = "text/plain";
    pub const PING: &'static str = "application/vnd.lime.ping+json";

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Wraps a literal without validation; for well-known constants only.
    pub fn from_static(media_type: &'static str) -> Self {
        MediaType(media_type.to_string())
    }
}

impl fmt::Display for MediaType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for MediaType {
    type Err = LimeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.split_once('/') {
            Some((ty, subtype)) if !ty.is_empty() && !subtype.is_empty() => {
                Ok(MediaType(s.to_string()))
            }
            _ => Err(LimeError::Protocol(format!("invalid media type '{}'", s))),
        }
    }
}

impl Serialize for MediaType {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.0)
    }
}

impl<'de> Deserialize<'de> for MediaType {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct MediaTypeVisitor;

        impl Visitor<'_> for MediaTypeVisitor {
            type Value = MediaType;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("a media type in 'type/subtype' form")
            }

            fn visit_str<E: de::Error>(self, v: &str) -> Result<Self::Value, E> {
                v.parse().map_err(|e: LimeError| de::Error::custom(e))
            }
        }

        deserializer.deserialize_str(MediaTypeVisitor)
    }
}

/// Generic document carrier: a media type plus its structured payload.
///
/// Typed documents implement [`TypedDocument`] and convert through this
/// carrier; envelopes always hold the carrier form so unknown media types
/// pass through the node untouched.
#[derive(Debug, Clone, PartialEq)]
pub struct Document {
    pub media_type: MediaType,
    pub content: Value,
}

impl Document {
    pub fn new(media_type: MediaType, content: Value) -> Self {
        Self {
            media_type,
            content,
        }
    }
}

/// A document with a statically known media type and serde schema.
pub trait TypedDocument: Serialize + serde::de::DeserializeOwned {
    const MEDIA_TYPE: &'static str;

    fn media_type() -> MediaType {
        MediaType::from_static(Self::MEDIA_TYPE)
    }

    fn into_document(self) -> Result<Document, LimeError> {
        Ok(Document::new(
            Self::media_type(),
            serde_json::to_value(self)?,
        ))
    }

    fn from_document(document: &Document) -> Result<Self, LimeError> {
        if document.media_type != Self::media_type() {
            return Err(LimeError::Protocol(format!(
                "expected media type '{}', got '{}'",
                Self::MEDIA_TYPE,
                document.media_type
            )));
        }
        serde_json::from_value(document.content.clone()).map_err(LimeError::from)
    }
}

/// Plain-text content at `text/plain`. Serialized as a bare JSON string.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PlainText(pub String);

impl TypedDocument for PlainText {
    const MEDIA_TYPE: &'static str = MediaType::TEXT_PLAIN;
}

/// Liveness probe resource at `application/vnd.lime.ping+json`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ping {}

impl TypedDocument for Ping {
    const MEDIA_TYPE: &'static str = MediaType::PING;
}

type Decoder = Arc<dyn Fn(&Value) -> Result<(), LimeError> + Send + Sync>;

/// Registry of known document schemas keyed by media type.
///
/// Registration is explicit at startup; no scanning. Decoding a registered
/// media type validates the payload against its schema, while unknown media
/// types pass through opaque.
#[derive(Clone, Default)]
pub struct DocumentRegistry {
    decoders: HashMap<MediaType, Decoder>,
}

impl DocumentRegistry {
    /// Empty registry; every media type is opaque.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the built-in document types registered.
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.register::<PlainText>();
        registry.register::<Ping>();
        registry
    }

    pub fn register<T: TypedDocument>(&mut self) {
        self.decoders.insert(
            T::media_type(),
            Arc::new(|value| {
                serde_json::from_value::<T>(value.clone())
                    .map(|_| ())
                    .map_err(LimeError::from)
            }),
        );
    }

    pub fn is_registered(&self, media_type: &MediaType) -> bool {
        self.decoders.contains_key(media_type)
    }

    /// Validates `content` against the registered schema for `media_type`
    /// and returns the document carrier. Unregistered types are accepted
    /// without validation.
    pub fn decode(&self, media_type: MediaType, content: Value) -> Result<Document, LimeError> {
        if let Some(decoder) = self.decoders.get(&media_type) {
            decoder(&content)?;
        }
        Ok(Document::new(media_type, content))
    }
}

impl fmt::Debug for DocumentRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DocumentRegistry")
            .field("media_types", &self.decoders.keys().collect::<Vec<_>>())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn media_type_parse() {
        assert!("text/plain".parse::<MediaType>().is_ok());
        assert!("application/vnd.lime.ping+json".parse::<MediaType>().is_ok());
        assert!("not-a-media-type".parse::<MediaType>().is_err());
    }

    #[test]
    fn typed_document_round_trip() {
        let doc = PlainText("hello".into()).into_document().unwrap();
        assert_eq!(doc.media_type.as_str(), MediaType::TEXT_PLAIN);
        assert_eq!(doc.content, json!("hello"));
        let text = PlainText::from_document(&doc).unwrap();
        assert_eq!(text.0, "hello");
    }

    #[test]
    fn registry_validates_known_types() {
        let registry = DocumentRegistry::with_defaults();
        let ping_type: MediaType = MediaType::PING.parse().unwrap();
        assert!(registry.is_registered(&ping_type));
        assert!(registry.decode(ping_type.clone(), json!({})).is_ok());
        assert!(registry.decode(ping_type, json!("bogus")).is_err());
    }

    #[test]
    fn registry_passes_unknown_types_through() {
        let registry = DocumentRegistry::with_defaults();
        let media_type: MediaType = "application/x-custom+json".parse().unwrap();
        let doc = registry
            .decode(media_type, json!({"anything": true}))
            .unwrap();
        assert_eq!(doc.content["anything"], json!(true));
    }
}
