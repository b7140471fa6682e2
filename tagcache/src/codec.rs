//! Cache item envelope and its serialization strategies.

use crate::error::{CacheError, CacheResult};
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// A cached value together with its key, expiry and tags, as stored under
/// one Store key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEnvelope<T> {
    /// Fully qualified cache key.
    pub key: String,
    /// The cached value.
    pub value: T,
    /// Absolute expiry, if any.
    #[serde(default)]
    pub expiry: Option<DateTime<Utc>>,
    /// Tags the value was stored with.
    #[serde(default)]
    pub tags: Option<Vec<String>>,
}

impl<T> CacheEnvelope<T> {
    /// Whether the envelope's expiry is before `now`.
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expiry.is_some_and(|expiry| expiry < now)
    }

    /// Tags as a slice, empty when none were stored.
    pub fn tags(&self) -> &[String] {
        self.tags.as_deref().unwrap_or_default()
    }
}

/// Serialization strategy for envelopes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SerializationFormat {
    /// JSON text.
    #[default]
    Json,
    /// Compact binary (bincode).
    Binary,
    /// XML text.
    Xml,
}

impl fmt::Display for SerializationFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Json => write!(f, "json"),
            Self::Binary => write!(f, "binary"),
            Self::Xml => write!(f, "xml"),
        }
    }
}

impl FromStr for SerializationFormat {
    type Err = CacheError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "json" => Ok(Self::Json),
            "binary" | "bincode" => Ok(Self::Binary),
            "xml" => Ok(Self::Xml),
            other => Err(CacheError::Configuration(format!(
                "unknown serializer '{}', expected json, binary or xml",
                other
            ))),
        }
    }
}

#[derive(Serialize)]
struct EnvelopeRef<'a, T: ?Sized> {
    key: &'a str,
    value: &'a T,
    expiry: Option<DateTime<Utc>>,
    tags: Option<&'a [String]>,
}

// XML has no null: absent fields are omitted and tags are wrapped so that
// an empty list stays distinguishable from no list. The value is wrapped
// the same way; a null or an empty sequence leaves the wrapper empty.
#[derive(Serialize)]
#[serde(rename = "CacheItem")]
struct XmlEnvelopeRef<'a, T: ?Sized> {
    key: &'a str,
    value: XmlValueRef<'a, T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    expiry: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tags: Option<XmlTagsRef<'a>>,
}

#[derive(Serialize)]
struct XmlValueRef<'a, T: ?Sized> {
    #[serde(skip_serializing_if = "Option::is_none")]
    item: Option<&'a T>,
}

#[derive(Serialize)]
struct XmlTagsRef<'a> {
    tag: &'a [String],
}

#[derive(Deserialize)]
#[serde(rename = "CacheItem")]
struct XmlEnvelope<T> {
    key: String,
    value: XmlValue<T>,
    #[serde(default)]
    expiry: Option<DateTime<Utc>>,
    #[serde(default)]
    tags: Option<XmlTags>,
}

#[derive(Deserialize)]
#[serde(bound(deserialize = "T: Deserialize<'de>"))]
struct XmlValue<T> {
    #[serde(default)]
    item: Option<T>,
}

#[derive(Deserialize)]
struct XmlTags {
    #[serde(default)]
    tag: Vec<String>,
}

/// Encodes and decodes [`CacheEnvelope`]s with the configured format.
#[derive(Debug, Clone, Copy, Default)]
pub struct CacheItemCodec {
    format: SerializationFormat,
}

impl CacheItemCodec {
    /// Create a codec for `format`.
    pub fn new(format: SerializationFormat) -> Self {
        Self { format }
    }

    /// The format in use.
    pub fn format(&self) -> SerializationFormat {
        self.format
    }

    /// Wrap `value` with its metadata and serialize it.
    pub fn encode<T: Serialize + ?Sized>(
        &self,
        key: &str,
        value: &T,
        expiry: Option<DateTime<Utc>>,
        tags: Option<&[String]>,
    ) -> CacheResult<Vec<u8>> {
        let encoded = match self.format {
            SerializationFormat::Json => serde_json::to_vec(&EnvelopeRef {
                key,
                value,
                expiry,
                tags,
            })
            .map_err(|e| CacheError::Encode(e.to_string()))?,
            SerializationFormat::Binary => bincode::serialize(&EnvelopeRef {
                key,
                value,
                expiry,
                tags,
            })
            .map_err(|e| CacheError::Encode(e.to_string()))?,
            SerializationFormat::Xml => quick_xml::se::to_string(&XmlEnvelopeRef {
                key,
                value: XmlValueRef {
                    item: (!is_null(value)).then_some(value),
                },
                expiry,
                tags: tags.map(|tag| XmlTagsRef { tag }),
            })
            .map_err(|e| CacheError::Encode(e.to_string()))?
            .into_bytes(),
        };
        Ok(encoded)
    }

    /// Deserialize an envelope. Empty input decodes to `None`.
    pub fn decode<T: DeserializeOwned>(&self, bytes: &[u8]) -> CacheResult<Option<CacheEnvelope<T>>> {
        if bytes.is_empty() {
            return Ok(None);
        }

        let envelope = match self.format {
            SerializationFormat::Json => {
                serde_json::from_slice(bytes).map_err(|e| CacheError::Decode(e.to_string()))?
            }
            SerializationFormat::Binary => {
                bincode::deserialize(bytes).map_err(|e| CacheError::Decode(e.to_string()))?
            }
            SerializationFormat::Xml => {
                let text =
                    std::str::from_utf8(bytes).map_err(|e| CacheError::Decode(e.to_string()))?;
                let xml: XmlEnvelope<T> =
                    quick_xml::de::from_str(text).map_err(|e| CacheError::Decode(e.to_string()))?;
                let value = match xml.value.item {
                    Some(value) => value,
                    None => empty_value()?,
                };
                CacheEnvelope {
                    key: xml.key,
                    value,
                    expiry: xml.expiry,
                    tags: xml.tags.map(|tags| tags.tag),
                }
            }
        };
        Ok(Some(envelope))
    }
}

fn is_null<T: Serialize + ?Sized>(value: &T) -> bool {
    serde_json::to_value(value).is_ok_and(|json| json.is_null())
}

/// The value behind an empty XML wrapper: a null, a unit or an empty
/// sequence, whichever `T` accepts.
fn empty_value<T: DeserializeOwned>() -> CacheResult<T> {
    use serde::de::IntoDeserializer;
    use serde::de::value::{Error, SeqDeserializer};

    T::deserialize(<() as IntoDeserializer<'_, Error>>::into_deserializer(()))
        .or_else(|_| T::deserialize(SeqDeserializer::<_, Error>::new(std::iter::empty::<()>())))
        .map_err(|e| CacheError::Decode(format!("empty value: {}", e)))
}
