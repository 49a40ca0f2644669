//! Pluggable encodings for snapshot bodies.
//!
//! Projection state is converted to a [`serde_json::Value`] first; a
//! [`Codec`] turns that value into bytes and back. The envelope records the
//! codec's content type so readers pick the matching codec from a
//! [`CodecRegistry`].
//!
//! Codecs apply to snapshots only. Event payloads are always stored as
//! JSON ([`NewEvent::payload`](crate::event::NewEvent::payload) is a
//! [`serde_json::Value`] and records carry
//! [`JSON_CONTENT_TYPE`](crate::event::JSON_CONTENT_TYPE)).

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use serde_json::Value;

use crate::error::CodecError;
use crate::event::JSON_CONTENT_TYPE;

/// Byte encoding for JSON-shaped values.
pub trait Codec: Send + Sync + fmt::Debug {
    /// MIME-style identifier written into envelopes.
    fn content_type(&self) -> &str;

    /// Encode a value to bytes.
    ///
    /// # Errors
    ///
    /// Returns [`CodecError`] if the value cannot be represented.
    fn encode(&self, value: &Value) -> Result<Vec<u8>, CodecError>;

    /// Decode bytes produced by [`encode`](Self::encode).
    ///
    /// # Errors
    ///
    /// Returns [`CodecError`] if the bytes are malformed.
    fn decode(&self, bytes: &[u8]) -> Result<Value, CodecError>;
}

/// Compact UTF-8 JSON.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonCodec;

impl Codec for JsonCodec {
    fn content_type(&self) -> &str {
        JSON_CONTENT_TYPE
    }

    fn encode(&self, value: &Value) -> Result<Vec<u8>, CodecError> {
        Ok(serde_json::to_vec(value)?)
    }

    fn decode(&self, bytes: &[u8]) -> Result<Value, CodecError> {
        Ok(serde_json::from_slice(bytes)?)
    }
}

/// Codecs by content type, with one designated for writing.
///
/// The default registry knows only [`JsonCodec`] and writes with it.
#[derive(Debug, Clone)]
pub struct CodecRegistry {
    codecs: HashMap<String, Arc<dyn Codec>>,
    preferred: Arc<dyn Codec>,
}

impl Default for CodecRegistry {
    fn default() -> Self {
        let json: Arc<dyn Codec> = Arc::new(JsonCodec);
        let mut codecs = HashMap::new();
        codecs.insert(JSON_CONTENT_TYPE.to_string(), Arc::clone(&json));
        Self {
            codecs,
            preferred: json,
        }
    }
}

impl CodecRegistry {
    /// Add a codec, replacing any existing one for its content type.
    pub fn register(mut self, codec: Arc<dyn Codec>) -> Self {
        self.codecs
            .insert(codec.content_type().to_string(), codec);
        self
    }

    /// Register `codec` and use it for new envelopes.
    pub fn prefer(mut self, codec: Arc<dyn Codec>) -> Self {
        self.preferred = Arc::clone(&codec);
        self.register(codec)
    }

    /// Codec used when writing.
    pub fn preferred(&self) -> &Arc<dyn Codec> {
        &self.preferred
    }

    /// Codec registered for `content_type`.
    ///
    /// # Errors
    ///
    /// [`CodecError::UnsupportedContentType`] if none is registered.
    pub fn get(&self, content_type: &str) -> Result<&Arc<dyn Codec>, CodecError> {
        self.codecs
            .get(content_type)
            .ok_or_else(|| CodecError::UnsupportedContentType {
                content_type: content_type.to_string(),
            })
    }
}
