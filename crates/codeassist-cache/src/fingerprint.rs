//! Request fingerprinting
//!
//! A [`CacheKey`] is the SHA-256 digest of a canonical rendering of a
//! completion request. Cache-control fields are stripped first so that
//! toggling them never changes the key, and object keys are emitted in sorted
//! order so that construction order never matters.

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use codeassist_core::CacheError;

/// Bumped whenever the canonical form changes, so old keys simply miss.
const FINGERPRINT_VERSION: &str = "codeassist-fingerprint/v1";

/// Fields that control caching and must not take part in the key
pub const CACHE_CONTROL_FIELDS: &[&str] = &["bypass_cache", "bypassCache"];

/// Fixed-length digest identifying a cacheable request
#[derive(Clone, Copy, Hash, Eq, PartialEq, Ord, PartialOrd)]
pub struct CacheKey([u8; 32]);

impl CacheKey {
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Name of the file this entry is persisted to
    pub fn file_name(&self) -> String {
        format!("{}.json", self.to_hex())
    }
}

impl fmt::Debug for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CacheKey({})", &self.to_hex()[..12])
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl FromStr for CacheKey {
    type Err = CacheError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut bytes = [0u8; 32];
        hex::decode_to_slice(s, &mut bytes).map_err(|e| CacheError::InvalidKey(format!("{s}: {e}")))?;
        Ok(Self(bytes))
    }
}

impl Serialize for CacheKey {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for CacheKey {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// A single chat message
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

impl ChatMessage {
    pub fn new(role: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            role: role.into(),
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new("user", content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new("assistant", content)
    }
}

/// Completion request as handed to the upstream LLM client
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct CompletionRequest {
    pub model: String,

    #[serde(default)]
    pub messages: Vec<ChatMessage>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f32>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub stop: Vec<String>,

    /// Structural options forwarded verbatim (response format, tools, ...)
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub options: BTreeMap<String, Value>,

    /// Skip the cache for this call; never part of the key
    #[serde(default)]
    pub bypass_cache: bool,
}

impl CompletionRequest {
    pub fn new(model: impl Into<String>) -> Self {
        Self {
            model: model.into(),
            ..Default::default()
        }
    }

    pub fn message(mut self, message: ChatMessage) -> Self {
        self.messages.push(message);
        self
    }

    pub fn option(mut self, name: impl Into<String>, value: Value) -> Self {
        self.options.insert(name.into(), value);
        self
    }

    pub fn cache_key(&self) -> CacheKey {
        fingerprint(self)
    }
}

/// Fingerprint a completion request
pub fn fingerprint(request: &CompletionRequest) -> CacheKey {
    match serde_json::to_value(request) {
        Ok(value) => fingerprint_value(&value),
        Err(e) => {
            tracing::warn!(error = %e, "Request not representable as JSON, hashing debug form");
            let mut stripped = request.clone();
            stripped.bypass_cache = false;
            digest(format!("{stripped:?}").as_bytes())
        }
    }
}

/// Fingerprint an arbitrary JSON request body.
///
/// Cache-control fields are dropped from the top-level object only. Nested
/// objects are payload and hash as they are.
pub fn fingerprint_value(request: &Value) -> CacheKey {
    let mut canonical = String::new();
    match request {
        Value::Object(map) => write_object(map, CACHE_CONTROL_FIELDS, &mut canonical),
        other => write_canonical(other, &mut canonical),
    }
    digest(canonical.as_bytes())
}

fn digest(canonical: &[u8]) -> CacheKey {
    let mut hasher = Sha256::new();
    hasher.update(FINGERPRINT_VERSION.as_bytes());
    hasher.update(b"\n");
    hasher.update(canonical);
    let mut bytes = [0u8; 32];
    bytes.copy_from_slice(&hasher.finalize());
    CacheKey(bytes)
}

/// Writes a type-tagged rendering with sorted object keys
fn write_canonical(value: &Value, out: &mut String) {
    match value {
        Value::Null => out.push('n'),
        Value::Bool(b) => {
            out.push('b');
            out.push(if *b { '1' } else { '0' });
        }
        Value::Number(n) => {
            out.push('#');
            out.push_str(&n.to_string());
            out.push(';');
        }
        Value::String(s) => write_string(s, out),
        Value::Array(items) => {
            out.push('[');
            for item in items {
                write_canonical(item, out);
                out.push(',');
            }
            out.push(']');
        }
        Value::Object(map) => write_object(map, &[], out),
    }
}

fn write_object(map: &Map<String, Value>, skip: &[&str], out: &mut String) {
    let mut keys: Vec<&String> = map.keys().filter(|k| !skip.contains(&k.as_str())).collect();
    keys.sort();

    out.push('{');
    for key in keys {
        write_string(key, out);
        out.push(':');
        write_canonical(&map[key], out);
        out.push(',');
    }
    out.push('}');
}

// Length-prefixed so that no string content can imitate structure.
fn write_string(s: &str, out: &mut String) {
    out.push('s');
    out.push_str(&s.len().to_string());
    out.push(':');
    out.push_str(s);
}
