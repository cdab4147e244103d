//! The on-disk JSON envelope: root-key document plus persistence metadata.
//!
//! A backing file looks like
//! `{"settings": {...}, "__internal__": {"migrations": {"version": "6.2.0"}}}`.
//! Only the value under the root key is user data.

use std::path::Path;

use rand::Rng;
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};
use tokio::fs;
use tracing::warn;

use crate::error::{Result, StoreError};
use crate::path::{get_path, set_path};
use crate::version::SchemaVersion;

/// Reserved top-level key holding persistence metadata.
pub const INTERNAL_KEY: &str = "__internal__";

/// Dotted path of the last applied schema version.
pub const VERSION_PATH: &str = "__internal__.migrations.version";

/// How envelopes are serialized to disk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Format {
    /// Single-line JSON.
    #[default]
    Compact,
    /// Indented JSON, easier to read and diff by hand.
    Pretty,
}

impl Format {
    pub fn serialize(self, envelope: &Value) -> Result<String> {
        let text = match self {
            Format::Compact => serde_json::to_string(envelope)?,
            Format::Pretty => serde_json::to_string_pretty(envelope)?,
        };
        Ok(text)
    }
}

/// Result of reading a backing file at construction time.
#[derive(Debug)]
pub enum Loaded {
    /// The file did not exist.
    Missing,
    /// The file existed but was not a JSON object.
    Corrupt,
    /// The parsed envelope.
    Envelope(Map<String, Value>),
}

/// Read and parse the envelope at `path`.
///
/// Only I/O errors other than "not found" are returned as errors.
pub async fn load(path: &Path) -> Result<Loaded> {
    let raw = match fs::read_to_string(path).await {
        Ok(raw) => raw,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Loaded::Missing),
        Err(e) => return Err(StoreError::io(path, e)),
    };

    match parse(&raw) {
        Some(map) => Ok(Loaded::Envelope(map)),
        None => {
            warn!("Ignoring unreadable store file {}", path.display());
            Ok(Loaded::Corrupt)
        }
    }
}

/// Parse envelope text. Anything but a JSON object is rejected.
pub fn parse(raw: &str) -> Option<Map<String, Value>> {
    match serde_json::from_str::<Value>(raw) {
        Ok(Value::Object(map)) => Some(map),
        _ => None,
    }
}

/// Shallow top-level merge: defaults first, persisted keys win.
pub fn merge_defaults(defaults: &Map<String, Value>, persisted: Map<String, Value>) -> Value {
    let mut merged = defaults.clone();
    merged.extend(persisted);
    Value::Object(merged)
}

/// The last schema version recorded in the envelope, if any.
pub fn recorded_version(envelope: &Value) -> Option<SchemaVersion> {
    get_path(envelope, VERSION_PATH)
        .and_then(Value::as_str)
        .and_then(|s| s.parse().ok())
}

pub fn record_version(envelope: &mut Value, version: SchemaVersion) {
    set_path(envelope, VERSION_PATH, Value::String(version.to_string()));
}

/// The document under `root_key`, or `fallback` when the key is absent.
pub fn document(envelope: &Value, root_key: &str, fallback: &Value) -> Value {
    envelope
        .get(root_key)
        .cloned()
        .unwrap_or_else(|| fallback.clone())
}

/// Content fingerprint used to tell real changes from echoes.
///
/// SHA-256 of the canonical form: compact JSON with object keys sorted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fingerprint(String);

impl Fingerprint {
    pub fn of(document: &Value) -> Self {
        let canonical = serde_json::to_string(&canonicalize(document)).unwrap_or_default();
        let mut hasher = Sha256::new();
        hasher.update(canonical.as_bytes());
        Self(hex::encode(hasher.finalize()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// Copy of `value` with every object's keys in sorted order.
fn canonicalize(value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            let sorted: Map<String, Value> = keys
                .into_iter()
                .map(|k| (k.clone(), canonicalize(&map[k.as_str()])))
                .collect();
            Value::Object(sorted)
        }
        Value::Array(items) => Value::Array(items.iter().map(canonicalize).collect()),
        other => other.clone(),
    }
}

fn random_hex() -> String {
    let bytes: [u8; 8] = rand::rng().random();
    hex::encode(bytes)
}

/// Atomic write using temp file + rename.
///
/// Readers (and other watchers) either see the old file or the new one,
/// never a partially written file from this process.
pub async fn atomic_write(path: &Path, content: &[u8]) -> std::io::Result<()> {
    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let temp_path = path.with_file_name(format!("{}.{}.tmp", file_name, random_hex()));

    if let Err(e) = fs::write(&temp_path, content).await {
        let _ = fs::remove_file(&temp_path).await;
        return Err(e);
    }

    if let Err(e) = fs::rename(&temp_path, path).await {
        let _ = fs::remove_file(&temp_path).await;
        return Err(e);
    }

    Ok(())
}
