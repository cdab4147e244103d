//! The document store: one named JSON document backed by one file.
//!
//! `SafeStore` composes the migration engine, the write serializer and the
//! change watcher:
//!
//! - `get` reads the in-memory document and never touches disk.
//! - `set_queued` updates the in-memory document and its fingerprint
//!   immediately, then queues the physical write. The returned future
//!   resolves once the write has been attempted.
//! - `on_change` only fires for edits made by someone else. Our own writes
//!   are reported through their `PendingWrite`, never through subscribers.
//! - `close` drains the write queue and then stops the watcher.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use once_cell::sync::Lazy;
use serde::de::DeserializeOwned;
use serde_json::{Map, Value};
use tokio::fs;
use tracing::{debug, error, info};

use crate::envelope::{self, Fingerprint, Format, Loaded};
use crate::error::{Result, StoreError};
use crate::events::{ChangeBus, Subscription};
use crate::migration::{self, Migrations};
use crate::version::SchemaVersion;
use crate::watcher::{ChangeWatcher, WatchSettings};
use crate::writer::{PendingWrite, WriteActivity, WriteSerializer};

/// Default delay after a write before watcher events are trusted again.
pub const DEFAULT_WRITE_COOLDOWN: Duration = Duration::from_millis(120);

/// Everything needed to open one store.
#[derive(Debug, Clone)]
pub struct StoreOptions {
    /// File stem; the backing file is `<directory>/<name>.json`.
    pub name: String,
    /// Top-level key the document lives under.
    pub root_key: String,
    pub directory: PathBuf,
    /// Defaults for the whole envelope, not just the root key.
    pub defaults: Map<String, Value>,
    pub format: Format,
    pub migrations: Migrations,
    /// Schema version the running code expects.
    pub schema_version: SchemaVersion,
    pub watch: WatchSettings,
    pub write_cooldown: Duration,
}

impl StoreOptions {
    pub fn new(
        name: impl Into<String>,
        root_key: impl Into<String>,
        directory: impl Into<PathBuf>,
    ) -> Self {
        Self {
            name: name.into(),
            root_key: root_key.into(),
            directory: directory.into(),
            defaults: Map::new(),
            format: Format::default(),
            migrations: Migrations::new(),
            schema_version: SchemaVersion::ZERO,
            watch: WatchSettings::default(),
            write_cooldown: DEFAULT_WRITE_COOLDOWN,
        }
    }

    /// Envelope defaults. A non-object value becomes the default document.
    ///
    /// A new file is stamped with `schema_version` without migrating, so the
    /// defaults must already contain everything the migrations would add.
    pub fn defaults(mut self, defaults: Value) -> Self {
        self.defaults = match defaults {
            Value::Object(map) => map,
            other => {
                let mut map = Map::new();
                map.insert(self.root_key.clone(), other);
                map
            }
        };
        self
    }

    pub fn format(mut self, format: Format) -> Self {
        self.format = format;
        self
    }

    pub fn migrations(mut self, migrations: Migrations, schema_version: SchemaVersion) -> Self {
        self.migrations = migrations;
        self.schema_version = schema_version;
        self
    }

    pub fn watch_settings(mut self, watch: WatchSettings) -> Self {
        self.watch = watch;
        self
    }

    pub fn write_cooldown(mut self, cooldown: Duration) -> Self {
        self.write_cooldown = cooldown;
        self
    }

    pub fn file_path(&self) -> PathBuf {
        self.directory.join(format!("{}.json", self.name))
    }

    fn default_document(&self) -> Value {
        self.defaults.get(&self.root_key).cloned().unwrap_or(Value::Null)
    }
}

/// Backing files currently owned by an open store in this process.
static OPEN_PATHS: Lazy<Mutex<HashSet<PathBuf>>> = Lazy::new(|| Mutex::new(HashSet::new()));

/// Exclusive claim on a backing file path, released on drop.
struct PathClaim(PathBuf);

impl PathClaim {
    fn acquire(path: &Path) -> Result<Self> {
        let mut open = OPEN_PATHS.lock().unwrap_or_else(|e| e.into_inner());
        if !open.insert(path.to_path_buf()) {
            return Err(StoreError::AlreadyOpen(path.to_path_buf()));
        }
        Ok(Self(path.to_path_buf()))
    }
}

impl Drop for PathClaim {
    fn drop(&mut self) {
        OPEN_PATHS
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&self.0);
    }
}

struct State {
    envelope: Value,
    document: Arc<Value>,
    fingerprint: Fingerprint,
}

/// State shared between the store handle and its watcher task.
struct Shared {
    root_key: String,
    default_document: Value,
    state: Mutex<State>,
    activity: Arc<WriteActivity>,
    bus: Arc<ChangeBus>,
    closed: AtomicBool,
}

impl Shared {
    fn lock(&self) -> std::sync::MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Fold a settled external edit into the cache and notify subscribers.
    fn apply_external(&self, mut parsed: Map<String, Value>) {
        if self.closed.load(Ordering::SeqCst) {
            return;
        }

        let document = parsed
            .get(&self.root_key)
            .cloned()
            .unwrap_or_else(|| self.default_document.clone());
        let fingerprint = Fingerprint::of(&document);

        {
            let mut state = self.lock();
            // set_queued enqueues under this lock, so this check can't race it.
            if self.activity.is_suppressed() {
                debug!("[{}] change arrived next to own write, ignoring", self.root_key);
                return;
            }
            // Keys beside the document (metadata, other writers' keys) are
            // kept even when the document itself is unchanged. An edit that
            // dropped the version marker keeps ours.
            if !parsed.contains_key(envelope::INTERNAL_KEY) {
                if let Some(internal) = state.envelope.get(envelope::INTERNAL_KEY) {
                    parsed.insert(envelope::INTERNAL_KEY.to_string(), internal.clone());
                }
            }
            state.envelope = Value::Object(parsed);
            if state.fingerprint == fingerprint {
                debug!("[{}] change carries no new content", self.root_key);
                return;
            }
            state.document = Arc::new(document.clone());
            state.fingerprint = fingerprint;
        }

        info!("[{}] external change detected", self.root_key);
        self.bus.emit(&document);
    }
}

/// A write-serializing, externally observable JSON document store.
pub struct SafeStore {
    name: String,
    path: PathBuf,
    shared: Arc<Shared>,
    writer: WriteSerializer,
    watcher: Mutex<Option<ChangeWatcher>>,
    format: Format,
    claim: Mutex<Option<PathClaim>>,
}

impl SafeStore {
    /// Open (or create) the store described by `options`.
    ///
    /// Loads the file if present and migrates it, otherwise writes the
    /// defaults. Directory, I/O and migration failures are fatal.
    pub async fn open(options: StoreOptions) -> Result<Self> {
        fs::create_dir_all(&options.directory)
            .await
            .map_err(|source| StoreError::CreateDir {
                path: options.directory.clone(),
                source,
            })?;

        let directory = options
            .directory
            .canonicalize()
            .map_err(|e| StoreError::io(&options.directory, e))?;
        let path = directory.join(format!("{}.json", options.name));
        let claim = PathClaim::acquire(&path)?;

        let (envelope, dirty) = Self::load_envelope(&options, &path).await?;
        if dirty {
            let text = options.format.serialize(&envelope)?;
            envelope::atomic_write(&path, text.as_bytes())
                .await
                .map_err(|e| StoreError::io(&path, e))?;
        }

        let default_document = options.default_document();
        let document = envelope::document(&envelope, &options.root_key, &default_document);
        let fingerprint = Fingerprint::of(&document);

        let activity = Arc::new(WriteActivity::new());
        let shared = Arc::new(Shared {
            root_key: options.root_key.clone(),
            default_document,
            state: Mutex::new(State {
                envelope,
                document: Arc::new(document),
                fingerprint,
            }),
            activity: Arc::clone(&activity),
            bus: Arc::new(ChangeBus::new()),
            closed: AtomicBool::new(false),
        });

        let writer = WriteSerializer::spawn(
            options.root_key.clone(),
            path.clone(),
            Arc::clone(&activity),
            options.write_cooldown,
        );

        let watch_shared = Arc::clone(&shared);
        let watcher = ChangeWatcher::start(
            options.root_key.clone(),
            path.clone(),
            activity,
            options.watch,
            move |parsed| watch_shared.apply_external(parsed),
        )?;

        info!("[{}] opened {}", options.root_key, path.display());

        Ok(Self {
            name: options.name,
            path,
            shared,
            writer,
            watcher: Mutex::new(Some(watcher)),
            format: options.format,
            claim: Mutex::new(Some(claim)),
        })
    }

    /// Read, merge defaults, and migrate. Returns the envelope and whether
    /// it differs from what is on disk.
    async fn load_envelope(options: &StoreOptions, path: &Path) -> Result<(Value, bool)> {
        match envelope::load(path).await? {
            Loaded::Missing | Loaded::Corrupt => {
                // Fresh start: no migration runs, so defaults must be in the
                // current schema shape.
                let mut fresh = Value::Object(options.defaults.clone());
                envelope::record_version(&mut fresh, options.schema_version);
                Ok((fresh, true))
            }
            Loaded::Envelope(persisted) => {
                let on_disk = Value::Object(persisted.clone());
                let mut merged = envelope::merge_defaults(&options.defaults, persisted);
                migration::migrate(
                    &options.root_key,
                    &mut merged,
                    &options.defaults,
                    &options.migrations,
                    options.schema_version,
                )?;
                let dirty = merged != on_disk;
                Ok((merged, dirty))
            }
        }
    }

    /// Current document. Never touches disk.
    pub fn get(&self) -> Arc<Value> {
        Arc::clone(&self.shared.lock().document)
    }

    /// Current document deserialized into `T`.
    pub fn get_as<T: DeserializeOwned>(&self) -> Result<T> {
        Ok(T::deserialize(&*self.get())?)
    }

    /// Queue a full replacement of the document.
    ///
    /// `get` reflects `value` as soon as this returns. After `close` this is
    /// a no-op and the returned future is already resolved.
    pub fn set_queued(&self, value: Value) -> PendingWrite {
        if self.shared.closed.load(Ordering::SeqCst) {
            debug!("[{}] store closed, dropping write", self.shared.root_key);
            return PendingWrite::ready();
        }

        let mut state = self.shared.lock();
        // close() flips the flag under this lock; a write that gets past
        // this check is queued before the writer shuts down.
        if self.shared.closed.load(Ordering::SeqCst) {
            return PendingWrite::ready();
        }
        if !state.envelope.is_object() {
            state.envelope = Value::Object(Map::new());
        }
        if let Value::Object(map) = &mut state.envelope {
            map.insert(self.shared.root_key.clone(), value.clone());
        }

        let bytes = match self.format.serialize(&state.envelope) {
            Ok(text) => text.into_bytes(),
            Err(e) => {
                error!("[{}] cannot serialize document: {}", self.shared.root_key, e);
                return PendingWrite::ready();
            }
        };

        state.fingerprint = Fingerprint::of(&value);
        state.document = Arc::new(value);

        // Submit while still holding the lock so cache order == write order.
        self.writer.submit(bytes)
    }

    /// Apply `update` to the current document and queue the result.
    ///
    /// `update` sees the value at call time. Two overlapping calls are not a
    /// read-modify-write transaction; only their write order is guaranteed.
    pub fn update_queued<F>(&self, update: F) -> PendingWrite
    where
        F: FnOnce(&Value) -> Value,
    {
        let current = self.get();
        self.set_queued(update(&current))
    }

    /// Subscribe to external changes.
    pub fn on_change(&self, callback: impl Fn(&Value) + Send + Sync + 'static) -> Subscription {
        self.shared.bus.subscribe(callback)
    }

    /// Drain the write queue, then stop watching. Safe to call twice.
    pub async fn close(&self) {
        let was_closed = {
            let _state = self.shared.lock();
            self.shared.closed.swap(true, Ordering::SeqCst)
        };
        if !was_closed {
            info!("[{}] closing", self.shared.root_key);
        }

        self.writer.shutdown().await;

        let watcher = self.watcher.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(watcher) = watcher {
            watcher.stop().await;
        }

        self.shared.bus.clear();
        drop(self.claim.lock().unwrap_or_else(|e| e.into_inner()).take());
    }

    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::SeqCst)
    }

    /// File stem of the backing file.
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn root_key(&self) -> &str {
        &self.shared.root_key
    }

    /// Backing file path.
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn directory(&self) -> &Path {
        self.path.parent().unwrap_or(&self.path)
    }
}
