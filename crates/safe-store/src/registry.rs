//! Opens the application's documents as a set.
//!
//! The settings document always lives in the base directory. Its
//! `settings_path` key, when set, moves the other documents elsewhere.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tracing::{info, warn};

use crate::backup;
use crate::catalog::{self, Document, CURRENT_SCHEMA};
use crate::envelope::Format;
use crate::error::{Result, StoreError};
use crate::events::Subscription;
use crate::store::{SafeStore, StoreOptions, DEFAULT_WRITE_COOLDOWN};
use crate::watcher::WatchSettings;
use crate::writer::PendingWrite;

/// Settings key naming the directory of the other documents.
pub const SETTINGS_PATH_KEY: &str = "settings_path";

/// How to open a [`StoreRegistry`].
#[derive(Debug, Clone)]
pub struct RegistryOptions {
    /// Directory holding the settings document.
    pub base_dir: PathBuf,
    pub format: Format,
    pub watch: WatchSettings,
    pub write_cooldown: Duration,
    /// Archive the documents directory after opening.
    pub backup_on_open: bool,
}

impl RegistryOptions {
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
            format: Format::default(),
            watch: WatchSettings::default(),
            write_cooldown: DEFAULT_WRITE_COOLDOWN,
            backup_on_open: true,
        }
    }

    pub fn format(mut self, format: Format) -> Self {
        self.format = format;
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

    pub fn backup_on_open(mut self, enabled: bool) -> Self {
        self.backup_on_open = enabled;
        self
    }

    /// Store options for `doc` in `dir`.
    pub fn store_options(&self, doc: Document, dir: &Path) -> StoreOptions {
        StoreOptions::new(doc.file_stem(), doc.root_key(), dir)
            .defaults(doc.defaults())
            .format(self.format)
            .migrations(doc.migrations(), CURRENT_SCHEMA)
            .watch_settings(self.watch)
            .write_cooldown(self.write_cooldown)
    }
}

/// The four application documents, addressable by name.
pub struct StoreRegistry {
    stores: HashMap<Document, Arc<SafeStore>>,
    documents_dir: PathBuf,
}

impl StoreRegistry {
    /// Open settings first, then the documents in the directory it names.
    ///
    /// Any store failing to open is fatal; stores opened before the failure
    /// are closed again.
    pub async fn open(options: RegistryOptions) -> Result<Self> {
        let settings = SafeStore::open(options.store_options(Document::Settings, &options.base_dir))
            .await?;

        let documents_dir = match settings.get().get(SETTINGS_PATH_KEY).and_then(Value::as_str) {
            Some(dir) if !dir.is_empty() => PathBuf::from(dir),
            _ => options.base_dir.clone(),
        };
        info!("Documents directory: {}", documents_dir.display());

        let mut stores = HashMap::new();
        stores.insert(Document::Settings, Arc::new(settings));

        for doc in Document::SIBLINGS {
            match SafeStore::open(options.store_options(doc, &documents_dir)).await {
                Ok(store) => {
                    stores.insert(doc, Arc::new(store));
                }
                Err(e) => {
                    for store in stores.values() {
                        store.close().await;
                    }
                    return Err(e);
                }
            }
        }

        // Sibling stores canonicalized the directory when they opened.
        let documents_dir = stores
            .get(&Document::Cards)
            .map(|s| s.directory().to_path_buf())
            .unwrap_or(documents_dir);

        if options.backup_on_open {
            tokio::spawn(backup::spawn_archive(documents_dir.clone()));
        }

        Ok(Self {
            stores,
            documents_dir,
        })
    }

    /// The store named `name` (`settings`, `cards`, `featured` or `decks`).
    pub fn store(&self, name: &str) -> Result<Arc<SafeStore>> {
        let doc: Document = name.parse()?;
        self.stores
            .get(&doc)
            .cloned()
            .ok_or_else(|| StoreError::UnknownStore(name.to_string()))
    }

    pub fn get(&self, name: &str) -> Result<Arc<Value>> {
        Ok(self.store(name)?.get())
    }

    pub fn set_queued(&self, name: &str, value: Value) -> Result<PendingWrite> {
        Ok(self.store(name)?.set_queued(value))
    }

    pub fn update_queued<F>(&self, name: &str, update: F) -> Result<PendingWrite>
    where
        F: FnOnce(&Value) -> Value,
    {
        Ok(self.store(name)?.update_queued(update))
    }

    pub fn on_change(
        &self,
        name: &str,
        callback: impl Fn(&Value) + Send + Sync + 'static,
    ) -> Result<Subscription> {
        Ok(self.store(name)?.on_change(callback))
    }

    pub async fn close(&self, name: &str) -> Result<()> {
        self.store(name)?.close().await;
        Ok(())
    }

    /// Close every store; settings goes last.
    pub async fn close_all(&self) {
        for doc in Document::SIBLINGS {
            if let Some(store) = self.stores.get(&doc) {
                store.close().await;
            }
        }
        if let Some(settings) = self.stores.get(&Document::Settings) {
            settings.close().await;
        }
    }

    /// Directory the non-settings documents live in.
    pub fn documents_dir(&self) -> &Path {
        &self.documents_dir
    }

    /// Move the documents to `dest`.
    ///
    /// Copies each document file that `dest` does not already have, then
    /// records `dest` in the settings. The open stores keep using the old
    /// directory; the next [`StoreRegistry::open`] uses the new one.
    pub async fn relocate(&self, dest: impl AsRef<Path>) -> Result<()> {
        let dest = dest.as_ref();
        tokio::fs::create_dir_all(dest)
            .await
            .map_err(|source| StoreError::CreateDir {
                path: dest.to_path_buf(),
                source,
            })?;

        for doc in Document::SIBLINGS {
            let store = self.store(doc.name())?;
            let target = dest.join(format!("{}.json", doc.file_stem()));
            if tokio::fs::try_exists(&target)
                .await
                .map_err(|e| StoreError::io(&target, e))?
            {
                info!("{} already present, not copied", target.display());
                continue;
            }
            tokio::fs::copy(store.path(), &target)
                .await
                .map_err(|e| StoreError::io(&target, e))?;
            info!("Copied {} to {}", store.path().display(), target.display());
        }

        let dest_str = dest.to_string_lossy().into_owned();
        self.update_queued(Document::Settings.name(), move |cur| {
            let mut next = match cur {
                Value::Object(map) => map.clone(),
                _ => Default::default(),
            };
            next.insert(SETTINGS_PATH_KEY.to_string(), Value::String(dest_str));
            Value::Object(next)
        })?
        .await;
        Ok(())
    }

    /// Replace the settings with defaults, keeping `draft_options.last_draft_key`
    /// and the install's `draft_options.user_uuid`.
    pub async fn reset_settings(&self) -> Result<()> {
        let current = self.get(Document::Settings.name())?;
        let mut next = catalog::default_settings();

        match current.pointer("/draft_options/last_draft_key") {
            Some(key) => next["draft_options"]["last_draft_key"] = key.clone(),
            None => warn!("No last_draft_key to carry over on settings reset"),
        }
        if let Some(uuid) = current.pointer("/draft_options/user_uuid") {
            next["draft_options"]["user_uuid"] = uuid.clone();
        }

        self.set_queued(Document::Settings.name(), next)?.await;
        Ok(())
    }
}
