//! SafeStore - JSON document stores with serialized writes, external change
//! detection and schema migrations.
//!
//! A [`SafeStore`] owns one named document inside one JSON file. Reads come
//! from memory; writes are queued and committed in order by a per-store
//! worker; edits made to the file by other processes are picked up by a
//! filesystem watcher and reported to subscribers once the file has settled.
//!
//! [`StoreRegistry`] opens the application's documents together, with the
//! settings document deciding where the others live.

pub mod backup;
pub mod catalog;
pub mod envelope;
pub mod error;
pub mod events;
pub mod migration;
pub mod path;
pub mod registry;
pub mod store;
pub mod version;
pub mod watcher;
pub mod writer;

pub use catalog::Document;
pub use envelope::Format;
pub use error::{MigrationError, Result, StoreError};
pub use events::Subscription;
pub use migration::{MigrationContext, Migrations};
pub use registry::{RegistryOptions, StoreRegistry};
pub use store::{SafeStore, StoreOptions};
pub use version::SchemaVersion;
pub use watcher::WatchSettings;
pub use writer::PendingWrite;
