//! Versioned schema migrations applied to an envelope at construction.
//!
//! Migrations are keyed by [`SchemaVersion`] and run in ascending order. The
//! last applied version is recorded inside the envelope itself under
//! [`VERSION_PATH`](crate::envelope::VERSION_PATH), so a migration runs when
//! `recorded < version <= current` and never again afterwards.
//!
//! Migrations should still guard themselves with `has` checks where they add
//! keys: a file written by a binary that skipped the marker (or edited by
//! hand) may already contain the shape a step is about to create.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use serde_json::{Map, Value};
use tracing::{info, warn};

use crate::envelope::{self, INTERNAL_KEY};
use crate::error::{MigrationError, Result, StoreError};
use crate::path::{delete_path, get_path, has_path, set_path};
use crate::version::SchemaVersion;

type MigrationFn = dyn Fn(&mut MigrationContext<'_>) -> std::result::Result<(), MigrationError>
    + Send
    + Sync;

/// Ordered set of migrations for one store.
#[derive(Clone, Default)]
pub struct Migrations {
    steps: BTreeMap<SchemaVersion, Arc<MigrationFn>>,
}

impl Migrations {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the migration for `version`, replacing any previous one.
    pub fn add<F>(mut self, version: SchemaVersion, migration: F) -> Self
    where
        F: Fn(&mut MigrationContext<'_>) -> std::result::Result<(), MigrationError>
            + Send
            + Sync
            + 'static,
    {
        self.steps.insert(version, Arc::new(migration));
        self
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn versions(&self) -> impl Iterator<Item = SchemaVersion> + '_ {
        self.steps.keys().copied()
    }
}

impl fmt::Debug for Migrations {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.steps.keys()).finish()
    }
}

/// Mutable handle a migration uses to inspect and reshape the envelope.
///
/// Paths are dotted and relative to the whole envelope, so a settings
/// migration addresses `"settings.draft_options.replay"`.
pub struct MigrationContext<'a> {
    envelope: &'a mut Value,
    defaults: &'a Map<String, Value>,
}

impl<'a> MigrationContext<'a> {
    pub fn get(&self, path: &str) -> Option<&Value> {
        get_path(&*self.envelope, path)
    }

    pub fn has(&self, path: &str) -> bool {
        has_path(&*self.envelope, path)
    }

    pub fn set(&mut self, path: &str, value: impl Into<Value>) {
        set_path(self.envelope, path, value.into());
    }

    pub fn delete(&mut self, path: &str) -> Option<Value> {
        delete_path(self.envelope, path)
    }

    /// Reset every key to the store defaults. Persistence metadata survives.
    pub fn clear(&mut self) {
        let internal = self
            .envelope
            .as_object()
            .and_then(|map| map.get(INTERNAL_KEY))
            .cloned();

        let mut fresh = self.defaults.clone();
        if let Some(internal) = internal {
            fresh.insert(INTERNAL_KEY.to_string(), internal);
        }
        *self.envelope = Value::Object(fresh);
    }

    pub fn defaults(&self) -> &Map<String, Value> {
        self.defaults
    }
}

/// What a migration pass did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MigrationOutcome {
    pub applied: Vec<SchemaVersion>,
    /// Whether the envelope (including the version marker) changed.
    pub changed: bool,
}

/// Bring `envelope` up to `current`.
///
/// Works on a copy: when any step fails the envelope is left untouched and
/// the error is returned, so a half-migrated document is never exposed.
pub fn migrate(
    store: &str,
    envelope: &mut Value,
    defaults: &Map<String, Value>,
    migrations: &Migrations,
    current: SchemaVersion,
) -> Result<MigrationOutcome> {
    let previous = envelope::recorded_version(envelope).unwrap_or(SchemaVersion::ZERO);

    if previous > current {
        warn!(
            "[{}] file was written by schema {}, newer than {}; leaving it as is",
            store, previous, current
        );
        return Ok(MigrationOutcome::default());
    }

    let mut working = envelope.clone();
    let mut applied = Vec::new();

    for (version, step) in migrations.steps.range(previous..=current) {
        if *version <= previous {
            continue;
        }

        let mut ctx = MigrationContext {
            envelope: &mut working,
            defaults,
        };
        step(&mut ctx).map_err(|e| StoreError::Migration {
            version: *version,
            message: e.to_string(),
        })?;

        envelope::record_version(&mut working, *version);
        applied.push(*version);
        info!("[{}] applied migration {}", store, version);
    }

    envelope::record_version(&mut working, current);

    let changed = working != *envelope;
    *envelope = working;
    Ok(MigrationOutcome { applied, changed })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn defaults() -> Map<String, Value> {
        match json!({"settings": {"draft_options": {"boosters_set": ["a", "b", "c", "d"]}}}) {
            Value::Object(map) => map,
            _ => unreachable!(),
        }
    }

    fn sample() -> Migrations {
        Migrations::new()
            .add(SchemaVersion::new(0, 6, 6), |ctx| {
                let boosters = ctx.get("settings.draft_options.boosters_set").cloned();
                if let Some(Value::Array(mut items)) = boosters {
                    if items.len() == 4 {
                        items.extend([json!(""), json!("")]);
                        ctx.set("settings.draft_options.boosters_set", items);
                    }
                }
                Ok(())
            })
            .add(SchemaVersion::new(1, 4, 7), |ctx| {
                if !ctx.has("settings.draft_options.replay") {
                    ctx.set("settings.draft_options.replay", false);
                }
                Ok(())
            })
            .add(SchemaVersion::new(9, 0, 0), |ctx| {
                ctx.set("settings.from_the_future", true);
                Ok(())
            })
    }

    #[test]
    fn test_applies_pending_in_order_up_to_current() {
        let mut envelope = json!({
            "settings": {"draft_options": {"boosters_set": ["a", "b", "c", "d"]}},
            "__internal__": {"migrations": {"version": "0.5.0"}}
        });

        let outcome = migrate(
            "settings",
            &mut envelope,
            &defaults(),
            &sample(),
            SchemaVersion::new(6, 2, 0),
        )
        .unwrap();

        assert_eq!(
            outcome.applied,
            vec![SchemaVersion::new(0, 6, 6), SchemaVersion::new(1, 4, 7)]
        );
        assert!(outcome.changed);
        assert_eq!(
            envelope["settings"]["draft_options"]["boosters_set"],
            json!(["a", "b", "c", "d", "", ""])
        );
        assert_eq!(envelope["settings"]["draft_options"]["replay"], json!(false));
        assert!(envelope["settings"].get("from_the_future").is_none());
        assert_eq!(envelope["__internal__"]["migrations"]["version"], json!("6.2.0"));
    }

    #[test]
    fn test_second_run_is_noop() {
        let mut envelope = json!({
            "settings": {"draft_options": {"boosters_set": ["a", "b", "c", "d"]}},
            "__internal__": {"migrations": {"version": "0.5.0"}}
        });
        let current = SchemaVersion::new(6, 2, 0);

        migrate("settings", &mut envelope, &defaults(), &sample(), current).unwrap();
        let once = envelope.clone();

        let outcome = migrate("settings", &mut envelope, &defaults(), &sample(), current).unwrap();
        assert!(outcome.applied.is_empty());
        assert!(!outcome.changed);
        assert_eq!(envelope, once);
    }

    #[test]
    fn test_skips_already_recorded_version() {
        let mut envelope = json!({
            "settings": {"draft_options": {"boosters_set": ["a", "b", "c", "d"]}},
            "__internal__": {"migrations": {"version": "0.6.6"}}
        });

        let outcome = migrate(
            "settings",
            &mut envelope,
            &defaults(),
            &sample(),
            SchemaVersion::new(6, 2, 0),
        )
        .unwrap();

        assert_eq!(outcome.applied, vec![SchemaVersion::new(1, 4, 7)]);
        assert_eq!(
            envelope["settings"]["draft_options"]["boosters_set"],
            json!(["a", "b", "c", "d"])
        );
    }

    #[test]
    fn test_clear_resets_to_defaults_but_keeps_marker() {
        let migrations = Migrations::new().add(SchemaVersion::new(0, 5, 5), |ctx| {
            ctx.clear();
            Ok(())
        });
        let mut envelope = json!({
            "settings": {"junk": 1},
            "stray": true,
            "__internal__": {"migrations": {"version": "0.1.0"}}
        });

        migrate(
            "settings",
            &mut envelope,
            &defaults(),
            &migrations,
            SchemaVersion::new(1, 0, 0),
        )
        .unwrap();

        assert_eq!(
            envelope,
            json!({
                "settings": {"draft_options": {"boosters_set": ["a", "b", "c", "d"]}},
                "__internal__": {"migrations": {"version": "1.0.0"}}
            })
        );
    }

    #[test]
    fn test_failure_leaves_envelope_untouched() {
        let migrations = Migrations::new()
            .add(SchemaVersion::new(1, 0, 0), |ctx| {
                ctx.set("settings.partial", true);
                Ok(())
            })
            .add(SchemaVersion::new(2, 0, 0), |_| Err(MigrationError::new("boom")));
        let mut envelope = json!({"settings": {}});
        let before = envelope.clone();

        let err = migrate(
            "settings",
            &mut envelope,
            &defaults(),
            &migrations,
            SchemaVersion::new(3, 0, 0),
        )
        .unwrap_err();

        assert!(matches!(
            err,
            StoreError::Migration { version, .. } if version == SchemaVersion::new(2, 0, 0)
        ));
        assert_eq!(envelope, before);
    }

    #[test]
    fn test_newer_file_is_left_alone() {
        let mut envelope = json!({
            "settings": {},
            "__internal__": {"migrations": {"version": "7.0.0"}}
        });
        let before = envelope.clone();

        let outcome = migrate(
            "settings",
            &mut envelope,
            &defaults(),
            &sample(),
            SchemaVersion::new(6, 2, 0),
        )
        .unwrap();

        assert_eq!(outcome, MigrationOutcome::default());
        assert_eq!(envelope, before);
    }
}
