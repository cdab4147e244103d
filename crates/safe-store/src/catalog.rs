//! The application's named documents: file names, defaults and migrations.

use std::fmt;
use std::str::FromStr;

use chrono::{Local, NaiveDate, TimeZone};
use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::{json, Value};

use crate::error::StoreError;
use crate::migration::{MigrationContext, Migrations};
use crate::version::SchemaVersion;

/// Schema version of the running code; migrations up to this run on open.
pub const CURRENT_SCHEMA: SchemaVersion = SchemaVersion::new(6, 2, 0);

/// Tags created for decks by the 0.9.1 migration.
pub const DEFAULT_DECK_TAGS: [&str; 9] = [
    "Избранное",
    "В работе",
    "Констрактед",
    "Драфт",
    "Силед",
    "Импорт",
    "Эксперимент",
    "Фан",
    "Архив",
];

/// One of the documents the application persists.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Document {
    Settings,
    Cards,
    Featured,
    Decks,
}

impl Document {
    pub const ALL: [Document; 4] = [
        Document::Settings,
        Document::Cards,
        Document::Featured,
        Document::Decks,
    ];

    /// Documents that live in the directory chosen by the settings.
    pub const SIBLINGS: [Document; 3] = [Document::Cards, Document::Featured, Document::Decks];

    /// Name callers use to address the document (`get("decks")`).
    pub fn name(self) -> &'static str {
        match self {
            Document::Settings => "settings",
            Document::Cards => "cards",
            Document::Featured => "featured",
            Document::Decks => "decks",
        }
    }

    /// Backing file stem.
    pub fn file_stem(self) -> &'static str {
        match self {
            Document::Settings => "user_settings",
            Document::Cards => "user_cards",
            Document::Featured => "featured",
            Document::Decks => "user_decks",
        }
    }

    pub fn root_key(self) -> &'static str {
        self.name()
    }

    /// Envelope defaults.
    pub fn defaults(self) -> Value {
        match self {
            Document::Settings => json!({ "settings": default_settings() }),
            Document::Cards => json!({ "cards": {} }),
            Document::Featured => json!({ "featured": { "": [] } }),
            Document::Decks => json!({ "decks": { "tags": DEFAULT_DECK_TAGS, "decks": [] } }),
        }
    }

    pub fn migrations(self) -> Migrations {
        match self {
            Document::Settings => settings_migrations(),
            Document::Decks => deck_migrations(),
            Document::Cards | Document::Featured => Migrations::new(),
        }
    }
}

impl fmt::Display for Document {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Document {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Document::ALL
            .into_iter()
            .find(|d| d.name() == s)
            .ok_or_else(|| StoreError::UnknownStore(s.to_string()))
    }
}

/// Sixteen empty seats of opponents' picks.
fn empty_seats() -> Value {
    Value::Array(vec![json!([]); 16])
}

/// Settings written for a fresh install (and by a settings reset).
///
/// Already in the current schema shape, including a newly generated
/// `user_uuid`: a fresh file is stamped with the current version and never
/// migrated.
pub fn default_settings() -> Value {
    json!({
        "draft_options": {
            "user_uuid": uuid::Uuid::new_v4().to_string(),
            "their_cards": empty_seats(),
            "look_at": null,
            "boosters_set": ["", "", "", "", "", ""],
            "last_boosters": [null, null, null, null],
            "replay": false,
            "draft_key": "",
            "last_draft_key": [],
            "new_draft_key": "",
            "last_full_draft": null
        },
        "deal_options": {
            "deck": []
        },
        "collection_options": {
            "icons": [],
            "ldb": []
        },
        "deckbuilding_options": {
            "icons": [],
            "ldb": [],
            "useCardPool": false,
            "cardPoolName": "",
            "cardPool": []
        },
        "other_options": {
            "screenshot_size": 1,
            "screenshot_quality": 98,
            "collection_all_filters": false
        }
    })
}

fn set_if_missing(ctx: &mut MigrationContext<'_>, path: &str, value: Value) {
    if !ctx.has(path) {
        ctx.set(path, value);
    }
}

/// Old four-slot booster lists grow two empty slots.
fn pad_boosters(ctx: &mut MigrationContext<'_>) {
    if let Some(Value::Array(boosters)) = ctx.get("settings.draft_options.boosters_set") {
        if boosters.len() == 4 {
            let mut padded = boosters.clone();
            padded.extend([json!(""), json!("")]);
            ctx.set("settings.draft_options.boosters_set", padded);
        }
    }
}

fn settings_migrations() -> Migrations {
    Migrations::new()
        .add(SchemaVersion::new(0, 5, 5), |ctx| {
            ctx.clear();
            Ok(())
        })
        .add(SchemaVersion::new(0, 6, 6), |ctx| {
            pad_boosters(ctx);
            Ok(())
        })
        .add(SchemaVersion::new(0, 6, 7), |ctx| {
            ctx.set("settings.deal_options", default_settings()["deal_options"].clone());
            Ok(())
        })
        .add(SchemaVersion::new(0, 7, 3), |ctx| {
            set_if_missing(ctx, "settings.deal_options.deck", json!([]));
            Ok(())
        })
        .add(SchemaVersion::new(0, 8, 1), |ctx| {
            set_if_missing(ctx, "settings.collection_options.icons", json!([]));
            set_if_missing(ctx, "settings.deckbuilding_options.icons", json!([]));
            Ok(())
        })
        .add(SchemaVersion::new(1, 2, 10), |ctx| {
            ctx.set("settings.other_options", json!({}));
            Ok(())
        })
        .add(SchemaVersion::new(1, 4, 7), |ctx| {
            set_if_missing(ctx, "settings.draft_options.last_boosters", Value::Null);
            set_if_missing(ctx, "settings.draft_options.replay", json!(false));
            Ok(())
        })
        .add(SchemaVersion::new(1, 5, 0), |ctx| {
            ctx.set("settings.draft_options.last_boosters", json!([null, null, null, null]));
            Ok(())
        })
        .add(SchemaVersion::new(1, 6, 5), |ctx| {
            set_if_missing(ctx, "settings.collection_options.ldb", json!([]));
            set_if_missing(ctx, "settings.deckbuilding_options.ldb", json!([]));
            Ok(())
        })
        .add(SchemaVersion::new(1, 6, 7), |ctx| {
            ctx.set("settings.collection_options.ldb", json!([]));
            ctx.set("settings.deckbuilding_options.ldb", json!([]));
            Ok(())
        })
        .add(SchemaVersion::new(1, 7, 1), |ctx| {
            set_if_missing(ctx, "settings.deckbuilding_options.useCardPool", json!(false));
            set_if_missing(ctx, "settings.deckbuilding_options.cardPoolName", json!(""));
            set_if_missing(ctx, "settings.deckbuilding_options.cardPool", json!([]));
            Ok(())
        })
        .add(SchemaVersion::new(1, 7, 4), |ctx| {
            set_if_missing(ctx, "settings.draft_options.their_cards", empty_seats());
            set_if_missing(ctx, "settings.draft_options.look_at", Value::Null);
            Ok(())
        })
        .add(SchemaVersion::new(1, 9, 0), |ctx| {
            pad_boosters(ctx);
            Ok(())
        })
        .add(SchemaVersion::new(5, 0, 9), |ctx| {
            if !ctx.has("settings.draft_options.user_uuid") {
                ctx.set(
                    "settings.draft_options.user_uuid",
                    uuid::Uuid::new_v4().to_string(),
                );
            }
            Ok(())
        })
        .add(SchemaVersion::new(5, 2, 1), |ctx| {
            set_if_missing(ctx, "settings.draft_options.draft_key", json!(""));
            set_if_missing(ctx, "settings.draft_options.last_draft_key", json!(""));
            set_if_missing(ctx, "settings.draft_options.new_draft_key", json!(""));
            Ok(())
        })
        .add(SchemaVersion::new(5, 2, 2), |ctx| {
            set_if_missing(ctx, "settings.draft_options.last_full_draft", Value::Null);
            Ok(())
        })
        .add(SchemaVersion::new(5, 2, 3), |ctx| {
            ctx.set("settings.draft_options.last_draft_key", json!([]));
            Ok(())
        })
        .add(SchemaVersion::new(6, 2, 0), |ctx| {
            ctx.set("settings.other_options.screenshot_size", 1);
            ctx.set("settings.other_options.screenshot_quality", 98);
            ctx.set("settings.other_options.collection_all_filters", false);
            Ok(())
        })
}

static DECK_DATE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\{.*?\}\sот\s(\d{2})-(\d{2})-(\d{4})").expect("deck date pattern is valid")
});

/// Milliseconds since the epoch for the local midnight of a `{...} от DD-MM-YYYY` name.
fn deck_timestamp(name: &str) -> Option<i64> {
    let caps = DECK_DATE.captures(name)?;
    let day = caps[1].parse().ok()?;
    let month = caps[2].parse().ok()?;
    let year = caps[3].parse().ok()?;
    let midnight = NaiveDate::from_ymd_opt(year, month, day)?.and_hms_opt(0, 0, 0)?;
    Local
        .from_local_datetime(&midnight)
        .earliest()
        .map(|dt| dt.timestamp_millis())
}

fn tag_deck(deck: &mut Value, now_ms: i64) {
    let name = deck
        .get("name")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();
    let card_count = deck
        .get("cards")
        .and_then(Value::as_array)
        .map_or(0, Vec::len);

    let lowered = name.to_lowercase();
    let mut tags = Vec::new();
    if lowered.contains("драфт") {
        tags.push("Драфт");
    } else if lowered.contains("силед") {
        tags.push("Силед");
    } else {
        tags.push("Констрактед");
    }
    if card_count < 30 {
        tags.push("В работе");
    }

    if let Value::Object(map) = deck {
        map.insert(
            "date".to_string(),
            json!(deck_timestamp(&name).unwrap_or(now_ms)),
        );
        map.insert("tags".to_string(), json!(tags));
    }
}

fn deck_migrations() -> Migrations {
    Migrations::new()
        .add(SchemaVersion::new(0, 4, 0), |ctx| {
            ctx.clear();
            Ok(())
        })
        .add(SchemaVersion::new(0, 9, 1), |ctx| {
            ctx.set("decks.tags", json!(DEFAULT_DECK_TAGS));

            let mut decks = match ctx.get("decks.decks") {
                Some(Value::Array(decks)) => decks.clone(),
                _ => Vec::new(),
            };
            let now_ms = Local::now().timestamp_millis();
            for deck in &mut decks {
                tag_deck(deck, now_ms);
            }
            ctx.set("decks.decks", decks);
            Ok(())
        })
}
