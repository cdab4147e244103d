//! End-to-end tests for SafeStore against the real filesystem watcher.
//!
//! Covers write ordering, echo suppression, external change delivery and
//! shutdown behavior.

use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::FutureExt;
use safe_store::{
    Document, RegistryOptions, SafeStore, StoreOptions, WatchSettings,
};
use serde_json::{json, Value};
use tempfile::TempDir;
use tokio::time::{sleep, timeout};

/// Longer than stability threshold + cooldown with room for slow CI.
const SETTLE: Duration = Duration::from_millis(1200);

fn watch() -> WatchSettings {
    WatchSettings {
        stability_threshold: Duration::from_millis(200),
        poll_interval: Duration::from_millis(50),
    }
}

fn list_options(dir: &Path) -> StoreOptions {
    StoreOptions::new("user_cards", "cards", dir)
        .defaults(json!({"cards": {"list": []}}))
        .watch_settings(watch())
}

fn read_file(path: &Path) -> Value {
    serde_json::from_str(&std::fs::read_to_string(path).unwrap()).unwrap()
}

fn record(store: &SafeStore) -> (Arc<Mutex<Vec<Value>>>, safe_store::Subscription) {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    let sub = store.on_change(move |value| sink.lock().unwrap().push(value.clone()));
    (seen, sub)
}

async fn wait_for_calls(seen: &Arc<Mutex<Vec<Value>>>, n: usize) {
    timeout(Duration::from_secs(10), async {
        while seen.lock().unwrap().len() < n {
            sleep(Duration::from_millis(25)).await;
        }
    })
    .await
    .expect("Timeout waiting for onChange");
}

#[tokio::test]
async fn test_unawaited_writes_end_with_last_value() {
    let temp = TempDir::new().unwrap();
    let store = SafeStore::open(list_options(temp.path())).await.unwrap();

    let pending: Vec<_> = (1..=25)
        .map(|n| store.set_queued(json!({"list": (1..=n).collect::<Vec<_>>()})))
        .collect();
    futures::future::join_all(pending).await;

    let expected = json!({"list": (1..=25).collect::<Vec<_>>()});
    assert_eq!(*store.get(), expected);
    assert_eq!(read_file(store.path())["cards"], expected);
    store.close().await;
}

#[tokio::test]
async fn test_two_quick_sets_scenario() {
    let temp = TempDir::new().unwrap();
    let store = SafeStore::open(list_options(temp.path())).await.unwrap();

    let first = store.set_queued(json!({"list": [1]}));
    let second = store.set_queued(json!({"list": [1, 2]}));
    first.await;
    second.await;

    assert_eq!(*store.get(), json!({"list": [1, 2]}));
    assert_eq!(read_file(store.path())["cards"], json!({"list": [1, 2]}));
    store.close().await;
}

#[tokio::test]
async fn test_own_writes_do_not_notify() {
    let temp = TempDir::new().unwrap();
    let store = SafeStore::open(list_options(temp.path())).await.unwrap();
    let (seen, _sub) = record(&store);

    sleep(Duration::from_millis(300)).await;
    for n in 0..5 {
        store.set_queued(json!({"list": [n]})).await;
    }
    sleep(SETTLE).await;

    assert!(seen.lock().unwrap().is_empty());
    store.close().await;
}

#[tokio::test]
async fn test_external_write_notifies_exactly_once() {
    let temp = TempDir::new().unwrap();
    let store = SafeStore::open(list_options(temp.path())).await.unwrap();
    let (seen, _sub) = record(&store);

    sleep(Duration::from_millis(300)).await;
    std::fs::write(store.path(), r#"{"cards": {"list": [9]}}"#).unwrap();

    wait_for_calls(&seen, 1).await;
    sleep(SETTLE).await;

    let calls = seen.lock().unwrap().clone();
    assert_eq!(calls, vec![json!({"list": [9]})]);
    assert_eq!(*store.get(), json!({"list": [9]}));
    store.close().await;
}

#[tokio::test]
async fn test_identical_external_write_is_silent() {
    let temp = TempDir::new().unwrap();
    let store = SafeStore::open(list_options(temp.path())).await.unwrap();
    store.set_queued(json!({"list": [1], "name": "a"})).await;
    let (seen, _sub) = record(&store);

    sleep(Duration::from_millis(300)).await;
    // Same content, different key order and whitespace.
    std::fs::write(
        store.path(),
        "{\n  \"cards\": {\"name\": \"a\",   \"list\": [1]}\n}",
    )
    .unwrap();
    sleep(SETTLE).await;

    assert!(seen.lock().unwrap().is_empty());
    store.close().await;
}

#[tokio::test]
async fn test_mid_write_content_is_retried() {
    let temp = TempDir::new().unwrap();
    let store = SafeStore::open(list_options(temp.path())).await.unwrap();
    let (seen, _sub) = record(&store);

    sleep(Duration::from_millis(300)).await;
    std::fs::write(store.path(), r#"{"cards": {"list": [4"#).unwrap();
    sleep(SETTLE).await;
    assert!(seen.lock().unwrap().is_empty());
    assert_eq!(*store.get(), json!({"list": []}));

    std::fs::write(store.path(), r#"{"cards": {"list": [4, 5]}}"#).unwrap();
    wait_for_calls(&seen, 1).await;
    assert_eq!(seen.lock().unwrap()[0], json!({"list": [4, 5]}));
    store.close().await;
}

#[tokio::test]
async fn test_external_keys_beside_document_survive_next_write() {
    let temp = TempDir::new().unwrap();
    let store = SafeStore::open(list_options(temp.path())).await.unwrap();
    let (seen, _sub) = record(&store);

    sleep(Duration::from_millis(300)).await;
    // Same document, plus a key some other writer owns.
    std::fs::write(
        store.path(),
        r#"{"cards": {"list": []}, "sync_meta": "remote"}"#,
    )
    .unwrap();
    sleep(SETTLE).await;
    assert!(seen.lock().unwrap().is_empty());

    store.set_queued(json!({"list": [1]})).await;

    let on_disk = read_file(store.path());
    assert_eq!(on_disk["sync_meta"], json!("remote"));
    assert_eq!(on_disk["cards"], json!({"list": [1]}));
    // The edit dropped the version marker; ours is kept.
    assert!(on_disk["__internal__"]["migrations"]["version"].is_string());
    store.close().await;
}

#[tokio::test]
async fn test_failed_write_keeps_value_and_queue_moves_on() {
    let temp = TempDir::new().unwrap();
    let store = SafeStore::open(list_options(temp.path())).await.unwrap();
    let path = store.path().to_path_buf();

    // A non-empty directory where the file should be makes the rename fail.
    std::fs::remove_file(&path).unwrap();
    std::fs::create_dir(&path).unwrap();
    std::fs::write(path.join("blocker"), "x").unwrap();

    timeout(Duration::from_secs(5), store.set_queued(json!({"list": [1]})))
        .await
        .expect("failed write must still resolve");
    assert_eq!(*store.get(), json!({"list": [1]}));
    assert!(path.is_dir());

    std::fs::remove_dir_all(&path).unwrap();
    store.set_queued(json!({"list": [1, 2]})).await;

    assert_eq!(read_file(&path)["cards"], json!({"list": [1, 2]}));
    assert_eq!(*store.get(), json!({"list": [1, 2]}));

    // No temp files left behind by the failed attempt.
    let leftovers: Vec<_> = std::fs::read_dir(temp.path())
        .unwrap()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_name().to_string_lossy().ends_with(".tmp"))
        .collect();
    assert!(leftovers.is_empty());
    store.close().await;
}

#[tokio::test]
async fn test_close_drains_then_goes_quiet() {
    let temp = TempDir::new().unwrap();
    let store = SafeStore::open(list_options(temp.path())).await.unwrap();
    let (seen, _sub) = record(&store);

    let pending: Vec<_> = (0..10)
        .map(|n| store.set_queued(json!({"list": [n]})))
        .collect();
    store.close().await;

    for write in pending {
        assert!(write.now_or_never().is_some(), "write still pending after close");
    }
    assert_eq!(read_file(store.path())["cards"], json!({"list": [9]}));

    std::fs::write(store.path(), r#"{"cards": {"list": ["late"]}}"#).unwrap();
    sleep(SETTLE).await;
    assert!(seen.lock().unwrap().is_empty());
}

#[tokio::test]
async fn test_dropped_subscription_stops_delivery() {
    let temp = TempDir::new().unwrap();
    let store = SafeStore::open(list_options(temp.path())).await.unwrap();
    let (kept, _kept_sub) = record(&store);
    let (dropped, dropped_sub) = record(&store);
    drop(dropped_sub);

    sleep(Duration::from_millis(300)).await;
    std::fs::write(store.path(), r#"{"cards": {"list": [7]}}"#).unwrap();

    wait_for_calls(&kept, 1).await;
    assert!(dropped.lock().unwrap().is_empty());
    store.close().await;
}

#[tokio::test]
async fn test_settings_migration_is_idempotent_across_opens() {
    let temp = TempDir::new().unwrap();
    let path = temp.path().join("user_settings.json");
    std::fs::write(
        &path,
        json!({
            "settings": {
                "draft_options": {"boosters_set": ["a", "b", "c", "d"]},
                "other_options": {"legacy": true}
            },
            "__internal__": {"migrations": {"version": "1.0.0"}}
        })
        .to_string(),
    )
    .unwrap();

    let options = RegistryOptions::new(temp.path()).watch_settings(watch());

    let first = SafeStore::open(options.store_options(Document::Settings, temp.path()))
        .await
        .unwrap();
    let after_first = read_file(&path);
    let doc_first = first.get();
    first.close().await;

    let second = SafeStore::open(options.store_options(Document::Settings, temp.path()))
        .await
        .unwrap();
    let after_second = read_file(&path);
    assert_eq!(*second.get(), *doc_first);
    second.close().await;

    assert_eq!(after_first, after_second);
    assert_eq!(
        after_first["settings"]["draft_options"]["boosters_set"],
        json!(["a", "b", "c", "d", "", ""])
    );
    assert_eq!(
        after_first["__internal__"]["migrations"]["version"],
        json!("6.2.0")
    );
}
