//! Integration tests for opening a client over a legacy file store

use keen_core::{legacy, Config, KeenClient, ProjectConfig};
use std::fs;
use std::path::Path;
use tempfile::TempDir;

fn config(dir: &TempDir) -> Config {
    let mut config = Config::default();
    config.project = ProjectConfig::new("proj", Some("wk"), None);
    config.storage.database_path = Some(dir.path().join("keen.db"));
    config.storage.legacy_dir = Some(dir.path().join("legacy"));
    config
}

fn write_event(root: &Path, collection: &str, name: &str, body: &str) {
    let dir = root.join("legacy").join("proj").join(collection);
    fs::create_dir_all(&dir).unwrap();
    fs::write(dir.join(name), body).unwrap();
}

#[test]
fn test_legacy_events_imported_once() {
    let dir = TempDir::new().unwrap();
    write_event(dir.path(), "purchases", "0001", r#"{"item":"a"}"#);
    write_event(dir.path(), "purchases", "0002", r#"{"item":"b"}"#);
    write_event(dir.path(), "signups", "0001", r#"{"user":"c"}"#);
    write_event(dir.path(), "signups", "0002", "{broken");

    let config = config(&dir);
    let client = KeenClient::open(&config).unwrap();

    assert_eq!(client.store().get_collection_event_count("purchases"), 2);
    assert_eq!(client.store().get_collection_event_count("signups"), 1);
    assert!(!dir.path().join("legacy").join("proj").exists());
    assert!(legacy::is_imported(client.store()).unwrap());

    // Imported payloads are stored byte for byte, in file order
    let events = client.store().get_events();
    let payloads: Vec<String> = events
        .values()
        .filter(|e| e.collection == "purchases")
        .map(|e| String::from_utf8(e.payload.clone()).unwrap())
        .collect();
    assert_eq!(payloads, vec![r#"{"item":"a"}"#, r#"{"item":"b"}"#]);
    drop(client);

    // Files appearing later are left alone
    write_event(dir.path(), "purchases", "0003", r#"{"item":"d"}"#);
    let client = KeenClient::open(&config).unwrap();
    assert_eq!(client.store().get_total_event_count(), 3);
    assert!(dir.path().join("legacy").join("proj").exists());
}

#[test]
fn test_other_projects_are_untouched() {
    let dir = TempDir::new().unwrap();
    let other = dir.path().join("legacy").join("other").join("clicks");
    fs::create_dir_all(&other).unwrap();
    fs::write(other.join("0001"), "{}").unwrap();

    let client = KeenClient::open(&config(&dir)).unwrap();
    assert_eq!(client.store().get_total_event_count(), 0);
    assert!(other.join("0001").exists());
}
