//! One-time import of the file-per-event store
//!
//! Older clients kept each queued event in its own file under
//! `<root>/<project_id>/<collection>/`. On first open the files are moved
//! into the SQLite store and the directory is removed. Each file is deleted
//! as soon as its event is stored, and a per-project setting records that
//! the import finished, so an interrupted import never stores an event twice.

use serde_json::{Map, Value};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

use crate::db::EventStore;
use crate::error::{Error, Result};
use crate::event::validate_collection;

/// Prefix of the setting that marks a project as imported
pub const IMPORTED_SETTING_PREFIX: &str = "file_store_imported";

fn imported_setting(project_id: &str) -> String {
    format!("{}:{}", IMPORTED_SETTING_PREFIX, project_id)
}

/// Whether the legacy store of this project was already imported
pub fn is_imported(store: &EventStore) -> Result<bool> {
    Ok(store
        .get_setting(&imported_setting(store.project_id()))?
        .as_deref()
        == Some("true"))
}

/// Import the project's legacy events unless that already happened
///
/// Returns the number of events imported.
pub fn maybe_import(store: &EventStore, legacy_root: &Path) -> Result<usize> {
    if is_imported(store)? {
        debug!(project_id = store.project_id(), "Legacy store already imported");
        return Ok(0);
    }

    let project_dir = legacy_root.join(store.project_id());
    let imported = if project_dir.is_dir() {
        import_dir(store, &project_dir)?
    } else {
        0
    };

    store.set_setting(&imported_setting(store.project_id()), "true")?;
    Ok(imported)
}

/// Import every event file below `project_dir`, then remove it
///
/// A storage error stops the import; files already imported are gone by then,
/// so running it again picks up where it stopped.
pub fn import_dir(store: &EventStore, project_dir: &Path) -> Result<usize> {
    let pattern = format!(
        "{}/*/*",
        glob::Pattern::escape(&project_dir.to_string_lossy())
    );
    let entries = glob::glob(&pattern)
        .map_err(|e| Error::Config(format!("invalid legacy store path: {}", e)))?;

    let mut files: Vec<PathBuf> = entries
        .filter_map(|entry| match entry {
            Ok(path) => Some(path),
            Err(e) => {
                warn!(error = %e, "Unreadable legacy store entry");
                None
            }
        })
        .filter(|path| path.is_file())
        .collect();
    // Legacy file names sort in the order events were added
    files.sort();

    let mut imported = 0;
    let mut skipped = 0;
    for path in &files {
        match import_file(store, path) {
            Ok(()) => imported += 1,
            Err(e @ Error::Database(_)) => return Err(e),
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Skipping legacy event");
                skipped += 1;
            }
        }
    }

    if let Err(e) = std::fs::remove_dir_all(project_dir) {
        warn!(dir = %project_dir.display(), error = %e, "Could not remove legacy store");
    }
    info!(
        imported,
        skipped,
        dir = %project_dir.display(),
        "Imported legacy events"
    );
    Ok(imported)
}

fn import_file(store: &EventStore, path: &Path) -> Result<()> {
    let collection = path
        .parent()
        .and_then(Path::file_name)
        .and_then(|name| name.to_str())
        .ok_or_else(|| Error::Validation("collection directory name is not UTF-8".to_string()))?;
    validate_collection(collection)?;

    let payload = std::fs::read(path)?;
    serde_json::from_slice::<Map<String, Value>>(&payload)?;

    store.add_event(collection, &payload)?;
    if let Err(e) = std::fs::remove_file(path) {
        warn!(path = %path.display(), error = %e, "Could not remove imported legacy event");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::StoreLimits;

    #[test]
    fn test_missing_dir_still_sets_flag() {
        let root = tempfile::tempdir().unwrap();
        let store = EventStore::open_in_memory("proj", StoreLimits::default()).unwrap();

        assert!(!is_imported(&store).unwrap());
        assert_eq!(maybe_import(&store, root.path()).unwrap(), 0);
        assert!(is_imported(&store).unwrap());
    }

    #[test]
    fn test_invalid_files_are_skipped() {
        let root = tempfile::tempdir().unwrap();
        let dir = root.path().join("proj").join("clicks");
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join("001"), br#"{"a":1}"#).unwrap();
        std::fs::write(dir.join("002"), b"garbage").unwrap();

        let store = EventStore::open_in_memory("proj", StoreLimits::default()).unwrap();
        assert_eq!(maybe_import(&store, root.path()).unwrap(), 1);
        assert_eq!(store.get_collection_event_count("clicks"), 1);
        assert!(!root.path().join("proj").exists());
    }

    #[test]
    fn test_interrupted_import_does_not_duplicate() {
        let root = tempfile::tempdir().unwrap();
        for collection in ["a", "b"] {
            let dir = root.path().join("proj").join(collection);
            std::fs::create_dir_all(&dir).unwrap();
            std::fs::write(dir.join("001"), br#"{"n":1}"#).unwrap();
        }

        let store = EventStore::open_in_memory("proj", StoreLimits::default()).unwrap();
        store
            .conn()
            .execute_batch(
                "CREATE TRIGGER fail_b BEFORE INSERT ON events WHEN NEW.collection = 'b'
                 BEGIN SELECT RAISE(ABORT, 'disk full'); END;",
            )
            .unwrap();

        assert!(matches!(
            maybe_import(&store, root.path()),
            Err(Error::Database(_))
        ));
        assert!(!is_imported(&store).unwrap());
        assert!(!root.path().join("proj/a/001").exists());
        assert!(root.path().join("proj/b/001").exists());

        store.conn().execute_batch("DROP TRIGGER fail_b;").unwrap();
        assert_eq!(maybe_import(&store, root.path()).unwrap(), 1);
        assert_eq!(store.get_collection_event_count("a"), 1);
        assert_eq!(store.get_collection_event_count("b"), 1);
        assert!(is_imported(&store).unwrap());
    }
}
