//! Integration tests for the file-backed inventory store.

use std::collections::BTreeMap;

use camino::Utf8PathBuf;
use fleetroll::store::SCHEMA_VERSION;
use fleetroll::test_support::{fixed_clock, instance_fixture};
use fleetroll::{InventoryStore, SqliteStore, StoreError};
use rstest::{fixture, rstest};
use rusqlite::{Connection, params};
use tempfile::TempDir;

struct Workspace {
    _dir: TempDir,
    db: Utf8PathBuf,
}

#[fixture]
fn workspace() -> Workspace {
    let dir = TempDir::new().unwrap_or_else(|err| panic!("tempdir: {err}"));
    let root = Utf8PathBuf::from_path_buf(dir.path().to_path_buf())
        .unwrap_or_else(|path| panic!("temp dir should be utf8: {}", path.display()));
    Workspace {
        db: root.join("state").join("inventory.db"),
        _dir: dir,
    }
}

fn open(path: &Utf8PathBuf) -> SqliteStore {
    SqliteStore::open_and_init(path)
        .unwrap_or_else(|err| panic!("open {path}: {err}"))
        .with_clock(fixed_clock)
}

#[rstest]
fn records_survive_reopening(workspace: Workspace) {
    let mut instance = instance_fixture("i-persist");
    instance.user = String::from("ubuntu");
    instance.ssh_key = String::from("/keys/id_ed25519");
    instance.ssh_port = Some(2222);
    instance.tags = BTreeMap::from([(String::from("owner"), String::from("ops"))]);
    {
        let store = open(&workspace.db);
        store.upsert(&instance).expect("upsert");
        store.replace_tags(&instance).expect("tags");
    }

    let reopened = open(&workspace.db);
    let loaded = reopened
        .instance("i-persist")
        .expect("lookup")
        .expect("row survives reopen");

    assert_eq!(loaded.user, "ubuntu");
    assert_eq!(loaded.ssh_port, Some(2222));
    assert_eq!(loaded.tags.get("owner").map(String::as_str), Some("ops"));
    assert_eq!(loaded.last_seen, Some(fixed_clock()));
}

#[rstest]
fn missing_parent_directories_are_created(workspace: Workspace) {
    drop(open(&workspace.db));
    assert!(workspace.db.exists(), "database file should exist");
}

#[rstest]
fn foreign_schema_version_is_rejected(workspace: Workspace) {
    drop(open(&workspace.db));
    let conn = Connection::open(&workspace.db).expect("raw connection");
    conn.execute(
        "UPDATE schema_meta SET value = ?1 WHERE key = 'version'",
        params![(SCHEMA_VERSION + 1).to_string()],
    )
    .expect("bump version");
    drop(conn);

    let err = SqliteStore::open_and_init(&workspace.db).expect_err("version mismatch");

    assert!(
        matches!(
            err,
            StoreError::SchemaMismatch { expected, found }
                if expected == SCHEMA_VERSION && found == SCHEMA_VERSION + 1
        ),
        "unexpected error: {err}"
    );
}

#[rstest]
fn terminated_rows_are_exported_only_on_request(workspace: Workspace) {
    let store = open(&workspace.db);
    for id in ["i-a", "i-b"] {
        store.upsert(&instance_fixture(id)).expect("upsert");
    }
    store
        .mark_terminated(&[String::from("i-a")])
        .expect("terminate");

    let active: Vec<String> = store
        .list_instances(false)
        .expect("list")
        .into_iter()
        .map(|instance| instance.id)
        .collect();
    let everything = store.list_instances(true).expect("list all");

    assert_eq!(active, vec![String::from("i-b")]);
    assert_eq!(everything.len(), 2);
}
