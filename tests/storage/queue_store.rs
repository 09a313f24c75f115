use seggate::error::GatewayError;
use seggate::storage::queue_store::QUEUE_DB_FILE;
use seggate::storage::{Column, ColumnType, DatabaseManager, DurableQueueStore, QueueRow};
use std::path::Path;
use tempfile::TempDir;

fn job_columns() -> Vec<Column> {
    vec![
        Column::new("id", ColumnType::Text),
        Column::new("attempts", ColumnType::Integer),
        Column::new("score", ColumnType::Real),
        Column::new("done", ColumnType::Boolean),
    ]
}

fn job(id: &str, attempts: i64) -> QueueRow {
    QueueRow::new()
        .with("id", id)
        .with("attempts", attempts)
        .with("score", 0.5)
        .with("done", false)
}

/// Drop every handle to the database so the next open reads from disk
fn simulate_restart(dir: &Path) {
    DatabaseManager::global()
        .close_database(&dir.join(QUEUE_DB_FILE))
        .unwrap();
}

#[test]
fn rows_survive_restart() {
    let dir = TempDir::new().unwrap();
    {
        let store = DurableQueueStore::open(dir.path(), "jobs", job_columns()).unwrap();
        store.insert(&job("a", 0)).unwrap();
        store.insert(&job("b", 3)).unwrap();
    }
    simulate_restart(dir.path());

    let store = DurableQueueStore::open(dir.path(), "jobs", job_columns()).unwrap();
    assert_eq!(store.len().unwrap(), 2);
    let b = store.get("b").unwrap().unwrap();
    assert_eq!(b.get_i64("attempts"), Some(3));
    assert_eq!(b.get_bool("done"), Some(false));

    let mut ids: Vec<String> = store
        .enumerate()
        .unwrap()
        .map(|row| row.unwrap().get_str("id").unwrap().to_string())
        .collect();
    ids.sort();
    assert_eq!(ids, vec!["a", "b"]);

    drop(store);
    simulate_restart(dir.path());
}

#[test]
fn reopening_with_other_columns_is_a_schema_mismatch() {
    let dir = TempDir::new().unwrap();
    {
        DurableQueueStore::open(dir.path(), "jobs", job_columns()).unwrap();
    }
    simulate_restart(dir.path());

    let mut changed = job_columns();
    changed.push(Column::new("owner", ColumnType::Text));
    let err = DurableQueueStore::open(dir.path(), "jobs", changed).unwrap_err();
    assert!(matches!(err, GatewayError::SchemaMismatch { .. }));

    // Other tables in the same file are unaffected
    let other = DurableQueueStore::open(dir.path(), "other", vec![Column::new("id", ColumnType::Text)]).unwrap();
    assert!(other.is_empty().unwrap());

    drop(other);
    simulate_restart(dir.path());
}

#[test]
fn duplicate_insert_keeps_the_first_row() {
    let dir = TempDir::new().unwrap();
    let store = DurableQueueStore::open(dir.path(), "jobs", job_columns()).unwrap();

    store.insert(&job("a", 1)).unwrap();
    let err = store.insert(&job("a", 9)).unwrap_err();
    assert!(matches!(err, GatewayError::DuplicateKey(_)));
    assert_eq!(store.get("a").unwrap().unwrap().get_i64("attempts"), Some(1));

    store.upsert(&job("a", 9)).unwrap();
    assert_eq!(store.get("a").unwrap().unwrap().get_i64("attempts"), Some(9));

    drop(store);
    simulate_restart(dir.path());
}

#[test]
fn rows_move_between_tables_atomically() {
    let dir = TempDir::new().unwrap();
    let active = DurableQueueStore::open(dir.path(), "active", job_columns()).unwrap();
    let done = DurableQueueStore::open(dir.path(), "done", job_columns()).unwrap();

    active.insert(&job("a", 2)).unwrap();
    assert!(active.move_to("a", &done).unwrap());
    assert!(!active.move_to("a", &done).unwrap());

    assert!(active.get("a").unwrap().is_none());
    assert_eq!(done.get("a").unwrap().unwrap().get_i64("attempts"), Some(2));

    drop(active);
    drop(done);
    simulate_restart(dir.path());
}

#[test]
fn concurrent_increments_are_not_lost() {
    let dir = TempDir::new().unwrap();
    let store = DurableQueueStore::open(dir.path(), "jobs", job_columns()).unwrap();
    store.insert(&job("counter", 0)).unwrap();

    std::thread::scope(|scope| {
        for _ in 0..8 {
            let store = store.clone();
            scope.spawn(move || {
                for _ in 0..25 {
                    store
                        .update_if("counter", |mut row| {
                            let attempts = row.get_i64("attempts")?;
                            row.set("attempts", attempts + 1);
                            Some(row)
                        })
                        .unwrap();
                }
            });
        }
    });

    assert_eq!(store.get("counter").unwrap().unwrap().get_i64("attempts"), Some(200));

    drop(store);
    simulate_restart(dir.path());
}
