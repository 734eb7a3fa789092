use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use serde_json::json;
use tokio::task::JoinSet;
use uuid::Uuid;

use allocator::allocation::service::AllocationService;
use allocator::config::AppConfig;
use allocator::error::StoreError;
use allocator::metrics::counters::Counters;
use allocator::store::AtomicStore;
use allocator::store::sqlite::SqlxStore;
use allocator::worker::StaticWorkerDirectory;

// -----------------------
// DB + helpers
// -----------------------

/// Isolated in-memory DB per test.
/// Unique name prevents test interference during parallel execution.
/// `cache=shared` allows multiple connections within the same pool to see the same in-memory DB.
async fn setup_store() -> SqlxStore {
    sqlx::any::install_default_drivers();

    let db_name = Uuid::new_v4().to_string();
    let cfg = AppConfig {
        database_url: format!("sqlite:file:{db_name}?mode=memory&cache=shared"),
        store_max_attempts: 1_000,
        slow_store_warn_ms: 50,
    };

    let store = SqlxStore::connect(&cfg)
        .await
        .expect("connect sqlite memory db");
    store.migrate().await.expect("migrate");
    store
}

#[tokio::test]
async fn set_overwrites_and_get_roundtrips() {
    let store = setup_store().await;

    assert!(store.get("k").await.unwrap().is_none());

    store.set("k", json!({"x": 1})).await.unwrap();
    store.set("k", json!({"x": 2})).await.unwrap();

    assert_eq!(store.get("k").await.unwrap(), Some(json!({"x": 2})));
}

#[tokio::test]
async fn atomic_update_initializes_then_increments() {
    let store = setup_store().await;

    let committed = store
        .atomic_update("counters/palghar/Kannad", &|cur| {
            assert!(cur.is_none());
            Some(json!({"next_bundle": 2, "gaps": []}))
        })
        .await
        .unwrap();
    assert_eq!(committed, Some(json!({"next_bundle": 2, "gaps": []})));

    let committed = store
        .atomic_update("counters/palghar/Kannad", &|cur| {
            let n = cur.unwrap()["next_bundle"].as_u64().unwrap();
            Some(json!({"next_bundle": n + 1, "gaps": []}))
        })
        .await
        .unwrap();
    assert_eq!(committed, Some(json!({"next_bundle": 3, "gaps": []})));
}

#[tokio::test]
async fn atomic_update_returning_none_deletes_the_row() {
    let store = setup_store().await;
    store.set("k", json!(1)).await.unwrap();

    assert_eq!(store.atomic_update("k", &|_| None).await.unwrap(), None);
    assert!(store.get("k").await.unwrap().is_none());

    // Absent key + None transition is a no-op, not an error.
    assert_eq!(store.atomic_update("k", &|_| None).await.unwrap(), None);
}

#[tokio::test]
async fn multi_path_update_applies_writes_and_deletes() {
    let store = setup_store().await;
    store.set("a", json!(1)).await.unwrap();

    let mut changes = HashMap::new();
    changes.insert("a".to_string(), None);
    changes.insert("b".to_string(), Some(json!(2)));
    store.multi_path_update(changes).await.unwrap();

    assert!(store.get("a").await.unwrap().is_none());
    assert_eq!(store.get("b").await.unwrap(), Some(json!(2)));
}

#[tokio::test]
async fn hard_insert_failures_surface_as_backend_errors() {
    sqlx::any::install_default_drivers();

    let db_name = Uuid::new_v4().to_string();
    let pool = sqlx::any::AnyPoolOptions::new()
        .max_connections(4)
        .connect(&format!("sqlite:file:{db_name}?mode=memory&cache=shared"))
        .await
        .expect("connect sqlite memory db");

    let store = SqlxStore::new(pool.clone(), 8);
    store.migrate().await.expect("migrate");

    // Reject every row creation at the database level so the insert fails
    // with something other than a duplicate key.
    sqlx::query(
        "CREATE TRIGGER block_inserts BEFORE INSERT ON entries \
         BEGIN SELECT RAISE(ABORT, 'inserts disabled'); END;",
    )
    .execute(&pool)
    .await
    .expect("create trigger");

    let err = store
        .atomic_update("counters/palghar/Kannad", &|_| Some(json!(1)))
        .await
        .unwrap_err();

    // A failure that cannot succeed on retry must not be reported as
    // contention, or callers would keep retrying it.
    assert!(
        matches!(err, StoreError::Backend(_)),
        "expected a backend error, got {err:?}"
    );
}

#[tokio::test]
async fn scan_prefix_filters_and_sorts() {
    let store = setup_store().await;
    store.set("records/p/r/1/items/A", json!(1)).await.unwrap();
    store.set("records/p/r/10/items/B", json!(2)).await.unwrap();
    store.set("records/p/r/1/meta", json!(3)).await.unwrap();
    store.set("counters/p/r", json!(4)).await.unwrap();

    let hits = store.scan_prefix("records/p/r/1/").await.unwrap();
    let paths: Vec<&str> = hits.iter().map(|(p, _)| p.as_str()).collect();
    assert_eq!(
        paths,
        vec!["records/p/r/1/items/A", "records/p/r/1/meta"],
        "bundle 10 must not match the bundle 1 container"
    );
}

#[tokio::test]
async fn scan_prefix_matches_like_wildcards_literally() {
    let store = setup_store().await;
    store.set("records/p_x/r/1/items/A", json!(1)).await.unwrap();
    store.set("records/pax/r/1/items/B", json!(2)).await.unwrap();
    store.set("records/p%x/r/1/items/C", json!(3)).await.unwrap();

    // `_` and `%` in a location name are path characters, not patterns.
    let hits = store.scan_prefix("records/p_x/").await.unwrap();
    let paths: Vec<&str> = hits.iter().map(|(p, _)| p.as_str()).collect();
    assert_eq!(paths, vec!["records/p_x/r/1/items/A"]);

    let hits = store.scan_prefix("records/p%x/").await.unwrap();
    let paths: Vec<&str> = hits.iter().map(|(p, _)| p.as_str()).collect();
    assert_eq!(paths, vec!["records/p%x/r/1/items/C"]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_increments_lose_no_updates() {
    let store = Arc::new(setup_store().await);
    let mut set = JoinSet::new();

    for _ in 0..16 {
        let s = Arc::clone(&store);
        set.spawn(async move {
            s.atomic_update("counter", &|cur| {
                let n = cur.and_then(|v| v.as_u64()).unwrap_or(0);
                Some(json!(n + 1))
            })
            .await
        });
    }

    while let Some(res) = set.join_next().await {
        res.expect("task panicked").expect("update failed");
    }

    assert_eq!(store.get("counter").await.unwrap(), Some(json!(16)));
}

// -----------------------
// Service over the durable backend
// -----------------------

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn allocation_lifecycle_runs_over_sqlite() {
    const N: usize = 8;

    let mut directory = StaticWorkerDirectory::new();
    for i in 0..N {
        directory = directory.with_worker(format!("u{i}"), "palghar");
    }

    let store = Arc::new(setup_store().await);
    let svc = Arc::new(AllocationService::new(
        store,
        Arc::new(directory),
        50,
        Counters::default(),
    ));

    let mut set = JoinSet::new();
    for i in 0..N {
        let svc = Arc::clone(&svc);
        set.spawn(async move { svc.assign(&format!("u{i}"), "palghar", "Kannad").await });
    }

    let mut issued = HashSet::new();
    while let Some(res) = set.join_next().await {
        let state = res.expect("task panicked").expect("assign failed");
        assert!(issued.insert(state.bundle_no));
    }
    assert_eq!(issued, (1..=N as u64).collect::<HashSet<_>>());

    // Recycle one number and watch it come back first.
    let recycled = svc.reset("u3", "Kannad").await.unwrap();
    svc.complete("u5", "Kannad").await.unwrap();

    let next = svc.assign("u5", "palghar", "Kannad").await.unwrap();
    assert_eq!(next.bundle_no, recycled);

    assert_eq!(
        svc.next_record_id("palghar", "Kannad").await.unwrap(),
        "PAKA1"
    );
}
