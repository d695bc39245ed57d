use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use stateful_fn::prelude::*;
use stateful_fn::{migrate, MigrationStatus, SqliteBackend};
use tempfile::TempDir;

fn id(s: &str) -> FunctionId {
    FunctionId::new(s).unwrap()
}

fn patient_lock() -> LockOptions {
    LockOptions::default()
        .with_timeout(Duration::from_secs(60))
        .with_lease(Duration::from_secs(30))
}

fn sqlite_registry(dir: &TempDir) -> Registry {
    let path = dir.path().join("state.db");
    Registry::new(
        RegistryConfig::default()
            .with_default_backend(BackendConfig::embedded(path))
            .with_lock_options(patient_lock()),
    )
}

async fn bump(counter: &StatefulFn) -> i64 {
    counter
        .call(|state| state.increment("count", 1))
        .await
        .unwrap()
        .unwrap()
}

#[tokio::test]
async fn counter_survives_restart() {
    let dir = TempDir::new().unwrap();

    {
        let registry = sqlite_registry(&dir);
        let counter = registry.bind(BindOptions::new(id("counter"))).await.unwrap();
        assert_eq!(bump(&counter).await, 1);
    }

    let registry = sqlite_registry(&dir);
    let counter = registry.bind(BindOptions::new(id("counter"))).await.unwrap();
    assert_eq!(bump(&counter).await, 2);
}

#[tokio::test]
async fn identities_are_isolated() {
    let dir = TempDir::new().unwrap();
    let registry = sqlite_registry(&dir);
    let a = registry.bind(BindOptions::new(id("a"))).await.unwrap();
    let b = registry.bind(BindOptions::new(id("b"))).await.unwrap();

    assert_eq!(bump(&a).await, 1);
    assert_eq!(bump(&a).await, 2);
    assert_eq!(bump(&b).await, 1);
}

async fn hammer(counter: Arc<StatefulFn>, tasks: usize, increments: usize) {
    let mut handles = Vec::new();
    for _ in 0..tasks {
        let counter = counter.clone();
        handles.push(tokio::spawn(async move {
            for _ in 0..increments {
                bump(&counter).await;
            }
        }));
    }
    for handle in handles {
        handle.await.unwrap();
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_increments_memory() {
    let registry = Registry::new(
        RegistryConfig::default()
            .with_default_backend(BackendConfig::memory("concurrency"))
            .with_lock_options(patient_lock()),
    );
    let counter = Arc::new(registry.bind(BindOptions::new(id("counter"))).await.unwrap());

    hammer(counter.clone(), 8, 50).await;

    let state = counter.snapshot().await.unwrap();
    assert_eq!(state.get(&Key::from("count")), Some(&Value::Int(400)));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_increments_sqlite() {
    let dir = TempDir::new().unwrap();
    let registry = sqlite_registry(&dir);
    let counter = Arc::new(registry.bind(BindOptions::new(id("counter"))).await.unwrap());

    hammer(counter.clone(), 4, 20).await;

    let state = counter.snapshot().await.unwrap();
    assert_eq!(state.get(&Key::from("count")), Some(&Value::Int(80)));
}

/// Two registries on one file stand in for two processes.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_increments_across_registries() {
    let dir = TempDir::new().unwrap();
    let first = sqlite_registry(&dir);
    let second = sqlite_registry(&dir);
    let a = Arc::new(first.bind(BindOptions::new(id("shared"))).await.unwrap());
    let b = Arc::new(second.bind(BindOptions::new(id("shared"))).await.unwrap());

    tokio::join!(hammer(a.clone(), 2, 15), hammer(b.clone(), 2, 15));

    let state = b.snapshot().await.unwrap();
    assert_eq!(state.get(&Key::from("count")), Some(&Value::Int(60)));
}

#[tokio::test]
async fn reads_follow_writes() {
    let dir = TempDir::new().unwrap();
    let registry = sqlite_registry(&dir);
    let f = registry
        .bind(BindOptions::new(id("replay")).codec(CodecKind::Json))
        .await
        .unwrap();

    let mut expected: BTreeMap<Key, Value> = BTreeMap::new();
    let mut seed: u64 = 0x2545_f491_4f6c_dd1d;
    for step in 0..60i64 {
        seed = seed
            .wrapping_mul(6_364_136_223_846_793_005)
            .wrapping_add(1_442_695_040_888_963_407);
        let key = Key::from(format!("k{}", (seed >> 33) % 7));

        if (seed >> 20) % 4 == 0 {
            expected.remove(&key);
            let k = key.clone();
            f.call(move |state| {
                state.remove(k);
            })
            .await
            .unwrap();
        } else {
            expected.insert(key.clone(), Value::Int(step));
            let k = key.clone();
            f.call(move |state| {
                state.insert(k, step);
            })
            .await
            .unwrap();
        }

        let seen = f.call(|state| state.as_map().clone()).await.unwrap();
        assert_eq!(seen, expected, "diverged at step {step}");
    }
}

#[tokio::test]
async fn migrate_sqlite_to_sqlite() {
    let dir = TempDir::new().unwrap();
    let source = SqliteBackend::open(dir.path().join("a.db"), None).await.unwrap();
    let destination = SqliteBackend::open(dir.path().join("b.db"), None).await.unwrap();

    {
        let registry = Registry::new(
            RegistryConfig::default().with_default_backend(BackendConfig::embedded(
                dir.path().join("a.db"),
            )),
        );
        let a = registry.bind(BindOptions::new(id("a"))).await.unwrap();
        let b = registry
            .bind(BindOptions::new(id("b")).codec(CodecKind::Json))
            .await
            .unwrap();
        bump(&a).await;
        bump(&b).await;
        bump(&b).await;
    }

    let report = migrate(&source, &destination).await;
    assert_eq!(report.status, MigrationStatus::Complete);
    assert_eq!(report.summary(), "2/2 succeeded");

    for name in ["a", "b"] {
        let src = source.get(&id(name)).await.unwrap().unwrap();
        let dst = destination.get(&id(name)).await.unwrap().unwrap();
        assert_eq!(src.payload, dst.payload);
        assert_eq!(src.codec, dst.codec);
        assert_eq!(src.version, dst.version);
    }

    // State is readable through a binding on the destination.
    let registry = Registry::new(
        RegistryConfig::default()
            .with_default_backend(BackendConfig::embedded(dir.path().join("b.db"))),
    );
    let b = registry.bind(BindOptions::new(id("b"))).await.unwrap();
    assert_eq!(bump(&b).await, 3);
}
