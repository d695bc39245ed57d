use std::path::Path;
use std::process::{Command, Output};

use stateful_fn::{BackendConfig, BindOptions, FunctionId, Registry, RegistryConfig};
use tempfile::TempDir;

fn stateful(args: &[&str]) -> Output {
    Command::new(env!("CARGO_BIN_EXE_stateful"))
        .args(args)
        .env_remove("STATEFUL_BACKEND")
        .env_remove("STATEFUL_CONNECTION")
        .env_remove("STATEFUL_NAMESPACE")
        .env("RUST_LOG", "off")
        .output()
        .unwrap()
}

fn stdout(output: &Output) -> String {
    String::from_utf8_lossy(&output.stdout).into_owned()
}

fn path_str(path: &Path) -> &str {
    path.to_str().unwrap()
}

async fn seed(path: &Path, names: &[&str]) {
    let registry =
        Registry::new(RegistryConfig::default().with_default_backend(BackendConfig::embedded(path)));
    for name in names {
        let f = registry
            .bind(BindOptions::new(FunctionId::new(*name).unwrap()))
            .await
            .unwrap();
        f.call(|state| state.increment("n", 1)).await.unwrap().unwrap();
    }
}

#[test]
fn init_then_healthcheck() {
    let dir = TempDir::new().unwrap();
    let db = dir.path().join("state.db");

    let out = stateful(&["init", "--backend", "embedded", "--path", path_str(&db)]);
    assert!(out.status.success(), "{out:?}");
    assert!(db.exists());

    let out = stateful(&["healthcheck", "--backend", "sqlite", "--path", path_str(&db)]);
    assert!(out.status.success(), "{out:?}");
    assert!(stdout(&out).starts_with("healthy"));
}

#[test]
fn healthcheck_missing_store_fails() {
    let dir = TempDir::new().unwrap();
    let db = dir.path().join("missing.db");

    let out = stateful(&["healthcheck", "--path", path_str(&db)]);
    assert_eq!(out.status.code(), Some(1));
    assert!(stdout(&out).starts_with("unhealthy"));
    assert!(!db.exists());
}

#[tokio::test]
async fn list_as_json() {
    let dir = TempDir::new().unwrap();
    let db = dir.path().join("state.db");
    seed(&db, &["a", "b"]).await;

    let out = stateful(&["list", "--path", path_str(&db), "--format", "json"]);
    assert!(out.status.success(), "{out:?}");
    let rows: serde_json::Value = serde_json::from_slice(&out.stdout).unwrap();
    let rows = rows.as_array().unwrap();
    assert_eq!(rows.len(), 2);
    assert_eq!(rows[0]["identity"], "a");
    assert_eq!(rows[0]["codec"], "bincode");
    assert_eq!(rows[0]["version"], 1);
}

#[tokio::test]
async fn migrate_between_files() {
    let dir = TempDir::new().unwrap();
    let from = dir.path().join("from.db");
    let to = dir.path().join("to.db");
    seed(&from, &["a", "b"]).await;

    let args = [
        "migrate",
        "--from",
        "embedded",
        "--to",
        "embedded",
        "--from-path",
        path_str(&from),
        "--to-path",
        path_str(&to),
    ];
    let out = stateful(&args);
    assert!(out.status.success(), "{out:?}");
    assert!(stdout(&out).contains("complete: 2/2 succeeded"));

    let again = stateful(&args);
    assert!(again.status.success());
    assert_eq!(stdout(&again).matches("unchanged").count(), 2);
}

#[test]
fn unknown_backend_kind_is_rejected() {
    let out = stateful(&["list", "--backend", "postgres", "--path", "x"]);
    assert!(!out.status.success());
}

#[test]
fn migrate_from_missing_source_fails_without_creating_it() {
    let dir = TempDir::new().unwrap();
    let from = dir.path().join("missing.db");
    let to = dir.path().join("to.db");

    let out = stateful(&[
        "migrate",
        "--from",
        "embedded",
        "--to",
        "embedded",
        "--from-path",
        path_str(&from),
        "--to-path",
        path_str(&to),
    ]);
    assert_eq!(out.status.code(), Some(1), "{out:?}");
    assert!(stdout(&out).contains("source unreadable"));
    assert!(!from.exists());
    assert!(!to.exists());
}

#[test]
fn list_missing_store_fails_without_creating_it() {
    let dir = TempDir::new().unwrap();
    let db = dir.path().join("missing.db");

    let out = stateful(&["list", "--path", path_str(&db)]);
    assert_eq!(out.status.code(), Some(1));
    assert!(!db.exists());
}
