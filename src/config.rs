//! Backend and registry configuration.
//!
//! A [`RegistryConfig`] can be built in code, parsed from TOML, or read
//! from `STATEFUL_*` environment variables.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use crate::codec::CodecKind;
use crate::error::{Result, StateError};
use crate::lock::LockOptions;
use crate::memory::MemoryBackend;
use crate::redis_backend::RedisBackend;
use crate::sqlite::SqliteBackend;
use crate::store::StateBackend;

/// Which storage engine backs a function.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    /// Single-file SQLite store on the local host.
    #[serde(alias = "sqlite")]
    Embedded,
    /// Redis, shared across hosts.
    #[serde(alias = "redis")]
    Networked,
    /// Process-local, not durable.
    Memory,
}

impl BackendKind {
    pub fn as_str(self) -> &'static str {
        match self {
            BackendKind::Embedded => "embedded",
            BackendKind::Networked => "networked",
            BackendKind::Memory => "memory",
        }
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BackendKind {
    type Err = StateError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "embedded" | "sqlite" => Ok(BackendKind::Embedded),
            "networked" | "redis" => Ok(BackendKind::Networked),
            "memory" => Ok(BackendKind::Memory),
            other => Err(StateError::InvalidConfig(format!(
                "unknown backend kind {other:?} (expected embedded, networked or memory)"
            ))),
        }
    }
}

/// Where one function's state lives.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BackendConfig {
    pub kind: BackendKind,
    /// File path for `embedded`, URL for `networked`, store name for `memory`.
    pub connection: String,
    #[serde(default)]
    pub namespace: Option<String>,
}

impl BackendConfig {
    pub fn new(kind: BackendKind, connection: impl Into<String>) -> Self {
        Self {
            kind,
            connection: connection.into(),
            namespace: None,
        }
    }

    /// SQLite file at `path`.
    pub fn embedded(path: impl AsRef<Path>) -> Self {
        Self::new(BackendKind::Embedded, path.as_ref().display().to_string())
    }

    /// Redis at `url`, e.g. `redis://localhost:6379/0`.
    pub fn networked(url: impl Into<String>) -> Self {
        Self::new(BackendKind::Networked, url)
    }

    /// Named in-process store.
    pub fn memory(name: impl Into<String>) -> Self {
        Self::new(BackendKind::Memory, name)
    }

    pub fn with_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = Some(namespace.into());
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.connection.trim().is_empty() && self.kind != BackendKind::Memory {
            return Err(StateError::InvalidConfig(format!(
                "{} backend requires a connection string",
                self.kind
            )));
        }
        if let Some(ns) = &self.namespace {
            if ns.is_empty() || ns.chars().any(char::is_control) {
                return Err(StateError::InvalidConfig(format!(
                    "invalid namespace {ns:?}"
                )));
            }
        }
        Ok(())
    }

    /// The same store under one canonical name: embedded paths are made
    /// absolute with `.`/`..` and symlinks resolved, so that `state.db` and
    /// `./state.db` compare equal. Other kinds are returned unchanged.
    pub fn normalized(&self) -> BackendConfig {
        let mut cfg = self.clone();
        if cfg.kind == BackendKind::Embedded && !cfg.connection.trim().is_empty() {
            cfg.connection = canonical_path(Path::new(&cfg.connection))
                .display()
                .to_string();
        }
        cfg
    }

    /// Open a new connection object for this configuration.
    ///
    /// The registry calls this at most once per distinct configuration.
    pub async fn connect(&self) -> Result<Arc<dyn StateBackend>> {
        self.validate()?;
        let namespace = self.namespace.as_deref();
        Ok(match self.kind {
            BackendKind::Embedded => {
                Arc::new(SqliteBackend::open(&self.connection, namespace).await?)
            }
            BackendKind::Networked => {
                Arc::new(RedisBackend::connect(&self.connection, namespace).await?)
            }
            BackendKind::Memory => Arc::new(MemoryBackend::new()),
        })
    }
}

impl fmt::Display for BackendConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.kind, self.connection)?;
        if let Some(ns) = &self.namespace {
            write!(f, " (namespace {ns})")?;
        }
        Ok(())
    }
}

/// Process-wide defaults owned by a [`Registry`](crate::Registry).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RegistryConfig {
    /// Backend for functions bound without an explicit one.
    #[serde(default)]
    pub default_backend: Option<BackendConfig>,
    #[serde(default)]
    pub default_codec: CodecKind,
    #[serde(default)]
    pub lock: LockOptions,
}

impl RegistryConfig {
    pub fn with_default_backend(mut self, backend: BackendConfig) -> Self {
        self.default_backend = Some(backend);
        self
    }

    pub fn with_default_codec(mut self, codec: CodecKind) -> Self {
        self.default_codec = codec;
        self
    }

    pub fn with_lock_options(mut self, lock: LockOptions) -> Self {
        self.lock = lock;
        self
    }

    /// Parse a TOML document.
    ///
    /// ```toml
    /// default_codec = "json"
    ///
    /// [default_backend]
    /// kind = "sqlite"
    /// connection = "state.db"
    ///
    /// [lock]
    /// timeout_ms = 5000
    /// ```
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let cfg: RegistryConfig =
            toml::from_str(content).map_err(|e| StateError::InvalidConfig(e.to_string()))?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn load_from_file(path: impl AsRef<Path>) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    /// Build from `STATEFUL_*` environment variables.
    ///
    /// `STATEFUL_BACKEND` and `STATEFUL_CONNECTION` set the default backend;
    /// `STATEFUL_NAMESPACE`, `STATEFUL_CODEC`, `STATEFUL_LOCK_TIMEOUT_MS` and
    /// `STATEFUL_LOCK_LEASE_MS` are optional.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let mut cfg = RegistryConfig::default();

        if let Some(kind) = lookup("STATEFUL_BACKEND") {
            let kind: BackendKind = kind.parse()?;
            let connection = lookup("STATEFUL_CONNECTION").unwrap_or_default();
            let mut backend = BackendConfig::new(kind, connection);
            backend.namespace = lookup("STATEFUL_NAMESPACE");
            cfg.default_backend = Some(backend);
        }
        if let Some(codec) = lookup("STATEFUL_CODEC") {
            cfg.default_codec = codec.parse()?;
        }
        if let Some(ms) = lookup("STATEFUL_LOCK_TIMEOUT_MS") {
            cfg.lock.timeout = parse_millis("STATEFUL_LOCK_TIMEOUT_MS", &ms)?;
        }
        if let Some(ms) = lookup("STATEFUL_LOCK_LEASE_MS") {
            cfg.lock.lease = parse_millis("STATEFUL_LOCK_LEASE_MS", &ms)?;
        }

        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<()> {
        if let Some(backend) = &self.default_backend {
            backend.validate()?;
        }
        self.lock.validate()
    }
}

/// Canonical form of `path`, which need not exist yet: its parent is
/// resolved instead and the file name appended.
fn canonical_path(path: &Path) -> PathBuf {
    if let Ok(resolved) = path.canonicalize() {
        return resolved;
    }
    let absolute = if path.is_absolute() {
        path.to_path_buf()
    } else {
        match std::env::current_dir() {
            Ok(cwd) => cwd.join(path),
            Err(_) => return path.to_path_buf(),
        }
    };
    match (absolute.parent(), absolute.file_name()) {
        (Some(parent), Some(name)) => parent
            .canonicalize()
            .map(|p| p.join(name))
            .unwrap_or(absolute),
        _ => absolute,
    }
}

fn parse_millis(name: &str, raw: &str) -> Result<Duration> {
    raw.trim()
        .parse::<u64>()
        .map(Duration::from_millis)
        .map_err(|e| StateError::InvalidConfig(format!("{name}={raw:?}: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_backend_kind_parse() {
        assert_eq!("sqlite".parse::<BackendKind>().unwrap(), BackendKind::Embedded);
        assert_eq!("Redis".parse::<BackendKind>().unwrap(), BackendKind::Networked);
        assert_eq!("memory".parse::<BackendKind>().unwrap(), BackendKind::Memory);
        assert!(matches!(
            "etcd".parse::<BackendKind>(),
            Err(StateError::InvalidConfig(_))
        ));
    }

    #[test]
    fn test_backend_config_validation() {
        assert!(BackendConfig::embedded("state.db").validate().is_ok());
        assert!(BackendConfig::networked("").validate().is_err());
        assert!(BackendConfig::memory("").validate().is_ok());
        assert!(BackendConfig::memory("m")
            .with_namespace("")
            .validate()
            .is_err());
    }

    #[test]
    fn test_registry_config_from_toml() {
        let cfg = RegistryConfig::from_toml_str(
            r#"
            default_codec = "json"

            [default_backend]
            kind = "redis"
            connection = "redis://localhost:6379/0"
            namespace = "demo"

            [lock]
            timeout_ms = 500
            "#,
        )
        .unwrap();

        let backend = cfg.default_backend.unwrap();
        assert_eq!(backend.kind, BackendKind::Networked);
        assert_eq!(backend.namespace.as_deref(), Some("demo"));
        assert_eq!(cfg.default_codec, CodecKind::Json);
        assert_eq!(cfg.lock.timeout, Duration::from_millis(500));
        assert_eq!(cfg.lock.lease, LockOptions::default().lease);
    }

    #[test]
    fn test_registry_config_empty_toml_is_default() {
        let cfg = RegistryConfig::from_toml_str("").unwrap();
        assert_eq!(cfg, RegistryConfig::default());
    }

    #[test]
    fn test_registry_config_from_lookup() {
        let vars: HashMap<&str, &str> = [
            ("STATEFUL_BACKEND", "sqlite"),
            ("STATEFUL_CONNECTION", "/tmp/state.db"),
            ("STATEFUL_CODEC", "json"),
            ("STATEFUL_LOCK_TIMEOUT_MS", "1500"),
        ]
        .into_iter()
        .collect();

        let cfg = RegistryConfig::from_lookup(|k| vars.get(k).map(|v| v.to_string())).unwrap();
        assert_eq!(
            cfg.default_backend,
            Some(BackendConfig::embedded("/tmp/state.db"))
        );
        assert_eq!(cfg.default_codec, CodecKind::Json);
        assert_eq!(cfg.lock.timeout, Duration::from_millis(1500));
    }

    #[test]
    fn test_registry_config_bad_env_value() {
        let err = RegistryConfig::from_lookup(|k| {
            (k == "STATEFUL_LOCK_TIMEOUT_MS").then(|| "soon".to_string())
        })
        .unwrap_err();
        assert!(err.is_configuration());
    }

    #[test]
    fn test_embedded_paths_normalize_to_one_name() {
        let dir = tempfile::TempDir::new().unwrap();
        let plain = BackendConfig::embedded(dir.path().join("state.db")).normalized();
        let dotted = BackendConfig::embedded(dir.path().join(".").join("state.db")).normalized();
        let parent = BackendConfig::embedded(dir.path().join("sub").join("..").join("state.db"));
        std::fs::create_dir(dir.path().join("sub")).unwrap();

        assert_eq!(plain, dotted);
        assert_eq!(plain, parent.normalized());
        assert!(Path::new(&plain.connection).is_absolute());
        assert_eq!(
            BackendConfig::memory("m").normalized(),
            BackendConfig::memory("m")
        );
    }
}
