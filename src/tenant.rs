use std::path::PathBuf;
use std::sync::Arc;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use tracing::info;

use crate::compactor;
use crate::engine::{Engine, EngineOptions};
use crate::limits::*;
use crate::notify::NotifyHub;

/// One engine per laundry room. The room is the database name of the
/// Postgres connection; each gets its own WAL and compactor task.
pub struct TenantManager {
    engines: DashMap<String, Arc<Engine>>,
    data_dir: PathBuf,
    compact_threshold: u64,
    options: EngineOptions,
}

/// Keep only characters that are safe in a file name.
fn sanitize(tenant: &str) -> String {
    tenant
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || *c == '_' || *c == '-')
        .collect()
}

impl TenantManager {
    pub fn new(data_dir: PathBuf, compact_threshold: u64, options: EngineOptions) -> Self {
        Self {
            engines: DashMap::new(),
            data_dir,
            compact_threshold,
            options,
        }
    }

    /// Get or lazily create the engine for `tenant`. Names that sanitize to
    /// the same file name share one engine.
    pub fn get_or_create(&self, tenant: &str) -> std::io::Result<Arc<Engine>> {
        if tenant.len() > MAX_TENANT_NAME_LEN {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                "tenant name too long",
            ));
        }
        let safe_name = sanitize(tenant);
        if safe_name.is_empty() {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                "empty tenant name",
            ));
        }
        if let Some(engine) = self.engines.get(&safe_name) {
            return Ok(engine.value().clone());
        }
        if self.engines.len() >= MAX_TENANTS {
            return Err(std::io::Error::other("too many tenants"));
        }

        // Two sessions may race here; the entry API makes sure only one engine
        // (and one writer on the WAL file) survives.
        let engine = match self.engines.entry(safe_name.clone()) {
            Entry::Occupied(e) => return Ok(e.get().clone()),
            Entry::Vacant(v) => {
                let wal_path = self.data_dir.join(format!("{safe_name}.wal"));
                let engine = Arc::new(Engine::new(
                    wal_path,
                    Arc::new(NotifyHub::new()),
                    self.options.clone(),
                )?);
                v.insert(engine.clone());
                engine
            }
        };

        let compactor_engine = engine.clone();
        let threshold = self.compact_threshold;
        tokio::spawn(async move {
            compactor::run_compactor(compactor_engine, threshold).await;
        });

        info!("opened laundry room {safe_name}");
        metrics::gauge!(crate::observability::TENANTS_ACTIVE).set(self.engines.len() as f64);
        Ok(engine)
    }

    pub fn tenant_count(&self) -> usize {
        self.engines.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::HOUR_MS;
    use std::fs;
    use tempfile::TempDir;

    fn manager(dir: &TempDir) -> TenantManager {
        TenantManager::new(dir.path().to_path_buf(), 1000, EngineOptions::default())
    }

    #[tokio::test]
    async fn rooms_are_isolated() {
        let dir = TempDir::new().unwrap();
        let tm = manager(&dir);

        let keller = tm.get_or_create("keller").unwrap();
        let dach = tm.get_or_create("dachboden").unwrap();

        keller
            .create_reservation("anna", 10 * HOUR_MS, 11 * HOUR_MS)
            .await
            .unwrap();
        // Same slot in another room is free
        dach.create_reservation("bert", 10 * HOUR_MS, 11 * HOUR_MS)
            .await
            .unwrap();

        assert_eq!(keller.reservation_count().await, 1);
        assert_eq!(dach.reservation_count().await, 1);
        assert_eq!(tm.tenant_count(), 2);
    }

    #[tokio::test]
    async fn wal_created_lazily() {
        let dir = TempDir::new().unwrap();
        let tm = manager(&dir);
        assert_eq!(fs::read_dir(dir.path()).unwrap().count(), 0);

        tm.get_or_create("haus_7").unwrap();
        assert!(dir.path().join("haus_7.wal").exists());
    }

    #[tokio::test]
    async fn same_engine_returned() {
        let dir = TempDir::new().unwrap();
        let tm = manager(&dir);
        let a = tm.get_or_create("keller").unwrap();
        let b = tm.get_or_create("keller").unwrap();
        assert!(Arc::ptr_eq(&a, &b));
    }

    #[tokio::test]
    async fn names_are_sanitized() {
        let dir = TempDir::new().unwrap();
        let tm = manager(&dir);

        tm.get_or_create("../evil").unwrap();
        assert!(dir.path().join("evil.wal").exists());

        let err = tm.get_or_create("../..").err().unwrap();
        assert!(err.to_string().contains("empty tenant name"));
    }

    #[tokio::test]
    async fn names_sharing_a_wal_share_an_engine() {
        let dir = TempDir::new().unwrap();
        let tm = manager(&dir);

        let plain = tm.get_or_create("keller").unwrap();
        let dotted = tm.get_or_create("kel.ler").unwrap();
        let escaped = tm.get_or_create("../keller").unwrap();
        assert!(Arc::ptr_eq(&plain, &dotted));
        assert!(Arc::ptr_eq(&plain, &escaped));
        assert_eq!(tm.tenant_count(), 1);

        plain
            .create_reservation("anna", 10 * HOUR_MS, 11 * HOUR_MS)
            .await
            .unwrap();
        let err = dotted
            .create_reservation("bert", 10 * HOUR_MS + HOUR_MS / 2, 12 * HOUR_MS)
            .await
            .unwrap_err();
        assert!(matches!(err, crate::engine::EngineError::Overlap(_)));
    }

    #[tokio::test]
    async fn name_too_long() {
        let dir = TempDir::new().unwrap();
        let tm = manager(&dir);
        let err = tm
            .get_or_create(&"x".repeat(MAX_TENANT_NAME_LEN + 1))
            .err()
            .unwrap();
        assert!(err.to_string().contains("tenant name too long"));
        assert!(tm.get_or_create(&"x".repeat(MAX_TENANT_NAME_LEN)).is_ok());
    }

    #[tokio::test]
    async fn reopening_replays_reservations() {
        let dir = TempDir::new().unwrap();
        let id = {
            let tm = manager(&dir);
            let engine = tm.get_or_create("keller").unwrap();
            engine
                .create_reservation("anna", HOUR_MS, 2 * HOUR_MS)
                .await
                .unwrap()
                .id
        };
        let tm = manager(&dir);
        let engine = tm.get_or_create("keller").unwrap();
        assert_eq!(engine.get_reservation(id).await.unwrap().owner_id, "anna");
    }
}
