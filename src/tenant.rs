use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use dashmap::DashMap;

use crate::compactor;
use crate::engine::Engine;
use crate::limits::*;

/// One engine per company, created on first use. The company is the
/// database name of the pgwire connection.
pub struct TenantManager {
    engines: DashMap<String, Arc<Engine>>,
    data_dir: PathBuf,
    compact_threshold: u64,
}

/// Company names become file names verbatim, so anything outside
/// `[A-Za-z0-9_-]` is refused rather than rewritten: two names must never
/// share a WAL.
fn wal_file_stem(company: &str) -> io::Result<&str> {
    if company.is_empty() {
        return Err(io::Error::new(io::ErrorKind::InvalidInput, "empty company name"));
    }
    if company.len() > MAX_TENANT_NAME_LEN {
        return Err(io::Error::new(io::ErrorKind::InvalidInput, "company name too long"));
    }
    if let Some(bad) = company
        .chars()
        .find(|c| !(c.is_ascii_alphanumeric() || *c == '_' || *c == '-'))
    {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("company name may not contain {bad:?}"),
        ));
    }
    Ok(company)
}

impl TenantManager {
    pub fn new(data_dir: PathBuf, compact_threshold: u64) -> Self {
        Self {
            engines: DashMap::new(),
            data_dir,
            compact_threshold,
        }
    }

    pub fn get_or_create(&self, company: &str) -> io::Result<Arc<Engine>> {
        if let Some(engine) = self.engines.get(company) {
            return Ok(engine.value().clone());
        }
        let stem = wal_file_stem(company)?;
        if self.engines.len() >= MAX_TENANTS {
            return Err(io::Error::other("too many companies"));
        }

        let engine = match self.engines.entry(company.to_string()) {
            dashmap::mapref::entry::Entry::Occupied(e) => return Ok(e.get().clone()),
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                let wal_path = self.data_dir.join(format!("{stem}.wal"));
                let engine = Arc::new(Engine::new(company, wal_path)?);
                slot.insert(engine.clone());
                engine
            }
        };

        tokio::spawn(compactor::run_compactor(engine.clone(), self.compact_threshold));
        metrics::gauge!(crate::observability::TENANTS_ACTIVE).set(self.engines.len() as f64);
        tracing::info!("company {company} loaded");
        Ok(engine)
    }
}

#[cfg(test)]
mod tests {
    use std::fs;

    use chrono::NaiveDate;
    use ulid::Ulid;

    use super::*;
    use crate::engine::{EngineError, NewResource};
    use crate::model::*;

    fn test_data_dir(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join("crewplan_test_tenant").join(name);
        let _ = fs::remove_dir_all(&dir);
        fs::create_dir_all(&dir).unwrap();
        dir
    }

    fn crane(id: Ulid) -> NewResource {
        NewResource {
            id,
            name: "Tower crane".into(),
            details: ResourceDetails::Equipment {
                condition: None,
                last_maintenance: None,
                next_maintenance: None,
            },
            status: None,
            cost_rate: None,
            cost_unit: None,
        }
    }

    #[tokio::test]
    async fn companies_are_isolated() {
        let tm = TenantManager::new(test_data_dir("isolation"), 1000);
        let acme = tm.get_or_create("acme").unwrap();
        let globex = tm.get_or_create("globex").unwrap();
        let acme_scope = Scope::new("acme", "ann");
        let globex_scope = Scope::new("globex", "gus");

        let rid = Ulid::new();
        acme.create_resource(&acme_scope, crane(rid)).await.unwrap();
        globex.create_resource(&globex_scope, crane(rid)).await.unwrap();

        let day = NaiveDate::from_ymd_opt(2025, 5, 1).unwrap();
        acme.add_availability(&acme_scope, Ulid::new(), rid, day, day, "inspection".into())
            .await
            .unwrap();

        let globex_blackouts = globex.list_availability(&globex_scope, rid, None).await.unwrap();
        assert!(globex_blackouts.is_empty());
        assert_eq!(acme.list_availability(&acme_scope, rid, None).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn foreign_scope_is_not_found() {
        let tm = TenantManager::new(test_data_dir("foreign_scope"), 1000);
        let acme = tm.get_or_create("acme").unwrap();
        let rid = Ulid::new();
        acme.create_resource(&Scope::new("acme", "ann"), crane(rid)).await.unwrap();

        let err = acme
            .resource(&Scope::new("globex", "gus"), rid, false)
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::OutOfScope(_)));
        assert_eq!(err.kind(), "not_found");
    }

    #[tokio::test]
    async fn wal_created_lazily() {
        let dir = test_data_dir("lazy");
        let tm = TenantManager::new(dir.clone(), 1000);
        assert_eq!(fs::read_dir(&dir).unwrap().count(), 0);
        tm.get_or_create("builders_inc").unwrap();
        assert!(dir.join("builders_inc.wal").exists());
    }

    #[tokio::test]
    async fn same_engine_returned() {
        let tm = TenantManager::new(test_data_dir("same_engine"), 1000);
        let a = tm.get_or_create("acme").unwrap();
        let b = tm.get_or_create("acme").unwrap();
        assert!(Arc::ptr_eq(&a, &b));
    }

    #[tokio::test]
    async fn company_name_with_path_characters_rejected() {
        let dir = test_data_dir("reject_path");
        let tm = TenantManager::new(dir.clone(), 1000);
        assert!(tm.get_or_create("../evil").is_err());
        assert!(tm.get_or_create("../..").is_err());
        assert!(tm.get_or_create("").is_err());
        assert_eq!(fs::read_dir(&dir).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn similar_company_names_never_share_state() {
        let dir = test_data_dir("no_collision");
        let tm = TenantManager::new(dir.clone(), 1000);
        let err = tm.get_or_create("acme.x").err().unwrap();
        assert_eq!(err.kind(), io::ErrorKind::InvalidInput);

        let acmex = tm.get_or_create("acmex").unwrap();
        let scope = Scope::new("acmex", "ann");
        acmex.create_resource(&scope, crane(Ulid::new())).await.unwrap();

        let fresh = TenantManager::new(dir, 1000);
        assert!(fresh.get_or_create("acme.x").is_err());
        let acme = fresh.get_or_create("acme").unwrap();
        let listed = acme.list_resources(&Scope::new("acme", "ann"), None, false).await.unwrap();
        assert!(listed.is_empty());
    }

    #[tokio::test]
    async fn company_name_too_long() {
        let tm = TenantManager::new(test_data_dir("too_long"), 1000);
        let err = tm
            .get_or_create(&"x".repeat(MAX_TENANT_NAME_LEN + 1))
            .err()
            .unwrap();
        assert!(err.to_string().contains("company name too long"));
    }
}
