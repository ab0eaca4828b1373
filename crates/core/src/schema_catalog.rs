use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use thiserror::Error;

use crate::value::TableSchema;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableEntry {
    pub name: String,
    pub schema: Arc<TableSchema>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DatabaseEntry {
    pub name: String,
    pub tables: Vec<TableEntry>,
}

/// Everything the connection tree and new tabs need to know about the
/// server: databases, tables, and each table's column metadata including
/// primary-key and auto-increment flags.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SchemaCatalog {
    pub databases: Vec<DatabaseEntry>,
}

impl SchemaCatalog {
    #[must_use]
    pub fn database(&self, name: &str) -> Option<&DatabaseEntry> {
        self.databases.iter().find(|database| database.name == name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message}")]
pub struct SchemaBackendError {
    message: String,
}

impl SchemaBackendError {
    #[must_use]
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

#[derive(Debug, Error)]
pub enum SchemaCatalogError {
    #[error("schema backend failed: {0}")]
    Backend(#[source] SchemaBackendError),
}

#[async_trait]
pub trait SchemaBackend {
    async fn fetch_catalog(&self) -> Result<SchemaCatalog, SchemaBackendError>;
}

#[derive(Debug)]
struct CachedCatalog {
    fetched_at: Instant,
    catalog: Arc<SchemaCatalog>,
}

/// TTL cache in front of the (slow) information-schema walk. Mutations
/// invalidate it explicitly when they change table shape; plain data edits
/// do not.
#[derive(Debug)]
pub struct SchemaCatalogService<B: SchemaBackend> {
    backend: B,
    ttl: Duration,
    cache: Option<CachedCatalog>,
}

impl<B: SchemaBackend> SchemaCatalogService<B> {
    #[must_use]
    pub fn new(backend: B, ttl: Duration) -> Self {
        Self {
            backend,
            ttl,
            cache: None,
        }
    }

    #[must_use]
    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    pub fn invalidate(&mut self) {
        self.cache = None;
    }

    pub async fn catalog(&mut self) -> Result<Arc<SchemaCatalog>, SchemaCatalogError> {
        self.catalog_at(Instant::now()).await
    }

    pub async fn refresh(&mut self) -> Result<Arc<SchemaCatalog>, SchemaCatalogError> {
        self.refresh_at(Instant::now()).await
    }

    pub async fn list_databases(&mut self) -> Result<Vec<String>, SchemaCatalogError> {
        let catalog = self.catalog().await?;
        Ok(catalog
            .databases
            .iter()
            .map(|database| database.name.clone())
            .collect())
    }

    pub async fn list_tables(
        &mut self,
        database_name: &str,
    ) -> Result<Vec<String>, SchemaCatalogError> {
        let catalog = self.catalog().await?;
        Ok(catalog
            .database(database_name)
            .map(|database| {
                database
                    .tables
                    .iter()
                    .map(|table| table.name.clone())
                    .collect()
            })
            .unwrap_or_default())
    }

    /// The schema a fresh table view opens with; `None` when the table is
    /// unknown to the catalog.
    pub async fn table_schema(
        &mut self,
        database_name: &str,
        table_name: &str,
    ) -> Result<Option<Arc<TableSchema>>, SchemaCatalogError> {
        let catalog = self.catalog().await?;
        Ok(catalog.database(database_name).and_then(|database| {
            database
                .tables
                .iter()
                .find(|table| table.name == table_name)
                .map(|table| Arc::clone(&table.schema))
        }))
    }

    async fn catalog_at(&mut self, now: Instant) -> Result<Arc<SchemaCatalog>, SchemaCatalogError> {
        if let Some(cache) = &self.cache {
            if now.duration_since(cache.fetched_at) <= self.ttl {
                return Ok(Arc::clone(&cache.catalog));
            }
        }
        self.refresh_at(now).await
    }

    async fn refresh_at(&mut self, now: Instant) -> Result<Arc<SchemaCatalog>, SchemaCatalogError> {
        let catalog = Arc::new(
            self.backend
                .fetch_catalog()
                .await
                .map_err(SchemaCatalogError::Backend)?,
        );

        self.cache = Some(CachedCatalog {
            fetched_at: now,
            catalog: Arc::clone(&catalog),
        });
        Ok(catalog)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    use super::{
        DatabaseEntry, SchemaBackend, SchemaBackendError, SchemaCatalog, SchemaCatalogService,
        TableEntry,
    };
    use crate::value::{Column, TableSchema};

    #[derive(Debug, Clone)]
    struct FakeSchemaBackend {
        fetch_count: Arc<AtomicUsize>,
        catalog: SchemaCatalog,
    }

    #[async_trait::async_trait]
    impl SchemaBackend for FakeSchemaBackend {
        async fn fetch_catalog(&self) -> Result<SchemaCatalog, SchemaBackendError> {
            self.fetch_count.fetch_add(1, Ordering::Relaxed);
            Ok(self.catalog.clone())
        }
    }

    fn sample_catalog() -> SchemaCatalog {
        let users = Arc::new(TableSchema::new(vec![
            Column::new("id", "bigint").primary_key(),
            Column::new("email", "varchar(255)"),
        ]));
        let events = Arc::new(TableSchema::new(vec![Column::new(
            "occurred_at",
            "datetime",
        )]));

        SchemaCatalog {
            databases: vec![
                DatabaseEntry {
                    name: "app".to_string(),
                    tables: vec![TableEntry {
                        name: "users".to_string(),
                        schema: users,
                    }],
                },
                DatabaseEntry {
                    name: "analytics".to_string(),
                    tables: vec![TableEntry {
                        name: "events".to_string(),
                        schema: events,
                    }],
                },
            ],
        }
    }

    fn backend(fetch_count: &Arc<AtomicUsize>) -> FakeSchemaBackend {
        FakeSchemaBackend {
            fetch_count: Arc::clone(fetch_count),
            catalog: sample_catalog(),
        }
    }

    #[tokio::test]
    async fn uses_cache_within_ttl() {
        let fetch_count = Arc::new(AtomicUsize::new(0));
        let mut service =
            SchemaCatalogService::new(backend(&fetch_count), Duration::from_secs(60));

        let databases = service
            .list_databases()
            .await
            .expect("first read should load the catalog");
        let tables = service
            .list_tables("app")
            .await
            .expect("second read should use the cache");

        assert_eq!(fetch_count.load(Ordering::Relaxed), 1);
        assert_eq!(databases, vec!["app".to_string(), "analytics".to_string()]);
        assert_eq!(tables, vec!["users".to_string()]);
    }

    #[tokio::test]
    async fn zero_ttl_refetches_on_each_request() {
        let fetch_count = Arc::new(AtomicUsize::new(0));
        let mut service = SchemaCatalogService::new(backend(&fetch_count), Duration::ZERO);

        service
            .list_databases()
            .await
            .expect("first read should load the catalog");
        service
            .list_databases()
            .await
            .expect("second read should refresh the catalog");

        assert_eq!(fetch_count.load(Ordering::Relaxed), 2);
    }

    #[tokio::test]
    async fn invalidation_forces_a_refetch() {
        let fetch_count = Arc::new(AtomicUsize::new(0));
        let mut service =
            SchemaCatalogService::new(backend(&fetch_count), Duration::from_secs(60));

        service.catalog().await.expect("initial load");
        service.invalidate();
        service.catalog().await.expect("reload after invalidation");
        assert_eq!(fetch_count.load(Ordering::Relaxed), 2);
    }

    #[tokio::test]
    async fn table_schema_resolves_columns_with_key_flags() {
        let fetch_count = Arc::new(AtomicUsize::new(0));
        let mut service =
            SchemaCatalogService::new(backend(&fetch_count), Duration::from_secs(60));

        let schema = service
            .table_schema("app", "users")
            .await
            .expect("lookup should succeed")
            .expect("users should exist");
        assert_eq!(schema.column_count(), 2);
        assert!(schema.columns[0].primary_key);
        assert_eq!(schema.primary_key_indices(), vec![0]);

        let missing = service
            .table_schema("app", "nope")
            .await
            .expect("lookup should succeed");
        assert!(missing.is_none());
    }
}
