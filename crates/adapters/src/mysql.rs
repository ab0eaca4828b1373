use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use futures_util::StreamExt;
use mysql_async::prelude::{Query, Queryable};
use mysql_async::{Conn, OptsBuilder, Pool, Row as MysqlRow, SslOpts, Value as MysqlValue};
use trellis_core::connection::{ConnectionBackend, ConnectionBackendError};
use trellis_core::mutations::{MutationBackend, MutationBackendError};
use trellis_core::page_loader::{PageBackend, PageBackendError};
use trellis_core::profiles::{ConnectionProfile, PasswordSource, TlsMode};
use trellis_core::query_spec::QuerySpec;
use trellis_core::schema_catalog::{
    DatabaseEntry, SchemaBackend, SchemaBackendError, SchemaCatalog, TableEntry,
};
use trellis_core::sql::{
    bounded_count_sql, delete_row_sql, insert_row_sql, page_select_sql, update_cell_sql, TableRef,
};
use trellis_core::value::{Column, Page, Row, RowCount, TableSchema, Value};

#[derive(Debug, Clone, Default)]
pub struct MysqlConnectionBackend;

#[async_trait]
impl ConnectionBackend for MysqlConnectionBackend {
    type Connection = Conn;

    async fn connect(
        &self,
        profile: &ConnectionProfile,
    ) -> Result<Self::Connection, ConnectionBackendError> {
        Conn::new(opts_from_profile(profile))
            .await
            .map_err(to_connection_error)
    }

    async fn ping(&self, connection: &mut Self::Connection) -> Result<(), ConnectionBackendError> {
        connection.ping().await.map_err(to_connection_error)
    }

    async fn disconnect(
        &self,
        connection: Self::Connection,
    ) -> Result<(), ConnectionBackendError> {
        connection.disconnect().await.map_err(to_connection_error)
    }
}

/// Pooled MySQL driver behind the paging, mutation, and schema seams.
#[derive(Debug, Clone)]
pub struct MysqlTableBackend {
    pool: Pool,
}

impl MysqlTableBackend {
    #[must_use]
    pub fn from_profile(profile: &ConnectionProfile) -> Self {
        Self {
            pool: Pool::new(opts_from_profile(profile)),
        }
    }

    pub async fn disconnect(&self) -> Result<(), mysql_async::Error> {
        self.pool.clone().disconnect().await
    }

    /// Run a statement outside the paging/mutation surface; used for
    /// seeding and DDL by the benchmark and the integration tests.
    pub async fn execute_raw(&self, sql: &str) -> Result<(), mysql_async::Error> {
        let mut conn = self.pool.get_conn().await?;
        conn.query_drop(sql).await
    }
}

#[async_trait]
impl PageBackend for MysqlTableBackend {
    async fn fetch_page(
        &self,
        spec: &QuerySpec,
        schema: Arc<TableSchema>,
        offset: u64,
        limit: usize,
    ) -> Result<Page, PageBackendError> {
        let sql = page_select_sql(spec, offset, limit)
            .map_err(|error| PageBackendError::new(error.to_string()))?;

        let mut stream = sql
            .stream::<MysqlRow, _>(self.pool.clone())
            .await
            .map_err(to_page_error)?;

        let mut rows = Vec::new();
        while let Some(row) = stream.next().await {
            let row = row.map_err(to_page_error)?;
            rows.push(row_to_core_row(row));
            if rows.len() >= limit {
                break;
            }
        }
        drop(stream);

        Page::new(schema, offset, rows).map_err(|error| PageBackendError::new(error.to_string()))
    }

    async fn count_rows(
        &self,
        spec: &QuerySpec,
        budget: u64,
    ) -> Result<RowCount, PageBackendError> {
        let sql = bounded_count_sql(spec, budget)
            .map_err(|error| PageBackendError::new(error.to_string()))?;

        let mut conn = self.pool.get_conn().await.map_err(to_page_error)?;
        let counted: Option<u64> = conn.query_first(sql).await.map_err(to_page_error)?;
        let total = counted.ok_or_else(|| PageBackendError::new("count returned no row"))?;

        // The probe select stops one row past the budget, so seeing
        // budget + 1 rows means the true total is at least that much.
        Ok(RowCount {
            total,
            exact: total <= budget,
        })
    }
}

#[async_trait]
impl MutationBackend for MysqlTableBackend {
    async fn update_cell(
        &self,
        database: Option<&str>,
        table: &str,
        key: &[(String, Value)],
        column: &str,
        value: &Value,
    ) -> Result<(), MutationBackendError> {
        let target =
            TableRef::new(database, table).map_err(|error| MutationBackendError::new(error.to_string()))?;
        let sql = update_cell_sql(target, key, column, value)
            .map_err(|error| MutationBackendError::new(error.to_string()))?;

        let mut conn = self.pool.get_conn().await.map_err(to_mutation_error)?;
        conn.query_drop(sql).await.map_err(to_mutation_error)?;
        if conn.affected_rows() == 0 {
            return Err(MutationBackendError::new(
                "no row matched the primary key; it may have been changed elsewhere",
            ));
        }
        Ok(())
    }

    async fn delete_row(
        &self,
        database: Option<&str>,
        table: &str,
        key: &[(String, Value)],
    ) -> Result<(), MutationBackendError> {
        let target =
            TableRef::new(database, table).map_err(|error| MutationBackendError::new(error.to_string()))?;
        let sql = delete_row_sql(target, key)
            .map_err(|error| MutationBackendError::new(error.to_string()))?;

        let mut conn = self.pool.get_conn().await.map_err(to_mutation_error)?;
        conn.query_drop(sql).await.map_err(to_mutation_error)?;
        if conn.affected_rows() == 0 {
            return Err(MutationBackendError::new(
                "no row matched the primary key; it may have been deleted elsewhere",
            ));
        }
        Ok(())
    }

    async fn insert_row(
        &self,
        database: Option<&str>,
        table: &str,
        values: &[(String, Value)],
    ) -> Result<(), MutationBackendError> {
        let target =
            TableRef::new(database, table).map_err(|error| MutationBackendError::new(error.to_string()))?;
        let sql = insert_row_sql(target, values)
            .map_err(|error| MutationBackendError::new(error.to_string()))?;

        let mut conn = self.pool.get_conn().await.map_err(to_mutation_error)?;
        conn.query_drop(sql).await.map_err(to_mutation_error)
    }
}

#[async_trait]
impl SchemaBackend for MysqlTableBackend {
    async fn fetch_catalog(&self) -> Result<SchemaCatalog, SchemaBackendError> {
        let mut conn = self.pool.get_conn().await.map_err(to_schema_error)?;
        let databases = conn
            .query_map("SHOW DATABASES", |database: String| database)
            .await
            .map_err(to_schema_error)?;

        let mut catalog_databases = Vec::with_capacity(databases.len());
        for database in databases {
            let tables = conn
                .exec_map(
                    "SELECT TABLE_NAME \
                     FROM information_schema.TABLES \
                     WHERE TABLE_SCHEMA = ? \
                     ORDER BY TABLE_NAME",
                    (database.clone(),),
                    |table_name: String| table_name,
                )
                .await
                .map_err(to_schema_error)?;

            let mut catalog_tables = Vec::with_capacity(tables.len());
            for table in tables {
                let columns = conn
                    .exec_map(
                        "SELECT COLUMN_NAME, COLUMN_TYPE, IS_NULLABLE, COLUMN_KEY, EXTRA, \
                         COLUMN_DEFAULT \
                         FROM information_schema.COLUMNS \
                         WHERE TABLE_SCHEMA = ? AND TABLE_NAME = ? \
                         ORDER BY ORDINAL_POSITION",
                        (database.clone(), table.clone()),
                        |(name, column_type, nullable, column_key, extra, default_literal): (
                            String,
                            String,
                            String,
                            String,
                            String,
                            Option<String>,
                        )| {
                            column_from_information_schema(
                                name,
                                column_type,
                                &nullable,
                                &column_key,
                                &extra,
                                default_literal,
                            )
                        },
                    )
                    .await
                    .map_err(to_schema_error)?;

                catalog_tables.push(TableEntry {
                    name: table,
                    schema: Arc::new(TableSchema::new(columns)),
                });
            }

            catalog_databases.push(DatabaseEntry {
                name: database,
                tables: catalog_tables,
            });
        }

        conn.disconnect().await.map_err(to_schema_error)?;
        Ok(SchemaCatalog {
            databases: catalog_databases,
        })
    }
}

fn column_from_information_schema(
    name: String,
    column_type: String,
    nullable: &str,
    column_key: &str,
    extra: &str,
    default_literal: Option<String>,
) -> Column {
    Column {
        name,
        type_name: column_type,
        nullable: nullable.eq_ignore_ascii_case("YES"),
        primary_key: column_key.eq_ignore_ascii_case("PRI"),
        auto_increment: extra.to_ascii_lowercase().contains("auto_increment"),
        default_literal,
    }
}

fn opts_from_profile(profile: &ConnectionProfile) -> OptsBuilder {
    let mut builder = OptsBuilder::default()
        .ip_or_hostname(profile.host.clone())
        .tcp_port(profile.port)
        .user(Some(profile.user.clone()));

    if let Some(password) = resolve_password(profile) {
        builder = builder.pass(Some(password));
    }

    if let Some(database) = &profile.database {
        builder = builder.db_name(Some(database.clone()));
    }

    if let Some(ssl_opts) = ssl_opts_from_profile(profile) {
        builder = builder.ssl_opts(ssl_opts);
    }

    if matches!(profile.tls_mode, TlsMode::Disabled) {
        builder = builder.prefer_socket(false);
    }

    builder
}

fn resolve_password(profile: &ConnectionProfile) -> Option<String> {
    let env_password = std::env::var("TRELLIS_DB_PASSWORD")
        .ok()
        .filter(|pw| !pw.is_empty());

    match profile.password_source {
        PasswordSource::EnvVar => env_password,
        PasswordSource::Keyring => {
            if let Some(password) = load_keyring_password(profile) {
                return Some(password);
            }

            if let Some(password) = env_password {
                store_keyring_password(profile, &password);
                return Some(password);
            }

            None
        }
    }
}

fn ssl_opts_from_profile(profile: &ConnectionProfile) -> Option<SslOpts> {
    let wants_tls = match profile.tls_mode {
        TlsMode::Disabled => false,
        TlsMode::Prefer => profile.tls_ca_cert_path.is_some(),
        TlsMode::Require => true,
    };
    if !wants_tls {
        return None;
    }

    let mut ssl_opts = SslOpts::default();
    if let Some(ca_cert_path) = non_empty(profile.tls_ca_cert_path.as_deref()) {
        ssl_opts = ssl_opts.with_root_certs(vec![PathBuf::from(ca_cert_path).into()]);
    }
    Some(ssl_opts)
}

fn non_empty(value: Option<&str>) -> Option<&str> {
    value.and_then(|raw| {
        let trimmed = raw.trim();
        (!trimmed.is_empty()).then_some(trimmed)
    })
}

#[cfg(any(target_os = "linux", target_os = "macos", target_os = "windows"))]
fn load_keyring_password(profile: &ConnectionProfile) -> Option<String> {
    let entry = keyring_entry(profile)?;
    entry.get_password().ok().filter(|pw| !pw.is_empty())
}

#[cfg(not(any(target_os = "linux", target_os = "macos", target_os = "windows")))]
fn load_keyring_password(_profile: &ConnectionProfile) -> Option<String> {
    None
}

#[cfg(any(target_os = "linux", target_os = "macos", target_os = "windows"))]
fn store_keyring_password(profile: &ConnectionProfile, password: &str) {
    if password.is_empty() {
        return;
    }
    if let Some(entry) = keyring_entry(profile) {
        let _ = entry.set_password(password);
    }
}

#[cfg(not(any(target_os = "linux", target_os = "macos", target_os = "windows")))]
fn store_keyring_password(_profile: &ConnectionProfile, _password: &str) {}

#[cfg(any(target_os = "linux", target_os = "macos", target_os = "windows"))]
fn keyring_entry(profile: &ConnectionProfile) -> Option<keyring::Entry> {
    let service = non_empty(profile.keyring_service.as_deref()).unwrap_or("trellis");
    let account = non_empty(profile.keyring_account.as_deref()).unwrap_or(profile.name.as_str());
    keyring::Entry::new(service, account).ok()
}

fn row_to_core_row(row: MysqlRow) -> Row {
    let values = row
        .unwrap()
        .into_iter()
        .map(mysql_value_to_value)
        .collect::<Vec<_>>();
    Row::new(values)
}

fn mysql_value_to_value(value: MysqlValue) -> Value {
    match value {
        MysqlValue::NULL => Value::Null,
        MysqlValue::Bytes(bytes) => match String::from_utf8(bytes) {
            Ok(text) => Value::Text(text),
            Err(error) => Value::Bytes(error.into_bytes()),
        },
        MysqlValue::Int(value) => Value::Integer(value),
        MysqlValue::UInt(value) => match i64::try_from(value) {
            Ok(value) => Value::Integer(value),
            Err(_) => Value::Text(value.to_string()),
        },
        MysqlValue::Float(value) => Value::Float(f64::from(value)),
        MysqlValue::Double(value) => Value::Float(value),
        MysqlValue::Date(year, month, day, hour, minute, second, micros) => Value::Text(format!(
            "{year:04}-{month:02}-{day:02} {hour:02}:{minute:02}:{second:02}.{micros:06}"
        )),
        MysqlValue::Time(is_negative, days, hours, minutes, seconds, micros) => {
            let sign = if is_negative { "-" } else { "" };
            Value::Text(format!(
                "{sign}{days:03} {hours:02}:{minutes:02}:{seconds:02}.{micros:06}"
            ))
        }
    }
}

fn to_connection_error(error: mysql_async::Error) -> ConnectionBackendError {
    ConnectionBackendError::new(error.to_string())
}

fn to_page_error(error: mysql_async::Error) -> PageBackendError {
    PageBackendError::new(error.to_string())
}

fn to_mutation_error(error: mysql_async::Error) -> MutationBackendError {
    MutationBackendError::new(error.to_string())
}

fn to_schema_error(error: mysql_async::Error) -> SchemaBackendError {
    SchemaBackendError::new(error.to_string())
}
