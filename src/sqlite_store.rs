//! Durable [`SchemaStore`] on SQLite.
//!
//! Writes run in `BEGIN IMMEDIATE` transactions, and a partial unique index
//! on `status = 'active'` rejects a second active row even if two processes
//! share the database file.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension, Params, TransactionBehavior, params};
use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::info;

use crate::compatibility::CompatibilityReport;
use crate::error::StoreError;
use crate::schema_store::{
    ChangeType, NewProviderSchema, NewSchema, ProviderSchema, SchemaChangeHistory, SchemaStatus,
    SchemaStore, UnifiedSchema, compare, ensure_activatable, prepare, validate_provider_schema,
};
use crate::sdl::{self, CompiledSchema, DirectiveMetadata, FieldMapping};

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

const SCHEMA_COLUMNS: &str =
    "id, version, sdl, status, checksum, change_type, previous_version, created_by, created_at";

const DDL: &str = "
    CREATE TABLE IF NOT EXISTS unified_schemas (
        id TEXT PRIMARY KEY,
        version TEXT NOT NULL UNIQUE,
        sdl TEXT NOT NULL,
        status TEXT NOT NULL CHECK (status IN ('draft', 'active', 'deprecated')),
        checksum TEXT NOT NULL,
        change_type TEXT NOT NULL,
        previous_version TEXT,
        created_by TEXT NOT NULL,
        created_at TEXT NOT NULL
    );
    CREATE UNIQUE INDEX IF NOT EXISTS idx_unified_schemas_single_active
        ON unified_schemas (status) WHERE status = 'active';
    CREATE TABLE IF NOT EXISTS field_mappings (
        schema_id TEXT NOT NULL REFERENCES unified_schemas (id),
        unified_path TEXT NOT NULL,
        provider_key TEXT NOT NULL,
        provider_field TEXT NOT NULL,
        provider_schema_id TEXT,
        field_type TEXT NOT NULL,
        is_list INTEGER NOT NULL,
        required INTEGER NOT NULL,
        metadata TEXT NOT NULL,
        PRIMARY KEY (schema_id, unified_path)
    );
    CREATE TABLE IF NOT EXISTS schema_change_history (
        id TEXT PRIMARY KEY,
        from_version TEXT,
        to_version TEXT NOT NULL,
        change_type TEXT NOT NULL,
        changes TEXT NOT NULL,
        created_by TEXT NOT NULL,
        created_at TEXT NOT NULL
    );
    CREATE TABLE IF NOT EXISTS provider_schemas (
        provider_key TEXT NOT NULL,
        version TEXT NOT NULL,
        sdl TEXT NOT NULL,
        active INTEGER NOT NULL,
        created_at TEXT NOT NULL,
        PRIMARY KEY (provider_key, version)
    );
";

struct Inner {
    connection: Connection,
    // Versions are immutable, so compiled schemas never go stale.
    compiled: HashMap<String, Arc<CompiledSchema>>,
}

#[derive(Clone)]
pub struct SqliteSchemaStore {
    inner: Arc<Mutex<Inner>>,
}

impl SqliteSchemaStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|e| StoreError::Backend(e.to_string()))?;
        }
        let connection = Connection::open(path)?;
        connection.execute_batch("PRAGMA journal_mode = WAL;")?;
        Self::initialize(connection)
    }

    pub fn open_in_memory() -> Result<Self, StoreError> {
        Self::initialize(Connection::open_in_memory()?)
    }

    fn initialize(connection: Connection) -> Result<Self, StoreError> {
        connection.busy_timeout(BUSY_TIMEOUT)?;
        connection.execute_batch("PRAGMA foreign_keys = ON;")?;
        connection.execute_batch(DDL)?;
        Ok(SqliteSchemaStore {
            inner: Arc::new(Mutex::new(Inner {
                connection,
                compiled: HashMap::new(),
            })),
        })
    }

    async fn with_inner<T, F>(&self, op: F) -> Result<T, StoreError>
    where
        F: FnOnce(&mut Inner) -> Result<T, StoreError> + Send + 'static,
        T: Send + 'static,
    {
        let inner = Arc::clone(&self.inner);
        tokio::task::spawn_blocking(move || {
            let mut guard = inner
                .lock()
                .map_err(|_| StoreError::Backend("sqlite connection mutex poisoned".to_string()))?;
            op(&mut guard)
        })
        .await
        .map_err(|e| StoreError::Backend(e.to_string()))?
    }
}

struct SchemaRow {
    id: String,
    version: String,
    sdl: String,
    status: String,
    checksum: String,
    change_type: String,
    previous_version: Option<String>,
    created_by: String,
    created_at: String,
}

fn schema_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<SchemaRow> {
    Ok(SchemaRow {
        id: row.get(0)?,
        version: row.get(1)?,
        sdl: row.get(2)?,
        status: row.get(3)?,
        checksum: row.get(4)?,
        change_type: row.get(5)?,
        previous_version: row.get(6)?,
        created_by: row.get(7)?,
        created_at: row.get(8)?,
    })
}

fn corrupt(what: &str, value: &str) -> StoreError {
    StoreError::Backend(format!("corrupt {} `{}` in schema store", what, value))
}

fn parse_timestamp(value: &str) -> Result<DateTime<Utc>, StoreError> {
    DateTime::parse_from_rfc3339(value)
        .map(|ts| ts.with_timezone(&Utc))
        .map_err(|_| corrupt("timestamp", value))
}

fn parse_change_type(value: &str) -> Result<ChangeType, StoreError> {
    ChangeType::parse(value).ok_or_else(|| corrupt("change type", value))
}

fn json_error(err: serde_json::Error) -> StoreError {
    StoreError::Backend(err.to_string())
}

fn load_mappings(conn: &Connection, schema_id: &str) -> Result<Vec<FieldMapping>, StoreError> {
    let mut stmt = conn.prepare(
        "SELECT unified_path, provider_key, provider_field, provider_schema_id, field_type, \
         is_list, required, metadata FROM field_mappings WHERE schema_id = ?1",
    )?;
    let rows = stmt.query_map(params![schema_id], |row| {
        Ok((
            FieldMapping {
                unified_path: row.get(0)?,
                provider_key: row.get(1)?,
                provider_field: row.get(2)?,
                schema_id: row.get(3)?,
                field_type: row.get(4)?,
                is_list: row.get(5)?,
                required: row.get(6)?,
                metadata: DirectiveMetadata::default(),
            },
            row.get::<_, String>(7)?,
        ))
    })?;

    let mut mappings = Vec::new();
    for row in rows {
        let (mut mapping, metadata) = row?;
        mapping.metadata = serde_json::from_str(&metadata).map_err(json_error)?;
        mappings.push(mapping);
    }
    Ok(mappings)
}

fn hydrate(
    conn: &Connection,
    cache: &mut HashMap<String, Arc<CompiledSchema>>,
    row: SchemaRow,
) -> Result<UnifiedSchema, StoreError> {
    let compiled = match cache.get(&row.version) {
        Some(compiled) => Arc::clone(compiled),
        None => {
            let mappings = load_mappings(conn, &row.id)?;
            let compiled = Arc::new(sdl::compile_with_mappings(&row.sdl, mappings)?);
            cache.insert(row.version.clone(), Arc::clone(&compiled));
            compiled
        }
    };

    Ok(UnifiedSchema {
        status: SchemaStatus::parse(&row.status).ok_or_else(|| corrupt("status", &row.status))?,
        change_type: parse_change_type(&row.change_type)?,
        created_at: parse_timestamp(&row.created_at)?,
        id: row.id,
        version: row.version,
        sdl: row.sdl,
        checksum: row.checksum,
        previous_version: row.previous_version,
        created_by: row.created_by,
        compiled,
    })
}

fn load_one<P: Params>(
    conn: &Connection,
    cache: &mut HashMap<String, Arc<CompiledSchema>>,
    clause: &str,
    params: P,
) -> Result<Option<UnifiedSchema>, StoreError> {
    let sql = format!("SELECT {} FROM unified_schemas {}", SCHEMA_COLUMNS, clause);
    let row = conn.query_row(&sql, params, schema_row).optional()?;
    row.map(|row| hydrate(conn, cache, row)).transpose()
}

fn load_active(
    conn: &Connection,
    cache: &mut HashMap<String, Arc<CompiledSchema>>,
) -> Result<Option<UnifiedSchema>, StoreError> {
    load_one(conn, cache, "WHERE status = 'active'", params![])
}

fn load_version(
    conn: &Connection,
    cache: &mut HashMap<String, Arc<CompiledSchema>>,
    version: &str,
) -> Result<Option<UnifiedSchema>, StoreError> {
    load_one(conn, cache, "WHERE version = ?1", params![version])
}

fn load_base(
    conn: &Connection,
    cache: &mut HashMap<String, Arc<CompiledSchema>>,
) -> Result<Option<UnifiedSchema>, StoreError> {
    match load_active(conn, cache)? {
        Some(active) => Ok(Some(active)),
        None => load_one(conn, cache, "ORDER BY rowid DESC LIMIT 1", params![]),
    }
}

fn insert_schema(conn: &Connection, schema: &UnifiedSchema) -> Result<(), StoreError> {
    conn.execute(
        "INSERT INTO unified_schemas (id, version, sdl, status, checksum, change_type, \
         previous_version, created_by, created_at) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
        params![
            schema.id,
            schema.version,
            schema.sdl,
            schema.status.as_str(),
            schema.checksum,
            schema.change_type.as_str(),
            schema.previous_version,
            schema.created_by,
            schema.created_at.to_rfc3339(),
        ],
    )?;

    let mut stmt = conn.prepare(
        "INSERT INTO field_mappings (schema_id, unified_path, provider_key, provider_field, \
         provider_schema_id, field_type, is_list, required, metadata) \
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
    )?;
    for mapping in schema.compiled.mappings.values() {
        stmt.execute(params![
            schema.id,
            mapping.unified_path,
            mapping.provider_key,
            mapping.provider_field,
            mapping.schema_id,
            mapping.field_type,
            mapping.is_list,
            mapping.required,
            serde_json::to_string(&mapping.metadata).map_err(json_error)?,
        ])?;
    }
    Ok(())
}

fn insert_history(conn: &Connection, entry: &SchemaChangeHistory) -> Result<(), StoreError> {
    conn.execute(
        "INSERT INTO schema_change_history (id, from_version, to_version, change_type, changes, \
         created_by, created_at) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        params![
            entry.id,
            entry.from_version,
            entry.to_version,
            entry.change_type.as_str(),
            serde_json::to_string(&entry.changes).map_err(json_error)?,
            entry.created_by,
            entry.created_at.to_rfc3339(),
        ],
    )?;
    Ok(())
}

#[async_trait]
impl SchemaStore for SqliteSchemaStore {
    async fn register_schema(&self, new: NewSchema) -> Result<UnifiedSchema, StoreError> {
        self.with_inner(move |inner| {
            let Inner {
                connection,
                compiled,
            } = inner;
            let tx = connection.transaction_with_behavior(TransactionBehavior::Immediate)?;

            let base = load_base(&tx, compiled)?;
            let prepared = prepare(new, base.as_ref())?;
            let version = prepared.schema.version.clone();

            let exists: Option<i64> = tx
                .query_row(
                    "SELECT 1 FROM unified_schemas WHERE version = ?1",
                    params![version],
                    |row| row.get(0),
                )
                .optional()?;
            if exists.is_some() {
                return Err(StoreError::DuplicateVersion(version));
            }

            insert_schema(&tx, &prepared.schema)?;
            insert_history(&tx, &prepared.history)?;
            tx.commit()?;

            compiled.insert(version.clone(), Arc::clone(&prepared.schema.compiled));
            info!(
                version = %version,
                change_type = %prepared.schema.change_type,
                mappings = prepared.schema.compiled.mappings.len(),
                "Registered schema"
            );
            Ok(prepared.schema)
        })
        .await
    }

    async fn activate_schema(
        &self,
        version: &str,
        allow_breaking: bool,
    ) -> Result<UnifiedSchema, StoreError> {
        let version = version.to_string();
        self.with_inner(move |inner| {
            let Inner {
                connection,
                compiled,
            } = inner;
            let tx = connection.transaction_with_behavior(TransactionBehavior::Immediate)?;

            let mut target = load_version(&tx, compiled, &version)?
                .ok_or_else(|| StoreError::NotFound(version.clone()))?;
            if target.status == SchemaStatus::Active {
                return Ok(target);
            }

            let active = load_active(&tx, compiled)?;
            ensure_activatable(active.as_ref(), &target, allow_breaking)?;

            tx.execute(
                "UPDATE unified_schemas SET status = 'deprecated' WHERE status = 'active'",
                params![],
            )?;
            tx.execute(
                "UPDATE unified_schemas SET status = 'active' WHERE version = ?1",
                params![version],
            )?;
            tx.commit()?;

            target.status = SchemaStatus::Active;
            info!(version = %version, "Activated schema");
            Ok(target)
        })
        .await
    }

    async fn deprecate_schema(&self, version: &str) -> Result<UnifiedSchema, StoreError> {
        let version = version.to_string();
        self.with_inner(move |inner| {
            let Inner {
                connection,
                compiled,
            } = inner;
            let tx = connection.transaction_with_behavior(TransactionBehavior::Immediate)?;

            let mut target = load_version(&tx, compiled, &version)?
                .ok_or_else(|| StoreError::NotFound(version.clone()))?;
            if target.status == SchemaStatus::Active {
                return Err(StoreError::ActiveSchema(version));
            }

            tx.execute(
                "UPDATE unified_schemas SET status = 'deprecated' WHERE version = ?1",
                params![version],
            )?;
            tx.commit()?;

            target.status = SchemaStatus::Deprecated;
            Ok(target)
        })
        .await
    }

    async fn get_active_schema(&self) -> Result<Option<UnifiedSchema>, StoreError> {
        self.with_inner(|inner| load_active(&inner.connection, &mut inner.compiled))
            .await
    }

    async fn get_schema(&self, version: &str) -> Result<Option<UnifiedSchema>, StoreError> {
        let version = version.to_string();
        self.with_inner(move |inner| load_version(&inner.connection, &mut inner.compiled, &version))
            .await
    }

    async fn list_schemas(&self) -> Result<Vec<UnifiedSchema>, StoreError> {
        self.with_inner(|inner| {
            let Inner {
                connection,
                compiled,
            } = inner;
            let sql = format!("SELECT {} FROM unified_schemas ORDER BY rowid", SCHEMA_COLUMNS);
            let rows = {
                let mut stmt = connection.prepare(&sql)?;
                let rows = stmt
                    .query_map(params![], schema_row)?
                    .collect::<Result<Vec<_>, _>>()?;
                rows
            };
            rows.into_iter()
                .map(|row| hydrate(connection, compiled, row))
                .collect()
        })
        .await
    }

    async fn change_history(
        &self,
        version: Option<&str>,
    ) -> Result<Vec<SchemaChangeHistory>, StoreError> {
        let version = version.map(str::to_string);
        self.with_inner(move |inner| {
            let mut stmt = inner.connection.prepare(
                "SELECT id, from_version, to_version, change_type, changes, created_by, created_at \
                 FROM schema_change_history WHERE ?1 IS NULL OR to_version = ?1 ORDER BY rowid",
            )?;
            let rows = stmt.query_map(params![version], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, Option<String>>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, String>(4)?,
                    row.get::<_, String>(5)?,
                    row.get::<_, String>(6)?,
                ))
            })?;

            let mut history = Vec::new();
            for row in rows {
                let (id, from_version, to_version, change_type, changes, created_by, created_at) =
                    row?;
                history.push(SchemaChangeHistory {
                    id,
                    from_version,
                    to_version,
                    change_type: parse_change_type(&change_type)?,
                    changes: serde_json::from_str(&changes).map_err(json_error)?,
                    created_by,
                    created_at: parse_timestamp(&created_at)?,
                });
            }
            Ok(history)
        })
        .await
    }

    async fn check_compatibility(
        &self,
        candidate_sdl: &str,
        base_version: Option<&str>,
    ) -> Result<CompatibilityReport, StoreError> {
        let candidate_sdl = candidate_sdl.to_string();
        let base_version = base_version.map(str::to_string);
        self.with_inner(move |inner| {
            let base = match &base_version {
                Some(version) => Some(
                    load_version(&inner.connection, &mut inner.compiled, version)?
                        .ok_or_else(|| StoreError::NotFound(version.clone()))?,
                ),
                None => load_active(&inner.connection, &mut inner.compiled)?,
            };
            compare(base.as_ref(), &candidate_sdl)
        })
        .await
    }

    async fn register_provider_schema(
        &self,
        new: NewProviderSchema,
    ) -> Result<ProviderSchema, StoreError> {
        validate_provider_schema(&new)?;
        self.with_inner(move |inner| {
            let tx = inner
                .connection
                .transaction_with_behavior(TransactionBehavior::Immediate)?;

            let exists: Option<i64> = tx
                .query_row(
                    "SELECT 1 FROM provider_schemas WHERE provider_key = ?1 AND version = ?2",
                    params![new.provider_key, new.version],
                    |row| row.get(0),
                )
                .optional()?;
            if exists.is_some() {
                return Err(StoreError::DuplicateVersion(format!(
                    "{}@{}",
                    new.provider_key, new.version
                )));
            }

            if new.activate {
                tx.execute(
                    "UPDATE provider_schemas SET active = 0 WHERE provider_key = ?1",
                    params![new.provider_key],
                )?;
            }

            let schema = ProviderSchema {
                provider_key: new.provider_key,
                version: new.version,
                sdl: new.sdl,
                active: new.activate,
                created_at: Utc::now(),
            };
            tx.execute(
                "INSERT INTO provider_schemas (provider_key, version, sdl, active, created_at) \
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    schema.provider_key,
                    schema.version,
                    schema.sdl,
                    schema.active,
                    schema.created_at.to_rfc3339(),
                ],
            )?;
            tx.commit()?;
            Ok(schema)
        })
        .await
    }

    async fn list_provider_schemas(
        &self,
        provider_key: Option<&str>,
    ) -> Result<Vec<ProviderSchema>, StoreError> {
        let provider_key = provider_key.map(str::to_string);
        self.with_inner(move |inner| {
            let mut stmt = inner.connection.prepare(
                "SELECT provider_key, version, sdl, active, created_at FROM provider_schemas \
                 WHERE ?1 IS NULL OR provider_key = ?1 ORDER BY rowid",
            )?;
            let rows = stmt.query_map(params![provider_key], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, bool>(3)?,
                    row.get::<_, String>(4)?,
                ))
            })?;

            let mut schemas = Vec::new();
            for row in rows {
                let (provider_key, version, sdl, active, created_at) = row?;
                schemas.push(ProviderSchema {
                    provider_key,
                    version,
                    sdl,
                    active,
                    created_at: parse_timestamp(&created_at)?,
                });
            }
            Ok(schemas)
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    const V1: &str = r#"
        type Query { person(nic: String!): Person }
        type Person {
            name: String @sourceInfo(providerKey: "rgdf", providerField: "getPersonInfo.fullName") @accessControl(type: "restricted")
        }
    "#;

    #[tokio::test]
    async fn persists_schemas_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("schemas.db");

        {
            let store = SqliteSchemaStore::open(&path).unwrap();
            store
                .register_schema(NewSchema::new(V1, "admin").with_version("1.0.0"))
                .await
                .unwrap();
            store.activate_schema("1.0.0", false).await.unwrap();
        }

        let reopened = SqliteSchemaStore::open(&path).unwrap();
        let active = reopened.get_active_schema().await.unwrap().unwrap();
        assert_eq!(active.version, "1.0.0");
        assert_eq!(active.status, SchemaStatus::Active);
        assert_eq!(active.checksum, sdl::checksum(V1));

        let mapping = active.compiled.mapping("person.name").unwrap();
        assert_eq!(mapping.provider_key, "rgdf");
        assert_eq!(mapping.metadata.access_control.as_deref(), Some("restricted"));
        assert!(active.compiled.field("Query", "person").is_some());

        let history = reopened.change_history(None).await.unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].to_version, "1.0.0");
        assert_eq!(history[0].changes.len(), 1);
    }

    #[tokio::test]
    async fn activation_deprecates_previous_and_checks_compatibility() {
        let store = SqliteSchemaStore::open_in_memory().unwrap();
        store.register_schema(NewSchema::new(V1, "admin")).await.unwrap();
        store.activate_schema("1.0.0", false).await.unwrap();

        let renamed = V1.replace("name: String", "fullName: String");
        let second = store.register_schema(NewSchema::new(renamed, "admin")).await.unwrap();
        assert_eq!(second.version, "2.0.0");

        assert!(matches!(
            store.activate_schema("2.0.0", false).await,
            Err(StoreError::BreakingChange { .. })
        ));
        store.activate_schema("2.0.0", true).await.unwrap();

        let statuses: Vec<_> = store
            .list_schemas()
            .await
            .unwrap()
            .into_iter()
            .map(|s| (s.version, s.status))
            .collect();
        assert_eq!(
            statuses,
            vec![
                ("1.0.0".to_string(), SchemaStatus::Deprecated),
                ("2.0.0".to_string(), SchemaStatus::Active)
            ]
        );
    }

    #[tokio::test]
    async fn unknown_and_duplicate_versions() {
        let store = SqliteSchemaStore::open_in_memory().unwrap();
        assert!(store.get_active_schema().await.unwrap().is_none());
        assert!(matches!(
            store.activate_schema("9.9.9", false).await,
            Err(StoreError::NotFound(_))
        ));

        store.register_schema(NewSchema::new(V1, "admin")).await.unwrap();
        assert!(matches!(
            store
                .register_schema(NewSchema::new(V1, "admin").with_version("1.0.0"))
                .await,
            Err(StoreError::DuplicateVersion(_))
        ));
    }

    #[test]
    fn partial_index_rejects_second_active_row() {
        let store = SqliteSchemaStore::open_in_memory().unwrap();
        let inner = store.inner.lock().unwrap();
        let insert = "INSERT INTO unified_schemas (id, version, sdl, status, checksum, change_type, \
                      created_by, created_at) VALUES (?1, ?2, '', 'active', '', 'major', 'x', '')";
        inner.connection.execute(insert, params!["a", "1.0.0"]).unwrap();
        assert!(inner.connection.execute(insert, params!["b", "2.0.0"]).is_err());
    }

    #[tokio::test]
    async fn provider_schemas_round_trip() {
        let store = SqliteSchemaStore::open_in_memory().unwrap();
        for version in ["1", "2"] {
            store
                .register_provider_schema(NewProviderSchema {
                    provider_key: "drp".into(),
                    version: version.into(),
                    sdl: "type Query { person(nic: String): String }".into(),
                    activate: true,
                })
                .await
                .unwrap();
        }
        let listed = store.list_provider_schemas(Some("drp")).await.unwrap();
        let flags: Vec<_> = listed.iter().map(|p| (p.version.as_str(), p.active)).collect();
        assert_eq!(flags, vec![("1", false), ("2", true)]);
        assert!(store.list_provider_schemas(Some("rgdf")).await.unwrap().is_empty());
    }
}
