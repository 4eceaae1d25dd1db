use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{info, warn};

pub use crate::compatibility::ChangeType;
use crate::compatibility::{self, CompatibilityReport};
use crate::error::{SdlError, StoreError};
use crate::sdl::{self, CompiledSchema};

const FIRST_VERSION: &str = "1.0.0";

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SchemaStatus {
    Draft,
    Active,
    Deprecated,
}

impl SchemaStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SchemaStatus::Draft => "draft",
            SchemaStatus::Active => "active",
            SchemaStatus::Deprecated => "deprecated",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "draft" => Some(SchemaStatus::Draft),
            "active" => Some(SchemaStatus::Active),
            "deprecated" => Some(SchemaStatus::Deprecated),
            _ => None,
        }
    }
}

impl fmt::Display for SchemaStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One registered version of the unified schema. Everything but `status` is
/// immutable once registered.
#[derive(Clone, Debug, Serialize)]
pub struct UnifiedSchema {
    pub id: String,
    pub version: String,
    pub sdl: String,
    pub status: SchemaStatus,
    pub checksum: String,
    pub change_type: ChangeType,
    pub previous_version: Option<String>,
    pub created_by: String,
    pub created_at: DateTime<Utc>,
    #[serde(skip)]
    pub compiled: Arc<CompiledSchema>,
}

#[derive(Clone, Debug, Default, Deserialize)]
pub struct NewSchema {
    pub sdl: String,
    #[serde(default)]
    pub created_by: String,
    /// Derived from the diff against the base version when omitted.
    #[serde(default)]
    pub change_type: Option<ChangeType>,
    /// Derived by bumping the base version when omitted.
    #[serde(default)]
    pub version: Option<String>,
}

impl NewSchema {
    pub fn new(sdl: impl Into<String>, created_by: impl Into<String>) -> Self {
        NewSchema {
            sdl: sdl.into(),
            created_by: created_by.into(),
            change_type: None,
            version: None,
        }
    }

    pub fn with_version(mut self, version: impl Into<String>) -> Self {
        self.version = Some(version.into());
        self
    }

    pub fn with_change_type(mut self, change_type: ChangeType) -> Self {
        self.change_type = Some(change_type);
        self
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FieldChangeKind {
    Added,
    Removed,
    Renamed,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldChange {
    pub kind: FieldChangeKind,
    pub path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub previous_path: Option<String>,
    pub provider_key: String,
    pub provider_field: String,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SchemaChangeHistory {
    pub id: String,
    pub from_version: Option<String>,
    pub to_version: String,
    pub change_type: ChangeType,
    pub changes: Vec<FieldChange>,
    pub created_by: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ProviderSchema {
    pub provider_key: String,
    pub version: String,
    pub sdl: String,
    pub active: bool,
    pub created_at: DateTime<Utc>,
}

#[derive(Clone, Debug, Deserialize)]
pub struct NewProviderSchema {
    pub provider_key: String,
    pub version: String,
    pub sdl: String,
    #[serde(default = "default_true")]
    pub activate: bool,
}

fn default_true() -> bool {
    true
}

/// Versioned storage for unified and provider schemas.
///
/// Every implementation guarantees that at most one unified schema is
/// active, including under concurrent `activate_schema` calls.
#[async_trait]
pub trait SchemaStore: Send + Sync {
    async fn register_schema(&self, new: NewSchema) -> Result<UnifiedSchema, StoreError>;

    /// Makes `version` the only active schema. The previously active version
    /// becomes deprecated. Breaking changes are refused unless `allow_breaking`.
    async fn activate_schema(
        &self,
        version: &str,
        allow_breaking: bool,
    ) -> Result<UnifiedSchema, StoreError>;

    async fn deprecate_schema(&self, version: &str) -> Result<UnifiedSchema, StoreError>;

    /// `Ok(None)` when no schema has ever been activated.
    async fn get_active_schema(&self) -> Result<Option<UnifiedSchema>, StoreError>;

    async fn get_schema(&self, version: &str) -> Result<Option<UnifiedSchema>, StoreError>;

    /// Oldest first.
    async fn list_schemas(&self) -> Result<Vec<UnifiedSchema>, StoreError>;

    async fn change_history(
        &self,
        version: Option<&str>,
    ) -> Result<Vec<SchemaChangeHistory>, StoreError>;

    /// Compares `candidate_sdl` with `base_version`, or with the active schema
    /// when no base is named.
    async fn check_compatibility(
        &self,
        candidate_sdl: &str,
        base_version: Option<&str>,
    ) -> Result<CompatibilityReport, StoreError>;

    async fn register_provider_schema(
        &self,
        new: NewProviderSchema,
    ) -> Result<ProviderSchema, StoreError>;

    async fn list_provider_schemas(
        &self,
        provider_key: Option<&str>,
    ) -> Result<Vec<ProviderSchema>, StoreError>;
}

/// A schema version ready to be written, plus its history row.
pub(crate) struct Prepared {
    pub schema: UnifiedSchema,
    pub history: SchemaChangeHistory,
}

/// Compiles and versions `new` against `base` (the active version, else the
/// latest registered). Callers check for duplicates and persist.
pub(crate) fn prepare(new: NewSchema, base: Option<&UnifiedSchema>) -> Result<Prepared, StoreError> {
    let compiled = Arc::new(sdl::compile(&new.sdl)?);

    let change_type = match new.change_type {
        Some(change_type) => change_type,
        None => match base {
            Some(base) => compatibility::check(&base.sdl, &new.sdl)?.level,
            None => ChangeType::Major,
        },
    };

    let version = match new.version {
        Some(version) => {
            let version = version.trim().to_string();
            parse_version(&version)?;
            version
        }
        None => next_version(base.map(|b| b.version.as_str()), change_type)?,
    };

    let created_by = if new.created_by.trim().is_empty() {
        "system".to_string()
    } else {
        new.created_by
    };
    let created_at = Utc::now();

    let history = SchemaChangeHistory {
        id: uuid::Uuid::new_v4().to_string(),
        from_version: base.map(|b| b.version.clone()),
        to_version: version.clone(),
        change_type,
        changes: diff_mappings(base.map(|b| b.compiled.as_ref()), &compiled),
        created_by: created_by.clone(),
        created_at,
    };

    let schema = UnifiedSchema {
        id: uuid::Uuid::new_v4().to_string(),
        checksum: sdl::checksum(&new.sdl),
        version,
        sdl: new.sdl,
        status: SchemaStatus::Draft,
        change_type,
        previous_version: base.map(|b| b.version.clone()),
        created_by,
        created_at,
        compiled,
    };

    Ok(Prepared { schema, history })
}

/// Refuses an activation that would break consumers of `active`.
pub(crate) fn ensure_activatable(
    active: Option<&UnifiedSchema>,
    target: &UnifiedSchema,
    allow_breaking: bool,
) -> Result<(), StoreError> {
    let Some(active) = active else {
        return Ok(());
    };

    let report = compatibility::check(&active.sdl, &target.sdl)?;
    if report.compatible {
        return Ok(());
    }

    let changes = report.breaking_changes();
    if allow_breaking {
        warn!(
            from = %active.version,
            version = %target.version,
            breaking = changes.len(),
            "Activating schema with breaking changes"
        );
        return Ok(());
    }

    Err(StoreError::BreakingChange {
        version: target.version.clone(),
        changes,
    })
}

pub(crate) fn validate_provider_schema(new: &NewProviderSchema) -> Result<(), StoreError> {
    if new.provider_key.trim().is_empty() {
        return Err(StoreError::Backend("provider_key must not be empty".to_string()));
    }
    graphql_parser::parse_schema::<String>(&new.sdl)
        .map_err(|e| SdlError::Parse(e.to_string()))?;
    Ok(())
}

pub(crate) fn parse_version(version: &str) -> Result<(u64, u64, u64), StoreError> {
    let invalid = || StoreError::InvalidVersion(version.to_string());
    let parts: Vec<&str> = version.split('.').collect();
    let [major, minor, patch] = parts.as_slice() else {
        return Err(invalid());
    };
    let number = |part: &str| part.parse::<u64>().map_err(|_| invalid());
    Ok((number(*major)?, number(*minor)?, number(*patch)?))
}

pub(crate) fn next_version(base: Option<&str>, change_type: ChangeType) -> Result<String, StoreError> {
    let Some(base) = base else {
        return Ok(FIRST_VERSION.to_string());
    };
    let (major, minor, patch) = parse_version(base)?;
    let next = match change_type {
        ChangeType::Major => (major + 1, 0, 0),
        ChangeType::Minor => (major, minor + 1, 0),
        ChangeType::Patch => (major, minor, patch + 1),
    };
    Ok(format!("{}.{}.{}", next.0, next.1, next.2))
}

/// Field-level changes between two mapping tables. A removal and an addition
/// routed to the same provider field are reported as one rename.
pub(crate) fn diff_mappings(from: Option<&CompiledSchema>, to: &CompiledSchema) -> Vec<FieldChange> {
    let empty = CompiledSchema::default();
    let from = from.unwrap_or(&empty);

    let removed: Vec<_> = from
        .mappings
        .values()
        .filter(|m| !to.mappings.contains_key(&m.unified_path))
        .collect();
    let added: Vec<_> = to
        .mappings
        .values()
        .filter(|m| !from.mappings.contains_key(&m.unified_path))
        .collect();

    let mut changes = Vec::new();
    let mut renamed_to = BTreeSet::new();

    for old in removed {
        let rename = added.iter().find(|new| {
            !renamed_to.contains(&new.unified_path)
                && new.provider_key == old.provider_key
                && new.provider_field == old.provider_field
        });
        match rename {
            Some(new) => {
                renamed_to.insert(new.unified_path.clone());
                changes.push(FieldChange {
                    kind: FieldChangeKind::Renamed,
                    path: new.unified_path.clone(),
                    previous_path: Some(old.unified_path.clone()),
                    provider_key: new.provider_key.clone(),
                    provider_field: new.provider_field.clone(),
                });
            }
            None => changes.push(FieldChange {
                kind: FieldChangeKind::Removed,
                path: old.unified_path.clone(),
                previous_path: None,
                provider_key: old.provider_key.clone(),
                provider_field: old.provider_field.clone(),
            }),
        }
    }

    for new in added {
        if renamed_to.contains(&new.unified_path) {
            continue;
        }
        changes.push(FieldChange {
            kind: FieldChangeKind::Added,
            path: new.unified_path.clone(),
            previous_path: None,
            provider_key: new.provider_key.clone(),
            provider_field: new.provider_field.clone(),
        });
    }

    changes.sort_by(|a, b| a.path.cmp(&b.path).then(a.kind.cmp(&b.kind)));
    changes
}

#[derive(Default)]
struct State {
    // Registration order.
    schemas: Vec<UnifiedSchema>,
    history: Vec<SchemaChangeHistory>,
    providers: Vec<ProviderSchema>,
}

impl State {
    fn active(&self) -> Option<&UnifiedSchema> {
        self.schemas
            .iter()
            .find(|schema| schema.status == SchemaStatus::Active)
    }

    fn base(&self) -> Option<&UnifiedSchema> {
        self.active().or_else(|| self.schemas.last())
    }

    fn position(&self, version: &str) -> Option<usize> {
        self.schemas.iter().position(|schema| schema.version == version)
    }
}

/// Process-local store. A single lock over all state; writers hold it for
/// the whole operation, so activations are serialized.
#[derive(Default)]
pub struct InMemorySchemaStore {
    state: RwLock<State>,
}

impl InMemorySchemaStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SchemaStore for InMemorySchemaStore {
    async fn register_schema(&self, new: NewSchema) -> Result<UnifiedSchema, StoreError> {
        let mut state = self.state.write().await;
        let prepared = prepare(new, state.base())?;

        if state.position(&prepared.schema.version).is_some() {
            return Err(StoreError::DuplicateVersion(prepared.schema.version));
        }

        info!(
            version = %prepared.schema.version,
            change_type = %prepared.schema.change_type,
            mappings = prepared.schema.compiled.mappings.len(),
            "Registered schema"
        );
        state.history.push(prepared.history);
        state.schemas.push(prepared.schema.clone());
        Ok(prepared.schema)
    }

    async fn activate_schema(
        &self,
        version: &str,
        allow_breaking: bool,
    ) -> Result<UnifiedSchema, StoreError> {
        let mut state = self.state.write().await;
        let target = state
            .position(version)
            .ok_or_else(|| StoreError::NotFound(version.to_string()))?;

        if state.schemas[target].status == SchemaStatus::Active {
            return Ok(state.schemas[target].clone());
        }

        ensure_activatable(state.active(), &state.schemas[target], allow_breaking)?;

        for schema in state.schemas.iter_mut() {
            if schema.status == SchemaStatus::Active {
                schema.status = SchemaStatus::Deprecated;
            }
        }
        state.schemas[target].status = SchemaStatus::Active;

        info!(version = %version, "Activated schema");
        Ok(state.schemas[target].clone())
    }

    async fn deprecate_schema(&self, version: &str) -> Result<UnifiedSchema, StoreError> {
        let mut state = self.state.write().await;
        let target = state
            .position(version)
            .ok_or_else(|| StoreError::NotFound(version.to_string()))?;

        if state.schemas[target].status == SchemaStatus::Active {
            return Err(StoreError::ActiveSchema(version.to_string()));
        }
        state.schemas[target].status = SchemaStatus::Deprecated;
        Ok(state.schemas[target].clone())
    }

    async fn get_active_schema(&self) -> Result<Option<UnifiedSchema>, StoreError> {
        Ok(self.state.read().await.active().cloned())
    }

    async fn get_schema(&self, version: &str) -> Result<Option<UnifiedSchema>, StoreError> {
        let state = self.state.read().await;
        Ok(state.position(version).map(|i| state.schemas[i].clone()))
    }

    async fn list_schemas(&self) -> Result<Vec<UnifiedSchema>, StoreError> {
        Ok(self.state.read().await.schemas.clone())
    }

    async fn change_history(
        &self,
        version: Option<&str>,
    ) -> Result<Vec<SchemaChangeHistory>, StoreError> {
        let state = self.state.read().await;
        Ok(state
            .history
            .iter()
            .filter(|entry| version.is_none_or(|v| entry.to_version == v))
            .cloned()
            .collect())
    }

    async fn check_compatibility(
        &self,
        candidate_sdl: &str,
        base_version: Option<&str>,
    ) -> Result<CompatibilityReport, StoreError> {
        let state = self.state.read().await;
        let base = match base_version {
            Some(version) => Some(
                state
                    .position(version)
                    .map(|i| &state.schemas[i])
                    .ok_or_else(|| StoreError::NotFound(version.to_string()))?,
            ),
            None => state.active(),
        };
        compare(base, candidate_sdl)
    }

    async fn register_provider_schema(
        &self,
        new: NewProviderSchema,
    ) -> Result<ProviderSchema, StoreError> {
        validate_provider_schema(&new)?;
        let mut state = self.state.write().await;

        if state
            .providers
            .iter()
            .any(|p| p.provider_key == new.provider_key && p.version == new.version)
        {
            return Err(StoreError::DuplicateVersion(format!(
                "{}@{}",
                new.provider_key, new.version
            )));
        }

        if new.activate {
            for existing in state
                .providers
                .iter_mut()
                .filter(|p| p.provider_key == new.provider_key)
            {
                existing.active = false;
            }
        }

        let schema = ProviderSchema {
            provider_key: new.provider_key,
            version: new.version,
            sdl: new.sdl,
            active: new.activate,
            created_at: Utc::now(),
        };
        state.providers.push(schema.clone());
        Ok(schema)
    }

    async fn list_provider_schemas(
        &self,
        provider_key: Option<&str>,
    ) -> Result<Vec<ProviderSchema>, StoreError> {
        let state = self.state.read().await;
        Ok(state
            .providers
            .iter()
            .filter(|p| provider_key.is_none_or(|key| p.provider_key == key))
            .cloned()
            .collect())
    }
}

/// Compatibility of `candidate_sdl` against `base`; everything is an
/// addition when there is no base.
pub(crate) fn compare(
    base: Option<&UnifiedSchema>,
    candidate_sdl: &str,
) -> Result<CompatibilityReport, StoreError> {
    let base_sdl = base.map(|b| b.sdl.as_str()).unwrap_or("");
    let mut report = compatibility::check(base_sdl, candidate_sdl)?;
    report.base_version = base.map(|b| b.version.clone());
    Ok(report)
}
