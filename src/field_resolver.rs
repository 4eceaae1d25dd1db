use serde::Serialize;
use std::collections::BTreeMap;

use crate::path_segments;
use crate::sdl::{CompiledSchema, DirectiveMetadata, FieldMapping};

/// One field the consumer selected.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RequestedField {
    pub unified_path: String,
    /// Where the value lands in the response, aliases applied.
    pub response_path: Vec<String>,
    /// Response path of the enclosing list container, if any.
    pub container: Option<Vec<String>>,
    /// A mapped list field whose elements carry a sub-selection.
    pub list_container: bool,
}

impl From<&str> for RequestedField {
    fn from(unified_path: &str) -> Self {
        RequestedField {
            unified_path: unified_path.to_string(),
            response_path: path_segments(unified_path)
                .into_iter()
                .map(str::to_string)
                .collect(),
            container: None,
            list_container: false,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FieldRole {
    Leaf,
    ListContainer,
    /// Projected out of each element of the container at `container`.
    Element {
        container: Vec<String>,
        relative_field: String,
    },
}

/// Routing for one requested field: which provider owns it, and where.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct ProviderLevelFieldRecord {
    pub provider_schema_id: Option<String>,
    pub provider_key: String,
    pub provider_field: String,
    pub unified_path: String,
    pub response_path: Vec<String>,
    pub role: FieldRole,
    pub metadata: DirectiveMetadata,
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct Resolution {
    pub records: Vec<ProviderLevelFieldRecord>,
    pub unmapped: Vec<String>,
}

impl Resolution {
    pub fn is_complete(&self) -> bool {
        self.unmapped.is_empty()
    }

    /// Unified paths sent to the policy decision point, deduplicated in
    /// request order.
    pub fn field_paths(&self) -> Vec<String> {
        let mut paths: Vec<String> = Vec::new();
        for record in &self.records {
            if !paths.contains(&record.unified_path) {
                paths.push(record.unified_path.clone());
            }
        }
        paths
    }

    pub fn provider_keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.records.iter().map(|r| r.provider_key.clone()).collect();
        keys.sort();
        keys.dedup();
        keys
    }
}

/// Looks requested fields up in the compiled mapping table.
#[derive(Clone, Copy, Debug, Default)]
pub struct FieldResolver;

impl FieldResolver {
    pub fn new() -> Self {
        FieldResolver
    }

    /// Every requested field ends up either in `records` or in `unmapped`.
    pub fn resolve(&self, schema: &CompiledSchema, requested: &[RequestedField]) -> Resolution {
        let mut resolution = Resolution::default();
        // Container response path -> its mapping.
        let mut containers: BTreeMap<&[String], &FieldMapping> = BTreeMap::new();

        for field in requested.iter().filter(|f| f.list_container) {
            if let Some(mapping) = schema.mapping(&field.unified_path) {
                containers.insert(field.response_path.as_slice(), mapping);
            }
        }

        for field in requested {
            let Some(mapping) = schema.mapping(&field.unified_path) else {
                push_unmapped(&mut resolution.unmapped, &field.unified_path);
                continue;
            };

            let role = match &field.container {
                None if field.list_container => FieldRole::ListContainer,
                None => FieldRole::Leaf,
                Some(container_path) => {
                    let element = containers
                        .get(container_path.as_slice())
                        .and_then(|container| element_field(container, mapping));
                    match element {
                        Some(relative_field) => FieldRole::Element {
                            container: container_path.clone(),
                            relative_field,
                        },
                        // Cannot be projected per element.
                        None => {
                            push_unmapped(&mut resolution.unmapped, &field.unified_path);
                            continue;
                        }
                    }
                }
            };

            resolution.records.push(ProviderLevelFieldRecord {
                provider_schema_id: mapping.schema_id.clone(),
                provider_key: mapping.provider_key.clone(),
                provider_field: mapping.provider_field.clone(),
                unified_path: field.unified_path.clone(),
                response_path: field.response_path.clone(),
                role,
                metadata: mapping.metadata.clone(),
            });
        }

        resolution
    }
}

fn push_unmapped(unmapped: &mut Vec<String>, path: &str) {
    if !unmapped.iter().any(|p| p == path) {
        unmapped.push(path.to_string());
    }
}

/// Provider path of `child` relative to the container it sits in. Both must
/// come from the same provider, and the child must live under the container.
fn element_field(container: &FieldMapping, child: &FieldMapping) -> Option<String> {
    if container.provider_key != child.provider_key {
        return None;
    }
    child
        .provider_field
        .strip_prefix(container.provider_field.as_str())
        .and_then(|rest| rest.strip_prefix('.'))
        .filter(|rest| !rest.is_empty())
        .map(str::to_string)
}
