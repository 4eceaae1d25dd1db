use serde::Serialize;
use serde_json::{Map, Value};
use std::collections::BTreeMap;

use crate::GraphQLError;
use crate::field_resolver::{FieldRole, ProviderLevelFieldRecord};
use crate::path_segments;
use crate::query_executor::ProviderResult;

/// The consumer-facing answer of a federated query.
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct FederatedResponse {
    pub data: Map<String, Value>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub errors: Vec<GraphQLError>,
}

impl FederatedResponse {
    pub fn is_success(&self) -> bool {
        self.errors.is_empty()
    }

    /// Audit status of the request.
    pub fn status(&self) -> &'static str {
        if self.is_success() { "SUCCESS" } else { "FAILURE" }
    }
}

/// Projects provider data back onto the consumer's response shape. A failed
/// provider yields `null` plus one error at each path it was meant to fill.
pub fn merge(
    results: &BTreeMap<String, ProviderResult>,
    records: &[ProviderLevelFieldRecord],
) -> FederatedResponse {
    let mut response = FederatedResponse::default();

    for record in records {
        let Some(result) = results.get(&record.provider_key) else {
            continue;
        };

        match (&result.outcome, &record.role) {
            // Filled in with their container.
            (_, FieldRole::Element { .. }) => {}
            (Ok(data), FieldRole::Leaf) => {
                let value = project(data, &path_segments(&record.provider_field));
                set_path(&mut response.data, &record.response_path, value);
            }
            (Ok(data), FieldRole::ListContainer) => {
                let value = project_container(data, record, records);
                set_path(&mut response.data, &record.response_path, value);
            }
            (Err(error), _) => {
                set_path(&mut response.data, &record.response_path, Value::Null);
                response.errors.push(
                    GraphQLError::new(format!("Provider {} failed: {}", error.provider_key, error.cause))
                        .at_path(&record.response_path)
                        .with_code(error.cause.code())
                        .with_extension("providerKey", Value::String(error.provider_key.clone())),
                );
            }
        }
    }

    response
}

/// Walks `segments` into a provider value. Lists met along the way are mapped
/// element by element; anything missing is `null`.
fn project(value: &Value, segments: &[&str]) -> Value {
    let Some((first, rest)) = segments.split_first() else {
        return value.clone();
    };
    match value {
        Value::Object(fields) => fields
            .get(*first)
            .map(|child| project(child, rest))
            .unwrap_or(Value::Null),
        Value::Array(items) => Value::Array(items.iter().map(|item| project(item, segments)).collect()),
        _ => Value::Null,
    }
}

fn project_container(
    data: &Value,
    container: &ProviderLevelFieldRecord,
    records: &[ProviderLevelFieldRecord],
) -> Value {
    let elements: Vec<(&[String], Vec<&str>)> = records
        .iter()
        .filter_map(|record| match &record.role {
            FieldRole::Element {
                container: path,
                relative_field,
            } if *path == container.response_path => record
                .response_path
                .get(path.len()..)
                .map(|relative_path| (relative_path, path_segments(relative_field))),
            _ => None,
        })
        .collect();

    match project(data, &path_segments(&container.provider_field)) {
        Value::Array(items) => Value::Array(
            items
                .iter()
                .map(|item| {
                    if item.is_null() {
                        return Value::Null;
                    }
                    let mut element = Map::new();
                    for (response_path, relative) in &elements {
                        set_path(&mut element, response_path, project(item, relative));
                    }
                    Value::Object(element)
                })
                .collect(),
        ),
        _ => Value::Null,
    }
}

fn set_path(target: &mut Map<String, Value>, path: &[String], value: Value) {
    let Some((last, parents)) = path.split_last() else {
        return;
    };
    let mut current = target;
    for segment in parents {
        let entry = current
            .entry(segment.clone())
            .or_insert_with(|| Value::Object(Map::new()));
        // A parent already nulled by a failure stays null.
        let Value::Object(next) = entry else {
            return;
        };
        current = next;
    }
    current.insert(last.clone(), value);
}
