use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;

use crate::path_segments;

/// Arguments the consumer passed, keyed by query field path (field names,
/// not aliases), e.g. `person` -> `{"nic": "199012345678"}`.
pub type ConsumerArguments = BTreeMap<String, Map<String, Value>>;

/// Copies a consumer argument into a provider argument.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArgumentMapping {
    pub provider_key: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schema_id: Option<String>,
    /// Consumer side, e.g. `person.nic`.
    pub source_path: String,
    /// Provider side, e.g. `getPersonInfo.nic`.
    pub target_path: String,
}

#[derive(Clone, Debug, Default)]
pub struct ArgumentTranslator {
    mappings: Vec<ArgumentMapping>,
}

impl ArgumentTranslator {
    pub fn new(mappings: Vec<ArgumentMapping>) -> Self {
        ArgumentTranslator { mappings }
    }

    pub fn mappings(&self) -> &[ArgumentMapping] {
        &self.mappings
    }

    /// Builds the argument tree for one provider. Arguments without a
    /// mapping for `provider_key` are dropped.
    pub fn translate(&self, provider_key: &str, consumer_args: &ConsumerArguments) -> Map<String, Value> {
        let mut translated = Map::new();
        for mapping in self
            .mappings
            .iter()
            .filter(|mapping| mapping.provider_key == provider_key)
        {
            if let Some(value) = lookup(consumer_args, &mapping.source_path) {
                insert_at(&mut translated, &mapping.target_path, value.clone());
            }
        }
        translated
    }

    /// The data owner is identified by the first mapped argument, in
    /// configuration order, that carries a string.
    pub fn owner_id(&self, consumer_args: &ConsumerArguments) -> Option<String> {
        self.mappings.iter().find_map(|mapping| {
            lookup(consumer_args, &mapping.source_path)
                .and_then(Value::as_str)
                .filter(|owner| !owner.is_empty())
                .map(str::to_string)
        })
    }
}

/// Resolves `source_path` against the consumer arguments. The longest field
/// path that prefixes it picks the argument object; the rest walks into it.
pub fn lookup<'a>(consumer_args: &'a ConsumerArguments, source_path: &str) -> Option<&'a Value> {
    let segments = path_segments(source_path);

    (1..segments.len()).rev().find_map(|split| {
        let field_path = segments[..split].join(".");
        let args = consumer_args.get(&field_path)?;
        let (first, rest) = segments[split..].split_first()?;
        rest.iter()
            .try_fold(args.get(*first)?, |value, segment| value.get(*segment))
    })
}

fn insert_at(target: &mut Map<String, Value>, path: &str, value: Value) {
    let segments = path_segments(path);
    let Some((last, parents)) = segments.split_last() else {
        return;
    };

    let mut current = target;
    for segment in parents {
        let entry = current
            .entry(segment.to_string())
            .or_insert_with(|| Value::Object(Map::new()));
        if !entry.is_object() {
            *entry = Value::Object(Map::new());
        }
        let Value::Object(next) = entry else {
            return;
        };
        current = next;
    }
    current.insert(last.to_string(), value);
}
