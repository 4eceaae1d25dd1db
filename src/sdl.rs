//! Compiles a unified SDL document into the lookup tables used per request:
//! an index of object, input and enum types and the `@sourceInfo` field
//! mappings.

use graphql_parser::parse_schema;
use graphql_parser::schema::{Definition, Directive, Field, InputValue, Type, TypeDefinition};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, BTreeSet};

use crate::error::SdlError;
use crate::graphql_value_to_json;

pub const SOURCE_INFO_DIRECTIVE: &str = "sourceInfo";
const DEFAULT_QUERY_TYPE: &str = "Query";

/// Declared routing for one unified field.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FieldMapping {
    pub unified_path: String,
    pub provider_key: String,
    pub provider_field: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schema_id: Option<String>,
    pub field_type: String,
    pub is_list: bool,
    pub required: bool,
    #[serde(default)]
    pub metadata: DirectiveMetadata,
}

/// Access-control metadata declared next to `@sourceInfo`.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct DirectiveMetadata {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub access_control: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub owner: Option<String>,
    /// Arguments of every other directive on the field, keyed by directive name.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub directives: BTreeMap<String, Value>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct ArgumentDef {
    pub name: String,
    pub rendered_type: String,
    pub required: bool,
}

#[derive(Clone, Debug, PartialEq)]
pub struct FieldDef {
    pub name: String,
    /// Innermost named type, e.g. `VehicleInfo` for `[VehicleInfo!]!`.
    pub type_name: String,
    pub rendered_type: String,
    pub is_list: bool,
    pub required: bool,
    pub arguments: Vec<ArgumentDef>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct ObjectDef {
    pub name: String,
    pub fields: BTreeMap<String, FieldDef>,
}

/// Immutable, SDL-derived view of one unified schema version.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct CompiledSchema {
    pub query_type: String,
    pub types: BTreeMap<String, ObjectDef>,
    /// Input object types with their declared fields.
    pub inputs: BTreeMap<String, Vec<ArgumentDef>>,
    pub enums: BTreeSet<String>,
    pub mappings: BTreeMap<String, FieldMapping>,
}

impl CompiledSchema {
    pub fn object(&self, type_name: &str) -> Option<&ObjectDef> {
        self.types.get(type_name)
    }

    pub fn field(&self, type_name: &str, field_name: &str) -> Option<&FieldDef> {
        self.types.get(type_name)?.fields.get(field_name)
    }

    pub fn input(&self, type_name: &str) -> Option<&[ArgumentDef]> {
        self.inputs.get(type_name).map(Vec::as_slice)
    }

    pub fn is_enum(&self, type_name: &str) -> bool {
        self.enums.contains(type_name)
    }

    pub fn mapping(&self, unified_path: &str) -> Option<&FieldMapping> {
        self.mappings.get(unified_path)
    }

    pub fn provider_keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self
            .mappings
            .values()
            .map(|mapping| mapping.provider_key.clone())
            .collect();
        keys.sort();
        keys.dedup();
        keys
    }
}

/// Parses `sdl` and extracts its field mappings.
pub fn compile(sdl: &str) -> Result<CompiledSchema, SdlError> {
    walk(sdl)
}

/// Rebuilds the type index from `sdl` but trusts previously stored mappings.
pub fn compile_with_mappings(
    sdl: &str,
    mappings: Vec<FieldMapping>,
) -> Result<CompiledSchema, SdlError> {
    let compiled = walk(sdl)?;
    Ok(CompiledSchema {
        mappings: mappings
            .into_iter()
            .map(|mapping| (mapping.unified_path.clone(), mapping))
            .collect(),
        ..compiled
    })
}

/// Unified path of a field: the lower-cased type name, a dot, the field name.
pub fn unified_path(type_name: &str, field_name: &str) -> String {
    format!("{}.{}", type_prefix(type_name), field_name)
}

pub fn type_prefix(type_name: &str) -> String {
    type_name.to_lowercase()
}

/// Hex-encoded SHA-256 of the SDL text.
pub fn checksum(sdl: &str) -> String {
    hex::encode(Sha256::digest(sdl.as_bytes()))
}

pub fn render_type<'a>(ty: &Type<'a, String>) -> String {
    match ty {
        Type::NamedType(name) => name.clone(),
        Type::ListType(inner) => format!("[{}]", render_type(inner)),
        Type::NonNullType(inner) => format!("{}!", render_type(inner)),
    }
}

pub fn named_type<'a>(ty: &Type<'a, String>) -> String {
    match ty {
        Type::NamedType(name) => name.clone(),
        Type::ListType(inner) | Type::NonNullType(inner) => named_type(inner),
    }
}

pub fn is_list<'a>(ty: &Type<'a, String>) -> bool {
    match ty {
        Type::NamedType(_) => false,
        Type::ListType(_) => true,
        Type::NonNullType(inner) => is_list(inner),
    }
}

pub fn is_non_null<'a>(ty: &Type<'a, String>) -> bool {
    matches!(ty, Type::NonNullType(_))
}

fn walk(sdl: &str) -> Result<CompiledSchema, SdlError> {
    let document = parse_schema::<String>(sdl).map_err(|e| SdlError::Parse(e.to_string()))?;

    let mut query_type = DEFAULT_QUERY_TYPE.to_string();
    let mut types = BTreeMap::new();
    let mut inputs = BTreeMap::new();
    let mut enums = BTreeSet::new();
    let mut mappings = BTreeMap::new();
    // path prefix -> original type name, to catch `VehicleInfo` vs `Vehicleinfo`.
    let mut prefixes: BTreeMap<String, String> = BTreeMap::new();

    for definition in &document.definitions {
        match definition {
            Definition::SchemaDefinition(schema_def) => {
                if let Some(name) = &schema_def.query {
                    query_type = name.clone();
                }
            }
            Definition::TypeDefinition(TypeDefinition::Object(object)) => {
                let prefix = type_prefix(&object.name);
                if let Some(existing) = prefixes.insert(prefix.clone(), object.name.clone()) {
                    return Err(SdlError::AmbiguousTypeName {
                        first: existing,
                        second: object.name.clone(),
                        prefix,
                    });
                }

                let mut fields = BTreeMap::new();
                for field in &object.fields {
                    if let Some(mapping) = extract_mapping(&object.name, field)? {
                        mappings.insert(mapping.unified_path.clone(), mapping);
                    }
                    fields.insert(field.name.clone(), field_def(field));
                }

                types.insert(
                    object.name.clone(),
                    ObjectDef {
                        name: object.name.clone(),
                        fields,
                    },
                );
            }
            Definition::TypeDefinition(TypeDefinition::InputObject(input)) => {
                let fields = input.fields.iter().map(argument_def).collect();
                inputs.insert(input.name.clone(), fields);
            }
            Definition::TypeDefinition(TypeDefinition::Enum(enum_type)) => {
                enums.insert(enum_type.name.clone());
            }
            _ => {}
        }
    }

    if !types.contains_key(&query_type) {
        return Err(SdlError::MissingQueryRoot(query_type));
    }

    Ok(CompiledSchema {
        query_type,
        types,
        inputs,
        enums,
        mappings,
    })
}

fn field_def<'a>(field: &Field<'a, String>) -> FieldDef {
    FieldDef {
        name: field.name.clone(),
        type_name: named_type(&field.field_type),
        rendered_type: render_type(&field.field_type),
        is_list: is_list(&field.field_type),
        required: is_non_null(&field.field_type),
        arguments: field.arguments.iter().map(argument_def).collect(),
    }
}

fn argument_def<'a>(arg: &InputValue<'a, String>) -> ArgumentDef {
    ArgumentDef {
        name: arg.name.clone(),
        rendered_type: render_type(&arg.value_type),
        required: is_non_null(&arg.value_type) && arg.default_value.is_none(),
    }
}

fn extract_mapping<'a>(
    type_name: &str,
    field: &Field<'a, String>,
) -> Result<Option<FieldMapping>, SdlError> {
    let path = unified_path(type_name, &field.name);
    let source_infos: Vec<&Directive<'a, String>> = field
        .directives
        .iter()
        .filter(|directive| directive.name == SOURCE_INFO_DIRECTIVE)
        .collect();

    let source_info = match source_infos.as_slice() {
        [] => return Ok(None),
        [single] => *single,
        _ => return Err(SdlError::DuplicateSourceInfo(path)),
    };

    let arguments = directive_arguments(source_info);
    let provider_key = string_argument(&arguments, "providerKey").ok_or_else(|| {
        SdlError::IncompleteSourceInfo {
            path: path.clone(),
            argument: "providerKey",
        }
    })?;
    let provider_field = string_argument(&arguments, "providerField").ok_or_else(|| {
        SdlError::IncompleteSourceInfo {
            path: path.clone(),
            argument: "providerField",
        }
    })?;

    Ok(Some(FieldMapping {
        unified_path: path,
        provider_key,
        provider_field,
        schema_id: string_argument(&arguments, "schemaId"),
        field_type: render_type(&field.field_type),
        is_list: is_list(&field.field_type),
        required: is_non_null(&field.field_type),
        metadata: directive_metadata(&field.directives),
    }))
}

fn directive_metadata<'a>(directives: &[Directive<'a, String>]) -> DirectiveMetadata {
    let mut metadata = DirectiveMetadata::default();

    for directive in directives {
        if directive.name == SOURCE_INFO_DIRECTIVE {
            continue;
        }
        let arguments = directive_arguments(directive);
        match directive.name.as_str() {
            "accessControl" => metadata.access_control = string_argument(&arguments, "type"),
            "source" => metadata.source = string_argument(&arguments, "value"),
            "owner" => metadata.owner = string_argument(&arguments, "value"),
            _ => {}
        }
        metadata
            .directives
            .insert(directive.name.clone(), Value::Object(arguments));
    }

    metadata
}

fn directive_arguments<'a>(directive: &Directive<'a, String>) -> Map<String, Value> {
    let no_variables = Map::new();
    directive
        .arguments
        .iter()
        .map(|(name, value)| (name.clone(), graphql_value_to_json(value, &no_variables)))
        .collect()
}

fn string_argument(arguments: &Map<String, Value>, name: &str) -> Option<String> {
    arguments
        .get(name)
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(str::to_string)
}
