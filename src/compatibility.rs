//! Field-level diff between two SDL documents, classified by the semantic
//! version bump each change needs.

use graphql_parser::parse_schema;
use graphql_parser::schema::{Definition, Directive, Field, InputValue, Type, TypeDefinition};
use serde::{Deserialize, Serialize};
use serde_json::Map;
use std::collections::BTreeMap;
use std::fmt;

use crate::error::SdlError;
use crate::graphql_value_to_json;
use crate::sdl::{is_list, is_non_null, named_type, render_type};

/// Size of a schema change. Ordered so the maximum of a set is its overall level.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeType {
    #[default]
    Patch,
    Minor,
    Major,
}

impl ChangeType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChangeType::Patch => "patch",
            ChangeType::Minor => "minor",
            ChangeType::Major => "major",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "patch" => Some(ChangeType::Patch),
            "minor" => Some(ChangeType::Minor),
            "major" => Some(ChangeType::Major),
            _ => None,
        }
    }
}

impl fmt::Display for ChangeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ChangeKind {
    TypeAdded,
    TypeRemoved,
    TypeKindChanged,
    FieldAdded,
    RequiredFieldAdded,
    FieldRemoved,
    FieldTypeChanged,
    FieldBecameNullable,
    FieldBecameNonNull,
    FieldBecameRequired,
    FieldBecameOptional,
    ArgumentAdded,
    RequiredArgumentAdded,
    ArgumentRemoved,
    ArgumentTypeChanged,
    ArgumentBecameRequired,
    ArgumentBecameOptional,
    EnumValueAdded,
    EnumValueRemoved,
    DirectivesChanged,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchemaDiff {
    pub path: String,
    pub kind: ChangeKind,
    pub level: ChangeType,
    pub description: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompatibilityReport {
    pub base_version: Option<String>,
    pub compatible: bool,
    pub level: ChangeType,
    pub changes: Vec<SchemaDiff>,
}

impl CompatibilityReport {
    pub fn breaking_changes(&self) -> Vec<String> {
        self.changes
            .iter()
            .filter(|change| change.level == ChangeType::Major)
            .map(|change| change.description.clone())
            .collect()
    }
}

/// Compares `candidate_sdl` against `base_sdl`. Pure and deterministic.
pub fn check(base_sdl: &str, candidate_sdl: &str) -> Result<CompatibilityReport, SdlError> {
    let base = model(base_sdl)?;
    let candidate = model(candidate_sdl)?;

    let mut diff = Differ::default();
    diff.types(&base, &candidate);

    let mut changes = diff.changes;
    changes.sort_by(|a, b| a.path.cmp(&b.path).then(a.kind.cmp(&b.kind)));

    let level = changes
        .iter()
        .map(|change| change.level)
        .max()
        .unwrap_or_default();

    Ok(CompatibilityReport {
        base_version: None,
        compatible: level != ChangeType::Major,
        level,
        changes,
    })
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Kind {
    Object,
    Interface,
    Input,
    Enum,
    Scalar,
    Union,
}

impl Kind {
    fn is_input(self) -> bool {
        self == Kind::Input
    }
}

#[derive(Debug)]
struct TypeModel {
    kind: Kind,
    fields: BTreeMap<String, FieldModel>,
    enum_values: Vec<String>,
}

#[derive(Debug)]
struct FieldModel {
    shape: TypeShape,
    has_default: bool,
    arguments: BTreeMap<String, FieldModel>,
    directives: Vec<String>,
}

#[derive(Debug, PartialEq, Eq)]
struct TypeShape {
    rendered: String,
    named: String,
    list: bool,
    non_null: bool,
}

impl TypeShape {
    fn of<'a>(ty: &Type<'a, String>) -> Self {
        TypeShape {
            rendered: render_type(ty),
            named: named_type(ty),
            list: is_list(ty),
            non_null: is_non_null(ty),
        }
    }

    fn same_base(&self, other: &TypeShape) -> bool {
        self.named == other.named && self.list == other.list
    }
}

fn model(sdl: &str) -> Result<BTreeMap<String, TypeModel>, SdlError> {
    let document = parse_schema::<String>(sdl).map_err(|e| SdlError::Parse(e.to_string()))?;
    let mut types = BTreeMap::new();

    for definition in &document.definitions {
        let Definition::TypeDefinition(type_def) = definition else {
            continue;
        };
        let (name, model) = match type_def {
            TypeDefinition::Object(object) => (
                object.name.clone(),
                TypeModel {
                    kind: Kind::Object,
                    fields: object.fields.iter().map(output_field).collect(),
                    enum_values: Vec::new(),
                },
            ),
            TypeDefinition::Interface(iface) => (
                iface.name.clone(),
                TypeModel {
                    kind: Kind::Interface,
                    fields: iface.fields.iter().map(output_field).collect(),
                    enum_values: Vec::new(),
                },
            ),
            TypeDefinition::InputObject(input) => (
                input.name.clone(),
                TypeModel {
                    kind: Kind::Input,
                    fields: input.fields.iter().map(input_value).collect(),
                    enum_values: Vec::new(),
                },
            ),
            TypeDefinition::Enum(enum_type) => (
                enum_type.name.clone(),
                TypeModel {
                    kind: Kind::Enum,
                    fields: BTreeMap::new(),
                    enum_values: enum_type.values.iter().map(|v| v.name.clone()).collect(),
                },
            ),
            TypeDefinition::Scalar(scalar) => (
                scalar.name.clone(),
                TypeModel {
                    kind: Kind::Scalar,
                    fields: BTreeMap::new(),
                    enum_values: Vec::new(),
                },
            ),
            TypeDefinition::Union(union_type) => (
                union_type.name.clone(),
                TypeModel {
                    kind: Kind::Union,
                    fields: BTreeMap::new(),
                    enum_values: union_type.types.clone(),
                },
            ),
        };
        types.insert(name, model);
    }

    Ok(types)
}

fn output_field<'a>(field: &Field<'a, String>) -> (String, FieldModel) {
    (
        field.name.clone(),
        FieldModel {
            shape: TypeShape::of(&field.field_type),
            has_default: false,
            arguments: field.arguments.iter().map(input_value).collect(),
            directives: render_directives(&field.directives),
        },
    )
}

fn input_value<'a>(value: &InputValue<'a, String>) -> (String, FieldModel) {
    (
        value.name.clone(),
        FieldModel {
            shape: TypeShape::of(&value.value_type),
            has_default: value.default_value.is_some(),
            arguments: BTreeMap::new(),
            directives: render_directives(&value.directives),
        },
    )
}

fn render_directives<'a>(directives: &[Directive<'a, String>]) -> Vec<String> {
    let no_variables = Map::new();
    let mut rendered: Vec<String> = directives
        .iter()
        .map(|directive| {
            let arguments: Map<String, serde_json::Value> = directive
                .arguments
                .iter()
                .map(|(name, value)| (name.clone(), graphql_value_to_json(value, &no_variables)))
                .collect();
            format!("@{}{}", directive.name, serde_json::Value::Object(arguments))
        })
        .collect();
    rendered.sort();
    rendered
}

#[derive(Default)]
struct Differ {
    changes: Vec<SchemaDiff>,
}

impl Differ {
    fn push(&mut self, path: String, kind: ChangeKind, level: ChangeType, description: String) {
        self.changes.push(SchemaDiff {
            path,
            kind,
            level,
            description,
        });
    }

    fn types(&mut self, base: &BTreeMap<String, TypeModel>, candidate: &BTreeMap<String, TypeModel>) {
        for (name, old) in base {
            match candidate.get(name) {
                None => self.push(
                    name.clone(),
                    ChangeKind::TypeRemoved,
                    ChangeType::Major,
                    format!("Type removed: {}", name),
                ),
                Some(new) if new.kind != old.kind => self.push(
                    name.clone(),
                    ChangeKind::TypeKindChanged,
                    ChangeType::Major,
                    format!("Type kind changed: {}", name),
                ),
                Some(new) if old.kind == Kind::Enum || old.kind == Kind::Union => {
                    self.members(name, &old.enum_values, &new.enum_values)
                }
                Some(new) => self.fields(name, old.kind.is_input(), &old.fields, &new.fields),
            }
        }

        for name in candidate.keys() {
            if !base.contains_key(name) {
                self.push(
                    name.clone(),
                    ChangeKind::TypeAdded,
                    ChangeType::Minor,
                    format!("Type added: {}", name),
                );
            }
        }
    }

    fn members(&mut self, type_name: &str, old: &[String], new: &[String]) {
        for value in old.iter().filter(|value| !new.contains(value)) {
            self.push(
                format!("{}.{}", type_name, value),
                ChangeKind::EnumValueRemoved,
                ChangeType::Major,
                format!("Value removed: {}.{}", type_name, value),
            );
        }
        for value in new.iter().filter(|value| !old.contains(value)) {
            self.push(
                format!("{}.{}", type_name, value),
                ChangeKind::EnumValueAdded,
                ChangeType::Minor,
                format!("Value added: {}.{}", type_name, value),
            );
        }
    }

    fn fields(
        &mut self,
        type_name: &str,
        input: bool,
        old: &BTreeMap<String, FieldModel>,
        new: &BTreeMap<String, FieldModel>,
    ) {
        for (name, old_field) in old {
            let path = format!("{}.{}", type_name, name);
            let Some(new_field) = new.get(name) else {
                self.push(
                    path.clone(),
                    ChangeKind::FieldRemoved,
                    ChangeType::Major,
                    format!("Field removed: {}", path),
                );
                continue;
            };

            if !old_field.shape.same_base(&new_field.shape) {
                self.push(
                    path.clone(),
                    ChangeKind::FieldTypeChanged,
                    ChangeType::Major,
                    format!(
                        "Field type changed: {} from {} to {}",
                        path, old_field.shape.rendered, new_field.shape.rendered
                    ),
                );
            } else if old_field.shape.non_null != new_field.shape.non_null {
                self.nullability(&path, input, old_field, new_field);
            }

            if !input {
                self.arguments(&path, &old_field.arguments, &new_field.arguments);
            }

            if old_field.directives != new_field.directives {
                self.push(
                    path.clone(),
                    ChangeKind::DirectivesChanged,
                    ChangeType::Patch,
                    format!("Directives changed: {}", path),
                );
            }
        }

        for (name, new_field) in new {
            if old.contains_key(name) {
                continue;
            }
            let path = format!("{}.{}", type_name, name);
            if input && new_field.shape.non_null && !new_field.has_default {
                self.push(
                    path.clone(),
                    ChangeKind::RequiredFieldAdded,
                    ChangeType::Major,
                    format!("Required input field added without default: {}", path),
                );
            } else {
                self.push(
                    path.clone(),
                    ChangeKind::FieldAdded,
                    ChangeType::Minor,
                    format!("Field added: {} ({})", path, new_field.shape.rendered),
                );
            }
        }
    }

    fn nullability(&mut self, path: &str, input: bool, old: &FieldModel, new: &FieldModel) {
        let became_non_null = new.shape.non_null && !old.shape.non_null;
        let (kind, level, what) = match (input, became_non_null) {
            // Inputs: required is stricter for the caller.
            (true, true) if !new.has_default => {
                (ChangeKind::FieldBecameRequired, ChangeType::Major, "became required")
            }
            (true, true) => (ChangeKind::FieldBecameRequired, ChangeType::Minor, "became required with default"),
            (true, false) => (ChangeKind::FieldBecameOptional, ChangeType::Minor, "became optional"),
            // Outputs: nullable is weaker for the reader.
            (false, true) => (ChangeKind::FieldBecameNonNull, ChangeType::Minor, "became non-null"),
            (false, false) => (ChangeKind::FieldBecameNullable, ChangeType::Major, "became nullable"),
        };
        self.push(
            path.to_string(),
            kind,
            level,
            format!("Field {}: {}", what, path),
        );
    }

    fn arguments(
        &mut self,
        field_path: &str,
        old: &BTreeMap<String, FieldModel>,
        new: &BTreeMap<String, FieldModel>,
    ) {
        for (name, old_arg) in old {
            let path = format!("{}({})", field_path, name);
            match new.get(name) {
                None => self.push(
                    path.clone(),
                    ChangeKind::ArgumentRemoved,
                    ChangeType::Major,
                    format!("Argument removed: {}", path),
                ),
                Some(new_arg) if !old_arg.shape.same_base(&new_arg.shape) => self.push(
                    path.clone(),
                    ChangeKind::ArgumentTypeChanged,
                    ChangeType::Major,
                    format!(
                        "Argument type changed: {} from {} to {}",
                        path, old_arg.shape.rendered, new_arg.shape.rendered
                    ),
                ),
                Some(new_arg) if new_arg.shape.non_null && !old_arg.shape.non_null => {
                    let level = if new_arg.has_default {
                        ChangeType::Minor
                    } else {
                        ChangeType::Major
                    };
                    self.push(
                        path.clone(),
                        ChangeKind::ArgumentBecameRequired,
                        level,
                        format!("Argument became required: {}", path),
                    );
                }
                Some(new_arg) if old_arg.shape.non_null && !new_arg.shape.non_null => self.push(
                    path.clone(),
                    ChangeKind::ArgumentBecameOptional,
                    ChangeType::Minor,
                    format!("Argument became optional: {}", path),
                ),
                Some(_) => {}
            }
        }

        for (name, new_arg) in new {
            if old.contains_key(name) {
                continue;
            }
            let path = format!("{}({})", field_path, name);
            if new_arg.shape.non_null && !new_arg.has_default {
                self.push(
                    path.clone(),
                    ChangeKind::RequiredArgumentAdded,
                    ChangeType::Major,
                    format!("Required argument added without default: {}", path),
                );
            } else {
                self.push(
                    path.clone(),
                    ChangeKind::ArgumentAdded,
                    ChangeType::Minor,
                    format!("Argument added: {}", path),
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    const BASE: &str = r#"
        type Query { person(nic: String!): Person }
        type Person {
            name: String! @sourceInfo(providerKey: "rgdf", providerField: "getPersonInfo.fullName")
            age: Int
        }
        input Filter { nic: String }
        enum Gender { MALE FEMALE }
    "#;

    fn kinds(report: &CompatibilityReport) -> Vec<(String, ChangeKind)> {
        report
            .changes
            .iter()
            .map(|change| (change.path.clone(), change.kind))
            .collect()
    }

    #[test]
    fn identical_schemas_are_patch_compatible() {
        let report = check(BASE, BASE).unwrap();
        assert!(report.compatible);
        assert_eq!(report.level, ChangeType::Patch);
        assert!(report.changes.is_empty());
    }

    #[test]
    fn additions_are_minor() {
        let candidate = BASE.replace("age: Int", "age: Int\n email: String")
            + "\n type Address { line1: String }";
        let report = check(BASE, &candidate).unwrap();
        assert!(report.compatible);
        assert_eq!(report.level, ChangeType::Minor);
        assert_eq!(
            kinds(&report),
            vec![
                ("Address".to_string(), ChangeKind::TypeAdded),
                ("Person.email".to_string(), ChangeKind::FieldAdded),
            ]
        );
    }

    #[test]
    fn removals_and_type_changes_are_breaking() {
        let candidate = BASE
            .replace("age: Int", "")
            .replace("name: String!", "name: Int!");
        let report = check(BASE, &candidate).unwrap();
        assert!(!report.compatible);
        assert_eq!(report.level, ChangeType::Major);
        assert_eq!(
            kinds(&report),
            vec![
                ("Person.age".to_string(), ChangeKind::FieldRemoved),
                ("Person.name".to_string(), ChangeKind::FieldTypeChanged),
            ]
        );
        assert_eq!(report.breaking_changes().len(), 2);
    }

    #[test]
    fn required_additions_without_default_are_breaking() {
        let candidate = BASE
            .replace("input Filter { nic: String }", "input Filter { nic: String region: String! }")
            .replace("person(nic: String!)", "person(nic: String!, purpose: String!)");
        let report = check(BASE, &candidate).unwrap();
        assert_eq!(
            kinds(&report),
            vec![
                ("Filter.region".to_string(), ChangeKind::RequiredFieldAdded),
                ("Query.person(purpose)".to_string(), ChangeKind::RequiredArgumentAdded),
            ]
        );
        assert!(!report.compatible);
    }

    #[test]
    fn required_argument_with_default_is_minor() {
        let candidate = BASE.replace(
            "person(nic: String!)",
            "person(nic: String!, purpose: String! = \"service\")",
        );
        let report = check(BASE, &candidate).unwrap();
        assert_eq!(report.level, ChangeType::Minor);
    }

    #[test]
    fn output_nullability_widening_is_breaking() {
        let candidate = BASE.replace("name: String!", "name: String");
        let report = check(BASE, &candidate).unwrap();
        assert_eq!(
            kinds(&report),
            vec![("Person.name".to_string(), ChangeKind::FieldBecameNullable)]
        );
        assert_eq!(report.level, ChangeType::Major);
    }

    #[test]
    fn provider_remap_is_patch() {
        let candidate = BASE.replace("getPersonInfo.fullName", "getPersonInfo.name");
        let report = check(BASE, &candidate).unwrap();
        assert_eq!(report.level, ChangeType::Patch);
        assert_eq!(
            kinds(&report),
            vec![("Person.name".to_string(), ChangeKind::DirectivesChanged)]
        );
    }

    #[test]
    fn enum_value_removal_is_breaking() {
        let candidate = BASE.replace("enum Gender { MALE FEMALE }", "enum Gender { MALE OTHER }");
        let report = check(BASE, &candidate).unwrap();
        assert_eq!(
            kinds(&report),
            vec![
                ("Gender.FEMALE".to_string(), ChangeKind::EnumValueRemoved),
                ("Gender.OTHER".to_string(), ChangeKind::EnumValueAdded),
            ]
        );
    }

    #[test]
    fn check_is_idempotent() {
        let candidate = BASE.replace("age: Int", "years: Int");
        let first = check(BASE, &candidate).unwrap();
        let second = check(BASE, &candidate).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn change_type_parses_case_insensitively() {
        assert_eq!(ChangeType::parse("MAJOR"), Some(ChangeType::Major));
        assert_eq!(ChangeType::parse(" minor "), Some(ChangeType::Minor));
        assert_eq!(ChangeType::parse("huge"), None);
        assert!(ChangeType::Major > ChangeType::Minor);
    }
}
