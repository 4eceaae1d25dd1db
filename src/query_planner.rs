use graphql_parser::query::{
    Definition, OperationDefinition, Selection, SelectionSet, Type, VariableDefinition,
    parse_query,
};
use serde_json::{Map, Value, json};
use std::collections::BTreeMap;

use crate::argument_translator::ConsumerArguments;
use crate::error::ClientError;
use crate::field_resolver::{ProviderLevelFieldRecord, RequestedField};
use crate::sdl::{ArgumentDef, CompiledSchema, unified_path};
use crate::{GraphQLRequest, graphql_value_to_json, path_segments};

/// Wraps an enum value on its way to the provider so it renders unquoted.
/// `$` keeps it apart from any input field name.
pub const ENUM_MARKER: &str = "$enum";

/// What a consumer query asks for, independent of who provides it.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct QueryPlan {
    pub requested: Vec<RequestedField>,
    pub arguments: ConsumerArguments,
}

pub trait QueryPlanner: Send + Sync {
    fn plan_query(
        &self,
        request: &GraphQLRequest,
        schema: &CompiledSchema,
    ) -> Result<QueryPlan, ClientError>;
}

/// Walks the selection of a single query operation against the unified
/// schema. Fragments, mutations and subscriptions are refused.
#[derive(Clone, Copy, Debug, Default)]
pub struct SelectionPlanner;

impl SelectionPlanner {
    pub fn new() -> Self {
        SelectionPlanner
    }
}

impl QueryPlanner for SelectionPlanner {
    fn plan_query(
        &self,
        request: &GraphQLRequest,
        schema: &CompiledSchema,
    ) -> Result<QueryPlan, ClientError> {
        let document = parse_query::<String>(&request.query)
            .map_err(|e| ClientError::MalformedQuery(e.to_string()))?;

        let mut operations = Vec::new();
        for definition in &document.definitions {
            match definition {
                Definition::Operation(operation) => operations.push(operation),
                Definition::Fragment(_) => {
                    return Err(ClientError::UnsupportedOperation(
                        "fragments are not supported".to_string(),
                    ));
                }
            }
        }

        let operation = select_operation(&operations, request.operation_name.as_deref())?;
        let (selection_set, variable_definitions) = match operation {
            OperationDefinition::SelectionSet(set) => (set, &[][..]),
            OperationDefinition::Query(query) => {
                (&query.selection_set, query.variable_definitions.as_slice())
            }
            OperationDefinition::Mutation(_) => {
                return Err(ClientError::UnsupportedOperation("mutation".to_string()));
            }
            OperationDefinition::Subscription(_) => {
                return Err(ClientError::UnsupportedOperation("subscription".to_string()));
            }
        };

        let mut walk = Walk {
            schema,
            variables: bind_variables(request.variable_map(), variable_definitions)?,
            seen: BTreeMap::new(),
            plan: QueryPlan::default(),
        };
        walk.selection_set(&schema.query_type, selection_set, &[], &[], None)?;

        if walk.plan.requested.is_empty() {
            return Err(ClientError::MalformedQuery("query selects no fields".to_string()));
        }
        Ok(walk.plan)
    }
}

fn operation_name<'a, 'b>(operation: &'b OperationDefinition<'a, String>) -> Option<&'b str> {
    match operation {
        OperationDefinition::SelectionSet(_) => None,
        OperationDefinition::Query(query) => query.name.as_deref(),
        OperationDefinition::Mutation(mutation) => mutation.name.as_deref(),
        OperationDefinition::Subscription(subscription) => subscription.name.as_deref(),
    }
}

fn select_operation<'a, 'b>(
    operations: &[&'b OperationDefinition<'a, String>],
    name: Option<&str>,
) -> Result<&'b OperationDefinition<'a, String>, ClientError> {
    match (name, operations) {
        (_, []) => Err(ClientError::MalformedQuery("no operation in document".to_string())),
        (None, [single]) => Ok(*single),
        (None, _) => Err(ClientError::MalformedQuery(
            "operationName is required when the document has several operations".to_string(),
        )),
        (Some(name), _) => operations
            .iter()
            .copied()
            .find(|operation| operation_name(operation) == Some(name))
            .ok_or_else(|| ClientError::MalformedQuery(format!("unknown operation `{}`", name))),
    }
}

/// Applies declared defaults and rejects missing non-null variables.
fn bind_variables<'a>(
    mut variables: Map<String, Value>,
    definitions: &[VariableDefinition<'a, String>],
) -> Result<Map<String, Value>, ClientError> {
    for definition in definitions {
        let supplied = variables
            .get(&definition.name)
            .is_some_and(|value| !value.is_null());
        if supplied {
            continue;
        }
        if let Some(default) = &definition.default_value {
            variables.insert(
                definition.name.clone(),
                graphql_value_to_json(default, &Map::new()),
            );
        } else if matches!(definition.var_type, Type::NonNullType(_)) {
            return Err(ClientError::MissingArgument(format!("${}", definition.name)));
        }
    }
    Ok(variables)
}

struct Walk<'s> {
    schema: &'s CompiledSchema,
    variables: Map<String, Value>,
    /// Arguments of every field path visited so far, empty ones included.
    seen: BTreeMap<String, Map<String, Value>>,
    plan: QueryPlan,
}

impl Walk<'_> {
    fn selection_set<'a>(
        &mut self,
        type_name: &str,
        selection_set: &SelectionSet<'a, String>,
        field_path: &[String],
        response_path: &[String],
        container: Option<&[String]>,
    ) -> Result<(), ClientError> {
        let schema = self.schema;
        for selection in &selection_set.items {
            let field = match selection {
                Selection::Field(field) => field,
                Selection::FragmentSpread(_) | Selection::InlineFragment(_) => {
                    return Err(ClientError::UnsupportedOperation(
                        "fragments are not supported".to_string(),
                    ));
                }
            };

            if field.name == "__typename" {
                continue;
            }

            let definition = schema.field(type_name, &field.name).ok_or_else(|| {
                ClientError::UnknownField {
                    type_name: type_name.to_string(),
                    field: field.name.clone(),
                }
            })?;
            let path = unified_path(type_name, &field.name);

            let mut query_path = field_path.to_vec();
            query_path.push(field.name.clone());
            let mut response = response_path.to_vec();
            response.push(field.alias.clone().unwrap_or_else(|| field.name.clone()));

            let supplied: Map<String, Value> = field
                .arguments
                .iter()
                .map(|(name, value)| (name.clone(), graphql_value_to_json(value, &self.variables)))
                .collect();
            let query_key = query_path.join(".");
            for name in supplied.keys() {
                if !definition.arguments.iter().any(|arg| &arg.name == name) {
                    return Err(ClientError::MalformedQuery(format!(
                        "unknown argument `{}` on `{}`",
                        name, query_key
                    )));
                }
            }
            for argument in definition.arguments.iter().filter(|arg| arg.required) {
                if supplied.get(&argument.name).is_none_or(Value::is_null) {
                    return Err(ClientError::MissingArgument(format!(
                        "{}.{}",
                        query_key, argument.name
                    )));
                }
            }

            let mut arguments = Map::new();
            for (name, value) in supplied {
                let Some(argument) = definition.arguments.iter().find(|arg| arg.name == name) else {
                    continue;
                };
                let at = format!("{}.{}", query_key, name);
                arguments.insert(name, self.coerce(value, &argument.rendered_type, &at)?);
            }

            // Arguments are keyed by field path, so aliases of one field
            // must agree on them.
            match self.seen.get(&query_key) {
                Some(previous) if *previous != arguments => {
                    return Err(ClientError::ConflictingArguments(query_key));
                }
                Some(_) => {}
                None => {
                    self.seen.insert(query_key.clone(), arguments.clone());
                }
            }
            if !arguments.is_empty() {
                self.plan.arguments.insert(query_key.clone(), arguments);
            }

            let is_object = schema.object(&definition.type_name).is_some();
            let selects = !field.selection_set.items.is_empty();
            match (is_object, selects) {
                (true, false) => {
                    return Err(ClientError::MalformedQuery(format!(
                        "field `{}` of type `{}` needs a selection",
                        query_key, definition.type_name
                    )));
                }
                (false, true) => {
                    return Err(ClientError::MalformedQuery(format!(
                        "field `{}` of type `{}` cannot have a selection",
                        query_key, definition.type_name
                    )));
                }
                (false, false) => {
                    self.plan.requested.push(RequestedField {
                        unified_path: path,
                        response_path: response,
                        container: container.map(<[String]>::to_vec),
                        list_container: false,
                    });
                }
                (true, true) => {
                    let opens_container = container.is_none()
                        && definition.is_list
                        && schema.mapping(&path).is_some();
                    if opens_container {
                        self.plan.requested.push(RequestedField {
                            unified_path: path,
                            response_path: response.clone(),
                            container: None,
                            list_container: true,
                        });
                        self.selection_set(
                            &definition.type_name,
                            &field.selection_set,
                            &query_path,
                            &response,
                            Some(response.as_slice()),
                        )?;
                    } else {
                        self.selection_set(
                            &definition.type_name,
                            &field.selection_set,
                            &query_path,
                            &response,
                            container,
                        )?;
                    }
                }
            }
        }
        Ok(())
    }

    /// Checks `value` against a rendered input type such as `[String!]!` and
    /// marks enum values.
    fn coerce(&self, value: Value, rendered_type: &str, at: &str) -> Result<Value, ClientError> {
        let (inner, non_null) = match rendered_type.strip_suffix('!') {
            Some(inner) => (inner, true),
            None => (rendered_type, false),
        };
        if value.is_null() {
            return if non_null {
                Err(ClientError::InvalidArgument(format!("`{}` must not be null", at)))
            } else {
                Ok(Value::Null)
            };
        }

        if let Some(item_type) = inner.strip_prefix('[').and_then(|rest| rest.strip_suffix(']')) {
            return match value {
                Value::Array(items) => items
                    .into_iter()
                    .map(|item| self.coerce(item, item_type, at))
                    .collect::<Result<Vec<_>, _>>()
                    .map(Value::Array),
                single => self.coerce(single, item_type, at),
            };
        }

        let builtin = match (inner, &value) {
            ("String", Value::String(_))
            | ("ID", Value::String(_) | Value::Number(_))
            | ("Float", Value::Number(_))
            | ("Boolean", Value::Bool(_)) => Some(true),
            ("Int", Value::Number(number)) => Some(number.is_i64()),
            ("String" | "ID" | "Int" | "Float" | "Boolean", _) => Some(false),
            _ => None,
        };
        match builtin {
            Some(true) => return Ok(value),
            Some(false) => return Err(mismatch(at, &value, inner)),
            None => {}
        }

        if self.schema.is_enum(inner) {
            return match &value {
                Value::String(name) if is_name(name) => Ok(json!({ ENUM_MARKER: name })),
                other => Err(mismatch(at, other, inner)),
            };
        }
        if let Some(fields) = self.schema.input(inner) {
            return match value {
                Value::Object(object) => self.input_object(object, fields, at),
                other => Err(mismatch(at, &other, inner)),
            };
        }

        // Custom scalar: any JSON, but object keys still end up in the
        // provider query.
        check_keys(&value, at)?;
        Ok(value)
    }

    fn input_object(
        &self,
        mut object: Map<String, Value>,
        fields: &[ArgumentDef],
        at: &str,
    ) -> Result<Value, ClientError> {
        if let Some(unknown) = object.keys().find(|key| !fields.iter().any(|f| &f.name == *key)) {
            return Err(ClientError::InvalidArgument(format!(
                "`{}` has no input field {:?}",
                at, unknown
            )));
        }

        let mut coerced = Map::new();
        for field in fields {
            let path = format!("{}.{}", at, field.name);
            match object.remove(&field.name) {
                Some(value) => {
                    coerced.insert(field.name.clone(), self.coerce(value, &field.rendered_type, &path)?);
                }
                None if field.required => return Err(ClientError::MissingArgument(path)),
                None => {}
            }
        }
        Ok(Value::Object(coerced))
    }
}

fn mismatch(at: &str, value: &Value, type_name: &str) -> ClientError {
    ClientError::InvalidArgument(format!(
        "`{}` does not accept {} as `{}`",
        at,
        kind(value),
        type_name
    ))
}

fn kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "a list",
        Value::Object(_) => "an object",
    }
}

/// `[_A-Za-z][_0-9A-Za-z]*`
pub(crate) fn is_name(name: &str) -> bool {
    let mut chars = name.chars();
    matches!(chars.next(), Some(first) if first == '_' || first.is_ascii_alphabetic())
        && chars.all(|c| c == '_' || c.is_ascii_alphanumeric())
}

fn check_keys(value: &Value, at: &str) -> Result<(), ClientError> {
    match value {
        Value::Object(fields) => fields.iter().try_for_each(|(key, item)| {
            if is_name(key) {
                check_keys(item, at)
            } else {
                Err(ClientError::InvalidArgument(format!(
                    "`{}` has an object key that is not a GraphQL name: {:?}",
                    at, key
                )))
            }
        }),
        Value::Array(items) => items.iter().try_for_each(|item| check_keys(item, at)),
        _ => Ok(()),
    }
}

#[derive(Debug, Default)]
struct FieldNode {
    children: BTreeMap<String, FieldNode>,
}

/// Renders one provider's sub-query from its field records and translated
/// arguments. At each field, argument keys naming a selected child descend
/// into it; all other keys become arguments of that field.
pub fn provider_query(records: &[&ProviderLevelFieldRecord], arguments: &Map<String, Value>) -> String {
    let mut root = FieldNode::default();
    for record in records {
        let mut node = &mut root;
        for segment in path_segments(&record.provider_field) {
            node = node.children.entry(segment.to_string()).or_default();
        }
    }

    let fields: Vec<String> = root
        .children
        .iter()
        .map(|(name, node)| render_field(name, node, arguments.get(name)))
        .collect();
    format!("query {{ {} }}", fields.join(" "))
}

fn render_field(name: &str, node: &FieldNode, arguments: Option<&Value>) -> String {
    let arguments = arguments.and_then(Value::as_object);
    let mut out = name.to_string();

    let own: Vec<String> = arguments
        .into_iter()
        .flatten()
        .filter(|(key, value)| is_name(key) && !(node.children.contains_key(*key) && value.is_object()))
        .map(|(key, value)| format!("{}: {}", key, literal(value)))
        .collect();
    if !own.is_empty() {
        out.push_str(&format!("({})", own.join(", ")));
    }

    if !node.children.is_empty() {
        let children: Vec<String> = node
            .children
            .iter()
            .map(|(child, child_node)| {
                render_field(child, child_node, arguments.and_then(|args| args.get(child)))
            })
            .collect();
        out.push_str(&format!(" {{ {} }}", children.join(" ")));
    }
    out
}

/// JSON value as a GraphQL input literal.
fn literal(value: &Value) -> String {
    match value {
        Value::Null => "null".to_string(),
        Value::Bool(flag) => flag.to_string(),
        Value::Number(number) => number.to_string(),
        Value::String(_) => value.to_string(),
        Value::Array(items) => {
            let items: Vec<String> = items.iter().map(literal).collect();
            format!("[{}]", items.join(", "))
        }
        Value::Object(fields) => match enum_value(fields) {
            Some(name) if is_name(name) => name.to_string(),
            Some(name) => Value::from(name).to_string(),
            None => {
                let fields: Vec<String> = fields
                    .iter()
                    .filter(|(key, _)| is_name(key))
                    .map(|(key, item)| format!("{}: {}", key, literal(item)))
                    .collect();
                format!("{{{}}}", fields.join(", "))
            }
        },
    }
}

fn enum_value(fields: &Map<String, Value>) -> Option<&str> {
    match fields.get(ENUM_MARKER) {
        Some(Value::String(name)) if fields.len() == 1 => Some(name.as_str()),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::field_resolver::FieldRole;
    use crate::sdl::{DirectiveMetadata, compile};
    use pretty_assertions::assert_eq;
    use serde_json::json;

    const SDL: &str = r#"
        type Query {
            person(nic: String!): Person
            vehicleCount(owner: String, first: Int = 10, status: VehicleStatus, filter: VehicleFilter, meta: JSON): Int @sourceInfo(providerKey: "dmt", providerField: "vehicle.count")
        }
        input VehicleFilter {
            ownerNic: String!
            statuses: [VehicleStatus!]
        }
        enum VehicleStatus { ACTIVE RETIRED }
        scalar JSON
        type Person {
            name: String @sourceInfo(providerKey: "rgdf", providerField: "getPersonInfo.fullName")
            address: String @sourceInfo(providerKey: "drp", providerField: "person.permanentAddress")
            ownedVehicles: [VehicleInfo] @sourceInfo(providerKey: "dmt", providerField: "vehicle.getVehicleInfos.data")
        }
        type VehicleInfo {
            regNo: String @sourceInfo(providerKey: "dmt", providerField: "vehicle.getVehicleInfos.data.registrationNumber")
        }
    "#;

    fn plan(query: &str) -> Result<QueryPlan, ClientError> {
        let schema = compile(SDL).unwrap();
        SelectionPlanner::new().plan_query(&GraphQLRequest::new(query), &schema)
    }

    fn paths(plan: &QueryPlan) -> Vec<(String, Vec<String>)> {
        plan.requested
            .iter()
            .map(|f| (f.unified_path.clone(), f.response_path.clone()))
            .collect()
    }

    #[test]
    fn collects_fields_aliases_and_arguments() {
        let plan = plan(r#"{ person(nic: "199012345678") { fullName: name address } }"#).unwrap();
        assert_eq!(
            paths(&plan),
            vec![
                ("person.name".to_string(), vec!["person".to_string(), "fullName".to_string()]),
                ("person.address".to_string(), vec!["person".to_string(), "address".to_string()]),
            ]
        );
        assert_eq!(
            serde_json::to_value(&plan.arguments).unwrap(),
            json!({"person": {"nic": "199012345678"}})
        );
    }

    #[test]
    fn substitutes_variables_and_defaults() {
        let schema = compile(SDL).unwrap();
        let request = GraphQLRequest::new(
            r#"query Lookup($nic: String!, $count: Int = 5) {
                person(nic: $nic) { name }
                vehicleCount(owner: $nic, first: $count)
            }"#,
        )
        .with_variables(json!({"nic": "123"}));
        let plan = SelectionPlanner::new().plan_query(&request, &schema).unwrap();
        assert_eq!(
            serde_json::to_value(&plan.arguments).unwrap(),
            json!({"person": {"nic": "123"}, "vehicleCount": {"owner": "123", "first": 5}})
        );
    }

    #[test]
    fn list_fields_with_selection_open_a_container() {
        let plan = plan(r#"{ person(nic: "1") { ownedVehicles { regNo } } }"#).unwrap();
        assert!(plan.requested[0].list_container);
        assert_eq!(plan.requested[1].unified_path, "vehicleinfo.regNo");
        assert_eq!(
            plan.requested[1].container,
            Some(vec!["person".to_string(), "ownedVehicles".to_string()])
        );
    }

    #[test]
    fn rejects_client_errors() {
        assert!(matches!(plan("{ person("), Err(ClientError::MalformedQuery(_))));
        assert!(matches!(
            plan(r#"{ person(nic: "1") { age } }"#),
            Err(ClientError::UnknownField { field, .. }) if field == "age"
        ));
        assert_eq!(
            plan("{ person { name } }").unwrap_err(),
            ClientError::MissingArgument("person.nic".to_string())
        );
        assert!(matches!(
            plan("mutation { person(nic: \"1\") { name } }"),
            Err(ClientError::UnsupportedOperation(_))
        ));
        assert!(matches!(
            plan("{ person(nic: \"1\") { ...F } } fragment F on Person { name }"),
            Err(ClientError::UnsupportedOperation(_))
        ));
        assert!(matches!(
            plan("{ person(nic: \"1\") }"),
            Err(ClientError::MalformedQuery(_))
        ));
    }

    #[test]
    fn missing_required_variable_is_a_client_error() {
        let schema = compile(SDL).unwrap();
        let request = GraphQLRequest::new("query ($nic: String!) { person(nic: $nic) { name } }");
        assert_eq!(
            SelectionPlanner::new().plan_query(&request, &schema).unwrap_err(),
            ClientError::MissingArgument("$nic".to_string())
        );
    }

    fn plan_with(query: &str, variables: Value) -> Result<QueryPlan, ClientError> {
        let schema = compile(SDL).unwrap();
        let request = GraphQLRequest::new(query).with_variables(variables);
        SelectionPlanner::new().plan_query(&request, &schema)
    }

    #[test]
    fn rejects_variables_that_do_not_fit_the_argument_type() {
        let smuggled = json!({
            "nic": { "a: 1}) { fullName: secretSsn } x: getPersonInfo(nic: {b": 1 }
        });
        assert!(matches!(
            plan_with("query ($nic: String!) { person(nic: $nic) { name } }", smuggled),
            Err(ClientError::InvalidArgument(message)) if message.contains("person.nic")
        ));

        assert!(matches!(
            plan_with("query ($n: Int) { vehicleCount(first: $n) }", json!({"n": "ten"})),
            Err(ClientError::InvalidArgument(_))
        ));
        assert!(matches!(
            plan_with("query ($n: Int) { vehicleCount(first: $n) }", json!({"n": 1.5})),
            Err(ClientError::InvalidArgument(_))
        ));
        assert!(matches!(
            plan_with("query ($s: VehicleStatus) { vehicleCount(status: $s) }", json!({"s": "NOT AN ENUM"})),
            Err(ClientError::InvalidArgument(_))
        ));
    }

    #[test]
    fn checks_input_objects_field_by_field() {
        let query = "query ($f: VehicleFilter) { vehicleCount(filter: $f) }";

        assert!(matches!(
            plan_with(query, json!({"f": {"ownerNic": "1", "x) { secret }": 1}})),
            Err(ClientError::InvalidArgument(_))
        ));
        assert_eq!(
            plan_with(query, json!({"f": {"statuses": ["ACTIVE"]}})).unwrap_err(),
            ClientError::MissingArgument("vehicleCount.filter.ownerNic".to_string())
        );
        assert!(matches!(
            plan_with(query, json!({"f": "ownerNic"})),
            Err(ClientError::InvalidArgument(_))
        ));

        let plan = plan_with(query, json!({"f": {"ownerNic": "1", "statuses": ["ACTIVE", "RETIRED"]}})).unwrap();
        assert_eq!(
            serde_json::to_value(&plan.arguments).unwrap(),
            json!({"vehicleCount": {"filter": {
                "ownerNic": "1",
                "statuses": [{"$enum": "ACTIVE"}, {"$enum": "RETIRED"}]
            }}})
        );
    }

    #[test]
    fn custom_scalars_pass_through_with_name_keys_only() {
        let query = "query ($m: JSON) { vehicleCount(meta: $m) }";

        let plan = plan_with(query, json!({"m": {"tags": [{"k": 1}]}})).unwrap();
        assert_eq!(plan.arguments["vehicleCount"]["meta"], json!({"tags": [{"k": 1}]}));
        assert!(matches!(
            plan_with(query, json!({"m": {"tags": [{"k: 1) { ssn }": 1}]}})),
            Err(ClientError::InvalidArgument(_))
        ));
    }

    #[test]
    fn aliased_repeats_must_agree_on_arguments() {
        assert_eq!(
            plan(r#"{ a: person(nic: "1") { name } b: person(nic: "2") { name } }"#).unwrap_err(),
            ClientError::ConflictingArguments("person".to_string())
        );
        assert_eq!(
            plan(r#"{ a: person(nic: "1") { name } b: person { name } }"#).unwrap_err(),
            ClientError::MissingArgument("person.nic".to_string())
        );
        assert!(matches!(
            plan(r#"{ vehicleCount a: vehicleCount(first: 2) }"#),
            Err(ClientError::ConflictingArguments(path)) if path == "vehicleCount"
        ));

        let plan = plan(r#"{ a: person(nic: "1") { name } b: person(nic: "1") { address } }"#).unwrap();
        assert_eq!(plan.requested.len(), 2);
        assert_eq!(
            serde_json::to_value(&plan.arguments).unwrap(),
            json!({"person": {"nic": "1"}})
        );
    }

    #[test]
    fn enum_arguments_are_marked() {
        let plan = plan("{ vehicleCount(status: RETIRED) }").unwrap();
        assert_eq!(
            serde_json::to_value(&plan.arguments).unwrap(),
            json!({"vehicleCount": {"status": {"$enum": "RETIRED"}}})
        );

        let plan = plan_with(
            "query ($s: VehicleStatus) { vehicleCount(status: $s) }",
            json!({"s": "ACTIVE"}),
        )
        .unwrap();
        assert_eq!(plan.arguments["vehicleCount"]["status"], json!({"$enum": "ACTIVE"}));
    }

    fn record(provider_field: &str) -> ProviderLevelFieldRecord {
        ProviderLevelFieldRecord {
            provider_schema_id: None,
            provider_key: "dmt".to_string(),
            provider_field: provider_field.to_string(),
            unified_path: String::new(),
            response_path: Vec::new(),
            role: FieldRole::Leaf,
            metadata: DirectiveMetadata::default(),
        }
    }

    #[test]
    fn renders_provider_query_with_arguments_on_the_right_field() {
        let records = [record("getPersonInfo.fullName"), record("getPersonInfo.birthDate")];
        let refs: Vec<&ProviderLevelFieldRecord> = records.iter().collect();
        let arguments = json!({"getPersonInfo": {"nic": "19\"90"}});

        assert_eq!(
            provider_query(&refs, arguments.as_object().unwrap()),
            r#"query { getPersonInfo(nic: "19\"90") { birthDate fullName } }"#
        );
    }

    #[test]
    fn renders_nested_arguments_and_input_objects() {
        let records = [
            record("vehicle.getVehicleInfos.data"),
            record("vehicle.getVehicleInfos.data.registrationNumber"),
        ];
        let refs: Vec<&ProviderLevelFieldRecord> = records.iter().collect();
        let arguments = json!({
            "vehicle": {"getVehicleInfos": {"filter": {"ownerNic": "1", "active": true}, "first": 2}}
        });

        assert_eq!(
            provider_query(&refs, arguments.as_object().unwrap()),
            r#"query { vehicle { getVehicleInfos(filter: {active: true, ownerNic: "1"}, first: 2) { data { registrationNumber } } } }"#
        );
    }

    #[test]
    fn renders_enum_arguments_unquoted() {
        let records = [record("vehicle.count")];
        let refs: Vec<&ProviderLevelFieldRecord> = records.iter().collect();
        let arguments = json!({
            "vehicle": {"count": {
                "status": {"$enum": "ACTIVE"},
                "filter": {"statuses": [{"$enum": "RETIRED"}], "label": "ACTIVE"},
                "odd": {"$enum": "not a name"}
            }}
        });

        assert_eq!(
            provider_query(&refs, arguments.as_object().unwrap()),
            r#"query { vehicle { count(filter: {label: "ACTIVE", statuses: [RETIRED]}, odd: "not a name", status: ACTIVE) } }"#
        );
    }

    #[test]
    fn renders_only_name_keys() {
        let records = [record("getPersonInfo.fullName")];
        let refs: Vec<&ProviderLevelFieldRecord> = records.iter().collect();
        let arguments = json!({"getPersonInfo": {"nic": {"a: 1}) { secret } x: f(nic: {b": 1}, "bad key": 2}});

        assert_eq!(
            provider_query(&refs, arguments.as_object().unwrap()),
            "query { getPersonInfo(nic: {}) { fullName } }"
        );
    }
}
