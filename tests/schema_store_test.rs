mod common;

use common::{Federator, PERSON_SDL};
use exchange_federator::schema_store::{InMemorySchemaStore, NewSchema, SchemaStatus, SchemaStore};
use exchange_federator::sqlite_store::SqliteSchemaStore;
use pretty_assertions::assert_eq;
use serde_json::json;
use std::sync::Arc;

const CONFIG: &str = "pdp:\n  url: http://127.0.0.1:9\n";

fn with_field(name: &str, provider_field: &str) -> String {
    PERSON_SDL.replace(
        "  address: String",
        &format!(
            "  {}: String @sourceInfo(providerKey: \"drp\", providerField: \"{}\")\n  address: String",
            name, provider_field
        ),
    )
}

async fn empty_federator() -> Federator {
    Federator::start(CONFIG, Arc::new(InMemorySchemaStore::new())).await
}

#[tokio::test]
async fn test_register_and_activate_first_version() {
    let federator = empty_federator().await;

    let (status, body) = federator.get("/sdl").await;
    assert_eq!(status, 503);
    assert_eq!(body["errors"][0]["extensions"]["code"], "NO_ACTIVE_SCHEMA");

    let (status, registered) = federator
        .post("/sdl", json!({ "sdl": PERSON_SDL, "created_by": "admin" }))
        .await;
    assert_eq!(status, 201);
    assert_eq!(registered["version"], "1.0.0");
    assert_eq!(registered["status"], "draft");

    let (status, activated) = federator.post("/sdl/versions/1.0.0/activate", json!({})).await;
    assert_eq!(status, 200);
    assert_eq!(activated["status"], "active");

    let (status, active) = federator.get("/sdl").await;
    assert_eq!(status, 200);
    assert_eq!(active["version"], "1.0.0");
    assert_eq!(active["checksum"], registered["checksum"]);

    let (_, health) = federator.get("/health").await;
    assert_eq!(health["activeSchemaVersion"], "1.0.0");
}

#[tokio::test]
async fn test_activate_unknown_version_is_not_found() {
    let federator = empty_federator().await;

    let (status, body) = federator.post("/sdl/versions/9.9.9/activate", json!({})).await;

    assert_eq!(status, 404);
    assert_eq!(body["errors"][0]["extensions"]["code"], "NOT_FOUND");
}

#[tokio::test]
async fn test_breaking_activation_is_refused_without_override() {
    let federator = empty_federator().await;
    federator.post("/sdl", json!({ "sdl": PERSON_SDL })).await;
    federator.post("/sdl/versions/1.0.0/activate", json!({})).await;

    let renamed = PERSON_SDL.replace("  name: String", "  fullName: String");
    let (status, registered) = federator
        .post("/sdl", json!({ "sdl": renamed, "version": "2.0.0" }))
        .await;
    assert_eq!(status, 201);
    assert_eq!(registered["change_type"], "major");

    let (status, body) = federator.post("/sdl/versions/2.0.0/activate", json!({})).await;
    assert_eq!(status, 409);
    assert_eq!(body["errors"][0]["extensions"]["code"], "BREAKING_CHANGE");

    let (status, _) = federator
        .post("/sdl/versions/2.0.0/activate", json!({ "allow_breaking": true }))
        .await;
    assert_eq!(status, 200);
    let (_, previous) = federator.get("/sdl/versions/1.0.0").await;
    assert_eq!(previous["status"], "deprecated");
}

#[tokio::test]
async fn test_compatibility_check_is_idempotent() {
    let federator = empty_federator().await;
    federator.post("/sdl", json!({ "sdl": PERSON_SDL })).await;
    federator.post("/sdl/versions/1.0.0/activate", json!({})).await;

    let candidate = json!({ "sdl": with_field("gender", "person.gender") });
    let (status, first) = federator.post("/sdl/check-compatibility", candidate.clone()).await;
    let (_, second) = federator.post("/sdl/check-compatibility", candidate).await;

    assert_eq!(status, 200);
    assert_eq!(first, second);
    assert_eq!(first["compatible"], true);
    assert_eq!(first["level"], "minor");
    let (_, versions) = federator.get("/sdl/versions").await;
    assert_eq!(versions["versions"].as_array().unwrap().len(), 1);
}

#[tokio::test]
async fn test_validate_reports_invalid_sdl() {
    let federator = empty_federator().await;

    let (status, body) = federator.post("/sdl/validate", json!({ "sdl": "type Person {" })).await;
    assert_eq!(status, 200);
    assert_eq!(body["valid"], false);

    let (_, body) = federator.post("/sdl/validate", json!({ "sdl": PERSON_SDL })).await;
    assert_eq!(body["valid"], true);
    assert_eq!(body["providers"], json!(["drp", "rgdf"]));
}

#[tokio::test]
async fn test_provider_schemas_are_listed_per_key() {
    let federator = empty_federator().await;
    let provider_sdl = "type Query { getPersonInfo(nic: String!): PersonInfo } type PersonInfo { fullName: String }";

    let (status, _) = federator
        .post(
            "/provider-schemas",
            json!({ "provider_key": "rgdf", "sdl": provider_sdl, "version": "1.0.0" }),
        )
        .await;
    assert_eq!(status, 201);

    let (status, body) = federator.get("/provider-schemas?provider_key=rgdf").await;
    assert_eq!(status, 200);
    assert_eq!(body["providerSchemas"].as_array().unwrap().len(), 1);
    let (_, body) = federator.get("/provider-schemas?provider_key=drp").await;
    assert!(body["providerSchemas"].as_array().unwrap().is_empty());
}

#[tokio::test]
async fn test_provider_schema_filter_is_url_decoded() {
    let federator = empty_federator().await;
    let provider_sdl = "type Query { vehicle: Vehicle } type Vehicle { regNo: String }";
    federator
        .post(
            "/provider-schemas",
            json!({ "provider_key": "dmt v2", "sdl": provider_sdl, "version": "1.0.0" }),
        )
        .await;

    let (status, body) = federator.get("/provider-schemas?provider_key=dmt%20v2").await;
    assert_eq!(status, 200);
    assert_eq!(body["providerSchemas"][0]["provider_key"], "dmt v2");
    let (_, body) = federator.get("/provider-schemas?provider_key=dmt+v2").await;
    assert_eq!(body["providerSchemas"].as_array().unwrap().len(), 1);
}

// Two admins activating different versions at once must leave exactly one
// active schema behind.
async fn assert_single_active_after_race(store: Arc<dyn SchemaStore>) {
    store
        .register_schema(NewSchema::new(PERSON_SDL, "admin").with_version("1.0.0"))
        .await
        .unwrap();
    store.activate_schema("1.0.0", false).await.unwrap();
    store
        .register_schema(NewSchema::new(with_field("gender", "person.gender"), "a").with_version("1.1.0"))
        .await
        .unwrap();
    store
        .register_schema(NewSchema::new(with_field("email", "person.email"), "b").with_version("1.2.0"))
        .await
        .unwrap();

    let first = {
        let store = store.clone();
        tokio::spawn(async move { store.activate_schema("1.1.0", true).await })
    };
    let second = {
        let store = store.clone();
        tokio::spawn(async move { store.activate_schema("1.2.0", true).await })
    };
    first.await.unwrap().unwrap();
    second.await.unwrap().unwrap();

    let schemas = store.list_schemas().await.unwrap();
    let active: Vec<_> = schemas.iter().filter(|s| s.status == SchemaStatus::Active).collect();
    assert_eq!(active.len(), 1);
    assert!(["1.1.0", "1.2.0"].contains(&active[0].version.as_str()));
    assert_eq!(
        store.get_active_schema().await.unwrap().unwrap().version,
        active[0].version
    );
    assert_eq!(
        schemas.iter().filter(|s| s.status == SchemaStatus::Deprecated).count(),
        2
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_activation_in_memory() {
    assert_single_active_after_race(Arc::new(InMemorySchemaStore::new())).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_activation_sqlite() {
    let dir = tempfile::tempdir().unwrap();
    let store = SqliteSchemaStore::open(dir.path().join("schemas.db")).unwrap();
    assert_single_active_after_race(Arc::new(store)).await;
}

#[tokio::test]
async fn test_sqlite_store_survives_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("schemas.db");
    {
        let store = SqliteSchemaStore::open(&path).unwrap();
        store.register_schema(NewSchema::new(PERSON_SDL, "admin")).await.unwrap();
        store.activate_schema("1.0.0", false).await.unwrap();
    }

    let reopened = SqliteSchemaStore::open(&path).unwrap();
    let active = reopened.get_active_schema().await.unwrap().unwrap();
    assert_eq!(active.version, "1.0.0");
    assert!(active.compiled.mapping("person.address").is_some());
}
