#![allow(dead_code)]

use bytes::Bytes;
use exchange_federator::config::Config;
use exchange_federator::schema_store::{InMemorySchemaStore, NewSchema, SchemaStore};
use exchange_federator::server::{AppState, serve};
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::header::HeaderMap;
use hyper::service::service_fn;
use hyper::{Request, Response};
use hyper_util::rt::TokioIo;
use serde_json::{Value, json};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::TcpListener;

pub const PERSON_SDL: &str = r#"
directive @sourceInfo(providerKey: String!, providerField: String!, schemaId: String) on FIELD_DEFINITION

type Query {
  person(nic: String!): Person
}

type Person {
  name: String @sourceInfo(providerKey: "rgdf", providerField: "getPersonInfo.fullName")
  birthDate: String @sourceInfo(providerKey: "rgdf", providerField: "getPersonInfo.birthDate")
  address: String @sourceInfo(providerKey: "drp", providerField: "person.permanentAddress")
}
"#;

/// One request as seen by a mock upstream.
#[derive(Clone, Debug)]
pub struct Recorded {
    pub method: String,
    pub path: String,
    pub headers: HeaderMap,
    pub body: Value,
}

/// Status, JSON body and artificial latency of a mock reply.
pub type Reply = (u16, Value, Duration);

type Handler = Arc<dyn Fn(&str, &str, &Value) -> Reply + Send + Sync>;

/// A tiny JSON-over-HTTP upstream bound to an ephemeral port.
pub struct MockServer {
    pub url: String,
    requests: Arc<Mutex<Vec<Recorded>>>,
}

impl MockServer {
    pub async fn start<F>(handler: F) -> Self
    where
        F: Fn(&str, &str, &Value) -> Reply + Send + Sync + 'static,
    {
        let handler: Handler = Arc::new(handler);
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let requests = Arc::new(Mutex::new(Vec::new()));
        let recorded = requests.clone();

        tokio::spawn(async move {
            loop {
                let Ok((stream, _)) = listener.accept().await else {
                    return;
                };
                let handler = handler.clone();
                let recorded = recorded.clone();
                tokio::spawn(async move {
                    let service = service_fn(move |req: Request<Incoming>| {
                        let handler = handler.clone();
                        let recorded = recorded.clone();
                        async move {
                            let method = req.method().to_string();
                            let path = req.uri().path().to_string();
                            let headers = req.headers().clone();
                            let bytes = req.into_body().collect().await?.to_bytes();
                            let body: Value = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
                            recorded.lock().unwrap().push(Recorded {
                                method: method.clone(),
                                path: path.clone(),
                                headers,
                                body: body.clone(),
                            });

                            let (status, reply, delay) = handler(&method, &path, &body);
                            tokio::time::sleep(delay).await;
                            Ok::<_, hyper::Error>(
                                Response::builder()
                                    .status(status)
                                    .header("content-type", "application/json")
                                    .body(Full::new(Bytes::from(reply.to_string())))
                                    .unwrap(),
                            )
                        }
                    });
                    let _ = hyper::server::conn::http1::Builder::new()
                        .serve_connection(TokioIo::new(stream), service)
                        .await;
                });
            }
        });

        MockServer {
            url: format!("http://{}", addr),
            requests,
        }
    }

    /// Always answers `status` with `body`.
    pub async fn fixed(status: u16, body: Value) -> Self {
        Self::start(move |_, _, _| (status, body.clone(), Duration::ZERO)).await
    }

    pub fn requests(&self) -> Vec<Recorded> {
        self.requests.lock().unwrap().clone()
    }

    pub fn requests_to(&self, path: &str) -> Vec<Recorded> {
        self.requests().into_iter().filter(|r| r.path == path).collect()
    }

    /// Waits until at least `count` requests arrived, for fire-and-forget callers.
    pub async fn wait_for(&self, count: usize) -> Vec<Recorded> {
        for _ in 0..100 {
            let requests = self.requests();
            if requests.len() >= count {
                return requests;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        self.requests()
    }
}

pub fn allow() -> Value {
    json!({ "allow": true, "consent_required": false, "consent_required_fields": [] })
}

pub fn rgdf_data() -> Value {
    json!({ "data": { "getPersonInfo": { "fullName": "Nimal Perera", "birthDate": "1990-01-01" } } })
}

pub fn drp_data() -> Value {
    json!({ "data": { "person": { "permanentAddress": "12 Galle Road" } } })
}

/// The federator served over real HTTP, wired from a YAML config that points
/// at mock upstreams.
pub struct Federator {
    pub url: String,
    pub state: Arc<AppState>,
    pub client: reqwest::Client,
}

impl Federator {
    pub async fn start(config_yaml: &str, store: Arc<dyn SchemaStore>) -> Self {
        let config = Config::from_yaml(config_yaml).unwrap();
        config.validate().unwrap();
        let state = Arc::new(AppState::from_config(&config, store).unwrap());

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("http://{}", listener.local_addr().unwrap());
        tokio::spawn(serve(listener, state.clone()));

        Federator {
            url,
            state,
            client: reqwest::Client::new(),
        }
    }

    pub async fn with_active_schema(config_yaml: &str) -> Self {
        let store = Arc::new(InMemorySchemaStore::new());
        let schema = store.register_schema(NewSchema::new(PERSON_SDL, "admin")).await.unwrap();
        store.activate_schema(&schema.version, false).await.unwrap();
        Self::start(config_yaml, store).await
    }

    pub async fn graphql(&self, consumer: Option<&str>, query: &str) -> (u16, Value, HeaderMap) {
        self.graphql_body(consumer, json!({ "query": query })).await
    }

    /// Posts a full GraphQL body, variables included.
    pub async fn graphql_body(&self, consumer: Option<&str>, body: Value) -> (u16, Value, HeaderMap) {
        let mut request = self
            .client
            .post(format!("{}/graphql", self.url))
            .header("X-Trace-ID", "trace-it")
            .json(&body);
        if let Some(consumer) = consumer {
            request = request.header("X-Consumer-ID", consumer);
        }
        let response = request.send().await.unwrap();
        let status = response.status().as_u16();
        let headers = response.headers().clone();
        (status, response.json().await.unwrap(), headers)
    }

    pub async fn post(&self, path: &str, body: Value) -> (u16, Value) {
        let response = self
            .client
            .post(format!("{}{}", self.url, path))
            .json(&body)
            .send()
            .await
            .unwrap();
        (response.status().as_u16(), response.json().await.unwrap())
    }

    pub async fn get(&self, path: &str) -> (u16, Value) {
        let response = self.client.get(format!("{}{}", self.url, path)).send().await.unwrap();
        (response.status().as_u16(), response.json().await.unwrap())
    }

    pub async fn get_text(&self, path: &str) -> (u16, String) {
        let response = self.client.get(format!("{}{}", self.url, path)).send().await.unwrap();
        (response.status().as_u16(), response.text().await.unwrap())
    }
}
