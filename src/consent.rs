use async_trait::async_trait;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use thiserror::Error;
use tracing::debug;

use crate::error::GateError;
use crate::{RequestContext, TRACE_ID_HEADER};

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataField {
    pub owner_type: String,
    pub owner_id: String,
    pub fields: Vec<String>,
}

/// Body of a consent creation request.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConsentSpec {
    pub app_id: String,
    pub data_fields: Vec<DataField>,
    pub purpose: String,
    pub session_id: String,
    pub redirect_url: String,
}

/// A pending consent record created by the consent engine.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConsentTicket {
    pub consent_id: String,
    /// Portal page the data owner is sent to.
    #[serde(alias = "consent_portal_url")]
    pub redirect_url: String,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ConsentStatus {
    Approved,
    Denied,
    Pending,
    Other(String),
}

impl ConsentStatus {
    pub fn parse(value: &str) -> Self {
        match value.trim().to_ascii_lowercase().as_str() {
            "approved" => ConsentStatus::Approved,
            "denied" | "rejected" => ConsentStatus::Denied,
            "pending" => ConsentStatus::Pending,
            _ => ConsentStatus::Other(value.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            ConsentStatus::Approved => "approved",
            ConsentStatus::Denied => "denied",
            ConsentStatus::Pending => "pending",
            ConsentStatus::Other(other) => other,
        }
    }
}

impl fmt::Display for ConsentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Serialize for ConsentStatus {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for ConsentStatus {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = String::deserialize(deserializer)?;
        Ok(ConsentStatus::parse(&value))
    }
}

#[derive(Debug, Deserialize)]
struct StatusBody {
    status: ConsentStatus,
}

/// Lifecycle of one consent-gated request.
///
/// ```text
/// Evaluated -> ConsentPending -> Approved -> Executing -> Completed
///                            \-> Denied -> Rejected
/// ```
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConsentState {
    Evaluated,
    ConsentPending,
    Approved,
    Executing,
    Completed,
    Denied,
    Rejected,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ConsentEvent {
    Initiated,
    Polled(ConsentStatus),
    Execute,
    Finish,
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("consent flow cannot go from {from:?} on {event:?}")]
pub struct InvalidTransition {
    pub from: ConsentState,
    pub event: ConsentEvent,
}

impl ConsentState {
    /// Every status other than `approved` ends in a rejection.
    pub fn next(self, event: ConsentEvent) -> Result<ConsentState, InvalidTransition> {
        use ConsentState::*;
        match (self, &event) {
            (Evaluated, ConsentEvent::Initiated) => Ok(ConsentPending),
            (ConsentPending, ConsentEvent::Polled(ConsentStatus::Approved)) => Ok(Approved),
            (ConsentPending, ConsentEvent::Polled(_)) => Ok(Denied),
            (Approved, ConsentEvent::Execute) => Ok(Executing),
            (Executing, ConsentEvent::Finish) => Ok(Completed),
            (Denied, ConsentEvent::Finish) => Ok(Rejected),
            _ => Err(InvalidTransition {
                from: self,
                event: event.clone(),
            }),
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, ConsentState::Completed | ConsentState::Rejected)
    }
}

#[async_trait]
pub trait ConsentEngine: Send + Sync {
    async fn create_consent(&self, ctx: &RequestContext, spec: &ConsentSpec) -> Result<ConsentTicket, GateError>;

    async fn consent_status(&self, ctx: &RequestContext, consent_id: &str) -> Result<ConsentStatus, GateError>;
}

/// `POST {base_url}/consents` and `GET {base_url}/consents/{id}`.
pub struct HttpConsentClient {
    client: reqwest::Client,
    base_url: String,
}

impl HttpConsentClient {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self::with_client(reqwest::Client::new(), base_url)
    }

    pub fn with_client(client: reqwest::Client, base_url: impl Into<String>) -> Self {
        HttpConsentClient {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }

    async fn decode<T: serde::de::DeserializeOwned>(response: reqwest::Response) -> Result<T, GateError> {
        let status = response.status();
        if !status.is_success() {
            return Err(GateError::ConsentUnavailable(format!(
                "consent engine returned status {}",
                status
            )));
        }
        response
            .json::<T>()
            .await
            .map_err(|e| GateError::ConsentInvalidResponse(e.to_string()))
    }
}

#[async_trait]
impl ConsentEngine for HttpConsentClient {
    async fn create_consent(&self, ctx: &RequestContext, spec: &ConsentSpec) -> Result<ConsentTicket, GateError> {
        debug!(trace_id = %ctx.trace_id, app_id = %spec.app_id, "Creating consent record");
        let response = self
            .client
            .post(format!("{}/consents", self.base_url))
            .header(TRACE_ID_HEADER, &ctx.trace_id)
            .json(spec)
            .send()
            .await
            .map_err(|e| GateError::ConsentUnavailable(e.to_string()))?;
        Self::decode(response).await
    }

    async fn consent_status(&self, ctx: &RequestContext, consent_id: &str) -> Result<ConsentStatus, GateError> {
        debug!(trace_id = %ctx.trace_id, consent_id = %consent_id, "Polling consent status");
        let response = self
            .client
            .get(format!("{}/consents/{}", self.base_url, consent_id))
            .header(TRACE_ID_HEADER, &ctx.trace_id)
            .send()
            .await
            .map_err(|e| GateError::ConsentUnavailable(e.to_string()))?;
        let body: StatusBody = Self::decode(response).await?;
        Ok(body.status)
    }
}
