use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::GateError;
use crate::{RequestContext, TRACE_ID_HEADER};

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequiredField {
    pub provider_key: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schema_id: Option<String>,
    pub field_name: String,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PdpRequest {
    pub consumer_id: String,
    pub app_id: String,
    pub request_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub owner_id: Option<String>,
    pub required_fields: Vec<RequiredField>,
    pub timestamp: DateTime<Utc>,
}

/// A consent-required field, either as a bare path or as a detailed entry.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ConsentRequiredField {
    Path(String),
    Detailed {
        field_name: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        schema_id: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        owner: Option<String>,
    },
}

impl ConsentRequiredField {
    pub fn path(&self) -> &str {
        match self {
            ConsentRequiredField::Path(path) => path,
            ConsentRequiredField::Detailed { field_name, .. } => field_name,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PdpResponse {
    pub allow: bool,
    #[serde(default)]
    pub consent_required: bool,
    #[serde(default)]
    pub consent_required_fields: Vec<ConsentRequiredField>,
}

/// Outcome of one policy evaluation. Built per request, never cached.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct PolicyDecision {
    pub allow: bool,
    pub consent_required: bool,
    pub consent_required_fields: Vec<String>,
}

impl TryFrom<PdpResponse> for PolicyDecision {
    type Error = GateError;

    fn try_from(response: PdpResponse) -> Result<Self, GateError> {
        let fields: Vec<String> = response
            .consent_required_fields
            .iter()
            .map(|field| field.path().to_string())
            .collect();

        if response.consent_required && fields.is_empty() {
            return Err(GateError::PdpInvalidResponse(
                "consent required without any consent-required fields".to_string(),
            ));
        }

        Ok(PolicyDecision {
            allow: response.allow,
            consent_required: response.consent_required,
            consent_required_fields: fields,
        })
    }
}

impl PolicyDecision {
    pub fn outcome(&self) -> &'static str {
        match (self.allow, self.consent_required) {
            (false, _) => "DENIED",
            (true, true) => "CONSENT_REQUIRED",
            (true, false) => "ALLOWED",
        }
    }
}

#[async_trait]
pub trait PolicyDecisionPoint: Send + Sync {
    async fn decide(&self, ctx: &RequestContext, request: &PdpRequest) -> Result<PdpResponse, GateError>;
}

/// `POST {base_url}/decide`.
pub struct HttpPdpClient {
    client: reqwest::Client,
    base_url: String,
}

impl HttpPdpClient {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self::with_client(reqwest::Client::new(), base_url)
    }

    pub fn with_client(client: reqwest::Client, base_url: impl Into<String>) -> Self {
        HttpPdpClient {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }
}

#[async_trait]
impl PolicyDecisionPoint for HttpPdpClient {
    async fn decide(&self, ctx: &RequestContext, request: &PdpRequest) -> Result<PdpResponse, GateError> {
        let url = format!("{}/decide", self.base_url);
        debug!(trace_id = %ctx.trace_id, fields = request.required_fields.len(), "Calling PDP");

        let response = self
            .client
            .post(&url)
            .header(TRACE_ID_HEADER, &ctx.trace_id)
            .json(request)
            .send()
            .await
            .map_err(|e| GateError::PdpUnavailable(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(GateError::PdpUnavailable(format!("PDP returned status {}", status)));
        }

        response
            .json::<PdpResponse>()
            .await
            .map_err(|e| GateError::PdpInvalidResponse(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    #[test]
    fn decodes_path_and_detailed_consent_fields() {
        let response: PdpResponse = serde_json::from_value(json!({
            "allow": true,
            "consent_required": true,
            "consent_required_fields": [
                "person.name",
                {"field_name": "person.address", "owner": "citizen"}
            ]
        }))
        .unwrap();

        let decision = PolicyDecision::try_from(response).unwrap();
        assert_eq!(
            decision.consent_required_fields,
            vec!["person.name".to_string(), "person.address".to_string()]
        );
        assert_eq!(decision.outcome(), "CONSENT_REQUIRED");
    }

    #[test]
    fn consent_required_without_fields_is_invalid() {
        let response = PdpResponse {
            allow: true,
            consent_required: true,
            consent_required_fields: Vec::new(),
        };
        assert!(matches!(
            PolicyDecision::try_from(response),
            Err(GateError::PdpInvalidResponse(_))
        ));
    }

    #[test]
    fn missing_consent_flags_default_to_false() {
        let response: PdpResponse = serde_json::from_value(json!({"allow": false})).unwrap();
        let decision = PolicyDecision::try_from(response).unwrap();
        assert!(!decision.consent_required);
        assert_eq!(decision.outcome(), "DENIED");
    }

    #[test]
    fn request_serializes_snake_case() {
        let request = PdpRequest {
            consumer_id: "c1".into(),
            app_id: "app".into(),
            request_id: "trace".into(),
            owner_id: None,
            required_fields: vec![RequiredField {
                provider_key: "rgdf".into(),
                schema_id: None,
                field_name: "person.name".into(),
            }],
            timestamp: DateTime::parse_from_rfc3339("2024-01-01T00:00:00Z")
                .unwrap()
                .with_timezone(&Utc),
        };
        assert_eq!(
            serde_json::to_value(&request).unwrap(),
            json!({
                "consumer_id": "c1",
                "app_id": "app",
                "request_id": "trace",
                "required_fields": [{"provider_key": "rgdf", "field_name": "person.name"}],
                "timestamp": "2024-01-01T00:00:00Z"
            })
        );
    }
}
