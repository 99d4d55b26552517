//! Control API for execution units.
//!
//! Provisioning and termination go to the control plane; readiness probes
//! and commands go to the unit's own endpoint.

use async_trait::async_trait;
use rpa_core::types::{BatchId, ServiceId};
use serde::{Deserialize, Serialize};

use crate::error::ExecutionUnitError;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProvisionRequest {
    pub service_id: ServiceId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub batch_id: Option<BatchId>,
}

/// Returned by the control plane as soon as provisioning has started.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProvisionedUnit {
    pub service_id: ServiceId,
    pub endpoint: String,
}

/// Result of one readiness probe.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Readiness {
    Ready,
    NotReady(String),
}

#[async_trait]
pub trait ExecutionUnitApi: Send + Sync {
    /// Start provisioning. Does not wait for the unit to come up.
    async fn provision(&self, request: &ProvisionRequest) -> Result<ProvisionedUnit, ExecutionUnitError>;

    /// Probe whether the unit can actually execute commands.
    async fn readiness(&self, endpoint: &str) -> Result<Readiness, ExecutionUnitError>;

    /// Opaque command passthrough.
    async fn command(
        &self,
        endpoint: &str,
        command: &serde_json::Value,
    ) -> Result<serde_json::Value, ExecutionUnitError>;

    /// Tear the unit down. Unknown units count as already gone.
    async fn terminate(&self, service_id: &str) -> Result<(), ExecutionUnitError>;
}

/// Expression evaluated by the functional readiness probe.
const PROBE_EXPRESSION: &str = "1 + 1";

#[derive(Debug, Deserialize)]
struct HealthBody {
    status: String,
}

/// HTTP implementation of [`ExecutionUnitApi`].
pub struct HttpExecutionUnitApi {
    client: reqwest::Client,
    control_url: String,
}

impl HttpExecutionUnitApi {
    /// * `control_url` - Base URL of the provisioning service, e.g. `http://units:9000`.
    pub fn new(control_url: String) -> Self {
        Self::with_client(reqwest::Client::new(), control_url)
    }

    pub fn with_client(client: reqwest::Client, control_url: String) -> Self {
        Self {
            client,
            control_url: control_url.trim_end_matches('/').to_string(),
        }
    }

    async fn ensure_success(response: reqwest::Response) -> Result<reqwest::Response, ExecutionUnitError> {
        let status = response.status();
        if !status.is_success() {
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "<unreadable body>".to_string());
            return Err(ExecutionUnitError::Api {
                status: status.as_u16(),
                body,
            });
        }
        Ok(response)
    }

    async fn parse_response<T: serde::de::DeserializeOwned>(
        response: reqwest::Response,
    ) -> Result<T, ExecutionUnitError> {
        let response = Self::ensure_success(response).await?;
        Ok(response.json::<T>().await?)
    }
}

#[async_trait]
impl ExecutionUnitApi for HttpExecutionUnitApi {
    /// `POST {control}/units`
    async fn provision(&self, request: &ProvisionRequest) -> Result<ProvisionedUnit, ExecutionUnitError> {
        let response = self
            .client
            .post(format!("{}/units", self.control_url))
            .json(request)
            .send()
            .await?;
        Self::parse_response(response).await
    }

    /// `GET {endpoint}/health/ready`, then a functional evaluation through
    /// the command endpoint. Anything short of both succeeding is not ready.
    async fn readiness(&self, endpoint: &str) -> Result<Readiness, ExecutionUnitError> {
        let response = self
            .client
            .get(format!("{endpoint}/health/ready"))
            .send()
            .await?;
        let health: HealthBody = match Self::parse_response(response).await {
            Ok(body) => body,
            Err(e) => return Ok(Readiness::NotReady(e.to_string())),
        };
        if health.status != "ready" {
            return Ok(Readiness::NotReady(format!("health status '{}'", health.status)));
        }

        let probe = serde_json::json!({ "type": "evaluate", "expression": PROBE_EXPRESSION });
        let result = match self.command(endpoint, &probe).await {
            Ok(value) => value,
            Err(e) => return Ok(Readiness::NotReady(e.to_string())),
        };
        if result.get("result").and_then(serde_json::Value::as_i64) == Some(2) {
            Ok(Readiness::Ready)
        } else {
            Ok(Readiness::NotReady(format!("probe returned {result}")))
        }
    }

    /// `POST {endpoint}/command`
    async fn command(
        &self,
        endpoint: &str,
        command: &serde_json::Value,
    ) -> Result<serde_json::Value, ExecutionUnitError> {
        let response = self
            .client
            .post(format!("{endpoint}/command"))
            .json(command)
            .send()
            .await?;
        Self::parse_response(response).await
    }

    /// `DELETE {control}/units/{service_id}`
    async fn terminate(&self, service_id: &str) -> Result<(), ExecutionUnitError> {
        let response = self
            .client
            .delete(format!("{}/units/{service_id}", self.control_url))
            .send()
            .await?;
        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(());
        }
        Self::ensure_success(response).await?;
        Ok(())
    }
}
