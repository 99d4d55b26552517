//! Dispatcher-to-worker transport.

use async_trait::async_trait;
use rpa_core::wire::{BatchAssignment, DispatchAck, WorkerStatus};
use rpa_core::worker_pool::WorkerEndpoint;

use crate::error::TransportError;

#[async_trait]
pub trait WorkerTransport: Send + Sync {
    /// Hand a whole batch to `worker`. The worker acknowledges once it has
    /// taken ownership, before any job runs.
    async fn hand_off(
        &self,
        worker: &WorkerEndpoint,
        assignment: &BatchAssignment,
    ) -> Result<DispatchAck, TransportError>;

    async fn status(&self, worker: &WorkerEndpoint) -> Result<WorkerStatus, TransportError>;
}

/// HTTP transport against the worker's axum surface.
pub struct HttpWorkerTransport {
    client: reqwest::Client,
}

impl HttpWorkerTransport {
    pub fn new(client: reqwest::Client) -> Self {
        Self { client }
    }

    async fn parse_response<T: serde::de::DeserializeOwned>(
        response: reqwest::Response,
    ) -> Result<T, TransportError> {
        let status = response.status();
        if !status.is_success() {
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "<unreadable body>".to_string());
            return Err(TransportError::Api {
                status: status.as_u16(),
                body,
            });
        }
        Ok(response.json::<T>().await?)
    }
}

#[async_trait]
impl WorkerTransport for HttpWorkerTransport {
    /// `POST {url}/batches`
    async fn hand_off(
        &self,
        worker: &WorkerEndpoint,
        assignment: &BatchAssignment,
    ) -> Result<DispatchAck, TransportError> {
        let response = self
            .client
            .post(format!("{}/batches", worker.url))
            .json(assignment)
            .send()
            .await?;
        Self::parse_response(response).await
    }

    /// `GET {url}/status`
    async fn status(&self, worker: &WorkerEndpoint) -> Result<WorkerStatus, TransportError> {
        let response = self
            .client
            .get(format!("{}/status", worker.url))
            .send()
            .await?;
        Self::parse_response(response).await
    }
}
