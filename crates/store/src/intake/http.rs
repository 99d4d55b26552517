//! REST client for a remote job intake service.

use async_trait::async_trait;
use rpa_core::job::{JobReport, JobStatus, PendingJob};
use rpa_core::types::JobId;

use super::{IntakeError, JobIntake};

/// HTTP client for the intake service.
pub struct HttpJobIntake {
    client: reqwest::Client,
    base_url: String,
}

impl HttpJobIntake {
    /// * `base_url` - e.g. `http://intake:8000`, without a trailing slash.
    pub fn new(base_url: String) -> Self {
        Self::with_client(reqwest::Client::new(), base_url)
    }

    pub fn with_client(client: reqwest::Client, base_url: String) -> Self {
        Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }

    async fn ensure_success(response: reqwest::Response) -> Result<reqwest::Response, IntakeError> {
        let status = response.status();
        if !status.is_success() {
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "<unreadable body>".to_string());
            return Err(IntakeError::Api {
                status: status.as_u16(),
                body,
            });
        }
        Ok(response)
    }

    async fn parse_response<T: serde::de::DeserializeOwned>(
        response: reqwest::Response,
    ) -> Result<T, IntakeError> {
        let response = Self::ensure_success(response).await?;
        Ok(response.json::<T>().await?)
    }

    async fn check_status(response: reqwest::Response) -> Result<(), IntakeError> {
        Self::ensure_success(response).await?;
        Ok(())
    }
}

#[async_trait]
impl JobIntake for HttpJobIntake {
    /// `GET /jobs/pending?limit=N`
    async fn pull_pending(&self, limit: usize) -> Result<Vec<PendingJob>, IntakeError> {
        let response = self
            .client
            .get(format!("{}/jobs/pending", self.base_url))
            .query(&[("limit", limit)])
            .send()
            .await?;
        Self::parse_response(response).await
    }

    /// `POST /jobs/assign`
    async fn mark_assigned(&self, job_ids: &[JobId], batch_id: &str) -> Result<(), IntakeError> {
        let response = self
            .client
            .post(format!("{}/jobs/assign", self.base_url))
            .json(&serde_json::json!({ "job_ids": job_ids, "batch_id": batch_id }))
            .send()
            .await?;
        Self::check_status(response).await
    }

    /// `PUT /jobs/{id}/status`
    async fn mark_status(&self, job_id: JobId, status: JobStatus) -> Result<(), IntakeError> {
        let response = self
            .client
            .put(format!("{}/jobs/{job_id}/status", self.base_url))
            .json(&serde_json::json!({ "status": status }))
            .send()
            .await?;
        Self::check_status(response).await
    }

    /// `POST /jobs/lookup`
    async fn fetch_jobs(&self, job_ids: &[JobId]) -> Result<Vec<PendingJob>, IntakeError> {
        let response = self
            .client
            .post(format!("{}/jobs/lookup", self.base_url))
            .json(&serde_json::json!({ "job_ids": job_ids }))
            .send()
            .await?;
        let mut jobs: Vec<PendingJob> = Self::parse_response(response).await?;
        job_ids
            .iter()
            .map(|id| {
                jobs.iter()
                    .position(|j| j.id == *id)
                    .map(|at| jobs.swap_remove(at))
                    .ok_or(IntakeError::NotFound(*id))
            })
            .collect()
    }

    /// `POST /jobs/{id}/report`
    async fn report(&self, report: &JobReport) -> Result<(), IntakeError> {
        let response = self
            .client
            .post(format!("{}/jobs/{}/report", self.base_url, report.job_id))
            .json(report)
            .send()
            .await?;
        Self::check_status(response).await
    }

    /// `POST /jobs/requeue`
    async fn requeue(&self, job_ids: &[JobId]) -> Result<(), IntakeError> {
        let response = self
            .client
            .post(format!("{}/jobs/requeue", self.base_url))
            .json(&serde_json::json!({ "job_ids": job_ids }))
            .send()
            .await?;
        Self::check_status(response).await
    }

    /// `POST /jobs/reassign`
    async fn reassign(&self, job_ids: &[JobId], batch_id: &str) -> Result<Vec<JobId>, IntakeError> {
        let response = self
            .client
            .post(format!("{}/jobs/reassign", self.base_url))
            .json(&serde_json::json!({ "job_ids": job_ids, "batch_id": batch_id }))
            .send()
            .await?;
        Self::parse_response(response).await
    }
}
