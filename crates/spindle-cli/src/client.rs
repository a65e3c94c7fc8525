//! HTTP client for the dispatch API.

use anyhow::{Context, Result};
use reqwest::Client;
use serde::Serialize;
use serde::de::DeserializeOwned;

use spindle_core::api::{
    HeartbeatResponse, NextTaskRequest, PutPullRequest, PutTaskRequest, PutTaskResponse,
    RegisterServiceRequest, RegisterServiceResponse, ReleasedResponse, ResourceRequest,
    ResourceResponse, TaskCompleteRequest, TaskCompleteResponse, UpdatedResponse,
};
use spindle_core::app::OfflineResources;
use spindle_core::domain::{Lease, ServiceId};

#[derive(Clone)]
pub struct DispatchClient {
    http: Client,
    base: String,
}

impl DispatchClient {
    /// `server` is the scheme and authority, e.g. `http://127.0.0.1:8080`.
    pub fn new(server: &str) -> Self {
        Self {
            http: Client::new(),
            base: format!("{}/api/tape", server.trim_end_matches('/')),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{path}", self.base)
    }

    async fn send<B, R>(&self, method: reqwest::Method, path: &str, body: Option<&B>) -> Result<R>
    where
        B: Serialize + ?Sized,
        R: DeserializeOwned,
    {
        let mut request = self.http.request(method, self.url(path));
        if let Some(body) = body {
            request = request.json(body);
        }
        request
            .send()
            .await
            .with_context(|| format!("{path} request"))?
            .error_for_status()
            .with_context(|| format!("{path} status"))?
            .json::<R>()
            .await
            .with_context(|| format!("{path} decode"))
    }

    pub async fn register(&self, req: &RegisterServiceRequest) -> Result<ServiceId> {
        let resp: RegisterServiceResponse = self
            .send(reqwest::Method::POST, "service", Some(req))
            .await?;
        Ok(resp.service)
    }

    /// `None` when there is no work right now.
    pub async fn next_task(&self, req: &NextTaskRequest) -> Result<Option<Lease>> {
        self.send(reqwest::Method::POST, "nexttask", Some(req)).await
    }

    pub async fn task_complete(&self, req: &TaskCompleteRequest) -> Result<bool> {
        let resp: TaskCompleteResponse = self
            .send(reqwest::Method::PUT, "taskcomplete", Some(req))
            .await?;
        Ok(resp.completed)
    }

    pub async fn put_task(&self, req: &PutTaskRequest) -> Result<usize> {
        let resp: PutTaskResponse = self.send(reqwest::Method::PUT, "task", Some(req)).await?;
        Ok(resp.queued)
    }

    pub async fn heartbeat(&self, division: &str, service: ServiceId) -> Result<HeartbeatResponse> {
        self.send::<(), _>(
            reqwest::Method::GET,
            &format!("heartbeat/{division}/{service}"),
            None,
        )
        .await
    }

    pub async fn resource_offline(&self, req: &ResourceRequest) -> Result<ResourceResponse> {
        self.send(reqwest::Method::POST, "resourceoffline", Some(req))
            .await
    }

    pub async fn offline_resources(&self, division: &str) -> Result<OfflineResources> {
        self.send::<(), _>(reqwest::Method::GET, &format!("resources/{division}"), None)
            .await
    }

    pub async fn put_pull(&self, pull_queue_id: i64, req: &PutPullRequest) -> Result<bool> {
        let resp: UpdatedResponse = self
            .send(reqwest::Method::PUT, &format!("pull/{pull_queue_id}"), Some(req))
            .await?;
        Ok(resp.updated)
    }

    pub async fn release_volume(&self, division: &str, volume: &str) -> Result<bool> {
        let resp: ReleasedResponse = self
            .send::<(), _>(
                reqwest::Method::PUT,
                &format!("releaselockedvolume/{division}/{volume}"),
                None,
            )
            .await?;
        Ok(resp.released)
    }
}
