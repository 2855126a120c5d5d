use crate::api::{
    event_utils::Event,
    events::ListEventsResponse,
    sites::{
        CancelDeploymentResponse, CreateSiteRequest, CreateSiteResponse, DeploySiteRequest,
        DeploySiteResponse, GetSiteResponse, ListSitesResponse, Site,
    },
    system::{GetHealthResponse, GetSystemMetadataResponse},
    templates::{ListTemplatesResponse, Template},
    BUILD_SEMVER,
};
use anyhow::{anyhow, bail, Context, Result};
use http::StatusCode;
use reqwest::RequestBuilder;
use serde::{de::DeserializeOwned, Deserialize};
use std::time::Duration;

/// Body dropshot sends back with every error response.
#[derive(Debug, Deserialize)]
struct ErrorBody {
    message: String,
    request_id: Option<String>,
}

/// Thin typed wrapper around the Launchpad http api.
#[derive(Debug, Clone)]
pub struct Client {
    http: reqwest::Client,
    base_url: String,
}

impl Client {
    pub fn new(server: &str) -> Result<Self> {
        let http = reqwest::Client::builder()
            .user_agent(format!("launchpad-cli/{BUILD_SEMVER}"))
            .timeout(Duration::from_secs(30))
            .build()
            .context("Could not build http client")?;

        Ok(Self {
            http,
            base_url: server.trim_end_matches('/').to_string(),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.base_url)
    }

    async fn send<T: DeserializeOwned>(&self, request: RequestBuilder) -> Result<T> {
        let response = request
            .send()
            .await
            .with_context(|| format!("Could not reach Launchpad at '{}'", self.base_url))?;

        let status = response.status();

        if status.is_success() {
            return response
                .json::<T>()
                .await
                .context("Could not parse response from Launchpad");
        }

        let body = response.text().await.unwrap_or_default();

        match serde_json::from_str::<ErrorBody>(&body) {
            Ok(error) => match error.request_id {
                Some(request_id) => Err(anyhow!(
                    "{} ({status}); request_id: {request_id}",
                    error.message
                )),
                None => Err(anyhow!("{} ({status})", error.message)),
            },
            Err(_) if status == StatusCode::NOT_FOUND => bail!("Not found ({status})"),
            Err(_) => bail!("Unexpected response ({status}); {body}"),
        }
    }

    pub async fn get_system_metadata(&self) -> Result<GetSystemMetadataResponse> {
        self.send(self.http.get(self.url("/api/system/metadata")))
            .await
    }

    pub async fn get_health(&self) -> Result<GetHealthResponse> {
        self.send(self.http.get(self.url("/api/system/health"))).await
    }

    pub async fn list_templates(&self) -> Result<Vec<Template>> {
        let response: ListTemplatesResponse =
            self.send(self.http.get(self.url("/api/templates"))).await?;
        Ok(response.templates)
    }

    pub async fn list_sites(&self, limit: u64, offset: u64) -> Result<Vec<Site>> {
        let response: ListSitesResponse = self
            .send(
                self.http
                    .get(self.url("/api/sites"))
                    .query(&[("limit", limit), ("offset", offset)]),
            )
            .await?;
        Ok(response.sites)
    }

    pub async fn get_site(&self, site_id: &str) -> Result<Site> {
        let response: GetSiteResponse = self
            .send(self.http.get(self.url(&format!("/api/sites/{site_id}"))))
            .await?;
        Ok(response.site)
    }

    pub async fn create_site(&self, request: &CreateSiteRequest) -> Result<Site> {
        let response: CreateSiteResponse = self
            .send(self.http.post(self.url("/api/sites")).json(request))
            .await?;
        Ok(response.site)
    }

    pub async fn deploy_site(&self, site_id: &str, reason: Option<String>) -> Result<Site> {
        let response: DeploySiteResponse = self
            .send(
                self.http
                    .post(self.url(&format!("/api/sites/{site_id}/deploy")))
                    .json(&DeploySiteRequest { reason }),
            )
            .await?;
        Ok(response.site)
    }

    pub async fn cancel_deployment(&self, site_id: &str) -> Result<bool> {
        let response: CancelDeploymentResponse = self
            .send(self.http.post(self.url(&format!("/api/sites/{site_id}/cancel"))))
            .await?;
        Ok(response.cancelled)
    }

    pub async fn list_site_events(&self, site_id: &str, limit: u64, offset: u64) -> Result<Vec<Event>> {
        let response: ListEventsResponse = self
            .send(
                self.http
                    .get(self.url(&format!("/api/sites/{site_id}/events")))
                    .query(&[("limit", limit), ("offset", offset)]),
            )
            .await?;
        Ok(response.events)
    }
}
