use crate::api::{ApiState, BUILD_COMMIT, BUILD_SEMVER};
use crate::{http_error, storage};
use anyhow::Result;
use dropshot::{endpoint, HttpError, HttpResponseOk, RequestContext};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct GetSystemMetadataResponse {
    /// The commit of the current build.
    pub commit: String,

    /// The semver version of the current build.
    pub semver: String,
}

/// Describe current system meta-information.
///
/// Return a number of internal metadata about the Launchpad service itself.
#[endpoint(
    method = GET,
    path = "/api/system/metadata",
    tags = ["System"],
)]
pub async fn get_system_metadata(
    _rqctx: RequestContext<Arc<ApiState>>,
) -> Result<HttpResponseOk<GetSystemMetadataResponse>, HttpError> {
    let resp = GetSystemMetadataResponse {
        commit: BUILD_COMMIT.to_string(),
        semver: BUILD_SEMVER.to_string(),
    };
    Ok(HttpResponseOk(resp))
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct GetHealthResponse {
    /// Number of deployments currently holding a run slot.
    pub active_deployments: usize,

    /// Number of templates available to deployments.
    pub templates: usize,
}

/// Check that the service can reach its database.
#[endpoint(
    method = GET,
    path = "/api/system/health",
    tags = ["System"],
)]
pub async fn get_health(
    rqctx: RequestContext<Arc<ApiState>>,
) -> Result<HttpResponseOk<GetHealthResponse>, HttpError> {
    let api_state = rqctx.context();

    let mut conn = match api_state.storage.read_conn().await {
        Ok(conn) => conn,
        Err(e) => {
            return Err(http_error!(
                "Could not open connection to database",
                rqctx.request_id,
                Some(e.into())
            ));
        }
    };

    if let Err(e) = storage::sites::list(&mut conn, 0, 1).await {
        return Err(http_error!(
            "Could not query database",
            rqctx.request_id,
            Some(e.into())
        ));
    }

    Ok(HttpResponseOk(GetHealthResponse {
        active_deployments: api_state.orchestrator.active_runs(),
        templates: api_state.templates.list().len(),
    }))
}
