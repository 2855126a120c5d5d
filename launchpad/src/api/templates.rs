use crate::{api::ApiState, hosting::BuildConfig};
use anyhow::Result;
use dropshot::{endpoint, HttpError, HttpResponseOk, RequestContext};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct Template {
    pub name: String,

    /// Semver version from the template's manifest.
    pub version: String,
    pub description: String,

    /// Configuration keys every site using this template must set.
    pub required: Vec<String>,

    /// How the hosting provider builds sites made from this template.
    pub build: BuildConfig,
}

impl Template {
    fn from_registered(template: &crate::templates::Template, branch: &str) -> Self {
        Self {
            name: template.name.clone(),
            version: template.version.to_string(),
            description: template.description.clone(),
            required: template.schema.required.clone(),
            build: template.build_config(branch),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct ListTemplatesResponse {
    pub templates: Vec<Template>,
}

/// List all templates.
///
/// Templates are loaded when the service starts.
#[endpoint(
    method = GET,
    path = "/api/templates",
    tags = ["Templates"],
)]
pub async fn list_templates(
    rqctx: RequestContext<Arc<ApiState>>,
) -> Result<HttpResponseOk<ListTemplatesResponse>, HttpError> {
    let api_state = rqctx.context();
    let branch = &api_state.config.deployment.branch;

    let templates = api_state
        .templates
        .list()
        .into_iter()
        .map(|template| Template::from_registered(template, branch))
        .collect();

    Ok(HttpResponseOk(ListTemplatesResponse { templates }))
}
