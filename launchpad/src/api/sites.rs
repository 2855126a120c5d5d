use crate::{
    api::{epoch_milli, event_utils, validate, ApiState},
    http_error,
    orchestrator::OrchestratorError,
    publisher::{repository_name, slotted_prefix},
    storage,
};
use anyhow::{Context, Result};
use dropshot::{
    endpoint, ClientErrorStatusCode, HttpError, HttpResponseAccepted, HttpResponseCreated,
    HttpResponseOk, Path, Query, RequestContext, TypedBody,
};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::{str::FromStr, sync::Arc};
use strum::{Display, EnumString};
use uuid::Uuid;

#[derive(
    Debug, Clone, Copy, Display, Default, PartialEq, EnumString, Eq, Hash, Serialize, Deserialize, JsonSchema,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
#[strum(ascii_case_insensitive)]
#[schemars(rename = "site_status")]
pub enum Status {
    /// Registered but never deployed.
    #[default]
    Created,

    /// Accepted a deploy trigger and waiting for a free run slot.
    Queued,

    Fetching,
    Materializing,
    ProvisioningDomain,
    Publishing,
    Linking,
    Succeeded,
    Failed,
}

impl Status {
    /// A run owns the record while it's in one of these.
    pub fn is_in_progress(&self) -> bool {
        matches!(
            self,
            Status::Queued
                | Status::Fetching
                | Status::Materializing
                | Status::ProvisioningDomain
                | Status::Publishing
                | Status::Linking
        )
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Status::Succeeded | Status::Failed)
    }

    /// Whether moving from `self` to `next` is a legal step for a run.
    pub fn can_transition_to(&self, next: Status) -> bool {
        use Status::*;

        match (self, next) {
            (Created | Succeeded | Failed, Queued) => true,
            (Queued, Fetching) => true,
            (Fetching, Materializing) => true,
            (Materializing, ProvisioningDomain | Publishing) => true,
            (ProvisioningDomain, Publishing) => true,
            (Publishing, Linking) => true,
            (Linking, Succeeded) => true,
            (current, Failed) => current.is_in_progress(),
            _ => false,
        }
    }
}

/// How far the one time domain setup has got. Never moves backwards.
#[derive(
    Debug, Clone, Copy, Display, Default, PartialEq, EnumString, Eq, Serialize, Deserialize, JsonSchema,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
#[strum(ascii_case_insensitive)]
pub enum DomainState {
    #[default]
    None,

    /// A purchase was started but its outcome was never recorded.
    PurchasePending,

    Purchased,
    DnsMigrated,
}

#[derive(
    Debug, Clone, Copy, Display, Default, PartialEq, EnumString, Eq, Serialize, Deserialize, JsonSchema,
)]
pub enum ErrorKind {
    NotFoundError,
    TemplateNotFoundError,
    ValidationError,
    DomainUnavailableError,
    RegistrarError,
    PublishError,
    HostingError,
    CancelledError,

    /// The process went away while the run was active.
    InterruptedError,

    #[default]
    InternalError,
}

impl ErrorKind {
    /// False for failures that will repeat until the site's inputs or the world change.
    pub fn is_retryable(&self) -> bool {
        !matches!(
            self,
            ErrorKind::NotFoundError
                | ErrorKind::TemplateNotFoundError
                | ErrorKind::ValidationError
                | ErrorKind::DomainUnavailableError
        )
    }
}

/// The single structured failure surfaced for a run.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, JsonSchema)]
pub struct DeploymentError {
    pub kind: ErrorKind,

    /// Human readable description of what went wrong.
    pub message: String,

    /// The status the run was in when it failed.
    pub step: Status,

    /// Whether triggering another deploy could succeed without anything else changing.
    pub retryable: bool,
}

/// The deployment record for a single site.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, JsonSchema)]
pub struct Site {
    /// Unique identifier for the site.
    pub site_id: String,

    pub user_id: String,

    /// The domain the site is served on.
    pub site_url: String,

    /// Optional capacity index; narrows the repository name.
    pub slot: Option<u32>,

    pub status: Status,

    /// Set the first time a deployment succeeds and never unset.
    pub is_deployed: bool,

    /// Time of the first successful deployment in epoch milliseconds.
    pub deployed_at: Option<u64>,

    pub live_url: Option<String>,

    /// Address the hosting provider serves the project on without the custom domain.
    pub hosting_url: Option<String>,

    /// Name of the repository and hosting project. Assigned at registration and unique across
    /// sites; a user with more than one site tells them apart with slots.
    pub repository: Option<String>,

    /// The last failure; cleared when a new deploy is accepted.
    pub error: Option<DeploymentError>,

    pub domain_state: DomainState,
    pub nameservers: Vec<String>,

    /// Domain registration expiry in epoch milliseconds.
    pub domain_expiry: Option<u64>,

    /// How many deploy triggers have been accepted.
    pub attempts: u64,

    pub last_reason: Option<String>,

    /// Time of creation in epoch milliseconds.
    pub created: u64,

    /// Time of last modification in epoch milliseconds.
    pub modified: u64,
}

impl Site {
    pub fn new(user_id: &str, site_url: &str, slot: Option<u32>) -> Self {
        let now = epoch_milli();

        Self {
            site_id: Uuid::now_v7().to_string(),
            user_id: user_id.into(),
            site_url: site_url.into(),
            slot,
            status: Status::Created,
            is_deployed: false,
            deployed_at: None,
            live_url: None,
            hosting_url: None,
            repository: None,
            error: None,
            domain_state: DomainState::None,
            nameservers: vec![],
            domain_expiry: None,
            attempts: 0,
            last_reason: None,
            created: now,
            modified: now,
        }
    }
}

fn parse_optional_u64(field: &str, value: &Option<String>) -> Result<Option<u64>> {
    match value {
        Some(value) => value.parse::<u64>().map(Some).with_context(|| {
            format!("Could not parse field '{field}' from storage value '{value}'")
        }),
        None => Ok(None),
    }
}

impl TryFrom<storage::sites::Site> for Site {
    type Error = anyhow::Error;

    fn try_from(value: storage::sites::Site) -> Result<Self> {
        let slot = value
            .slot
            .map(u32::try_from)
            .transpose()
            .with_context(|| {
                format!(
                    "Could not parse field 'slot' from storage value '{:?}'",
                    value.slot
                )
            })?;

        let status = Status::from_str(&value.status).with_context(|| {
            format!(
                "Could not parse field 'status' from storage value '{}'",
                value.status
            )
        })?;

        let deployed_at = parse_optional_u64("deployed_at", &value.deployed_at)?;
        let domain_expiry = parse_optional_u64("domain_expiry", &value.domain_expiry)?;

        let error = serde_json::from_str(&value.error).with_context(|| {
            format!(
                "Could not parse field 'error' from storage value '{}'",
                value.error
            )
        })?;

        let domain_state = DomainState::from_str(&value.domain_state).with_context(|| {
            format!(
                "Could not parse field 'domain_state' from storage value '{}'",
                value.domain_state
            )
        })?;

        let nameservers = serde_json::from_str(&value.nameservers).with_context(|| {
            format!(
                "Could not parse field 'nameservers' from storage value '{}'",
                value.nameservers
            )
        })?;

        let attempts = u64::try_from(value.attempts).with_context(|| {
            format!(
                "Could not parse field 'attempts' from storage value '{}'",
                value.attempts
            )
        })?;

        let created = value.created.parse::<u64>().with_context(|| {
            format!(
                "Could not parse field 'created' from storage value '{}'",
                value.created
            )
        })?;

        let modified = value.modified.parse::<u64>().with_context(|| {
            format!(
                "Could not parse field 'modified' from storage value '{}'",
                value.modified
            )
        })?;

        Ok(Site {
            site_id: value.site_id,
            user_id: value.user_id,
            site_url: value.site_url,
            slot,
            status,
            is_deployed: value.is_deployed,
            deployed_at,
            live_url: value.live_url,
            hosting_url: value.hosting_url,
            repository: value.repository,
            error,
            domain_state,
            nameservers,
            domain_expiry,
            attempts,
            last_reason: value.last_reason,
            created,
            modified,
        })
    }
}

impl TryFrom<Site> for storage::sites::Site {
    type Error = anyhow::Error;

    fn try_from(value: Site) -> Result<Self> {
        let error = serde_json::to_string(&value.error).with_context(|| {
            format!(
                "Could not parse field 'error' to storage value '{:#?}'",
                value.error
            )
        })?;

        let nameservers = serde_json::to_string(&value.nameservers).with_context(|| {
            format!(
                "Could not parse field 'nameservers' to storage value '{:#?}'",
                value.nameservers
            )
        })?;

        let attempts = i64::try_from(value.attempts).with_context(|| {
            format!(
                "Could not parse field 'attempts' to storage value '{}'",
                value.attempts
            )
        })?;

        Ok(Self {
            site_id: value.site_id,
            user_id: value.user_id,
            site_url: value.site_url,
            slot: value.slot.map(i64::from),
            status: value.status.to_string(),
            is_deployed: value.is_deployed,
            deployed_at: value.deployed_at.map(|v| v.to_string()),
            live_url: value.live_url,
            hosting_url: value.hosting_url,
            repository: value.repository,
            error,
            domain_state: value.domain_state.to_string(),
            nameservers,
            domain_expiry: value.domain_expiry.map(|v| v.to_string()),
            attempts,
            last_reason: value.last_reason,
            created: value.created.to_string(),
            modified: value.modified.to_string(),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct SitePathArgs {
    /// The unique identifier for the target site.
    pub site_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct ListSitesQueryArgs {
    pub limit: Option<u64>,
    pub offset: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct ListSitesResponse {
    /// A list of all sites.
    pub sites: Vec<Site>,
}

/// List all sites.
#[endpoint(
    method = GET,
    path = "/api/sites",
    tags = ["Sites"],
)]
pub async fn list_sites(
    rqctx: RequestContext<Arc<ApiState>>,
    query_params: Query<ListSitesQueryArgs>,
) -> Result<HttpResponseOk<ListSitesResponse>, HttpError> {
    let api_state = rqctx.context();
    let query = query_params.into_inner();

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

    let storage_sites = match storage::sites::list(
        &mut conn,
        query.offset.unwrap_or_default() as i64,
        query.limit.unwrap_or(50) as i64,
    )
    .await
    {
        Ok(sites) => sites,
        Err(e) => {
            return Err(http_error!(
                "Could not get objects from database",
                rqctx.request_id,
                Some(e.into())
            ));
        }
    };

    let mut sites: Vec<Site> = vec![];

    for storage_site in storage_sites {
        let site = Site::try_from(storage_site).map_err(|e| {
            http_error!(
                "Could not parse object from database",
                rqctx.request_id,
                Some(e)
            )
        })?;

        sites.push(site);
    }

    Ok(HttpResponseOk(ListSitesResponse { sites }))
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct CreateSiteRequest {
    /// Owner of the site's artifacts in object storage.
    pub user_id: String,

    /// The domain the site will be served on, for example 'joes-pizza.com'.
    pub site_url: String,

    pub slot: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct CreateSiteResponse {
    pub site: Site,
}

/// Register a new site.
///
/// The site starts out in the `created` status; nothing is fetched or bought until it's deployed.
#[endpoint(
    method = POST,
    path = "/api/sites",
    tags = ["Sites"],
)]
pub async fn create_site(
    rqctx: RequestContext<Arc<ApiState>>,
    body: TypedBody<CreateSiteRequest>,
) -> Result<HttpResponseCreated<CreateSiteResponse>, HttpError> {
    let api_state = rqctx.context();
    let body = body.into_inner();

    let site_url = body.site_url.trim().to_string();

    if let Err(e) = validate::is_valid_site_url(&site_url) {
        return Err(HttpError::for_bad_request(
            None,
            format!("'{site_url}' is not a valid site_url; {e}"),
        ));
    }

    if let Err(e) = validate::is_valid_user_id(&body.user_id) {
        return Err(HttpError::for_bad_request(
            None,
            format!("'{}' is not a valid user_id; {e}", body.user_id),
        ));
    }

    if let Some(slot) = body.slot {
        if let Err(e) = validate::is_valid_slot(slot, api_state.config.deployment.slot_capacity) {
            return Err(HttpError::for_bad_request(
                None,
                format!("slot '{slot}' is not valid; {e}"),
            ));
        }
    }

    let mut new_site = Site::new(&body.user_id, &site_url, body.slot);
    let repository = repository_name(
        &slotted_prefix(
            &api_state.config.deployment.project_prefix,
            body.slot.map(i64::from),
        ),
        &body.user_id,
    );
    new_site.repository = Some(repository.clone());

    let new_site_storage: storage::sites::Site = new_site.clone().try_into().map_err(|e| {
        http_error!(
            "Could not serialize site for database",
            rqctx.request_id,
            Some(e)
        )
    })?;

    let mut conn = match api_state.storage.write_conn().await {
        Ok(conn) => conn,
        Err(e) => {
            return Err(http_error!(
                "Could not open connection to database",
                rqctx.request_id,
                Some(e.into())
            ));
        }
    };

    match storage::sites::get_by_repository(&mut conn, &repository).await {
        Ok(owner) => {
            return Err(HttpError::for_client_error(
                Some("conflict".into()),
                ClientErrorStatusCode::CONFLICT,
                format!(
                    "repository '{repository}' already belongs to site '{}'; register this site \
                    with a free slot",
                    owner.site_url
                ),
            ));
        }
        Err(storage::StorageError::NotFound) => {}
        Err(e) => {
            return Err(http_error!(
                "Could not query database",
                rqctx.request_id,
                Some(e.into())
            ));
        }
    }

    if let Err(e) = storage::sites::insert(&mut conn, &new_site_storage).await {
        match e {
            storage::StorageError::Exists => {
                return Err(HttpError::for_client_error(
                    Some("conflict".into()),
                    ClientErrorStatusCode::CONFLICT,
                    format!("a site for '{site_url}' or repository '{repository}' already exists"),
                ));
            }
            _ => {
                return Err(http_error!(
                    "Could not insert objects into database",
                    rqctx.request_id,
                    Some(e.into())
                ));
            }
        }
    };

    drop(conn);

    api_state.event_bus.publish(event_utils::Kind::CreatedSite {
        site_id: new_site.site_id.clone(),
        site_url: new_site.site_url.clone(),
    });

    Ok(HttpResponseCreated(CreateSiteResponse { site: new_site }))
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct GetSiteResponse {
    /// The site requested.
    pub site: Site,
}

/// Get a site by id.
///
/// This is how callers follow a deployment after triggering it.
#[endpoint(
    method = GET,
    path = "/api/sites/{site_id}",
    tags = ["Sites"],
)]
pub async fn get_site(
    rqctx: RequestContext<Arc<ApiState>>,
    path_params: Path<SitePathArgs>,
) -> Result<HttpResponseOk<GetSiteResponse>, HttpError> {
    let api_state = rqctx.context();
    let path = path_params.into_inner();

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

    let storage_site = match storage::sites::get(&mut conn, &path.site_id).await {
        Ok(site) => site,
        Err(e) => match e {
            storage::StorageError::NotFound => {
                return Err(HttpError::for_not_found(
                    None,
                    format!("site '{}' does not exist", path.site_id),
                ));
            }
            _ => {
                return Err(http_error!(
                    "Could not get object from database",
                    rqctx.request_id,
                    Some(e.into())
                ));
            }
        },
    };

    let site = Site::try_from(storage_site).map_err(|e| {
        http_error!(
            "Could not parse object from database",
            rqctx.request_id,
            Some(e)
        )
    })?;

    Ok(HttpResponseOk(GetSiteResponse { site }))
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct DeploySiteRequest {
    /// Free form note recorded with the deployment, e.g. "content updated".
    pub reason: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct DeploySiteResponse {
    /// The site as of the moment the deployment was queued; poll it for progress.
    pub site: Site,
}

/// Deploy a site.
///
/// Returns as soon as the deployment is queued. Safe to call repeatedly; a site that already has
/// a deployment in progress is rejected with a conflict.
#[endpoint(
    method = POST,
    path = "/api/sites/{site_id}/deploy",
    tags = ["Sites"],
)]
pub async fn deploy_site(
    rqctx: RequestContext<Arc<ApiState>>,
    path_params: Path<SitePathArgs>,
    body: TypedBody<DeploySiteRequest>,
) -> Result<HttpResponseAccepted<DeploySiteResponse>, HttpError> {
    let api_state = rqctx.context();
    let path = path_params.into_inner();
    let body = body.into_inner();

    let reason = body.reason.unwrap_or_else(|| "manual".into());

    let (site, _run) = match api_state
        .orchestrator
        .deploy(api_state, &path.site_id, &reason)
        .await
    {
        Ok(accepted) => accepted,
        Err(e) => match e {
            OrchestratorError::SiteNotFound(site_id) => {
                return Err(HttpError::for_not_found(
                    None,
                    format!("site '{site_id}' does not exist"),
                ));
            }
            OrchestratorError::RepositoryInUse {
                repository, holder, ..
            } => {
                return Err(HttpError::for_client_error(
                    Some("conflict".into()),
                    ClientErrorStatusCode::CONFLICT,
                    format!("repository '{repository}' is taken by site '{holder}'"),
                ));
            }
            OrchestratorError::AlreadyInProgress { site_id, status } => {
                return Err(HttpError::for_client_error(
                    Some("conflict".into()),
                    ClientErrorStatusCode::CONFLICT,
                    format!("site '{site_id}' already has a deployment in progress; status '{status}'"),
                ));
            }
            _ => {
                return Err(http_error!(
                    "Could not queue deployment",
                    rqctx.request_id,
                    Some(e.into())
                ));
            }
        },
    };

    Ok(HttpResponseAccepted(DeploySiteResponse { site }))
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct CancelDeploymentResponse {
    /// False when the site had no active deployment to cancel.
    pub cancelled: bool,
}

/// Cancel a site's active deployment.
///
/// The run stops at its next step boundary and fails with `CancelledError`.
#[endpoint(
    method = POST,
    path = "/api/sites/{site_id}/cancel",
    tags = ["Sites"],
)]
pub async fn cancel_deployment(
    rqctx: RequestContext<Arc<ApiState>>,
    path_params: Path<SitePathArgs>,
) -> Result<HttpResponseOk<CancelDeploymentResponse>, HttpError> {
    let api_state = rqctx.context();
    let path = path_params.into_inner();

    let cancelled = api_state.orchestrator.cancel(&path.site_id);

    if cancelled {
        api_state
            .event_bus
            .publish(event_utils::Kind::StartedDeploymentCancellation {
                site_id: path.site_id.clone(),
            });
    }

    Ok(HttpResponseOk(CancelDeploymentResponse { cancelled }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn pipeline_moves_forward_one_step_at_a_time() {
        let happy_path = [
            Status::Created,
            Status::Queued,
            Status::Fetching,
            Status::Materializing,
            Status::ProvisioningDomain,
            Status::Publishing,
            Status::Linking,
            Status::Succeeded,
        ];

        for pair in happy_path.windows(2) {
            assert!(pair[0].can_transition_to(pair[1]), "{} -> {}", pair[0], pair[1]);
            assert!(!pair[1].can_transition_to(pair[0]), "{} -> {}", pair[1], pair[0]);
        }

        assert!(Status::Materializing.can_transition_to(Status::Publishing));
        assert!(!Status::Fetching.can_transition_to(Status::Publishing));
        assert!(!Status::Queued.can_transition_to(Status::Succeeded));
    }

    #[test]
    fn failure_is_reachable_only_from_active_states() {
        for status in [
            Status::Queued,
            Status::Fetching,
            Status::Materializing,
            Status::ProvisioningDomain,
            Status::Publishing,
            Status::Linking,
        ] {
            assert!(status.is_in_progress());
            assert!(status.can_transition_to(Status::Failed));
        }

        for status in [Status::Created, Status::Succeeded, Status::Failed] {
            assert!(!status.can_transition_to(Status::Failed));
            assert!(status.can_transition_to(Status::Queued));
        }
    }

    #[test]
    fn storage_round_trip_keeps_structured_fields() {
        let mut site = Site::new("4f1c2a9e-77aa-4a43", "joes-pizza.com", Some(2));
        site.status = Status::Failed;
        site.domain_state = DomainState::DnsMigrated;
        site.nameservers = vec!["ns1.launchpad.test".into()];
        site.error = Some(DeploymentError {
            kind: ErrorKind::PublishError,
            message: "push rejected".into(),
            step: Status::Publishing,
            retryable: true,
        });

        let stored: storage::sites::Site = site.clone().try_into().expect("Failed to convert");
        assert_eq!(stored.status, "failed");
        assert_eq!(stored.domain_state, "dns_migrated");
        assert_eq!(stored.slot, Some(2));

        let parsed = Site::try_from(stored).expect("Failed to parse");
        assert_eq!(parsed, site);
    }

    #[test]
    fn statuses_read_back_case_insensitively() {
        assert_eq!(Status::from_str("PROVISIONING_DOMAIN").ok(), Some(Status::ProvisioningDomain));
        assert_eq!(Status::ProvisioningDomain.to_string(), "provisioning_domain");
        assert_eq!(
            serde_json::to_string(&ErrorKind::NotFoundError).expect("Failed to serialize"),
            "\"NotFoundError\""
        );
    }
}
