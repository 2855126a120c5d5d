//! Drives a site through fetch, materialize, domain setup, publish and link.
//!
//! The persisted status is the only record of progress. Every transition is a compare-and-set
//! against the status the run believes the record is in, and each one is written before the step
//! it names starts. A failed run is never retried automatically; the next `deploy` for the site
//! starts over at fetching and the idempotent steps make the rerun cheap. Domain purchase and DNS
//! migration are never redone once recorded.


use crate::{
    api::{
        epoch_milli,
        event_utils::Kind,
        sites::{DeploymentError, DomainState, ErrorKind, Site, Status},
        ApiState,
    },
    fetcher::{FetchError, Fetcher, SiteBundle},
    hosting::ProjectRef,
    linker::{LinkError, Linker},
    provisioner::{DomainLedger, DomainProgress, ProvisionError, Provisioner},
    publisher::{repository_name, slotted_prefix, PublishError, Publisher},
    retry::RetryPolicy,
    storage::{self, sites::UpdatableFields, StorageError},
    templates::{materialize::materialize, TemplateError},
    workspace::{self, WorkingTree},
};
use async_trait::async_trait;
use dashmap::{mapref::entry::Entry, DashMap};
use std::{
    path::Path,
    str::FromStr,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
};
use tokio::{sync::Semaphore, task::JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

#[derive(thiserror::Error, Debug)]
pub enum OrchestratorError {
    #[error("site '{0}' not found")]
    SiteNotFound(String),

    #[error("site '{site_id}' already has a deployment in progress; status '{status}'")]
    AlreadyInProgress { site_id: String, status: Status },

    #[error("repository '{repository}' for site '{site_id}' is taken by site '{holder}'")]
    RepositoryInUse {
        site_id: String,
        repository: String,
        holder: String,
    },

    #[error("storage error; {0}")]
    Storage(#[from] StorageError),

    #[error("{0}")]
    Internal(String),
}

/// A site claimed by this process. Held from the moment a trigger is accepted until the run has
/// written its final status.
#[derive(Debug)]
struct ActiveRun {
    run_id: u64,
    token: CancellationToken,
    repository: String,
}

#[derive(Debug)]
struct RepositoryClaim {
    site_id: String,
    run_id: u64,
}

/// Tracks active runs and bounds how many execute at once.
#[derive(Debug)]
pub struct Orchestrator {
    permits: Arc<Semaphore>,
    max_concurrent: usize,
    active: DashMap<String, ActiveRun>,
    repositories: DashMap<String, RepositoryClaim>,
    run_counter: AtomicU64,
}

impl Orchestrator {
    pub fn new(max_concurrent: usize) -> Self {
        let max_concurrent = max_concurrent.max(1);

        Self {
            permits: Arc::new(Semaphore::new(max_concurrent)),
            max_concurrent,
            active: DashMap::new(),
            repositories: DashMap::new(),
            run_counter: AtomicU64::new(0),
        }
    }

    /// Runs currently holding a permit.
    pub fn active_runs(&self) -> usize {
        self.max_concurrent
            .saturating_sub(self.permits.available_permits())
    }

    /// Queues a deployment for the site and returns the queued record along with a handle that
    /// resolves to the record as the run left it.
    ///
    /// The site and its repository are claimed before anything is written, so there is at most
    /// one run per site and one run per repository. A record that claims to be in progress while
    /// nothing in this process holds it was abandoned by a run that could not record its outcome;
    /// it is failed as interrupted and the trigger accepted.
    pub async fn deploy(
        &self,
        api_state: &Arc<ApiState>,
        site_id: &str,
        reason: &str,
    ) -> Result<(Site, JoinHandle<Site>), OrchestratorError> {
        let mut site = load_site(&api_state.storage, site_id).await?;
        let repository = site.repository.clone().unwrap_or_else(|| {
            repository_name(
                &slotted_prefix(
                    &api_state.config.deployment.project_prefix,
                    site.slot.map(i64::from),
                ),
                &site.user_id,
            )
        });

        if site.repository.is_none() {
            let owner = {
                let mut conn = api_state.storage.read_conn().await?;
                storage::sites::get_by_repository(&mut conn, &repository).await
            };

            match owner {
                Ok(owner) if owner.site_id != site.site_id => {
                    return Err(OrchestratorError::RepositoryInUse {
                        site_id: site_id.into(),
                        repository,
                        holder: owner.site_id,
                    });
                }
                Ok(_) | Err(StorageError::NotFound) => {}
                Err(e) => return Err(e.into()),
            }
        }

        let token = CancellationToken::new();
        let run_id = self.run_counter.fetch_add(1, Ordering::SeqCst);
        self.claim(&site, &repository, run_id, &token)?;

        if let Err(e) = self.queue(api_state, &mut site, reason).await {
            self.finish(site_id, run_id);
            return Err(e);
        }

        publish(
            api_state,
            Kind::QueuedDeployment {
                site_id: site_id.into(),
                reason: reason.into(),
                attempt: site.attempts,
            },
        )
        .await;

        info!(site_id = site_id, reason = reason, attempt = site.attempts, "Queued deployment");

        let run = Run {
            state: api_state.clone(),
            site: site.clone(),
            repository,
            token,
            run_id,
        };

        Ok((site, tokio::spawn(run.execute())))
    }

    fn claim(
        &self,
        site: &Site,
        repository: &str,
        run_id: u64,
        token: &CancellationToken,
    ) -> Result<(), OrchestratorError> {
        match self.active.entry(site.site_id.clone()) {
            Entry::Occupied(_) => {
                return Err(OrchestratorError::AlreadyInProgress {
                    site_id: site.site_id.clone(),
                    status: site.status,
                });
            }
            Entry::Vacant(entry) => {
                entry.insert(ActiveRun {
                    run_id,
                    token: token.clone(),
                    repository: repository.to_string(),
                });
            }
        }

        let holder = match self.repositories.entry(repository.to_string()) {
            Entry::Occupied(entry) => entry.get().site_id.clone(),
            Entry::Vacant(entry) => {
                entry.insert(RepositoryClaim {
                    site_id: site.site_id.clone(),
                    run_id,
                });
                return Ok(());
            }
        };

        self.finish(&site.site_id, run_id);

        warn!(
            site_id = %site.site_id,
            repository = repository,
            holder = %holder,
            "Repository is already being published by another site"
        );

        Err(OrchestratorError::RepositoryInUse {
            site_id: site.site_id.clone(),
            repository: repository.to_string(),
            holder,
        })
    }

    /// Moves a claimed site to `queued`.
    async fn queue(
        &self,
        api_state: &ApiState,
        site: &mut Site,
        reason: &str,
    ) -> Result<(), OrchestratorError> {
        if site.status.is_in_progress() {
            match interrupt(api_state, &site.site_id, &site.status.to_string()).await {
                Ok(_) => site.status = Status::Failed,
                Err(StorageError::StatusMismatch { actual, .. }) => {
                    return Err(OrchestratorError::AlreadyInProgress {
                        site_id: site.site_id.clone(),
                        status: Status::from_str(&actual).unwrap_or_default(),
                    });
                }
                Err(StorageError::NotFound) => {
                    return Err(OrchestratorError::SiteNotFound(site.site_id.clone()))
                }
                Err(e) => return Err(e.into()),
            }
        }

        let now = epoch_milli();
        let fields = UpdatableFields {
            status: Some(Status::Queued.to_string()),
            error: Some("null".into()),
            attempts: Some(site.attempts as i64 + 1),
            last_reason: Some(reason.into()),
            modified: Some(now.to_string()),
            ..Default::default()
        };

        let result = {
            let mut conn = api_state.storage.write_conn().await?;
            storage::sites::compare_and_set(&mut conn, &site.site_id, &site.status.to_string(), fields)
                .await
        };

        match result {
            Ok(_) => {}
            Err(StorageError::StatusMismatch { actual, .. }) => {
                return Err(OrchestratorError::AlreadyInProgress {
                    site_id: site.site_id.clone(),
                    status: Status::from_str(&actual).unwrap_or_default(),
                });
            }
            Err(StorageError::NotFound) => {
                return Err(OrchestratorError::SiteNotFound(site.site_id.clone()))
            }
            Err(e) => return Err(e.into()),
        }

        site.status = Status::Queued;
        site.error = None;
        site.attempts += 1;
        site.last_reason = Some(reason.into());
        site.modified = now;

        Ok(())
    }

    /// Asks the site's active run to stop at its next step boundary. Returns false if the site has
    /// no active run.
    pub fn cancel(&self, site_id: &str) -> bool {
        match self.active.get(site_id) {
            Some(active) => {
                active.token.cancel();
                info!(site_id = site_id, "Cancellation requested");
                true
            }
            None => false,
        }
    }

    /// Fails every record a previous process left in progress and removes stale working trees.
    /// Must run before this process accepts any deployments.
    pub async fn recover(&self, api_state: &ApiState) -> Result<usize, OrchestratorError> {
        let in_progress: Vec<String> = [
            Status::Queued,
            Status::Fetching,
            Status::Materializing,
            Status::ProvisioningDomain,
            Status::Publishing,
            Status::Linking,
        ]
        .iter()
        .map(|status| status.to_string())
        .collect();

        let stale = {
            let mut conn = api_state.storage.read_conn().await?;
            storage::sites::list_by_status(&mut conn, &in_progress).await?
        };

        let mut recovered = 0;

        for record in stale {
            if self.active.contains_key(&record.site_id) {
                continue;
            }

            match interrupt(api_state, &record.site_id, &record.status).await {
                Ok(_) => recovered += 1,
                Err(StorageError::StatusMismatch { .. }) | Err(StorageError::NotFound) => {
                    debug!(site_id = %record.site_id, "Record changed during recovery; skipping");
                }
                Err(e) => return Err(e.into()),
            }
        }

        let work_dir = Path::new(&api_state.config.deployment.work_dir);
        let swept = workspace::sweep_stale(work_dir).map_err(|e| {
            OrchestratorError::Internal(format!(
                "could not sweep working trees under '{}'; {e}",
                work_dir.display()
            ))
        })?;

        if recovered > 0 || swept > 0 {
            info!(recovered = recovered, swept_trees = swept, "Recovered from previous run");
        }

        Ok(recovered)
    }

    fn finish(&self, site_id: &str, run_id: u64) {
        if let Some((_, active)) = self
            .active
            .remove_if(site_id, |_, active| active.run_id == run_id)
        {
            self.repositories
                .remove_if(&active.repository, |_, claim| claim.run_id == run_id);
        }
    }
}

/// Fails a record left in progress by a run that is no longer around to finish it.
async fn interrupt(api_state: &ApiState, site_id: &str, status: &str) -> Result<Status, StorageError> {
    let step = Status::from_str(status).unwrap_or_default();
    let error = DeploymentError {
        kind: ErrorKind::InterruptedError,
        message: format!("deployment was interrupted while {step}"),
        step,
        retryable: ErrorKind::InterruptedError.is_retryable(),
    };

    let fields = UpdatableFields {
        status: Some(Status::Failed.to_string()),
        error: Some(serialize_error(&error)),
        modified: Some(epoch_milli().to_string()),
        ..Default::default()
    };

    {
        let mut conn = api_state.storage.write_conn().await?;
        storage::sites::compare_and_set(&mut conn, site_id, status, fields).await?;
    }

    warn!(site_id = site_id, step = %step, "Marked interrupted deployment as failed");

    publish(
        api_state,
        Kind::FailedDeployment {
            site_id: site_id.into(),
            step,
            kind: ErrorKind::InterruptedError,
        },
    )
    .await;

    Ok(step)
}

async fn load_site(db: &storage::Db, site_id: &str) -> Result<Site, OrchestratorError> {
    let mut conn = db.read_conn().await?;

    let record = match storage::sites::get(&mut conn, site_id).await {
        Ok(record) => record,
        Err(StorageError::NotFound) => {
            return Err(OrchestratorError::SiteNotFound(site_id.into()))
        }
        Err(e) => return Err(e.into()),
    };

    Site::try_from(record).map_err(|e| OrchestratorError::Internal(format!("{e:#}")))
}

/// Events are part of the site's history but never worth failing a run over.
async fn publish(api_state: &ApiState, kind: Kind) {
    if let Err(e) = api_state.event_bus.try_publish(kind).await {
        error!(error = %e, "Could not publish event");
    }
}

fn serialize_error(error: &DeploymentError) -> String {
    serde_json::to_string(&Some(error)).unwrap_or_else(|_| "null".into())
}

/// Why a step failed, before it's pinned to the step it happened in.
#[derive(Debug, Clone, PartialEq, Eq)]
struct Failure {
    kind: ErrorKind,
    message: String,
}

impl Failure {
    fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

impl From<StorageError> for Failure {
    fn from(value: StorageError) -> Self {
        Failure::new(
            ErrorKind::InternalError,
            format!("could not update deployment record; {value}"),
        )
    }
}

impl From<FetchError> for Failure {
    fn from(value: FetchError) -> Self {
        let kind = match &value {
            FetchError::NotFound(_) => ErrorKind::NotFoundError,
            FetchError::InvalidConfiguration(_) => ErrorKind::ValidationError,
            _ => ErrorKind::InternalError,
        };
        Failure::new(kind, value.to_string())
    }
}

impl From<TemplateError> for Failure {
    fn from(value: TemplateError) -> Self {
        let kind = match &value {
            TemplateError::NotFound(_) => ErrorKind::TemplateNotFoundError,
            TemplateError::Validation { .. } => ErrorKind::ValidationError,
            _ => ErrorKind::InternalError,
        };
        Failure::new(kind, value.to_string())
    }
}

impl From<ProvisionError> for Failure {
    fn from(value: ProvisionError) -> Self {
        let kind = match &value {
            ProvisionError::Unavailable(_) => ErrorKind::DomainUnavailableError,
            ProvisionError::Registrar(_) | ProvisionError::TimedOut(_) => ErrorKind::RegistrarError,
            ProvisionError::Ledger(_) => ErrorKind::InternalError,
        };
        Failure::new(kind, value.to_string())
    }
}

impl From<PublishError> for Failure {
    fn from(value: PublishError) -> Self {
        Failure::new(ErrorKind::PublishError, value.to_string())
    }
}

impl From<LinkError> for Failure {
    fn from(value: LinkError) -> Self {
        Failure::new(ErrorKind::HostingError, value.to_string())
    }
}

/// Writes domain progress onto the site record while it sits in `provisioning_domain`.
struct RecordLedger {
    storage: storage::Db,
    site_id: String,
}

#[async_trait]
impl DomainLedger for RecordLedger {
    async fn record(&self, progress: &DomainProgress) -> Result<(), StorageError> {
        let fields = UpdatableFields {
            domain_state: Some(progress.state.to_string()),
            nameservers: Some(
                serde_json::to_string(&progress.nameservers).unwrap_or_else(|_| "[]".into()),
            ),
            domain_expiry: progress.expiry.map(|expiry| expiry.to_string()),
            modified: Some(epoch_milli().to_string()),
            ..Default::default()
        };

        let mut conn = self.storage.write_conn().await?;
        storage::sites::compare_and_set(
            &mut conn,
            &self.site_id,
            &Status::ProvisioningDomain.to_string(),
            fields,
        )
        .await
    }
}

/// One deployment attempt. Owns the in-memory copy of the record and keeps it in step with
/// storage.
struct Run {
    state: Arc<ApiState>,
    site: Site,
    repository: String,
    token: CancellationToken,
    run_id: u64,
}

impl Run {
    async fn execute(mut self) -> Site {
        let permits = self.state.orchestrator.permits.clone();

        // Waiting for a permit is the one place a run can sit for a long time, so cancellation is
        // honoured here as well as between steps.
        let permit = tokio::select! {
            permit = permits.acquire_owned() => permit.ok(),
            _ = self.token.cancelled() => None,
        };

        let outcome = match permit {
            Some(_) => self.pipeline().await,
            None => Err(Failure::new(
                ErrorKind::CancelledError,
                "deployment was cancelled before it started",
            )),
        };

        if let Err(failure) = outcome {
            self.fail(failure).await;
        }

        drop(permit);

        self.state
            .orchestrator
            .finish(&self.site.site_id, self.run_id);

        match load_site(&self.state.storage, &self.site.site_id).await {
            Ok(site) => site,
            Err(e) => {
                warn!(site_id = %self.site.site_id, error = %e, "Could not reload site after run");
                self.site
            }
        }
    }

    async fn pipeline(&mut self) -> Result<(), Failure> {
        let state = self.state.clone();
        let config = &state.config.deployment;
        let policy = RetryPolicy::from(&config.retry);

        self.enter(Status::Fetching).await?;

        let fetcher = Fetcher::new(state.collaborators.object_store.clone(), policy);
        let (tree, bundle) = fetcher
            .fetch(
                &self.site.user_id,
                &self.site.site_url,
                Path::new(&config.work_dir),
                &self.site.site_id,
            )
            .await?;

        let result = self.with_tree(&tree, bundle).await;

        let path = tree.path().to_path_buf();
        if let Err(e) = tree.release() {
            error!(path = %path.display(), error = %e, "Could not remove working tree");
        }

        result
    }

    async fn with_tree(
        &mut self,
        tree: &WorkingTree,
        bundle: SiteBundle,
    ) -> Result<(), Failure> {
        let state = self.state.clone();
        let config = &state.config.deployment;
        let collaborators = &state.collaborators;
        let policy = RetryPolicy::from(&config.retry);

        self.enter(Status::Materializing).await?;

        let materialized = materialize(
            &state.templates,
            &config.default_template,
            &config.branch,
            &bundle,
            tree,
        )
        .await?;

        let first_time = !self.site.is_deployed;

        if first_time && self.site.domain_state != DomainState::DnsMigrated {
            self.enter(Status::ProvisioningDomain).await?;

            let provisioner = Provisioner::new(
                collaborators.registrar.clone(),
                policy.clone(),
                config.domain_years,
                config.domain_auto_renew,
            );
            let ledger = RecordLedger {
                storage: state.storage.clone(),
                site_id: self.site.site_id.clone(),
            };
            let started_unpurchased = matches!(
                self.site.domain_state,
                DomainState::None | DomainState::PurchasePending
            );

            let progress = provisioner
                .provision(
                    &self.site.site_url,
                    DomainProgress {
                        state: self.site.domain_state,
                        nameservers: self.site.nameservers.clone(),
                        expiry: self.site.domain_expiry,
                    },
                    &ledger,
                )
                .await?;

            self.site.domain_state = progress.state;
            self.site.nameservers = progress.nameservers.clone();
            self.site.domain_expiry = progress.expiry;

            if started_unpurchased {
                publish(
                    &self.state,
                    Kind::PurchasedDomain {
                        site_id: self.site.site_id.clone(),
                        domain: self.site.site_url.clone(),
                    },
                )
                .await;
            }

            publish(
                &self.state,
                Kind::MigratedDns {
                    site_id: self.site.site_id.clone(),
                    domain: self.site.site_url.clone(),
                    nameservers: progress.nameservers,
                },
            )
            .await;
        }

        self.enter(Status::Publishing).await?;

        let name = self.repository.clone();

        let publisher = Publisher::new(collaborators.source_host.clone(), policy.clone(), &config.branch);
        let published = publisher
            .publish(&name, &self.site.site_url, &materialized.site_dir)
            .await?;

        self.update(UpdatableFields {
            repository: Some(name.clone()),
            ..Default::default()
        })
        .await?;
        self.site.repository = Some(name.clone());

        publish(
            &self.state,
            Kind::PublishedSite {
                site_id: self.site.site_id.clone(),
                repository: name,
                commit: published.commit.id.clone(),
            },
        )
        .await;

        self.enter(Status::Linking).await?;

        let linker = Linker::new(
            collaborators.hosting.clone(),
            collaborators.source_host.clone(),
            policy,
            &config.branch,
        );
        let domain = first_time.then_some(self.site.site_url.as_str());
        let project = linker
            .link(&published.repo, &materialized.build, domain, &materialized.site_dir)
            .await?;

        self.succeed(project).await
    }

    /// Persists the move to `next` before the step it names begins.
    async fn enter(&mut self, next: Status) -> Result<(), Failure> {
        self.transition(next, UpdatableFields::default()).await?;

        publish(
            &self.state,
            Kind::EnteredStep {
                site_id: self.site.site_id.clone(),
                status: next,
            },
        )
        .await;

        info!(site_id = %self.site.site_id, step = %next, "Entered step");

        Ok(())
    }

    async fn transition(&mut self, next: Status, mut fields: UpdatableFields) -> Result<(), Failure> {
        if self.token.is_cancelled() {
            return Err(Failure::new(
                ErrorKind::CancelledError,
                format!("deployment was cancelled before {next}"),
            ));
        }

        if !self.site.status.can_transition_to(next) {
            return Err(Failure::new(
                ErrorKind::InternalError,
                format!("illegal status transition from {} to {next}", self.site.status),
            ));
        }

        let now = epoch_milli();
        fields.status = Some(next.to_string());
        fields.modified = Some(now.to_string());

        self.compare_and_set(fields).await?;

        self.site.status = next;
        self.site.modified = now;

        Ok(())
    }

    /// Updates fields without changing status.
    async fn update(&mut self, mut fields: UpdatableFields) -> Result<(), StorageError> {
        let now = epoch_milli();
        fields.modified = Some(now.to_string());
        self.compare_and_set(fields).await?;
        self.site.modified = now;
        Ok(())
    }

    async fn compare_and_set(&self, fields: UpdatableFields) -> Result<(), StorageError> {
        let mut conn = self.state.storage.write_conn().await?;
        storage::sites::compare_and_set(
            &mut conn,
            &self.site.site_id,
            &self.site.status.to_string(),
            fields,
        )
        .await
    }

    async fn succeed(&mut self, project: ProjectRef) -> Result<(), Failure> {
        let live_url = format!("https://{}", self.site.site_url);
        let deployed_at = self.site.deployed_at.unwrap_or_else(epoch_milli);

        self.transition(
            Status::Succeeded,
            UpdatableFields {
                is_deployed: Some(true),
                deployed_at: Some(deployed_at.to_string()),
                live_url: Some(live_url.clone()),
                hosting_url: Some(project.url.clone()),
                error: Some("null".into()),
                ..Default::default()
            },
        )
        .await?;

        self.site.is_deployed = true;
        self.site.deployed_at = Some(deployed_at);
        self.site.live_url = Some(live_url.clone());
        self.site.hosting_url = Some(project.url);
        self.site.error = None;

        publish(
            &self.state,
            Kind::CompletedDeployment {
                site_id: self.site.site_id.clone(),
                live_url: live_url.clone(),
            },
        )
        .await;

        info!(site_id = %self.site.site_id, live_url = %live_url, "Deployment succeeded");

        Ok(())
    }

    async fn fail(&mut self, failure: Failure) {
        let step = self.site.status;

        if !step.can_transition_to(Status::Failed) {
            error!(
                site_id = %self.site.site_id,
                step = %step,
                error = %failure.message,
                "Run failed in a status that can't move to failed"
            );
            return;
        }

        let error = DeploymentError {
            kind: failure.kind,
            message: failure.message,
            step,
            retryable: failure.kind.is_retryable(),
        };

        let fields = UpdatableFields {
            status: Some(Status::Failed.to_string()),
            error: Some(serialize_error(&error)),
            modified: Some(epoch_milli().to_string()),
            ..Default::default()
        };

        if let Err(e) = self.compare_and_set(fields).await {
            error!(
                site_id = %self.site.site_id,
                step = %step,
                error = %e,
                "Could not record deployment failure"
            );
            return;
        }

        warn!(
            site_id = %self.site.site_id,
            step = %step,
            kind = %error.kind,
            error = %error.message,
            "Deployment failed"
        );

        self.site.status = Status::Failed;
        self.site.error = Some(error.clone());

        publish(
            &self.state,
            Kind::FailedDeployment {
                site_id: self.site.site_id.clone(),
                step,
                kind: error.kind,
            },
        )
        .await;
    }
}
