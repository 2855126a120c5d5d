//! Binds the published repository to a hosting project and makes sure a build fires.

use crate::{
    hosting::{BuildConfig, Hosting, HostingError, ProjectRef},
    retry::{retry, RetryPolicy, TimedOut, Transient},
    source_host::{PushRequest, RepoRef, SourceHost, SourceHostError},
};
use std::{path::Path, sync::Arc};
use tracing::{debug, info};

pub const TRIGGER_COMMIT_MESSAGE: &str = "chore: trigger deploy";

#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum LinkError {
    #[error("{0}")]
    Hosting(#[from] HostingError),

    #[error("could not push build trigger; {0}")]
    Trigger(#[from] SourceHostError),

    #[error("{0}")]
    TimedOut(#[from] TimedOut),
}

impl Transient for LinkError {
    fn is_transient(&self) -> bool {
        match self {
            LinkError::Hosting(HostingError::FailedPrecondition(_)) => false,
            LinkError::Trigger(SourceHostError::FailedPrecondition(_))
            | LinkError::Trigger(SourceHostError::Io(_)) => false,
            _ => true,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Linker {
    hosting: Arc<dyn Hosting>,
    source_host: Arc<dyn SourceHost>,
    policy: RetryPolicy,
    branch: String,
}

impl Linker {
    pub fn new(
        hosting: Arc<dyn Hosting>,
        source_host: Arc<dyn SourceHost>,
        policy: RetryPolicy,
        branch: &str,
    ) -> Self {
        Self {
            hosting,
            source_host,
            policy,
            branch: branch.to_string(),
        }
    }

    /// Looks up or creates the project named after the repository, attaches `domain` when one is
    /// given, then pushes an empty commit so the provider builds what's there now.
    pub async fn link(
        &self,
        repo: &RepoRef,
        build: &BuildConfig,
        domain: Option<&str>,
        site_dir: &Path,
    ) -> Result<ProjectRef, LinkError> {
        let hosting = &self.hosting;
        let name = repo.name.as_str();

        let project = retry(&self.policy, "create hosting project", move || async move {
            hosting
                .create_project(name, repo, build)
                .await
                .map_err(LinkError::from)
        })
        .await?;

        debug!(project = %project.name, url = %project.url, "Hosting project ready");

        if let Some(domain) = domain {
            let project_ref = &project;
            retry(&self.policy, "attach domain", move || async move {
                hosting
                    .attach_domain(project_ref, domain)
                    .await
                    .map_err(LinkError::from)
            })
            .await?;

            info!(project = %project.name, domain = domain, "Attached custom domain");
        }

        let source_host = &self.source_host;
        let request = PushRequest {
            branch: self.branch.clone(),
            message: TRIGGER_COMMIT_MESSAGE.into(),
            force: false,
            allow_empty: true,
        };
        let request_ref = &request;

        let commit = retry(&self.policy, "push build trigger", move || async move {
            source_host
                .push(repo, site_dir, request_ref)
                .await
                .map_err(LinkError::from)
        })
        .await?;

        debug!(project = %project.name, commit = %commit.id, "Pushed build trigger");

        Ok(project)
    }
}
