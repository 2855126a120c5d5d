//! Publishes a materialized site to its source repository.

use crate::{
    retry::{retry, RetryPolicy, TimedOut, Transient},
    source_host::{CommitRef, PushRequest, RepoRef, SourceHost, SourceHostError},
};
use std::{path::Path, sync::Arc};
use tracing::{debug, info};

const USER_FRAGMENT_LEN: usize = 8;

const DEFAULT_GITIGNORE: &str = "node_modules/\n.next/\nout/\n.DS_Store\n*.log\n.env*\n";

#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum PublishError {
    #[error("{0}")]
    SourceHost(#[from] SourceHostError),

    #[error("{0}")]
    TimedOut(#[from] TimedOut),

    #[error("could not prepare tree for publishing; {0}")]
    Io(String),
}

impl Transient for PublishError {
    fn is_transient(&self) -> bool {
        match self {
            PublishError::SourceHost(SourceHostError::FailedPrecondition(_))
            | PublishError::SourceHost(SourceHostError::Io(_)) => false,
            PublishError::SourceHost(_) | PublishError::TimedOut(_) => true,
            PublishError::Io(_) => false,
        }
    }
}

/// The repository (and hosting project) name for a user's site.
///
/// `prefix` is lowercased with spaces turned into dashes and everything outside `[a-z0-9-]`
/// dropped. It's joined to the first eight alphanumeric characters of `user_id`.
pub fn repository_name(prefix: &str, user_id: &str) -> String {
    let prefix: String = prefix
        .trim()
        .to_lowercase()
        .replace(' ', "-")
        .chars()
        .filter(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || *c == '-')
        .collect();

    let fragment: String = user_id
        .chars()
        .filter(|c| c.is_ascii_alphanumeric())
        .take(USER_FRAGMENT_LEN)
        .collect::<String>()
        .to_lowercase();

    format!("{prefix}-{fragment}")
}

/// The configured project prefix, narrowed to a slot when the site has one.
pub fn slotted_prefix(project_prefix: &str, slot: Option<i64>) -> String {
    match slot {
        Some(slot) => format!("{project_prefix}-{slot}"),
        None => project_prefix.to_string(),
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Published {
    pub repo: RepoRef,
    pub commit: CommitRef,
}

#[derive(Debug, Clone)]
pub struct Publisher {
    host: Arc<dyn SourceHost>,
    policy: RetryPolicy,
    branch: String,
}

impl Publisher {
    pub fn new(host: Arc<dyn SourceHost>, policy: RetryPolicy, branch: &str) -> Self {
        Self {
            host,
            policy,
            branch: branch.to_string(),
        }
    }

    /// Creates the repository if needed and force pushes the whole of `site_dir` to the branch.
    /// Whatever was on the branch before is replaced.
    pub async fn publish(
        &self,
        name: &str,
        site_url: &str,
        site_dir: &Path,
    ) -> Result<Published, PublishError> {
        let host = &self.host;

        let repo = retry(&self.policy, "create repository", move || async move {
            host.create_repo(name).await.map_err(PublishError::from)
        })
        .await?;

        debug!(repository = %repo.name, url = %repo.url, "Repository ready");

        ensure_gitignore(site_dir).await?;

        let request = PushRequest {
            branch: self.branch.clone(),
            message: format!("Deploy {site_url}"),
            force: true,
            allow_empty: false,
        };

        let (repo_ref, request_ref) = (&repo, &request);
        let commit = retry(&self.policy, "push site", move || async move {
            host.push(repo_ref, site_dir, request_ref)
                .await
                .map_err(PublishError::from)
        })
        .await?;

        info!(repository = %repo.name, commit = %commit.id, branch = %self.branch, "Published site");

        Ok(Published { repo, commit })
    }
}

async fn ensure_gitignore(site_dir: &Path) -> Result<(), PublishError> {
    let path = site_dir.join(".gitignore");

    let exists = tokio::fs::try_exists(&path)
        .await
        .map_err(|e| PublishError::Io(e.to_string()))?;

    if exists {
        return Ok(());
    }

    tokio::fs::write(&path, DEFAULT_GITIGNORE)
        .await
        .map_err(|e| PublishError::Io(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source_host::memory;
    use rstest::rstest;
    use std::time::Duration;

    #[rstest]
    #[case("launchpad", "4f1c2a9e-77aa-4a43", "launchpad-4f1c2a9e")]
    #[case("Local Biz", "AB-cd_12.34ef56", "local-biz-abcd1234")]
    #[case("sites!@#", "abc", "sites-abc")]
    #[case("launchpad-3", "00000000-0000", "launchpad-3-00000000")]
    fn repository_names(#[case] prefix: &str, #[case] user_id: &str, #[case] expected: &str) {
        assert_eq!(repository_name(prefix, user_id), expected);
        assert_eq!(repository_name(prefix, user_id), repository_name(prefix, user_id));
    }

    #[test]
    fn slots_narrow_the_prefix() {
        assert_eq!(slotted_prefix("launchpad", Some(3)), "launchpad-3");
        assert_eq!(slotted_prefix("launchpad", None), "launchpad");
    }

    fn policy() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 2,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(2),
            multiplier: 2.0,
            attempt_timeout: Duration::from_secs(5),
        }
    }

    #[tokio::test]
    async fn republishing_replaces_history() {
        let host = Arc::new(memory::Engine::new());
        let publisher = Publisher::new(host.clone(), policy(), "main");
        let site = tempfile::tempdir().expect("Failed to create temporary directory");

        std::fs::write(site.path().join("index.html"), "v1").expect("Failed to write file");
        publisher
            .publish("launchpad-4f1c2a9e", "joes-pizza.com", site.path())
            .await
            .expect("Failed to publish");

        std::fs::write(site.path().join("index.html"), "v2").expect("Failed to write file");
        publisher
            .publish("launchpad-4f1c2a9e", "joes-pizza.com", site.path())
            .await
            .expect("Failed to publish");

        let repo = host
            .repository("launchpad-4f1c2a9e")
            .expect("repository should exist");

        assert_eq!(host.create_calls(), 2);
        assert_eq!(repo.commits.len(), 1);

        let commit = &repo.commits[0];
        assert!(commit.forced);
        assert_eq!(commit.message, "Deploy joes-pizza.com");
        assert_eq!(commit.branch, "main");
        assert_eq!(commit.files.get("index.html"), Some(&b"v2".to_vec()));
        assert!(commit.files.contains_key(".gitignore"));
    }

    #[tokio::test]
    async fn existing_gitignore_is_kept() {
        let host = Arc::new(memory::Engine::new());
        let publisher = Publisher::new(host.clone(), policy(), "main");
        let site = tempfile::tempdir().expect("Failed to create temporary directory");
        std::fs::write(site.path().join(".gitignore"), "dist/\n").expect("Failed to write file");

        publisher
            .publish("launchpad-4f1c2a9e", "joes-pizza.com", site.path())
            .await
            .expect("Failed to publish");

        let repo = host
            .repository("launchpad-4f1c2a9e")
            .expect("repository should exist");
        assert_eq!(
            repo.commits[0].files.get(".gitignore"),
            Some(&b"dist/\n".to_vec())
        );
    }
}
