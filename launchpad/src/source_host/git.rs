//! Publishes to bare git repositories on the local disk using the `git` binary.

use super::{CommitRef, PushRequest, RepoRef, SourceHost, SourceHostError};
use async_trait::async_trait;
use serde::Deserialize;
use std::{
    path::{Path, PathBuf},
    process::Stdio,
};
use tokio::process::Command;
use tracing::debug;

#[derive(Deserialize, Default, Debug, Clone, PartialEq, Eq)]
pub struct Config {
    /// Directory that holds one bare repository per site.
    pub repos_path: String,
    pub author_name: String,
    pub author_email: String,
}

#[derive(Debug)]
pub struct Engine {
    repos_path: PathBuf,
    author_name: String,
    author_email: String,
}

impl Engine {
    pub fn new(config: &Config) -> Result<Self, SourceHostError> {
        std::fs::create_dir_all(&config.repos_path).map_err(|e| {
            SourceHostError::FailedPrecondition(format!(
                "could not create repository directory '{}'; {e}",
                config.repos_path
            ))
        })?;

        Ok(Self {
            repos_path: PathBuf::from(&config.repos_path),
            author_name: config.author_name.clone(),
            author_email: config.author_email.clone(),
        })
    }

    async fn git(&self, dir: &Path, args: &[&str]) -> Result<String, SourceHostError> {
        let mut cmd = Command::new("git");
        cmd.arg("-c")
            .arg(format!("user.name={}", self.author_name))
            .arg("-c")
            .arg(format!("user.email={}", self.author_email))
            .args(args)
            .current_dir(dir)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        debug!(command = ?cmd, "Running git");

        let output = cmd
            .output()
            .await
            .map_err(|e| SourceHostError::Connection(format!("could not run git; {e}")))?;

        if !output.status.success() {
            return Err(SourceHostError::CommandFailed {
                command: format!("git {}", args.join(" ")),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }

        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }
}

#[async_trait]
impl SourceHost for Engine {
    async fn create_repo(&self, name: &str) -> Result<RepoRef, SourceHostError> {
        let path = self.repos_path.join(format!("{name}.git"));
        let url = path.to_string_lossy().to_string();

        if path.join("HEAD").exists() {
            return Ok(RepoRef {
                name: name.to_string(),
                url,
            });
        }

        tokio::fs::create_dir_all(&path)
            .await
            .map_err(|e| SourceHostError::Io(e.to_string()))?;

        self.git(&path, &["init", "--bare", "--quiet"]).await?;

        Ok(RepoRef {
            name: name.to_string(),
            url,
        })
    }

    async fn push(
        &self,
        repo: &RepoRef,
        tree: &Path,
        request: &PushRequest,
    ) -> Result<CommitRef, SourceHostError> {
        if !tree.join(".git").exists() {
            self.git(tree, &["init", "--quiet"]).await?;
        }

        self.git(tree, &["add", "--all"]).await?;

        // A retry after a failed push finds its commit already made; only the push is repeated.
        let pending = self.git(tree, &["status", "--porcelain"]).await?;
        if !pending.is_empty() || request.allow_empty {
            let mut commit_args = vec!["commit", "--quiet", "-m", request.message.as_str()];
            if request.allow_empty {
                commit_args.push("--allow-empty");
            }
            self.git(tree, &commit_args).await?;
        }

        self.git(tree, &["branch", "-M", request.branch.as_str()])
            .await?;

        let refspec = format!("HEAD:refs/heads/{}", request.branch);
        let mut push_args = vec!["push", "--quiet"];
        if request.force {
            push_args.push("--force");
        }
        push_args.push(repo.url.as_str());
        push_args.push(refspec.as_str());
        self.git(tree, &push_args).await?;

        let id = self.git(tree, &["rev-parse", "HEAD"]).await?;

        Ok(CommitRef { id })
    }
}
