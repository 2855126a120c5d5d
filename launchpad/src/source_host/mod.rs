pub mod git;
pub mod memory;

use async_trait::async_trait;
use serde::Deserialize;
use std::{fmt::Debug, path::Path, sync::Arc};
use strum::{Display, EnumString};

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum SourceHostError {
    #[error("could not reach source host; {0}")]
    Connection(String),

    /// The host answered but refused or failed the request; auth problems land here too.
    #[error("source host rejected request; {0}")]
    Api(String),

    #[error("command '{command}' failed; {stderr}")]
    CommandFailed { command: String, stderr: String },

    #[error("could not read working tree; {0}")]
    Io(String),

    #[error("could not init source host; {0}")]
    FailedPrecondition(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RepoRef {
    pub name: String,

    /// Where the repository can be pushed to or cloned from.
    pub url: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PushRequest {
    pub branch: String,
    pub message: String,

    /// Overwrite whatever history the remote branch has.
    pub force: bool,

    /// Commit even when the tree is unchanged since the last commit.
    pub allow_empty: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommitRef {
    pub id: String,
}

/// A source control host that repositories are published to.
#[async_trait]
pub trait SourceHost: Debug + Send + Sync + 'static {
    /// Creates the repository if it doesn't exist yet; an existing repository is returned as is.
    async fn create_repo(&self, name: &str) -> Result<RepoRef, SourceHostError>;

    /// Commits the full contents of `tree` and pushes it to `request.branch`.
    async fn push(
        &self,
        repo: &RepoRef,
        tree: &Path,
        request: &PushRequest,
    ) -> Result<CommitRef, SourceHostError>;
}

#[derive(Debug, Clone, Default, Deserialize, PartialEq, Eq, Display, EnumString)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum Engine {
    #[default]
    Git,
    Memory,
}

pub fn new(config: &crate::conf::api::SourceHost) -> Result<Arc<dyn SourceHost>, SourceHostError> {
    match config.engine {
        Engine::Git => {
            let Some(settings) = &config.git else {
                return Err(SourceHostError::FailedPrecondition(
                    "Git engine settings not found in config".into(),
                ));
            };

            Ok(Arc::new(git::Engine::new(settings)?))
        }
        Engine::Memory => Ok(Arc::new(memory::Engine::new())),
    }
}
