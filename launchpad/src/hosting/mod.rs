pub mod memory;

use crate::source_host::RepoRef;
use async_trait::async_trait;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::{fmt::Debug, sync::Arc};
use strum::{Display, EnumString};

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum HostingError {
    #[error("could not reach hosting provider; {0}")]
    Connection(String),

    #[error("hosting provider rejected request; {0}")]
    Api(String),

    #[error("hosting project '{0}' not found")]
    ProjectNotFound(String),

    #[error("could not init hosting provider; {0}")]
    FailedPrecondition(String),
}

/// How the hosting provider turns the repository into static files.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct BuildConfig {
    pub build_command: String,

    /// Directory, relative to `root_dir`, holding the exported site after the build.
    pub destination_dir: String,
    pub root_dir: String,
    pub production_branch: String,
}

impl Default for BuildConfig {
    fn default() -> Self {
        Self {
            build_command: "npm run build".into(),
            destination_dir: "out".into(),
            root_dir: String::new(),
            production_branch: "main".into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProjectRef {
    pub name: String,

    /// The provider assigned address the project is served on before any custom domain.
    pub url: String,
}

/// An edge hosting provider that builds and serves sites from a repository.
#[async_trait]
pub trait Hosting: Debug + Send + Sync + 'static {
    /// Returns the project named `name`, creating it bound to `repo` if it doesn't exist.
    async fn create_project(
        &self,
        name: &str,
        repo: &RepoRef,
        build: &BuildConfig,
    ) -> Result<ProjectRef, HostingError>;

    /// Attaching a domain that's already attached succeeds.
    async fn attach_domain(&self, project: &ProjectRef, domain: &str) -> Result<(), HostingError>;
}

#[derive(Debug, Clone, Default, Deserialize, PartialEq, Eq, Display, EnumString)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum Engine {
    #[default]
    Memory,
}

pub fn new(config: &crate::conf::api::Hosting) -> Result<Arc<dyn Hosting>, HostingError> {
    #[allow(clippy::match_single_binding)]
    match config.engine {
        Engine::Memory => {
            let settings = config.memory.clone().unwrap_or_default();
            Ok(Arc::new(memory::Engine::new(&settings)))
        }
    }
}
