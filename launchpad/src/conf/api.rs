use crate::{hosting, object_store, registrar, source_host};
use serde::Deserialize;

#[derive(Deserialize, Default, Debug, Clone, PartialEq)]
pub struct ApiConfig {
    pub general: General,
    pub server: Server,
    pub deployment: Deployment,
    pub object_store: ObjectStore,
    pub registrar: Registrar,
    pub source_host: SourceHost,
    pub hosting: Hosting,
}

#[derive(Deserialize, Default, Debug, Clone, PartialEq, Eq)]
pub struct General {
    /// Turns on humanized log output and other conveniences for development.
    pub dev_mode: bool,
    pub log_level: String,

    /// How long events are kept in seconds.
    pub event_log_retention: u64,

    /// How often the event pruner runs in seconds.
    pub event_prune_interval: u64,
}

#[derive(Deserialize, Default, Debug, Clone, PartialEq, Eq)]
pub struct Server {
    /// Must be in the form `<ip>:<port>`.
    pub bind_address: String,
    pub storage_path: String,
    pub storage_max_read_connections: u32,
}

#[derive(Deserialize, Default, Debug, Clone, PartialEq)]
pub struct Deployment {
    /// Leading part of every repository and hosting project name.
    pub project_prefix: String,

    /// Working trees are created under here, one per attempt.
    pub work_dir: String,
    pub templates_dir: String,

    /// Used when a site's configuration doesn't name a template.
    pub default_template: String,
    pub branch: String,

    /// Runs over this limit wait in `queued` for a free permit.
    pub max_concurrent_deployments: usize,
    pub slot_capacity: u32,
    pub domain_years: u32,
    pub domain_auto_renew: bool,
    pub retry: Retry,
}

#[derive(Deserialize, Default, Debug, Clone, PartialEq)]
pub struct Retry {
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub multiplier: f64,
    pub attempt_timeout_secs: u64,
}

#[derive(Deserialize, Default, Debug, Clone, PartialEq, Eq)]
pub struct ObjectStore {
    pub engine: object_store::Engine,
    pub filesystem: Option<object_store::filesystem::Config>,
}

#[derive(Deserialize, Default, Debug, Clone, PartialEq, Eq)]
pub struct Registrar {
    pub engine: registrar::Engine,
    pub memory: Option<registrar::memory::Config>,
}

#[derive(Deserialize, Default, Debug, Clone, PartialEq, Eq)]
pub struct SourceHost {
    pub engine: source_host::Engine,
    pub git: Option<source_host::git::Config>,
}

#[derive(Deserialize, Default, Debug, Clone, PartialEq, Eq)]
pub struct Hosting {
    pub engine: hosting::Engine,
    pub memory: Option<hosting::memory::Config>,
}
