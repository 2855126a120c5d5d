pub mod event_utils;
pub mod events;
pub mod sites;
pub mod system;
pub mod templates;
pub mod validate;

use crate::{
    conf, hosting, object_store, orchestrator::Orchestrator, registrar, source_host, storage,
    templates::TemplateRegistry,
};
use anyhow::{anyhow, Context, Result};
use dropshot::{
    ApiDescription, ConfigDropshot, ConfigLogging, ConfigLoggingLevel, HttpServer, ServerBuilder,
};
use std::{
    path::Path,
    str::FromStr,
    sync::Arc,
    time::{SystemTime, UNIX_EPOCH},
};
use tracing::{error, info};

pub const BUILD_SEMVER: &str = env!("BUILD_SEMVER");
pub const BUILD_COMMIT: &str = env!("BUILD_COMMIT");

/// Return the current epoch time in milliseconds.
pub fn epoch_milli() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_millis() as u64)
        .unwrap_or_default()
}

/// Logs the full error and hands the caller back an internal error carrying only `msg`.
#[macro_export]
macro_rules! http_error {
    ($msg:expr, $request_id:expr, $err:expr) => {{
        let err: Option<anyhow::Error> = $err;
        tracing::error!(
            message = $msg,
            request_id = %$request_id,
            error = ?err,
        );
        dropshot::HttpError::for_internal_error(format!("{}; request_id: {}", $msg, $request_id))
    }};
}

/// The external systems a deployment talks to.
#[derive(Debug, Clone)]
pub struct Collaborators {
    pub object_store: Arc<dyn object_store::ObjectStore>,
    pub registrar: Arc<dyn registrar::Registrar>,
    pub source_host: Arc<dyn source_host::SourceHost>,
    pub hosting: Arc<dyn hosting::Hosting>,
}

impl Collaborators {
    pub async fn from_config(config: &conf::api::ApiConfig) -> Result<Self> {
        let object_store = object_store::new(&config.object_store)
            .await
            .context("Could not initialize object store")?;

        let registrar =
            registrar::new(&config.registrar).context("Could not initialize registrar")?;

        let source_host =
            source_host::new(&config.source_host).context("Could not initialize source host")?;

        let hosting = hosting::new(&config.hosting).context("Could not initialize hosting")?;

        Ok(Self {
            object_store,
            registrar,
            source_host,
            hosting,
        })
    }
}

/// Everything endpoints and deployment runs share.
#[derive(Debug)]
pub struct ApiState {
    /// Various configurations needed by the api
    pub config: conf::api::ApiConfig,

    /// Holds every site record and the event history.
    pub storage: storage::Db,

    /// Used throughout the whole application in order to allow functions to wait on state changes.
    pub event_bus: event_utils::EventBus,

    pub templates: TemplateRegistry,

    pub collaborators: Collaborators,

    pub orchestrator: Orchestrator,
}

impl ApiState {
    pub async fn new(config: conf::api::ApiConfig) -> Result<Self> {
        let collaborators = Collaborators::from_config(&config).await?;
        Self::from_parts(config, collaborators).await
    }

    /// Builds state around collaborators the caller already has.
    pub async fn from_parts(config: conf::api::ApiConfig, collaborators: Collaborators) -> Result<Self> {
        let storage = storage::Db::new(
            &config.server.storage_path,
            config.server.storage_max_read_connections.max(1),
        )
        .await
        .with_context(|| format!("Could not open database at '{}'", config.server.storage_path))?;

        let event_bus = event_utils::EventBus::new(
            storage.clone(),
            config.general.event_log_retention,
            config.general.event_prune_interval,
        );

        let templates = TemplateRegistry::load(Path::new(&config.deployment.templates_dir))
            .context("Could not load templates")?;

        let orchestrator = Orchestrator::new(config.deployment.max_concurrent_deployments);

        Ok(Self {
            config,
            storage,
            event_bus,
            templates,
            collaborators,
            orchestrator,
        })
    }
}

/// Every endpoint the service exposes.
pub fn init_api() -> Result<ApiDescription<Arc<ApiState>>> {
    let mut api = ApiDescription::new();

    /* /api/system */
    api.register(system::get_system_metadata)
        .map_err(|e| anyhow!("could not register endpoint; {e}"))?;
    api.register(system::get_health)
        .map_err(|e| anyhow!("could not register endpoint; {e}"))?;

    /* /api/templates */
    api.register(templates::list_templates)
        .map_err(|e| anyhow!("could not register endpoint; {e}"))?;

    /* /api/sites */
    api.register(sites::list_sites)
        .map_err(|e| anyhow!("could not register endpoint; {e}"))?;
    api.register(sites::create_site)
        .map_err(|e| anyhow!("could not register endpoint; {e}"))?;
    api.register(sites::get_site)
        .map_err(|e| anyhow!("could not register endpoint; {e}"))?;
    api.register(sites::deploy_site)
        .map_err(|e| anyhow!("could not register endpoint; {e}"))?;
    api.register(sites::cancel_deployment)
        .map_err(|e| anyhow!("could not register endpoint; {e}"))?;

    /* /api/sites/{site_id}/events */
    api.register(events::list_site_events)
        .map_err(|e| anyhow!("could not register endpoint; {e}"))?;

    Ok(api)
}

pub fn write_openapi_spec(path: std::path::PathBuf) -> Result<()> {
    let api = init_api()?;

    if let Some(parent) = path.parent().filter(|parent| !parent.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Could not create directory '{}'", parent.display()))?;
    }

    let mut file = std::fs::File::create(&path)
        .with_context(|| format!("Could not create file '{}'", path.display()))?;

    let version = semver::Version::parse(BUILD_SEMVER)
        .with_context(|| format!("Build version '{BUILD_SEMVER}' is not semver"))?;

    api.openapi("Launchpad", version)
        .write(&mut file)
        .context("Could not write openapi spec")?;

    Ok(())
}

/// Recovers anything a previous process left behind, then serves the api until a shutdown signal
/// arrives.
pub async fn start_web_service(api_state: Arc<ApiState>) -> Result<()> {
    let bind_address = std::net::SocketAddr::from_str(&api_state.config.server.bind_address)
        .with_context(|| {
            format!(
                "Could not parse url '{}' while trying to bind binary to port; \
        should be in format '<ip>:<port>'; Please be sure to use an ip instead of something like 'localhost', \
        when attempting to bind",
                &api_state.config.server.bind_address
            )
        })?;

    api_state
        .orchestrator
        .recover(&api_state)
        .await
        .context("Could not recover interrupted deployments")?;

    let dropshot_conf = ConfigDropshot {
        bind_address,
        ..Default::default()
    };

    let log = ConfigLogging::StderrTerminal {
        level: if api_state.config.general.dev_mode {
            ConfigLoggingLevel::Debug
        } else {
            ConfigLoggingLevel::Info
        },
    }
    .to_logger("launchpad")
    .map_err(|error| anyhow!("failed to create logger: {}", error))?;

    let api = init_api()?;

    let server = ServerBuilder::new(api, api_state, log)
        .config(dropshot_conf)
        .start()
        .map_err(|error| anyhow!("failed to create server: {}", error))?;

    let shutdown = server.wait_for_shutdown();

    tokio::spawn(wait_for_shutdown_signal(server));

    info!(
        message = "Started Launchpad http service",
        host = %bind_address.ip(),
        port = %bind_address.port(),
    );

    shutdown
        .await
        .map_err(|error| anyhow!("Server encountered errors while running; {:#?}", error))
}

async fn wait_for_shutdown_signal(server: HttpServer<Arc<ApiState>>) {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!("Shutdown signal received; stopping http service");

    if let Err(e) = server.close().await {
        error!(error = %e, "Http service did not shut down cleanly");
    }
}
