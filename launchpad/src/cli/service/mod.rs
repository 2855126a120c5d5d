use crate::{
    api::{start_web_service, ApiState},
    cli::{init_logger, Cli},
    conf::{self, api::ApiConfig},
};
use anyhow::{Context, Result};
use clap::{Args, Subcommand};
use colored::Colorize;
use std::sync::Arc;

#[derive(Debug, Args, Clone)]
pub struct ServiceSubcommands {
    #[clap(subcommand)]
    pub command: ServiceCommands,
}

#[derive(Debug, Subcommand, Clone)]
pub enum ServiceCommands {
    /// Start the Launchpad API server.
    Start,

    /// Show the version and health of a running server.
    Info,
}

impl Cli {
    pub async fn handle_service_subcommands(&self, command: ServiceSubcommands) -> Result<()> {
        let cmds = command.command;
        match cmds {
            ServiceCommands::Start => self.service_start().await,
            ServiceCommands::Info => self.service_info().await,
        }
    }

    async fn service_start(&self) -> Result<()> {
        let config: ApiConfig = conf::Kind::Api
            .parse(self.args.config_path.as_deref())
            .context("Could not parse api configuration")?;

        init_logger(&config.general.log_level, config.general.dev_mode)?;

        let api_state = ApiState::new(config)
            .await
            .context("Could not initialize api state")?;

        start_web_service(Arc::new(api_state)).await
    }

    async fn service_info(&self) -> Result<()> {
        let metadata = self
            .client
            .get_system_metadata()
            .await
            .context("Could not successfully retrieve metadata from Launchpad api")?;

        let health = self
            .client
            .get_health()
            .await
            .context("Could not successfully retrieve health from Launchpad api")?;

        println!(
            "Launchpad {} ({}) at {}",
            metadata.semver.green(),
            metadata.commit.trim(),
            self.conf.server
        );
        println!(
            "  {} active deployments, {} templates loaded",
            health.active_deployments, health.templates
        );

        Ok(())
    }
}
