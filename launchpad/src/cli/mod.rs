mod client;
mod service;
mod site;
mod template;

use crate::{
    api::sites::Status,
    conf::{self, cli::CliConfig},
};
use anyhow::{anyhow, Context, Result};
use chrono_humanize::{Accuracy, HumanTime, Tense};
use clap::{Parser, Subcommand};
use colored::{ColoredString, Colorize};
use std::time::{SystemTime, UNIX_EPOCH};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser, Clone)]
#[clap(name = "launchpad")]
#[clap(about = "Launchpad turns a site configuration into a live website.")]
#[clap(
    long_about = "Launchpad turns a site configuration into a live website.\n\n It fetches a site's \
    uploaded configuration, renders it into a template, buys and configures the site's domain on first \
    deploy, publishes the result to a repository and links that repository to a hosting provider.\n\n \
    Deploys are safe to repeat; a site that is already live only has its content republished."
)]
#[clap(version)]
pub struct Args {
    /// Set configuration path; if empty default paths are used
    #[clap(long, value_name = "PATH")]
    pub config_path: Option<String>,

    /// Address of the Launchpad service; overrides configuration.
    #[clap(long, global = true)]
    pub server: Option<String>,

    /// Show absolute times and extra columns.
    #[clap(long, global = true)]
    pub detail: bool,

    #[clap(subcommand)]
    pub command: Commands,
}

#[derive(Debug, Subcommand, Clone)]
pub enum Commands {
    /// Manages service related commands pertaining to administration.
    Service(service::ServiceSubcommands),

    /// Register, deploy and inspect sites.
    Site(site::SiteSubcommands),

    /// List the templates sites can be rendered with.
    Template(template::TemplateSubcommands),
}

#[derive(Debug)]
pub struct Cli {
    pub args: Args,
    pub conf: CliConfig,
    pub client: client::Client,
}

impl Cli {
    pub fn new() -> Result<Self> {
        let args = Args::parse();

        let mut conf: CliConfig = conf::Kind::Cli
            .parse(args.config_path.as_deref())
            .context("Could not parse cli configuration")?;

        if let Some(server) = &args.server {
            conf.server.clone_from(server);
        }

        if args.detail {
            conf.detail = true;
        }

        let client = client::Client::new(&conf.server)?;

        Ok(Self { args, conf, client })
    }

    pub async fn run(&mut self) -> Result<()> {
        match self.args.command.clone() {
            Commands::Service(service) => self.handle_service_subcommands(service).await,
            Commands::Site(site) => self.handle_site_subcommands(site).await,
            Commands::Template(template) => self.handle_template_subcommands(template).await,
        }
    }

    /// Relative time by default, absolute when the user asked for detail.
    fn format_time(&self, epoch_milli: u64) -> Option<String> {
        if epoch_milli == 0 {
            return None;
        }

        if self.conf.detail {
            return chrono::DateTime::from_timestamp_millis(epoch_milli as i64)
                .map(|time| time.to_rfc2822());
        }

        humanize_relative_duration(epoch_milli)
    }
}

/// Sets up the global tracing subscriber. `RUST_LOG` wins over `log_level` when set.
pub fn init_logger(log_level: &str, pretty: bool) -> Result<()> {
    let filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => EnvFilter::try_new(log_level)
            .with_context(|| format!("Could not parse log_level '{log_level}'"))?,
    };

    let builder = tracing_subscriber::fmt().with_env_filter(filter);

    let result = if pretty {
        builder.pretty().try_init()
    } else {
        builder.json().try_init()
    };

    result.map_err(|e| anyhow!("Could not initialize logger; {e}"))
}

fn epoch_milli() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_millis() as u64)
        .unwrap_or_default()
}

/// Transforms the given time into a humanized duration string from the current time.
/// (i.e. 'about an hour ago')
fn humanize_relative_duration(time: u64) -> Option<String> {
    if time == 0 {
        return None;
    }

    let time_diff = epoch_milli().saturating_sub(time);
    let time_diff_duration = chrono::Duration::milliseconds(-(time_diff as i64));
    Some(HumanTime::from(time_diff_duration).to_string())
}

/// Transforms the given two time intervals into a humanized duration string.
fn humanize_absolute_duration(start: u64, end: u64) -> String {
    // An unset end means whatever we're measuring is still going.
    let end = if end == 0 { epoch_milli() } else { end };

    if end < start {
        return "0s".to_string();
    }

    let time_diff_duration = chrono::Duration::milliseconds((end - start) as i64);
    HumanTime::from(time_diff_duration).to_text_en(Accuracy::Precise, Tense::Present)
}

fn colorize_status_text(status: Status) -> ColoredString {
    let text = status.to_string().to_uppercase();

    match status {
        Status::Created => text.normal(),
        Status::Succeeded => text.green(),
        Status::Failed => text.red(),
        _ => text.yellow(),
    }
}

fn colorize_status_text_comfy(status: Status) -> comfy_table::Cell {
    let cell = comfy_table::Cell::new(status.to_string().to_uppercase());

    match status {
        Status::Created => cell,
        Status::Succeeded => cell.fg(comfy_table::Color::Green),
        Status::Failed => cell.fg(comfy_table::Color::Red),
        _ => cell.fg(comfy_table::Color::Yellow),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reversed_durations_are_zero() {
        assert_eq!(humanize_absolute_duration(5_000, 1_000), "0s");
    }

    #[test]
    fn unset_times_have_no_relative_form() {
        assert_eq!(humanize_relative_duration(0), None);
        assert!(humanize_relative_duration(epoch_milli()).is_some());
    }
}
