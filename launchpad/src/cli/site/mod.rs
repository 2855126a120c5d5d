use crate::{
    api::{
        event_utils::Kind,
        sites::{CreateSiteRequest, Site, Status},
    },
    cli::{colorize_status_text, colorize_status_text_comfy, epoch_milli, humanize_absolute_duration, Cli},
};
use anyhow::{bail, Context, Result};
use clap::{Args, Subcommand};
use colored::Colorize;
use comfy_table::{presets::ASCII_MARKDOWN, Cell, CellAlignment, Color, ContentArrangement};
use std::time::Duration;

const POLL_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Debug, Args, Clone)]
pub struct SiteSubcommands {
    #[clap(subcommand)]
    pub command: SiteCommands,
}

#[derive(Debug, Subcommand, Clone)]
pub enum SiteCommands {
    /// List all sites.
    List {
        #[arg(long, default_value_t = 50)]
        limit: u64,

        #[arg(long, default_value_t = 0)]
        offset: u64,
    },

    /// Fetch information about an individual site.
    Get {
        /// Site Identifier.
        id: String,
    },

    /// Register a new site.
    ///
    /// The site's configuration must be uploaded to the object store under
    /// `private/<user_id>/<site_url>/site.json` before it can be deployed.
    Create {
        /// Owner of the site.
        user_id: String,

        /// Domain the site will be served on, e.g. joes-pizza.com
        site_url: String,

        /// Optional capacity slot; narrows the repository name.
        #[arg(long)]
        slot: Option<u32>,
    },

    /// Deploy a site.
    ///
    /// The first deploy buys the domain and attaches it to the hosting project. Every later
    /// deploy only republishes content.
    Deploy {
        /// Site Identifier.
        id: String,

        /// Short note recorded with the deployment.
        #[arg(short, long)]
        reason: Option<String>,

        /// Wait for the deployment to finish, printing each step as it starts.
        #[arg(short, long)]
        wait: bool,
    },

    /// Cancel a site's active deployment at its next step.
    Cancel {
        /// Site Identifier.
        id: String,
    },

    /// List a site's event history, oldest first.
    Events {
        /// Site Identifier.
        id: String,

        #[arg(long, default_value_t = 100)]
        limit: u64,
    },
}

impl Cli {
    pub async fn handle_site_subcommands(&self, command: SiteSubcommands) -> Result<()> {
        let cmds = command.command;
        match cmds {
            SiteCommands::List { limit, offset } => self.site_list(limit, offset).await,
            SiteCommands::Get { id } => self.site_get(&id).await,
            SiteCommands::Create {
                user_id,
                site_url,
                slot,
            } => self.site_create(&user_id, &site_url, slot).await,
            SiteCommands::Deploy { id, reason, wait } => self.site_deploy(&id, reason, wait).await,
            SiteCommands::Cancel { id } => self.site_cancel(&id).await,
            SiteCommands::Events { id, limit } => self.site_events(&id, limit).await,
        }
    }

    pub async fn site_list(&self, limit: u64, offset: u64) -> Result<()> {
        let sites = self
            .client
            .list_sites(limit, offset)
            .await
            .context("Could not successfully retrieve sites from Launchpad api")?;

        if sites.is_empty() {
            println!("No sites found.");
            return Ok(());
        }

        let mut headers = vec!["id", "site url", "status", "live", "modified"];
        if self.conf.detail {
            headers.extend(["repository", "attempts"]);
        }

        let mut table = comfy_table::Table::new();
        table
            .load_preset(ASCII_MARKDOWN)
            .set_content_arrangement(ContentArrangement::Dynamic)
            .set_header(headers.into_iter().map(|header| {
                Cell::new(header)
                    .set_alignment(CellAlignment::Center)
                    .fg(Color::Blue)
            }));

        for site in sites {
            let mut row = vec![
                Cell::new(&site.site_id).fg(Color::Green),
                Cell::new(&site.site_url),
                colorize_status_text_comfy(site.status),
                Cell::new(if site.is_deployed { "yes" } else { "no" }),
                Cell::new(
                    self.format_time(site.modified)
                        .unwrap_or_else(|| "Unknown".to_string()),
                ),
            ];

            if self.conf.detail {
                row.push(Cell::new(site.repository.as_deref().unwrap_or("-")));
                row.push(Cell::new(site.attempts));
            }

            table.add_row(row);
        }

        println!("{}", &table.to_string());
        Ok(())
    }

    pub async fn site_get(&self, id: &str) -> Result<()> {
        let site = self
            .client
            .get_site(id)
            .await
            .context("Could not successfully retrieve site from Launchpad api")?;

        self.print_site(&site);
        Ok(())
    }

    fn print_site(&self, site: &Site) {
        println!(
            "[{}] {} :: {}",
            site.site_id.green(),
            site.site_url.bold(),
            colorize_status_text(site.status)
        );
        println!();
        println!("  Owner: {}", site.user_id);

        if let Some(slot) = site.slot {
            println!("  Slot: {slot}");
        }

        if let Some(live_url) = &site.live_url {
            println!("  Live at: {}", live_url.cyan());
        }

        if let Some(hosting_url) = &site.hosting_url {
            println!("  Hosting url: {hosting_url}");
        }

        if let Some(repository) = &site.repository {
            println!("  Repository: {repository}");
        }

        println!("  Domain: {}", site.domain_state);
        if !site.nameservers.is_empty() {
            println!("  Nameservers: {}", site.nameservers.join(", "));
        }

        if let Some(expiry) = site.domain_expiry.and_then(|expiry| self.format_time(expiry)) {
            println!("  Domain expires: {expiry}");
        }

        if let Some(deployed_at) = site.deployed_at.and_then(|at| self.format_time(at)) {
            println!("  First deployed: {deployed_at}");
        }

        println!(
            "  Deploy attempts: {}{}",
            site.attempts,
            site.last_reason
                .as_ref()
                .map(|reason| format!(" (last: {reason})"))
                .unwrap_or_default()
        );

        if let Some(error) = &site.error {
            println!();
            println!(
                "  {} {} while {}{}",
                "x".red(),
                error.kind.to_string().red(),
                error.step,
                if error.retryable { "; retryable" } else { "" }
            );
            println!("    {}", error.message);
        }

        println!();
        println!(
            "Created {} | Modified {}",
            self.format_time(site.created)
                .unwrap_or_else(|| "Unknown".to_string()),
            self.format_time(site.modified)
                .unwrap_or_else(|| "Unknown".to_string())
        );
    }

    pub async fn site_create(&self, user_id: &str, site_url: &str, slot: Option<u32>) -> Result<()> {
        let site = self
            .client
            .create_site(&CreateSiteRequest {
                user_id: user_id.into(),
                site_url: site_url.into(),
                slot,
            })
            .await
            .context("Could not successfully create site from Launchpad api")?;

        println!(
            "{} Successfully created site '{}' with id '{}'!",
            "✓".green(),
            site.site_url,
            site.site_id
        );
        Ok(())
    }

    pub async fn site_deploy(&self, id: &str, reason: Option<String>, wait: bool) -> Result<()> {
        let site = self
            .client
            .deploy_site(id, reason)
            .await
            .context("Could not successfully deploy site from Launchpad api")?;

        println!(
            "{} Queued deployment #{} for '{}'",
            "✓".green(),
            site.attempts,
            site.site_url
        );

        if !wait {
            return Ok(());
        }

        self.wait_for_deployment(id).await
    }

    async fn wait_for_deployment(&self, id: &str) -> Result<()> {
        let started = epoch_milli();
        let mut last_status = Status::Queued;

        loop {
            tokio::time::sleep(POLL_INTERVAL).await;

            let site = self
                .client
                .get_site(id)
                .await
                .context("Could not successfully retrieve site from Launchpad api")?;

            if site.status != last_status {
                println!(
                    "  {} {}",
                    "→".blue(),
                    colorize_status_text(site.status)
                );
                last_status = site.status;
            }

            if !site.status.is_terminal() {
                continue;
            }

            let elapsed = humanize_absolute_duration(started, epoch_milli());

            if site.status == Status::Succeeded {
                println!(
                    "{} Deployed in {elapsed}; live at {}",
                    "✓".green(),
                    site.live_url.unwrap_or_default()
                );
                return Ok(());
            }

            match site.error {
                Some(error) => bail!(
                    "deployment failed while {} after {elapsed}; {}: {}",
                    error.step,
                    error.kind,
                    error.message
                ),
                None => bail!("deployment failed after {elapsed}"),
            }
        }
    }

    pub async fn site_cancel(&self, id: &str) -> Result<()> {
        let cancelled = self
            .client
            .cancel_deployment(id)
            .await
            .context("Could not successfully cancel deployment from Launchpad api")?;

        if cancelled {
            println!(
                "{} Cancellation requested; the run stops at its next step.",
                "✓".green()
            );
        } else {
            println!("Site '{id}' has no active deployment.");
        }

        Ok(())
    }

    pub async fn site_events(&self, id: &str, limit: u64) -> Result<()> {
        let events = self
            .client
            .list_site_events(id, limit, 0)
            .await
            .context("Could not successfully retrieve events from Launchpad api")?;

        if events.is_empty() {
            println!("No events found.");
            return Ok(());
        }

        let mut table = comfy_table::Table::new();
        table
            .load_preset(ASCII_MARKDOWN)
            .set_content_arrangement(ContentArrangement::Dynamic)
            .set_header(vec![
                Cell::new("emitted")
                    .set_alignment(CellAlignment::Center)
                    .fg(Color::Blue),
                Cell::new("kind")
                    .set_alignment(CellAlignment::Center)
                    .fg(Color::Blue),
                Cell::new("details")
                    .set_alignment(CellAlignment::Center)
                    .fg(Color::Blue),
            ]);

        for event in events {
            table.add_row(vec![
                Cell::new(
                    self.format_time(event.emitted)
                        .unwrap_or_else(|| "Unknown".to_string()),
                ),
                Cell::new(event.kind.to_string()).fg(Color::Green),
                Cell::new(describe(&event.kind)),
            ]);
        }

        println!("{}", &table.to_string());
        Ok(())
    }
}

/// One line summary of what an event carries.
fn describe(kind: &Kind) -> String {
    match kind {
        Kind::CreatedSite { site_url, .. } => site_url.clone(),
        Kind::QueuedDeployment {
            reason, attempt, ..
        } => format!("attempt {attempt}: {reason}"),
        Kind::EnteredStep { status, .. } => status.to_string(),
        Kind::PurchasedDomain { domain, .. } => domain.clone(),
        Kind::MigratedDns {
            domain,
            nameservers,
            ..
        } => format!("{domain} -> {}", nameservers.join(", ")),
        Kind::PublishedSite {
            repository, commit, ..
        } => format!("{repository}@{}", commit.chars().take(8).collect::<String>()),
        Kind::CompletedDeployment { live_url, .. } => live_url.clone(),
        Kind::FailedDeployment { step, kind, .. } => format!("{kind} while {step}"),
        Kind::StartedDeploymentCancellation { .. } => String::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::sites::ErrorKind;

    #[test]
    fn failures_describe_kind_and_step() {
        let kind = Kind::FailedDeployment {
            site_id: "site".into(),
            step: Status::Publishing,
            kind: ErrorKind::PublishError,
        };

        assert_eq!(describe(&kind), "PublishError while publishing");
    }

    #[test]
    fn published_commits_are_shortened() {
        let kind = Kind::PublishedSite {
            site_id: "site".into(),
            repository: "launchpad-4f1c2a9e".into(),
            commit: "0123456789abcdef".into(),
        };

        assert_eq!(describe(&kind), "launchpad-4f1c2a9e@01234567");
    }
}
