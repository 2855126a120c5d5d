use crate::cli::Cli;
use anyhow::{Context, Result};
use clap::{Args, Subcommand};
use comfy_table::{presets::ASCII_MARKDOWN, Cell, CellAlignment, Color, ContentArrangement};

#[derive(Debug, Args, Clone)]
pub struct TemplateSubcommands {
    #[clap(subcommand)]
    pub command: TemplateCommands,
}

#[derive(Debug, Subcommand, Clone)]
pub enum TemplateCommands {
    /// List all templates the server has loaded.
    List,
}

impl Cli {
    pub async fn handle_template_subcommands(&self, command: TemplateSubcommands) -> Result<()> {
        let cmds = command.command;
        match cmds {
            TemplateCommands::List => self.template_list().await,
        }
    }

    pub async fn template_list(&self) -> Result<()> {
        let mut templates = self
            .client
            .list_templates()
            .await
            .context("Could not successfully retrieve templates from Launchpad api")?;

        if templates.is_empty() {
            println!("No templates found.");
            return Ok(());
        }

        templates.sort_by(|a, b| a.name.cmp(&b.name));

        let mut table = comfy_table::Table::new();
        table
            .load_preset(ASCII_MARKDOWN)
            .set_content_arrangement(ContentArrangement::Dynamic)
            .set_header(vec![
                Cell::new("name")
                    .set_alignment(CellAlignment::Center)
                    .fg(Color::Blue),
                Cell::new("version")
                    .set_alignment(CellAlignment::Center)
                    .fg(Color::Blue),
                Cell::new("description")
                    .set_alignment(CellAlignment::Center)
                    .fg(Color::Blue),
                Cell::new("required fields")
                    .set_alignment(CellAlignment::Center)
                    .fg(Color::Blue),
            ]);

        for template in templates {
            table.add_row(vec![
                Cell::new(template.name).fg(Color::Green),
                Cell::new(template.version),
                Cell::new(template.description),
                Cell::new(template.required.join(", ")),
            ]);
        }

        println!("{}", &table.to_string());
        Ok(())
    }
}
