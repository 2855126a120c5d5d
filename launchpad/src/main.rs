mod api;
mod cli;
mod conf;
mod fetcher;
mod hosting;
mod linker;
mod object_store;
mod orchestrator;
mod provisioner;
mod publisher;
mod registrar;
mod retry;
mod source_host;
mod storage;
mod templates;
mod workspace;

use colored::Colorize;
use human_panic::setup_panic;

#[tokio::main]
async fn main() {
    setup_panic!();

    let mut cli = match cli::Cli::new() {
        Ok(cli) => cli,
        Err(e) => {
            eprintln!("{} {:?}", "x".red(), e);
            std::process::exit(1)
        }
    };

    match cli.run().await {
        Ok(_) => {}
        Err(e) => {
            eprintln!("{} {:?}", "x".red(), e);
            std::process::exit(1)
        }
    }
}
