#![allow(dead_code)]

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

fn main() {
    let path = std::path::PathBuf::from("docs/openapi.json");

    if let Err(e) = api::write_openapi_spec(path) {
        eprintln!("Could not generate openapi spec; {e:?}");
        std::process::exit(1);
    }
}
