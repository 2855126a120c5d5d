pub mod api;
pub mod cli;

use anyhow::{anyhow, Context, Result};
use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use rust_embed::RustEmbed;
use serde::de::DeserializeOwned;
use std::{borrow::Cow, path::Path};

#[derive(RustEmbed)]
#[folder = "src/conf/"]
struct EmbeddedConfigFS;

/// The configuration type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Kind {
    Api,
    Cli,
}

impl Kind {
    /// Returns an embedded default configuration file in bytes.
    fn default_config(&self) -> Result<Cow<'static, [u8]>> {
        let name = match self {
            Kind::Api => "default_api_config.toml",
            Kind::Cli => "default_cli_config.toml",
        };

        EmbeddedConfigFS::get(name)
            .map(|file| file.data)
            .ok_or_else(|| anyhow!("embedded config file '{name}' missing from binary"))
    }

    /// Returns the default configuration paths that are searched in case user does not specify.
    fn config_paths(&self) -> Vec<String> {
        match self {
            Kind::Api => vec!["/etc/launchpad/launchpad.toml".to_string()],
            Kind::Cli => {
                let Some(user_home) = dirs::home_dir() else {
                    return vec![];
                };

                vec![
                    user_home.join(".launchpad.toml").to_string_lossy().to_string(),
                    user_home
                        .join(".config/launchpad.toml")
                        .to_string_lossy()
                        .to_string(),
                ]
            }
        }
    }

    fn env_prefix(&self) -> &'static str {
        match self {
            Kind::Api => "LAUNCHPAD_",
            Kind::Cli => "LAUNCHPAD_CLI_",
        }
    }

    /// Layers, lowest priority first: embedded defaults, the first config path that exists (or
    /// `path_override`), then environment variables. Nested keys use `__` in variable names, so
    /// `LAUNCHPAD_SERVER__BIND_ADDRESS` sets `server.bind_address`.
    pub fn parse<T: DeserializeOwned>(&self, path_override: Option<&str>) -> Result<T> {
        let default_config_raw = self.default_config()?;
        let default_config = std::str::from_utf8(&default_config_raw)
            .context("Embedded default config is not valid utf-8")?;

        let mut figment = Figment::new().merge(Toml::string(default_config));

        match path_override {
            Some(path) => {
                if !Path::new(path).exists() {
                    return Err(anyhow!("Config file '{path}' does not exist"));
                }
                figment = figment.merge(Toml::file(path));
            }
            None => {
                if let Some(path) = self
                    .config_paths()
                    .into_iter()
                    .find(|path| Path::new(path).exists())
                {
                    figment = figment.merge(Toml::file(path));
                }
            }
        }

        let env = Env::prefixed(self.env_prefix()).split("__");

        // The api prefix is a prefix of the cli one; keep cli variables out of the api config.
        let env = match self {
            Kind::Api => env.filter(|key| !key.starts_with("cli_")),
            Kind::Cli => env,
        };

        figment
            .merge(env)
            .extract::<T>()
            .context("Could not parse configuration")
    }
}
