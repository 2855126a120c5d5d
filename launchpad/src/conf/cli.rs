use serde::Deserialize;

#[derive(Deserialize, Debug, Default, Clone, PartialEq, Eq)]
pub struct CliConfig {
    /// Base url of the launchpad service.
    pub server: String,

    /// Show extra columns in list output.
    pub detail: bool,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conf::Kind;

    #[test]
    fn env_overrides_default_server() {
        figment::Jail::expect_with(|jail| {
            let config: CliConfig = Kind::Cli
                .parse(Some(&write_empty(jail)?))
                .expect("Failed to parse config");
            assert_eq!(config.server, "http://127.0.0.1:8080");

            jail.set_env("LAUNCHPAD_CLI_SERVER", "http://10.0.0.5:8080");
            let config: CliConfig = Kind::Cli
                .parse(Some(&write_empty(jail)?))
                .expect("Failed to parse config");
            assert_eq!(config.server, "http://10.0.0.5:8080");
            assert!(!config.detail);
            Ok(())
        });
    }

    fn write_empty(jail: &mut figment::Jail) -> figment::Result<String> {
        jail.create_file("cli.toml", "")?;
        Ok("cli.toml".to_string())
    }
}
