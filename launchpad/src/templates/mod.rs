//! Named, versioned site templates.
//!
//! A template is a directory containing:
//!
//! * `template.toml` - name, version, build settings, injection paths and the schema site
//!   configurations must satisfy.
//! * `example.json` - an example configuration, checked against the schema when loaded.
//! * `scaffold/` - the source tree copied into every deployment.
//!
//! New templates are added by dropping a directory into the templates dir (or registering one),
//! never by code changes.

pub mod materialize;

use crate::hosting::BuildConfig;
use figment::{
    providers::{Format, Toml},
    Figment,
};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::{
    collections::BTreeMap,
    path::{Component, Path, PathBuf},
};
use strum::Display;
use tracing::{info, warn};

pub const MANIFEST_FILE: &str = "template.toml";
pub const EXAMPLE_FILE: &str = "example.json";
pub const SCAFFOLD_DIR: &str = "scaffold";

/// The site configuration key that names which template to use.
pub const TEMPLATE_KEY: &str = "template";

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum TemplateError {
    #[error("template '{0}' not found")]
    NotFound(String),

    #[error("site configuration does not match template '{template}'; {}", .problems.join("; "))]
    Validation {
        template: String,
        problems: Vec<String>,
    },

    #[error("template '{name}' is invalid; {reason}")]
    InvalidTemplate { name: String, reason: String },

    #[error("could not materialize template; {0}")]
    Io(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema, Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum FieldType {
    String,
    Number,
    Integer,
    Boolean,
    Object,
    Array,
}

impl FieldType {
    fn matches(&self, value: &Value) -> bool {
        match self {
            FieldType::String => value.is_string(),
            FieldType::Number => value.is_number(),
            FieldType::Integer => value.is_i64() || value.is_u64(),
            FieldType::Boolean => value.is_boolean(),
            FieldType::Object => value.is_object(),
            FieldType::Array => value.is_array(),
        }
    }
}

fn describe(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// The shape a site configuration has to have for a template to render it.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct Schema {
    /// Top level keys that must be present and not null.
    #[serde(default)]
    pub required: Vec<String>,

    /// Expected JSON type per top level key; keys not listed here are not checked.
    #[serde(default)]
    pub properties: BTreeMap<String, FieldType>,
}

impl Schema {
    /// Returns every problem found rather than stopping at the first.
    pub fn validate(&self, config: &Map<String, Value>) -> Result<(), Vec<String>> {
        let mut problems = vec![];

        for key in &self.required {
            match config.get(key) {
                None | Some(Value::Null) => problems.push(format!("missing required key '{key}'")),
                Some(_) => {}
            }
        }

        for (key, expected) in &self.properties {
            if let Some(value) = config.get(key) {
                if value.is_null() {
                    continue;
                }

                if !expected.matches(value) {
                    problems.push(format!(
                        "key '{key}' should be {expected} but is {}",
                        describe(value)
                    ));
                }
            }
        }

        if problems.is_empty() {
            Ok(())
        } else {
            Err(problems)
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct BuildSettings {
    pub command: Option<String>,
    pub output_dir: Option<String>,
    pub root_dir: Option<String>,
}

/// Where fetched artifacts land inside the materialized tree, relative to its root.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct InjectionPaths {
    pub config: String,
    pub backlinks: String,
    pub assets: String,
}

impl Default for InjectionPaths {
    fn default() -> Self {
        Self {
            config: "data/site.json".into(),
            backlinks: "data/backlinks.json".into(),
            assets: "public".into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct Manifest {
    pub name: String,
    pub version: String,

    #[serde(default)]
    pub description: String,

    #[serde(default)]
    pub build: BuildSettings,

    #[serde(default)]
    pub paths: InjectionPaths,

    #[serde(default)]
    pub schema: Schema,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Template {
    pub name: String,
    pub version: semver::Version,
    pub description: String,
    pub schema: Schema,
    pub paths: InjectionPaths,
    pub build: BuildSettings,

    /// Directory whose contents are copied into each deployment.
    pub scaffold: PathBuf,
}

impl Template {
    /// Reads the template rooted at `dir`.
    pub fn load(dir: &Path) -> Result<Self, TemplateError> {
        let dir_name = dir
            .file_name()
            .map(|name| name.to_string_lossy().to_string())
            .unwrap_or_default();

        let manifest: Manifest = Figment::new()
            .merge(Toml::file(dir.join(MANIFEST_FILE)))
            .extract()
            .map_err(|e| TemplateError::InvalidTemplate {
                name: dir_name.clone(),
                reason: format!("could not parse {MANIFEST_FILE}; {e}"),
            })?;

        let template = Self::from_manifest(manifest, dir.join(SCAFFOLD_DIR))?;

        let example_path = dir.join(EXAMPLE_FILE);
        if example_path.exists() {
            template.check_example(&example_path)?;
        }

        Ok(template)
    }

    pub fn from_manifest(manifest: Manifest, scaffold: PathBuf) -> Result<Self, TemplateError> {
        let invalid = |reason: String| TemplateError::InvalidTemplate {
            name: manifest.name.clone(),
            reason,
        };

        let version = semver::Version::parse(&manifest.version)
            .map_err(|e| invalid(format!("version '{}' is not semver; {e}", manifest.version)))?;

        for (label, path) in [
            ("config", &manifest.paths.config),
            ("backlinks", &manifest.paths.backlinks),
            ("assets", &manifest.paths.assets),
        ] {
            if !is_contained(path) {
                return Err(invalid(format!(
                    "{label} path '{path}' must be relative and stay inside the site"
                )));
            }
        }

        if !scaffold.is_dir() {
            return Err(invalid(format!(
                "scaffold directory '{}' does not exist",
                scaffold.display()
            )));
        }

        Ok(Self {
            name: manifest.name,
            version,
            description: manifest.description,
            schema: manifest.schema,
            paths: manifest.paths,
            build: manifest.build,
            scaffold,
        })
    }

    fn check_example(&self, path: &Path) -> Result<(), TemplateError> {
        let invalid = |reason: String| TemplateError::InvalidTemplate {
            name: self.name.clone(),
            reason,
        };

        let raw = std::fs::read(path).map_err(|e| invalid(format!("could not read example; {e}")))?;

        let example = match serde_json::from_slice::<Value>(&raw) {
            Ok(Value::Object(map)) => map,
            Ok(_) => return Err(invalid("example must be a JSON object".into())),
            Err(e) => return Err(invalid(format!("example is not valid JSON; {e}"))),
        };

        self.schema.validate(&example).map_err(|problems| {
            invalid(format!(
                "example does not satisfy the schema; {}",
                problems.join("; ")
            ))
        })
    }

    /// Build settings for the hosting provider with template overrides applied.
    pub fn build_config(&self, production_branch: &str) -> BuildConfig {
        let defaults = BuildConfig::default();

        BuildConfig {
            build_command: self.build.command.clone().unwrap_or(defaults.build_command),
            destination_dir: self
                .build
                .output_dir
                .clone()
                .unwrap_or(defaults.destination_dir),
            root_dir: self.build.root_dir.clone().unwrap_or(defaults.root_dir),
            production_branch: production_branch.to_string(),
        }
    }
}

fn is_contained(path: &str) -> bool {
    let path = Path::new(path);

    !path.as_os_str().is_empty()
        && path
            .components()
            .all(|component| matches!(component, Component::Normal(_) | Component::CurDir))
}

/// Every template the service knows about, keyed by name.
#[derive(Debug, Clone, Default)]
pub struct TemplateRegistry {
    templates: BTreeMap<String, Template>,
}

impl TemplateRegistry {
    /// Loads every template directory under `root`. Broken templates are skipped with a warning
    /// so one bad template can't take the others down with it.
    pub fn load(root: &Path) -> Result<Self, TemplateError> {
        let mut registry = Self::default();

        if !root.is_dir() {
            warn!(path = %root.display(), "Templates directory not found; no templates loaded");
            return Ok(registry);
        }

        let entries = std::fs::read_dir(root).map_err(|e| TemplateError::Io(e.to_string()))?;

        for entry in entries {
            let entry = entry.map_err(|e| TemplateError::Io(e.to_string()))?;
            let path = entry.path();

            if !path.join(MANIFEST_FILE).is_file() {
                continue;
            }

            match Template::load(&path) {
                Ok(template) => {
                    info!(
                        name = %template.name,
                        version = %template.version,
                        "Registered template"
                    );
                    registry.register(template);
                }
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "Skipping invalid template");
                }
            }
        }

        Ok(registry)
    }

    /// Adds or replaces a template.
    pub fn register(&mut self, template: Template) {
        self.templates.insert(template.name.clone(), template);
    }

    pub fn get(&self, name: &str) -> Result<&Template, TemplateError> {
        self.templates
            .get(name)
            .ok_or_else(|| TemplateError::NotFound(name.to_string()))
    }

    pub fn list(&self) -> Vec<&Template> {
        self.templates.values().collect()
    }
}

#[cfg(test)]
pub mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    /// Writes a small but complete template under `root/<name>`.
    pub fn write_template(root: &Path, name: &str, version: &str) -> PathBuf {
        let dir = root.join(name);
        std::fs::create_dir_all(dir.join("scaffold/.git")).expect("Failed to create dir");
        std::fs::create_dir_all(dir.join("scaffold/.github/workflows")).expect("Failed to create dir");
        std::fs::create_dir_all(dir.join("scaffold/src")).expect("Failed to create dir");

        std::fs::write(
            dir.join(MANIFEST_FILE),
            format!(
                r#"
name = "{name}"
version = "{version}"
description = "A one page site for local businesses"

[build]
output_dir = "out"

[schema]
required = ["businessName"]

[schema.properties]
businessName = "string"
phone = "string"
"#
            ),
        )
        .expect("Failed to write manifest");

        std::fs::write(
            dir.join(EXAMPLE_FILE),
            r#"{"businessName": "Example Co", "phone": "555-0100"}"#,
        )
        .expect("Failed to write example");

        std::fs::write(dir.join("scaffold/package.json"), r#"{"name": "site"}"#)
            .expect("Failed to write scaffold file");
        std::fs::write(dir.join("scaffold/src/index.tsx"), "export default () => null;")
            .expect("Failed to write scaffold file");
        std::fs::write(dir.join("scaffold/.git/HEAD"), "ref: refs/heads/main")
            .expect("Failed to write scaffold file");
        std::fs::write(dir.join("scaffold/.github/workflows/ci.yml"), "on: push")
            .expect("Failed to write scaffold file");

        dir
    }

    #[test]
    fn schema_reports_every_problem() {
        let schema = Schema {
            required: vec!["businessName".into(), "phone".into()],
            properties: BTreeMap::from([
                ("businessName".to_string(), FieldType::String),
                ("rating".to_string(), FieldType::Number),
            ]),
        };

        let config = json!({"businessName": 12, "phone": null, "rating": 4.5});
        let Value::Object(config) = config else {
            panic!("expected an object");
        };

        assert_eq!(
            schema.validate(&config),
            Err(vec![
                "missing required key 'phone'".to_string(),
                "key 'businessName' should be string but is number".to_string(),
            ])
        );
    }

    #[test]
    fn registry_loads_valid_templates_and_skips_broken_ones() {
        let root = tempfile::tempdir().expect("Failed to create temporary directory");
        write_template(root.path(), "local-business", "1.2.0");

        let broken = write_template(root.path(), "broken", "not-semver");
        assert!(broken.exists());

        std::fs::create_dir_all(root.path().join("stray-dir")).expect("Failed to create dir");

        let registry = TemplateRegistry::load(root.path()).expect("Failed to load registry");

        let names: Vec<_> = registry.list().iter().map(|t| t.name.clone()).collect();
        assert_eq!(names, vec!["local-business".to_string()]);

        let template = registry.get("local-business").expect("template should exist");
        assert_eq!(template.version, semver::Version::new(1, 2, 0));
        assert_eq!(template.paths, InjectionPaths::default());

        assert_eq!(
            registry.get("missing").unwrap_err(),
            TemplateError::NotFound("missing".into())
        );
    }

    #[test]
    fn example_must_satisfy_schema() {
        let root = tempfile::tempdir().expect("Failed to create temporary directory");
        let dir = write_template(root.path(), "local-business", "1.0.0");
        std::fs::write(dir.join(EXAMPLE_FILE), r#"{"phone": "555-0100"}"#)
            .expect("Failed to write example");

        let err = Template::load(&dir).unwrap_err();
        assert!(matches!(err, TemplateError::InvalidTemplate { .. }));
    }

    #[test]
    fn injection_paths_must_stay_inside_site() {
        assert!(is_contained("data/site.json"));
        assert!(is_contained("./public"));
        assert!(!is_contained("../outside.json"));
        assert!(!is_contained("/etc/passwd"));
        assert!(!is_contained(""));
    }

    #[test]
    fn build_config_applies_overrides() {
        let root = tempfile::tempdir().expect("Failed to create temporary directory");
        let dir = write_template(root.path(), "local-business", "1.0.0");
        let template = Template::load(&dir).expect("Failed to load template");

        assert_eq!(
            template.build_config("main"),
            BuildConfig {
                build_command: "npm run build".into(),
                destination_dir: "out".into(),
                root_dir: String::new(),
                production_branch: "main".into(),
            }
        );
    }

    #[test]
    fn shipped_templates_load() {
        let root = Path::new(env!("CARGO_MANIFEST_DIR")).join("templates");
        let registry = TemplateRegistry::load(&root).expect("Failed to load registry");

        let template = registry
            .get("local-business")
            .expect("local-business template should ship");
        assert_eq!(template.paths.assets, "public/images");
        assert_eq!(template.build_config("main").destination_dir, "dist");
    }
}
