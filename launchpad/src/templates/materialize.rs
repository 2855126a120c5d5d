use super::{Template, TemplateError, TemplateRegistry, TEMPLATE_KEY};
use crate::{fetcher::SiteBundle, hosting::BuildConfig, workspace::WorkingTree};
use serde_json::Value;
use std::{
    fs, io,
    path::{Path, PathBuf},
};
use tracing::debug;

/// Directory names never copied out of a scaffold.
const VCS_METADATA: &[&str] = &[".git", ".github"];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Materialized {
    pub template: String,
    pub version: semver::Version,
    pub site_dir: PathBuf,
    pub build: BuildConfig,
}

/// Picks the template named by the configuration (or the default), validates the configuration
/// against it and writes a self contained site into the working tree's site directory.
pub async fn materialize(
    registry: &TemplateRegistry,
    default_template: &str,
    production_branch: &str,
    bundle: &SiteBundle,
    tree: &WorkingTree,
) -> Result<Materialized, TemplateError> {
    let name = match bundle.config.get(TEMPLATE_KEY) {
        Some(Value::String(name)) if !name.trim().is_empty() => name.trim().to_string(),
        _ => default_template.to_string(),
    };

    let template = registry.get(&name)?.clone();

    template
        .schema
        .validate(&bundle.config)
        .map_err(|problems| TemplateError::Validation {
            template: name.clone(),
            problems,
        })?;

    let site_dir = tree.site_dir();
    let inputs_dir = tree.inputs_dir();
    let bundle = bundle.clone();
    let blocking_template = template.clone();
    let blocking_site_dir = site_dir.clone();

    tokio::task::spawn_blocking(move || {
        render(&blocking_template, &bundle, &inputs_dir, &blocking_site_dir)
    })
    .await
    .map_err(|e| TemplateError::Io(format!("materialize task failed; {e}")))?
    .map_err(|e| TemplateError::Io(e.to_string()))?;

    debug!(
        template = %template.name,
        version = %template.version,
        site_dir = %site_dir.display(),
        "Materialized template"
    );

    Ok(Materialized {
        build: template.build_config(production_branch),
        template: template.name,
        version: template.version,
        site_dir,
    })
}

fn render(template: &Template, bundle: &SiteBundle, inputs_dir: &Path, site_dir: &Path) -> io::Result<()> {
    copy_scaffold(&template.scaffold, site_dir)?;

    write_into(site_dir, &template.paths.config, &bundle.raw_config)?;

    if let Some(backlinks) = &bundle.backlinks {
        write_into(site_dir, &template.paths.backlinks, backlinks)?;
    }

    let assets_dir = site_dir.join(&template.paths.assets);
    for image in &bundle.images {
        fs::create_dir_all(&assets_dir)?;
        fs::copy(inputs_dir.join("images").join(image), assets_dir.join(image))?;
    }

    Ok(())
}

fn write_into(site_dir: &Path, relative: &str, content: &[u8]) -> io::Result<()> {
    let path = site_dir.join(relative);
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::write(path, content)
}

fn copy_scaffold(source: &Path, destination: &Path) -> io::Result<()> {
    fs::create_dir_all(destination)?;

    for entry in fs::read_dir(source)? {
        let entry = entry?;
        let name = entry.file_name();

        if VCS_METADATA.iter().any(|skip| name == *skip) {
            continue;
        }

        let target = destination.join(&name);

        if entry.file_type()?.is_dir() {
            copy_scaffold(&entry.path(), &target)?;
        } else {
            fs::copy(entry.path(), target)?;
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::templates::tests::write_template;
    use bytes::Bytes;
    use serde_json::{json, Map};

    struct Fixture {
        registry: TemplateRegistry,
        tree: WorkingTree,
        _templates: tempfile::TempDir,
        _work_root: tempfile::TempDir,
    }

    fn fixture() -> Fixture {
        let templates = tempfile::tempdir().expect("Failed to create temporary directory");
        write_template(templates.path(), "local-business", "1.0.0");
        let registry = TemplateRegistry::load(templates.path()).expect("Failed to load registry");

        let work_root = tempfile::tempdir().expect("Failed to create temporary directory");
        let tree = WorkingTree::create(work_root.path(), "site_one").expect("Failed to create tree");

        Fixture {
            registry,
            tree,
            _templates: templates,
            _work_root: work_root,
        }
    }

    fn bundle(config: Value, tree: &WorkingTree, images: &[&str]) -> SiteBundle {
        let raw = serde_json::to_vec(&config).expect("Failed to serialize config");
        let Value::Object(config) = config else {
            panic!("expected an object");
        };

        std::fs::write(tree.inputs_dir().join("site.json"), &raw).expect("Failed to write file");
        std::fs::create_dir_all(tree.inputs_dir().join("images")).expect("Failed to create dir");
        for image in images {
            std::fs::write(tree.inputs_dir().join("images").join(image), "img").expect("Failed to write file");
        }

        SiteBundle {
            config,
            raw_config: Bytes::from(raw),
            backlinks: Some(Bytes::from_static(b"[\"https://example.com\"]")),
            images: images.iter().map(|image| image.to_string()).collect(),
        }
    }

    #[tokio::test]
    async fn produces_self_contained_site() {
        let fixture = fixture();
        let bundle = bundle(
            json!({"businessName": "Joe's Pizza", "phone": "555-0101"}),
            &fixture.tree,
            &["logo.png"],
        );

        let materialized = materialize(&fixture.registry, "local-business", "main", &bundle, &fixture.tree)
            .await
            .expect("Failed to materialize");

        let site = &materialized.site_dir;
        assert_eq!(materialized.template, "local-business");
        assert!(site.join("package.json").is_file());
        assert!(site.join("src/index.tsx").is_file());
        assert!(!site.join(".git").exists());
        assert!(!site.join(".github").exists());
        assert!(site.join("public/logo.png").is_file());

        let injected = std::fs::read(site.join("data/site.json")).expect("Failed to read config");
        assert_eq!(Bytes::from(injected), bundle.raw_config);
        assert!(site.join("data/backlinks.json").is_file());
    }

    #[tokio::test]
    async fn unknown_template_is_fatal() {
        let fixture = fixture();
        let bundle = bundle(
            json!({"template": "restaurant-deluxe", "businessName": "Joe's Pizza"}),
            &fixture.tree,
            &[],
        );

        let err = materialize(&fixture.registry, "local-business", "main", &bundle, &fixture.tree)
            .await
            .unwrap_err();

        assert_eq!(err, TemplateError::NotFound("restaurant-deluxe".into()));
        assert_eq!(
            std::fs::read_dir(fixture.tree.site_dir()).expect("Failed to read dir").count(),
            0
        );
    }

    #[tokio::test]
    async fn configuration_must_satisfy_schema() {
        let fixture = fixture();
        let bundle = bundle(json!({"phone": 5550101}), &fixture.tree, &[]);

        let err = materialize(&fixture.registry, "local-business", "main", &bundle, &fixture.tree)
            .await
            .unwrap_err();

        let TemplateError::Validation { template, problems } = err else {
            panic!("expected a validation error");
        };
        assert_eq!(template, "local-business");
        assert_eq!(problems.len(), 2);
    }

    #[tokio::test]
    async fn configuration_is_never_rewritten() {
        let fixture = fixture();
        let mut config = Map::new();
        config.insert("businessName".into(), json!("Joe's Pizza"));
        config.insert("heroImage".into(), json!("logo.png"));
        let original = bundle(Value::Object(config), &fixture.tree, &["logo.png"]);

        let materialized = materialize(&fixture.registry, "local-business", "main", &original, &fixture.tree)
            .await
            .expect("Failed to materialize");

        let written = std::fs::read(materialized.site_dir.join("data/site.json")).expect("Failed to read config");
        assert_eq!(Bytes::from(written), original.raw_config);
    }
}
