//! Pulls a site's artifacts out of object storage and stages them in a fresh working tree.

use crate::{
    object_store::{ObjectStore, ObjectStoreError},
    retry::{retry, RetryPolicy, TimedOut, Transient},
    workspace::WorkingTree,
};
use bytes::Bytes;
use serde_json::{Map, Value};
use std::{path::Path, sync::Arc};
use tracing::debug;

pub const SITE_CONFIG_FILE: &str = "site.json";
pub const BACKLINKS_FILE: &str = "backlinks.json";
const IMAGE_EXTENSIONS: &[&str] = &["png", "jpg", "jpeg", "gif", "webp", "svg"];

#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum FetchError {
    #[error("site configuration '{0}' not found in object storage")]
    NotFound(String),

    #[error("site configuration is not a valid JSON object; {0}")]
    InvalidConfiguration(String),

    #[error("object storage request failed; {0}")]
    Storage(ObjectStoreError),

    #[error("{0}")]
    TimedOut(#[from] TimedOut),

    #[error("could not stage artifacts in working tree; {0}")]
    WorkingTree(String),
}

impl Transient for FetchError {
    fn is_transient(&self) -> bool {
        match self {
            FetchError::Storage(e) => !matches!(
                e,
                ObjectStoreError::NotFound | ObjectStoreError::FailedPrecondition(_)
            ),
            FetchError::TimedOut(_) => true,
            _ => false,
        }
    }
}

impl From<ObjectStoreError> for FetchError {
    fn from(value: ObjectStoreError) -> Self {
        FetchError::Storage(value)
    }
}

/// Where a given artifact for a site lives in the object store.
pub fn artifact_key(visibility: &str, user_id: &str, site_url: &str, filename: &str) -> String {
    format!("{visibility}/{user_id}/{site_url}/{filename}")
}

/// Everything fetched for one site. The file contents are also staged under the working tree's
/// inputs directory.
#[derive(Debug, Clone, PartialEq)]
pub struct SiteBundle {
    /// The parsed `site.json`; never modified after fetching.
    pub config: Map<String, Value>,

    /// `site.json` exactly as stored.
    pub raw_config: Bytes,

    pub backlinks: Option<Bytes>,

    /// File names of the staged images, found under `inputs/images`.
    pub images: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct Fetcher {
    store: Arc<dyn ObjectStore>,
    policy: RetryPolicy,
}

impl Fetcher {
    pub fn new(store: Arc<dyn ObjectStore>, policy: RetryPolicy) -> Self {
        Self { store, policy }
    }

    /// Fetches everything for the site and, only once `site.json` is known to exist, creates the
    /// working tree to stage it in.
    pub async fn fetch(
        &self,
        user_id: &str,
        site_url: &str,
        work_root: &Path,
        site_id: &str,
    ) -> Result<(WorkingTree, SiteBundle), FetchError> {
        let config_key = artifact_key("private", user_id, site_url, SITE_CONFIG_FILE);
        let raw_config = match self.get(&config_key).await? {
            Some(raw) => raw,
            None => return Err(FetchError::NotFound(config_key)),
        };

        let config = match serde_json::from_slice::<Value>(&raw_config) {
            Ok(Value::Object(map)) => map,
            Ok(_) => {
                return Err(FetchError::InvalidConfiguration(
                    "top level value must be an object".into(),
                ))
            }
            Err(e) => return Err(FetchError::InvalidConfiguration(e.to_string())),
        };

        let backlinks_key = artifact_key("private", user_id, site_url, BACKLINKS_FILE);
        let backlinks = self.get(&backlinks_key).await?;

        let images = self.fetch_images(user_id, site_url).await?;

        let tree = WorkingTree::create(work_root, site_id)
            .map_err(|e| FetchError::WorkingTree(e.to_string()))?;

        let inputs = tree.inputs_dir();
        write_file(&inputs.join(SITE_CONFIG_FILE), &raw_config).await?;

        if let Some(backlinks) = &backlinks {
            write_file(&inputs.join(BACKLINKS_FILE), backlinks).await?;
        }

        let mut image_names = Vec::with_capacity(images.len());
        for (name, content) in images {
            write_file(&inputs.join("images").join(&name), &content).await?;
            image_names.push(name);
        }

        debug!(
            site_id = site_id,
            has_backlinks = backlinks.is_some(),
            images = image_names.len(),
            "Fetched site artifacts"
        );

        Ok((
            tree,
            SiteBundle {
                config,
                raw_config,
                backlinks,
                images: image_names,
            },
        ))
    }

    /// A missing object comes back as `None` instead of an error.
    async fn get(&self, key: &str) -> Result<Option<Bytes>, FetchError> {
        let store = &self.store;

        let result = retry(&self.policy, "fetch artifact", move || async move {
            store.get(key).await.map_err(FetchError::from)
        })
        .await;

        match result {
            Ok(content) => Ok(Some(content)),
            Err(FetchError::Storage(ObjectStoreError::NotFound)) => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Images can live under either the private or the public prefix; when both have a file of
    /// the same name the private one wins.
    async fn fetch_images(
        &self,
        user_id: &str,
        site_url: &str,
    ) -> Result<Vec<(String, Bytes)>, FetchError> {
        let mut images: Vec<(String, Bytes)> = vec![];

        for visibility in ["private", "public"] {
            let prefix = format!("{visibility}/{user_id}/{site_url}");
            let store = &self.store;
            let prefix_ref = prefix.as_str();

            let keys = retry(&self.policy, "list artifacts", move || async move {
                store.list_keys(prefix_ref).await.map_err(FetchError::from)
            })
            .await?;

            for key in keys {
                let Some(name) = key.rsplit('/').next().map(str::to_string) else {
                    continue;
                };

                if !is_image(&name) || images.iter().any(|(existing, _)| existing == &name) {
                    continue;
                }

                // Deleted between listing and fetching; nothing to stage.
                if let Some(content) = self.get(&key).await? {
                    images.push((name, content));
                }
            }
        }

        Ok(images)
    }
}

fn is_image(name: &str) -> bool {
    match name.rsplit_once('.') {
        Some((stem, extension)) if !stem.is_empty() => IMAGE_EXTENSIONS
            .iter()
            .any(|allowed| extension.eq_ignore_ascii_case(allowed)),
        _ => false,
    }
}

async fn write_file(path: &Path, content: &[u8]) -> Result<(), FetchError> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|e| FetchError::WorkingTree(e.to_string()))?;
    }

    tokio::fs::write(path, content)
        .await
        .map_err(|e| FetchError::WorkingTree(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object_store::memory;
    use std::time::Duration;

    const USER: &str = "4f1c2a9e-77aa-4a43-9a3b-b1f0c0de0001";

    fn policy() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 2,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(2),
            multiplier: 2.0,
            attempt_timeout: Duration::from_secs(5),
        }
    }

    async fn seeded_store() -> Arc<memory::Engine> {
        let store = Arc::new(memory::Engine::new());

        let objects = [
            ("private", "site.json", r#"{"businessName": "Joe's Pizza"}"#),
            ("private", "logo.PNG", "png-bytes"),
            ("private", "notes.txt", "not an image"),
            ("public", "hero.webp", "webp-bytes"),
            ("public", "logo.PNG", "public copy"),
        ];

        for (visibility, name, content) in objects {
            store
                .put(
                    &artifact_key(visibility, USER, "joes-pizza.com", name),
                    Bytes::from(content),
                    false,
                )
                .await
                .expect("Failed to seed object");
        }

        store
    }

    #[test]
    fn image_detection() {
        assert!(is_image("logo.png"));
        assert!(is_image("LOGO.JPeG"));
        assert!(!is_image(".png"));
        assert!(!is_image("site.json"));
        assert!(!is_image("png"));
    }

    #[tokio::test]
    async fn stages_config_and_images() {
        let store = seeded_store().await;
        let root = tempfile::tempdir().expect("Failed to create temporary directory");
        let fetcher = Fetcher::new(store, policy());

        let (tree, bundle) = fetcher
            .fetch(USER, "joes-pizza.com", root.path(), "site_one")
            .await
            .expect("Failed to fetch");

        assert_eq!(
            bundle.config.get("businessName"),
            Some(&Value::String("Joe's Pizza".into()))
        );
        assert_eq!(bundle.backlinks, None);
        assert_eq!(bundle.images, vec!["logo.PNG".to_string(), "hero.webp".to_string()]);

        let staged_logo = std::fs::read_to_string(tree.inputs_dir().join("images/logo.PNG"))
            .expect("Failed to read staged image");
        assert_eq!(staged_logo, "png-bytes");
        assert!(tree.inputs_dir().join("site.json").is_file());
        assert!(!tree.inputs_dir().join("backlinks.json").exists());
    }

    #[tokio::test]
    async fn missing_config_fails_before_creating_tree() {
        let store = Arc::new(memory::Engine::new());
        let root = tempfile::tempdir().expect("Failed to create temporary directory");
        let fetcher = Fetcher::new(store, policy());

        let err = fetcher
            .fetch(USER, "joes-pizza.com", root.path(), "site_one")
            .await
            .unwrap_err();

        assert_eq!(
            err,
            FetchError::NotFound(format!("private/{USER}/joes-pizza.com/site.json"))
        );
        assert!(!err.is_transient());
        assert_eq!(std::fs::read_dir(root.path()).expect("Failed to read root").count(), 0);
    }

    #[tokio::test]
    async fn malformed_config_is_rejected() {
        let store = Arc::new(memory::Engine::new());
        store
            .put(
                &artifact_key("private", USER, "joes-pizza.com", SITE_CONFIG_FILE),
                Bytes::from("[1, 2, 3]"),
                false,
            )
            .await
            .expect("Failed to seed object");

        let root = tempfile::tempdir().expect("Failed to create temporary directory");
        let fetcher = Fetcher::new(store, policy());

        let err = fetcher
            .fetch(USER, "joes-pizza.com", root.path(), "site_one")
            .await
            .unwrap_err();

        assert!(matches!(err, FetchError::InvalidConfiguration(_)));
    }
}
