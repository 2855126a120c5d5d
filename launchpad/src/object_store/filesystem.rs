use super::{ObjectStore, ObjectStoreError};
use async_trait::async_trait;
use bytes::Bytes;
use object_store::local::LocalFileSystem;
use serde::Deserialize;
use std::path::PathBuf;

#[derive(Deserialize, Default, Debug, Clone, PartialEq, Eq)]
pub struct Config {
    /// The path of the directory that should contain the object files.
    pub path: String,
}

#[derive(Debug)]
pub struct Engine {
    store: LocalFileSystem,
    root: PathBuf,
}

impl Engine {
    pub fn new(config: &Config) -> Result<Self, ObjectStoreError> {
        std::fs::create_dir_all(&config.path).map_err(|e| {
            ObjectStoreError::FailedPrecondition(format!(
                "could not create object store directory '{}'; {e}",
                config.path
            ))
        })?;

        let store = LocalFileSystem::new_with_prefix(&config.path).map_err(|e| {
            ObjectStoreError::FailedPrecondition(format!(
                "could not open object store directory '{}'; {e}",
                config.path
            ))
        })?;

        Ok(Engine {
            store,
            root: PathBuf::from(&config.path),
        })
    }
}

#[async_trait]
impl ObjectStore for Engine {
    async fn get(&self, key: &str) -> Result<Bytes, ObjectStoreError> {
        super::get_from(&self.store, key).await
    }

    async fn put(&self, key: &str, content: Bytes, force: bool) -> Result<(), ObjectStoreError> {
        super::put_into(&self.store, key, content, force).await
    }

    async fn list_keys(&self, prefix: &str) -> Result<Vec<String>, ObjectStoreError> {
        // Walking a directory that was never created is an error for the local backend rather
        // than an empty listing.
        if !self.root.join(prefix).exists() {
            return Ok(vec![]);
        }

        super::list_from(&self.store, prefix).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    /// Basic CRUD can be accomplished.
    async fn crud() {
        let dir = tempfile::tempdir().expect("Failed to create temporary directory");
        let store = Engine::new(&Config {
            path: dir.path().join("objects").to_string_lossy().to_string(),
        })
        .expect("Failed to open object store");

        let key = "private/user_1/joes-pizza.com/site.json";

        store
            .put(key, Bytes::from("{}"), false)
            .await
            .expect("Failed to put object");

        assert_eq!(store.get(key).await.expect("Failed to get object"), Bytes::from("{}"));

        let err = store.put(key, Bytes::from("[]"), false).await.unwrap_err();
        assert_eq!(err, ObjectStoreError::Exists);

        store
            .put(key, Bytes::from("[]"), true)
            .await
            .expect("Failed to overwrite object");
        assert_eq!(store.get(key).await.expect("Failed to get object"), Bytes::from("[]"));

        let keys = store
            .list_keys("private/user_1/joes-pizza.com")
            .await
            .expect("Failed to list keys");
        assert_eq!(keys, vec![key.to_string()]);

        let missing = store.get("private/user_1/nope/site.json").await.unwrap_err();
        assert_eq!(missing, ObjectStoreError::NotFound);

        let empty = store.list_keys("public/user_1").await.expect("Failed to list keys");
        assert!(empty.is_empty());
    }
}
