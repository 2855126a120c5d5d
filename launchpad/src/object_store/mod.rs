pub mod filesystem;
pub mod memory;

use async_trait::async_trait;
use bytes::Bytes;
use futures::TryStreamExt;
use serde::Deserialize;
use std::{fmt::Debug, sync::Arc};
use strum::{Display, EnumString};

/// Represents different object store failure possibilities.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum ObjectStoreError {
    #[error("could not establish connection to object store; {0}")]
    Connection(String),

    #[error("requested entity not found")]
    NotFound,

    #[error("entity already exists")]
    Exists,

    #[error("unexpected storage error occurred; {0}")]
    Internal(String),

    /// Failed to start due to misconfigured settings, usually from a misconfigured settings file.
    #[error("could not init object store; {0}")]
    FailedPrecondition(String),
}

impl From<object_store::Error> for ObjectStoreError {
    fn from(err: object_store::Error) -> Self {
        match err {
            object_store::Error::NotFound { .. } => ObjectStoreError::NotFound,
            object_store::Error::AlreadyExists { .. } => ObjectStoreError::Exists,
            e => ObjectStoreError::Internal(e.to_string()),
        }
    }
}

/// Where site artifacts live. Keys are plain `/` separated paths.
#[async_trait]
pub trait ObjectStore: Debug + Send + Sync + 'static {
    async fn get(&self, key: &str) -> Result<Bytes, ObjectStoreError>;

    /// Writes the object; refuses to overwrite unless `force` is set.
    async fn put(&self, key: &str, content: Bytes, force: bool) -> Result<(), ObjectStoreError>;

    /// All keys below the given prefix, sorted.
    async fn list_keys(&self, prefix: &str) -> Result<Vec<String>, ObjectStoreError>;
}

#[derive(Debug, Clone, Default, Deserialize, PartialEq, Eq, Display, EnumString)]
#[serde(rename_all = "snake_case")] // This handles case insensitivity during deserialization
#[strum(serialize_all = "snake_case")]
pub enum Engine {
    #[default]
    Filesystem,
    Memory,
}

pub async fn new(
    config: &crate::conf::api::ObjectStore,
) -> Result<Arc<dyn ObjectStore>, ObjectStoreError> {
    match config.engine {
        Engine::Filesystem => {
            let Some(settings) = &config.filesystem else {
                return Err(ObjectStoreError::FailedPrecondition(
                    "Filesystem engine settings not found in config".into(),
                ));
            };

            let engine = filesystem::Engine::new(settings)?;
            Ok(Arc::new(engine))
        }
        Engine::Memory => Ok(Arc::new(memory::Engine::new())),
    }
}

async fn get_from(store: &dyn object_store::ObjectStore, key: &str) -> Result<Bytes, ObjectStoreError> {
    let path = object_store::path::Path::from(key);

    let result = store.get(&path).await?;
    let object = result.bytes().await?;

    Ok(object)
}

async fn put_into(
    store: &dyn object_store::ObjectStore,
    key: &str,
    content: Bytes,
    force: bool,
) -> Result<(), ObjectStoreError> {
    let path = object_store::path::Path::from(key);

    // We've found an object, but the user did not pass force, return an error.
    if !force && store.head(&path).await.is_ok() {
        return Err(ObjectStoreError::Exists);
    }

    store
        .put(&path, object_store::PutPayload::from_bytes(content))
        .await?;

    Ok(())
}

async fn list_from(
    store: &dyn object_store::ObjectStore,
    prefix: &str,
) -> Result<Vec<String>, ObjectStoreError> {
    let prefix = object_store::path::Path::from(prefix);

    let objects: Vec<object_store::ObjectMeta> = match store.list(Some(&prefix)).try_collect().await {
        Ok(objects) => objects,
        Err(object_store::Error::NotFound { .. }) => vec![],
        Err(e) => return Err(e.into()),
    };

    let mut keys: Vec<String> = objects
        .into_iter()
        .map(|object| object.location.to_string())
        .collect();
    keys.sort();

    Ok(keys)
}
