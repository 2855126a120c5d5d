use super::{ObjectStore, ObjectStoreError};
use async_trait::async_trait;
use bytes::Bytes;
use object_store::memory::InMemory;

/// Keeps every object in process memory. Contents vanish with the process.
#[derive(Debug, Default)]
pub struct Engine(InMemory);

impl Engine {
    pub fn new() -> Self {
        Engine(InMemory::new())
    }
}

#[async_trait]
impl ObjectStore for Engine {
    async fn get(&self, key: &str) -> Result<Bytes, ObjectStoreError> {
        super::get_from(&self.0, key).await
    }

    async fn put(&self, key: &str, content: Bytes, force: bool) -> Result<(), ObjectStoreError> {
        super::put_into(&self.0, key, content, force).await
    }

    async fn list_keys(&self, prefix: &str) -> Result<Vec<String>, ObjectStoreError> {
        super::list_from(&self.0, prefix).await
    }
}
