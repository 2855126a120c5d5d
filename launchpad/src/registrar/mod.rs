pub mod memory;

use async_trait::async_trait;
use serde::Deserialize;
use std::{fmt::Debug, sync::Arc};
use strum::{Display, EnumString};

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum RegistrarError {
    /// The domain is owned by someone else or otherwise can never be registered by us.
    #[error("domain '{0}' is not available for registration")]
    Unavailable(String),

    #[error("registrar rate limited the request; {0}")]
    RateLimited(String),

    #[error("registrar request failed; {0}")]
    Api(String),

    #[error("could not init registrar; {0}")]
    FailedPrecondition(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
#[strum(serialize_all = "snake_case")]
pub enum Availability {
    /// Nobody holds it; a purchase should succeed.
    Available,

    /// Already registered to our account.
    Owned,

    /// Registered to somebody else or reserved.
    Unavailable,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
#[strum(serialize_all = "snake_case")]
pub enum PurchaseStatus {
    Registered,

    /// The account already held the domain. Counts as success.
    AlreadyOwned,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Purchase {
    pub status: PurchaseStatus,

    /// Registration expiry in epoch milliseconds.
    pub expiry: u64,
}

/// Domain registrar and DNS authority.
#[async_trait]
pub trait Registrar: Debug + Send + Sync + 'static {
    async fn check(&self, domain: &str) -> Result<Availability, RegistrarError>;

    async fn purchase(
        &self,
        domain: &str,
        years: u32,
        auto_renew: bool,
    ) -> Result<Purchase, RegistrarError>;

    /// Points the domain's nameservers at the hosting provider and returns the new set.
    async fn migrate_dns(&self, domain: &str) -> Result<Vec<String>, RegistrarError>;
}

#[derive(Debug, Clone, Default, Deserialize, PartialEq, Eq, Display, EnumString)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum Engine {
    #[default]
    Memory,
}

pub fn new(config: &crate::conf::api::Registrar) -> Result<Arc<dyn Registrar>, RegistrarError> {
    #[allow(clippy::match_single_binding)]
    match config.engine {
        Engine::Memory => {
            let settings = config.memory.clone().unwrap_or_default();
            Ok(Arc::new(memory::Engine::new(&settings)))
        }
    }
}
