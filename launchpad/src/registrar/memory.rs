use super::{Availability, Purchase, PurchaseStatus, Registrar, RegistrarError};
use crate::api::epoch_milli;
use async_trait::async_trait;
use dashmap::DashMap;
use serde::Deserialize;
use std::{
    collections::HashSet,
    sync::atomic::{AtomicU64, Ordering},
};

const MILLIS_PER_YEAR: u64 = 365 * 24 * 60 * 60 * 1000;

#[derive(Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct Config {
    /// Nameservers handed back by every DNS migration.
    pub nameservers: Vec<String>,

    /// Domains that behave as registered to someone else.
    #[serde(default)]
    pub unavailable: Vec<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            nameservers: vec!["ns1.launchpad.test".into(), "ns2.launchpad.test".into()],
            unavailable: vec![],
        }
    }
}

/// A registrar that keeps its ledger in process memory and counts every call made against it.
#[derive(Debug, Default)]
pub struct Engine {
    nameservers: Vec<String>,
    unavailable: HashSet<String>,
    owned: DashMap<String, Purchase>,
    migrated: DashMap<String, Vec<String>>,
    check_calls: AtomicU64,
    purchase_calls: AtomicU64,
    migrate_calls: AtomicU64,
}

impl Engine {
    pub fn new(config: &Config) -> Self {
        Self {
            nameservers: config.nameservers.clone(),
            unavailable: config.unavailable.iter().map(|d| d.to_lowercase()).collect(),
            ..Default::default()
        }
    }

    pub fn check_calls(&self) -> u64 {
        self.check_calls.load(Ordering::SeqCst)
    }

    pub fn purchase_calls(&self) -> u64 {
        self.purchase_calls.load(Ordering::SeqCst)
    }

    pub fn migrate_calls(&self) -> u64 {
        self.migrate_calls.load(Ordering::SeqCst)
    }

    /// Total calls of every kind.
    pub fn calls(&self) -> u64 {
        self.check_calls() + self.purchase_calls() + self.migrate_calls()
    }

    pub fn owns(&self, domain: &str) -> bool {
        self.owned.contains_key(&domain.to_lowercase())
    }

    pub fn nameservers_for(&self, domain: &str) -> Option<Vec<String>> {
        self.migrated
            .get(&domain.to_lowercase())
            .map(|entry| entry.value().clone())
    }
}

#[async_trait]
impl Registrar for Engine {
    async fn check(&self, domain: &str) -> Result<Availability, RegistrarError> {
        self.check_calls.fetch_add(1, Ordering::SeqCst);
        let domain = domain.to_lowercase();

        if self.owned.contains_key(&domain) {
            return Ok(Availability::Owned);
        }

        if self.unavailable.contains(&domain) {
            return Ok(Availability::Unavailable);
        }

        Ok(Availability::Available)
    }

    async fn purchase(
        &self,
        domain: &str,
        years: u32,
        _auto_renew: bool,
    ) -> Result<Purchase, RegistrarError> {
        self.purchase_calls.fetch_add(1, Ordering::SeqCst);
        let domain = domain.to_lowercase();

        if self.unavailable.contains(&domain) {
            return Err(RegistrarError::Unavailable(domain));
        }

        if let Some(existing) = self.owned.get(&domain) {
            return Ok(Purchase {
                status: PurchaseStatus::AlreadyOwned,
                expiry: existing.expiry,
            });
        }

        let purchase = Purchase {
            status: PurchaseStatus::Registered,
            expiry: epoch_milli() + u64::from(years.max(1)) * MILLIS_PER_YEAR,
        };

        self.owned.insert(domain, purchase.clone());

        Ok(purchase)
    }

    async fn migrate_dns(&self, domain: &str) -> Result<Vec<String>, RegistrarError> {
        self.migrate_calls.fetch_add(1, Ordering::SeqCst);
        let domain = domain.to_lowercase();

        if !self.owned.contains_key(&domain) {
            return Err(RegistrarError::Api(format!(
                "domain '{domain}' is not registered to this account"
            )));
        }

        self.migrated.insert(domain, self.nameservers.clone());

        Ok(self.nameservers.clone())
    }
}
