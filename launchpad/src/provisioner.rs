//! Buys the site's domain and hands its DNS to the hosting provider.
//!
//! Neither step is ever undone. Progress is written to a ledger after every step so a later run
//! picks up where the last one stopped instead of paying for the domain twice.

use crate::{
    api::sites::DomainState,
    registrar::{Availability, Registrar, RegistrarError},
    retry::{retry, RetryPolicy, TimedOut, Transient},
    storage::StorageError,
};
use async_trait::async_trait;
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};
use tracing::{debug, info};

#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum ProvisionError {
    #[error("domain '{0}' is not available for registration")]
    Unavailable(String),

    #[error("{0}")]
    Registrar(RegistrarError),

    #[error("{0}")]
    TimedOut(#[from] TimedOut),

    #[error("could not record domain progress; {0}")]
    Ledger(StorageError),
}

impl From<RegistrarError> for ProvisionError {
    fn from(value: RegistrarError) -> Self {
        match value {
            RegistrarError::Unavailable(domain) => ProvisionError::Unavailable(domain),
            e => ProvisionError::Registrar(e),
        }
    }
}

impl Transient for ProvisionError {
    fn is_transient(&self) -> bool {
        match self {
            ProvisionError::Registrar(RegistrarError::FailedPrecondition(_)) => false,
            ProvisionError::Registrar(_) | ProvisionError::TimedOut(_) => true,
            ProvisionError::Unavailable(_) | ProvisionError::Ledger(_) => false,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DomainProgress {
    pub state: DomainState,
    pub nameservers: Vec<String>,

    /// Registration expiry in epoch milliseconds, when the registrar told us.
    pub expiry: Option<u64>,
}

/// Somewhere durable to write domain progress to.
#[async_trait]
pub trait DomainLedger: Send + Sync {
    async fn record(&self, progress: &DomainProgress) -> Result<(), StorageError>;
}

#[derive(Debug, Clone)]
pub struct Provisioner {
    registrar: Arc<dyn Registrar>,
    policy: RetryPolicy,
    years: u32,
    auto_renew: bool,
}

impl Provisioner {
    pub fn new(registrar: Arc<dyn Registrar>, policy: RetryPolicy, years: u32, auto_renew: bool) -> Self {
        Self {
            registrar,
            policy,
            years,
            auto_renew,
        }
    }

    /// Walks the domain from wherever `progress` says it is to `dns_migrated`.
    pub async fn provision(
        &self,
        domain: &str,
        mut progress: DomainProgress,
        ledger: &dyn DomainLedger,
    ) -> Result<DomainProgress, ProvisionError> {
        if progress.state == DomainState::DnsMigrated {
            debug!(domain = domain, "Domain already provisioned; nothing to do");
            return Ok(progress);
        }

        if progress.state != DomainState::Purchased {
            // A pending marker left by an earlier attempt means a purchase may have gone through
            // without us hearing back.
            let verify_first = progress.state == DomainState::PurchasePending;

            progress.state = DomainState::PurchasePending;
            ledger.record(&progress).await.map_err(ProvisionError::Ledger)?;

            let expiry = self.purchase(domain, verify_first).await?;

            progress.state = DomainState::Purchased;
            progress.expiry = expiry.or(progress.expiry);
            ledger.record(&progress).await.map_err(ProvisionError::Ledger)?;

            info!(domain = domain, "Domain purchased");
        }

        let registrar = &self.registrar;
        let nameservers = retry(&self.policy, "migrate dns", move || async move {
            registrar
                .migrate_dns(domain)
                .await
                .map_err(ProvisionError::from)
        })
        .await?;

        progress.state = DomainState::DnsMigrated;
        progress.nameservers = nameservers;
        ledger.record(&progress).await.map_err(ProvisionError::Ledger)?;

        info!(domain = domain, nameservers = ?progress.nameservers, "Domain DNS migrated");

        Ok(progress)
    }

    /// Any attempt after one whose outcome we never saw confirms availability before buying.
    async fn purchase(&self, domain: &str, verify_first: bool) -> Result<Option<u64>, ProvisionError> {
        let needs_check = AtomicBool::new(verify_first);
        let needs_check = &needs_check;
        let registrar = &self.registrar;
        let (years, auto_renew) = (self.years, self.auto_renew);

        retry(&self.policy, "purchase domain", move || async move {
            if needs_check.load(Ordering::SeqCst) {
                match registrar.check(domain).await? {
                    Availability::Owned => {
                        debug!(domain = domain, "Domain already owned; skipping purchase");
                        return Ok(None);
                    }
                    Availability::Unavailable => {
                        return Err(ProvisionError::Unavailable(domain.to_string()))
                    }
                    Availability::Available => {}
                }
            }

            // Stays set unless the registrar confirms, which covers timeouts that drop this
            // future mid call.
            needs_check.store(true, Ordering::SeqCst);

            let purchase = registrar.purchase(domain, years, auto_renew).await?;

            needs_check.store(false, Ordering::SeqCst);

            Ok(Some(purchase.expiry))
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registrar::{memory, Purchase};
    use std::{sync::Mutex, time::Duration};

    #[derive(Default)]
    struct VecLedger(Mutex<Vec<DomainState>>);

    impl VecLedger {
        fn states(&self) -> Vec<DomainState> {
            self.0.lock().expect("ledger lock poisoned").clone()
        }
    }

    #[async_trait]
    impl DomainLedger for VecLedger {
        async fn record(&self, progress: &DomainProgress) -> Result<(), StorageError> {
            self.0
                .lock()
                .expect("ledger lock poisoned")
                .push(progress.state.clone());
            Ok(())
        }
    }

    /// Completes the first purchase on the registrar side but never answers in time.
    #[derive(Debug)]
    struct LostResponseRegistrar {
        inner: memory::Engine,
        lose_next: AtomicBool,
    }

    #[async_trait]
    impl Registrar for LostResponseRegistrar {
        async fn check(&self, domain: &str) -> Result<Availability, RegistrarError> {
            self.inner.check(domain).await
        }

        async fn purchase(&self, domain: &str, years: u32, auto_renew: bool) -> Result<Purchase, RegistrarError> {
            let purchase = self.inner.purchase(domain, years, auto_renew).await?;
            if self.lose_next.swap(false, Ordering::SeqCst) {
                tokio::time::sleep(Duration::from_secs(30)).await;
            }
            Ok(purchase)
        }

        async fn migrate_dns(&self, domain: &str) -> Result<Vec<String>, RegistrarError> {
            self.inner.migrate_dns(domain).await
        }
    }

    fn policy() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 3,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(2),
            multiplier: 2.0,
            attempt_timeout: Duration::from_millis(200),
        }
    }

    fn provisioner(registrar: Arc<dyn Registrar>) -> Provisioner {
        Provisioner::new(registrar, policy(), 1, true)
    }

    #[tokio::test]
    async fn fresh_domain_is_bought_then_migrated() {
        let registrar = Arc::new(memory::Engine::new(&memory::Config::default()));
        let ledger = VecLedger::default();

        let progress = provisioner(registrar.clone())
            .provision("joes-pizza.com", DomainProgress::default(), &ledger)
            .await
            .expect("Failed to provision");

        assert_eq!(progress.state, DomainState::DnsMigrated);
        assert_eq!(progress.nameservers, memory::Config::default().nameservers);
        assert!(progress.expiry.is_some());
        assert_eq!(
            ledger.states(),
            vec![
                DomainState::PurchasePending,
                DomainState::Purchased,
                DomainState::DnsMigrated
            ]
        );
        assert_eq!(registrar.purchase_calls(), 1);
        assert_eq!(registrar.check_calls(), 0);
        assert_eq!(registrar.migrate_calls(), 1);
    }

    #[tokio::test]
    async fn purchased_domain_only_gets_migrated() {
        let registrar = Arc::new(memory::Engine::new(&memory::Config::default()));
        registrar
            .purchase("joes-pizza.com", 1, true)
            .await
            .expect("Failed to purchase domain");
        let ledger = VecLedger::default();

        provisioner(registrar.clone())
            .provision(
                "joes-pizza.com",
                DomainProgress {
                    state: DomainState::Purchased,
                    ..Default::default()
                },
                &ledger,
            )
            .await
            .expect("Failed to provision");

        assert_eq!(registrar.purchase_calls(), 1);
        assert_eq!(registrar.check_calls(), 0);
        assert_eq!(ledger.states(), vec![DomainState::DnsMigrated]);
    }

    #[tokio::test]
    async fn migrated_domain_is_left_alone() {
        let registrar = Arc::new(memory::Engine::new(&memory::Config::default()));
        let ledger = VecLedger::default();

        let progress = provisioner(registrar.clone())
            .provision(
                "joes-pizza.com",
                DomainProgress {
                    state: DomainState::DnsMigrated,
                    nameservers: vec!["ns1.example".into()],
                    expiry: None,
                },
                &ledger,
            )
            .await
            .expect("Failed to provision");

        assert_eq!(progress.nameservers, vec!["ns1.example".to_string()]);
        assert_eq!(registrar.calls(), 0);
        assert!(ledger.states().is_empty());
    }

    #[tokio::test]
    async fn pending_purchase_is_verified_before_buying_again() {
        let registrar = Arc::new(memory::Engine::new(&memory::Config::default()));
        // The earlier attempt bought it, then the process died before recording that.
        registrar
            .purchase("joes-pizza.com", 1, true)
            .await
            .expect("Failed to purchase domain");
        let ledger = VecLedger::default();

        provisioner(registrar.clone())
            .provision(
                "joes-pizza.com",
                DomainProgress {
                    state: DomainState::PurchasePending,
                    ..Default::default()
                },
                &ledger,
            )
            .await
            .expect("Failed to provision");

        assert_eq!(registrar.check_calls(), 1);
        assert_eq!(registrar.purchase_calls(), 1);
    }

    #[tokio::test]
    async fn timed_out_purchase_is_not_repeated() {
        let registrar = Arc::new(LostResponseRegistrar {
            inner: memory::Engine::new(&memory::Config::default()),
            lose_next: AtomicBool::new(true),
        });
        let ledger = VecLedger::default();

        let progress = provisioner(registrar.clone())
            .provision("joes-pizza.com", DomainProgress::default(), &ledger)
            .await
            .expect("Failed to provision");

        assert_eq!(progress.state, DomainState::DnsMigrated);
        assert_eq!(registrar.inner.purchase_calls(), 1);
        assert_eq!(registrar.inner.check_calls(), 1);
    }

    #[tokio::test]
    async fn unavailable_domain_is_fatal() {
        let registrar = Arc::new(memory::Engine::new(&memory::Config {
            unavailable: vec!["google.com".into()],
            ..Default::default()
        }));
        let ledger = VecLedger::default();

        let err = provisioner(registrar.clone())
            .provision("google.com", DomainProgress::default(), &ledger)
            .await
            .unwrap_err();

        assert_eq!(err, ProvisionError::Unavailable("google.com".into()));
        assert!(!err.is_transient());
        assert_eq!(registrar.purchase_calls(), 1);
        assert_eq!(registrar.migrate_calls(), 0);
        assert_eq!(ledger.states(), vec![DomainState::PurchasePending]);
    }

    struct BrokenLedger;

    #[async_trait]
    impl DomainLedger for BrokenLedger {
        async fn record(&self, _progress: &DomainProgress) -> Result<(), StorageError> {
            Err(StorageError::Connection("database is locked".into()))
        }
    }

    #[tokio::test]
    async fn unrecorded_progress_stops_before_buying() {
        let registrar = Arc::new(memory::Engine::new(&memory::Config::default()));

        let err = provisioner(registrar.clone())
            .provision("joes-pizza.com", DomainProgress::default(), &BrokenLedger)
            .await
            .unwrap_err();

        let expected = ProvisionError::Ledger(StorageError::Connection("database is locked".into()));
        assert_eq!(err.clone(), expected);
        assert!(!err.is_transient());
        assert_eq!(registrar.purchase_calls(), 0);
    }
}
