use crate::{
    api::{
        epoch_milli,
        sites::{ErrorKind, Status},
    },
    storage,
};
use anyhow::{Context, Result};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use strum::{Display, EnumDiscriminants, EnumString};
use tokio::sync::broadcast;
use tracing::{debug, error, info, trace};
use uuid::Uuid;

#[derive(Debug, PartialEq, Eq, EnumDiscriminants, Display, Serialize, Deserialize, Clone, JsonSchema)]
#[strum_discriminants(derive(EnumString, Display, Hash))]
#[strum_discriminants(strum(serialize_all = "snake_case"))]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum Kind {
    // Site events
    CreatedSite {
        site_id: String,
        site_url: String,
    },

    // Deployment events
    QueuedDeployment {
        site_id: String,
        reason: String,
        attempt: u64,
    },
    EnteredStep {
        site_id: String,
        status: Status,
    },
    PurchasedDomain {
        site_id: String,
        domain: String,
    },
    MigratedDns {
        site_id: String,
        domain: String,
        nameservers: Vec<String>,
    },
    PublishedSite {
        site_id: String,
        repository: String,
        commit: String,
    },
    CompletedDeployment {
        site_id: String,
        live_url: String,
    },
    FailedDeployment {
        site_id: String,
        step: Status,
        kind: ErrorKind,
    },
    StartedDeploymentCancellation {
        site_id: String,
    },
}

impl Kind {
    pub fn site_id(&self) -> &str {
        match self {
            Kind::CreatedSite { site_id, .. }
            | Kind::QueuedDeployment { site_id, .. }
            | Kind::EnteredStep { site_id, .. }
            | Kind::PurchasedDomain { site_id, .. }
            | Kind::MigratedDns { site_id, .. }
            | Kind::PublishedSite { site_id, .. }
            | Kind::CompletedDeployment { site_id, .. }
            | Kind::FailedDeployment { site_id, .. }
            | Kind::StartedDeploymentCancellation { site_id } => site_id,
        }
    }
}

/// A single event
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, JsonSchema)]
pub struct Event {
    /// Unique identifier for event.
    pub id: String,

    /// The type of event it is.
    pub kind: Kind,

    /// Time event was performed in epoch milliseconds.
    pub emitted: u64,
}

impl TryFrom<storage::events::Event> for Event {
    type Error = anyhow::Error;

    fn try_from(value: storage::events::Event) -> Result<Self> {
        let emitted = value.emitted.parse::<u64>().with_context(|| {
            format!(
                "Could not parse field 'emitted' from storage value '{}'",
                value.emitted
            )
        })?;

        let kind: Kind = serde_json::from_str(&value.details).with_context(|| {
            format!(
                "Could not parse field 'details' from storage value '{}'",
                value.details
            )
        })?;

        Ok(Event {
            id: value.id,
            kind,
            emitted,
        })
    }
}

impl TryFrom<Event> for storage::events::Event {
    type Error = anyhow::Error;

    fn try_from(value: Event) -> Result<Self> {
        let details = serde_json::to_string(&value.kind).with_context(|| {
            format!(
                "Could not parse field 'kind' to storage value '{:#?}'",
                value.kind
            )
        })?;

        Ok(Self {
            id: value.id,
            site_id: Some(value.kind.site_id().to_string()),
            kind: KindDiscriminants::from(&value.kind).to_string(),
            details,
            emitted: value.emitted.to_string(),
        })
    }
}

impl Event {
    pub fn new(kind: Kind) -> Self {
        Self {
            id: Uuid::now_v7().to_string(),
            kind,
            emitted: epoch_milli(),
        }
    }
}

/// Every event is written to storage before it's broadcast, so the per site history survives
/// restarts while in-process listeners still see events as they happen.
#[derive(Debug, Clone)]
pub struct EventBus {
    storage: storage::Db,
    broadcast_channel: broadcast::Sender<Event>,
}

impl EventBus {
    /// `retention` and `prune_interval` are in seconds.
    pub fn new(storage: storage::Db, retention: u64, prune_interval: u64) -> Self {
        let (tx, _) = broadcast::channel(100);

        let event_bus = Self {
            storage: storage.clone(),
            broadcast_channel: tx,
        };

        tokio::spawn(async move {
            loop {
                if let Err(e) = prune_events(&storage, retention).await {
                    error!(error = %e, "encountered an error during attempt to prune old events")
                };

                tokio::time::sleep(Duration::from_secs(prune_interval.max(1))).await;
            }
        });

        event_bus
    }

    /// Returns a channel receiver end which can be used to listen to events.
    /// The receiver will drop automatically when out of scope.
    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.broadcast_channel.subscribe()
    }

    /// Publishes and waits until the event is stored. Having no listeners is not an error.
    pub async fn try_publish(&self, kind: Kind) -> Result<Event> {
        let new_event = Event::new(kind.clone());

        let new_event_storage: storage::events::Event =
            new_event.clone().try_into().with_context(|| {
                format!(
                    "could not publish event for kind '{}'; could not serialize event into storage",
                    &kind
                )
            })?;

        let mut conn = self.storage.write_conn().await.with_context(|| {
            format!(
                "could not publish event for kind '{}'; Database error;",
                new_event.kind,
            )
        })?;

        storage::events::insert(&mut conn, &new_event_storage)
            .await
            .with_context(|| {
                format!(
                    "could not publish event for kind '{}'; Database insert error",
                    &kind
                )
            })?;

        drop(conn);

        debug!(kind = %kind, site_id = kind.site_id(), emitted = new_event.emitted, "new event");

        if let Err(err) = self.broadcast_channel.send(new_event.clone()) {
            trace!(error = %err, "No receivers available to receive published message");
        }

        Ok(new_event)
    }

    /// Publishes in the background; failures are only logged.
    pub fn publish(&self, kind: Kind) {
        let event_bus = self.clone();

        tokio::spawn(async move {
            if let Err(err) = event_bus.try_publish(kind).await {
                error!(error = %err, "Could not publish event");
            }
        });
    }
}

async fn prune_events(storage: &storage::Db, retention: u64) -> Result<(), storage::StorageError> {
    let cutoff = epoch_milli().saturating_sub(Duration::from_secs(retention).as_millis() as u64);

    let mut conn = match storage.write_conn().await {
        Ok(conn) => conn,
        Err(e) => {
            error!("could not prune events; connection error");
            return Err(e);
        }
    };

    let total_pruned = storage::events::delete_older_than(&mut conn, cutoff).await?;

    if total_pruned > 0 {
        info!(
            retention = retention,
            total_pruned = total_pruned,
            "pruned old events"
        );
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::tests::TestHarness;
    use pretty_assertions::assert_eq;

    #[tokio::test]
    async fn published_events_are_stored_and_broadcast() {
        let harness = TestHarness::new().await;
        let bus = EventBus::new(harness.db.clone(), 3600, 3600);
        let mut listener = bus.subscribe();

        let published = bus
            .try_publish(Kind::EnteredStep {
                site_id: "site_one".into(),
                status: Status::Fetching,
            })
            .await
            .expect("Failed to publish event");

        let received = listener.recv().await.expect("Failed to receive event");
        assert_eq!(received, published);

        let mut conn = harness.read_conn().await.expect("Failed to open connection");
        let stored = storage::events::list_by_site(&mut conn, "site_one", 0, 0)
            .await
            .expect("Failed to list events");

        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].kind, "entered_step");

        let round_tripped: Event = stored[0].clone().try_into().expect("Failed to parse event");
        assert_eq!(round_tripped, published);
    }

    #[tokio::test]
    async fn pruning_removes_expired_events() {
        let harness = TestHarness::new().await;
        let bus = EventBus::new(harness.db.clone(), 3600, 3600);

        let mut old: storage::events::Event = Event::new(Kind::CreatedSite {
            site_id: "site_one".into(),
            site_url: "joes-pizza.com".into(),
        })
        .try_into()
        .expect("Failed to convert event");
        old.emitted = "1".into();

        {
            let mut conn = harness.write_conn().await.expect("Failed to open connection");
            storage::events::insert(&mut conn, &old).await.expect("Failed to insert event");
        }

        bus.try_publish(Kind::StartedDeploymentCancellation {
            site_id: "site_one".into(),
        })
        .await
        .expect("Failed to publish event");

        prune_events(&harness.db, 60).await.expect("Failed to prune");

        let mut conn = harness.read_conn().await.expect("Failed to open connection");
        let remaining = storage::events::list_by_site(&mut conn, "site_one", 0, 0)
            .await
            .expect("Failed to list events");
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].kind, "started_deployment_cancellation");
    }
}
