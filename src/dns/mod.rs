//! The DNS updater: keeps alias records of a managed zone pointed at the labelled load
//! balancers.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tap::TapFallible;
use tracing::{debug, error, info, instrument, warn};

pub use cf_dns::{credentials_from_env, CfDns};
pub use directory::{LoadBalancer, LoadBalancerDirectory, LoadBalancers, ServiceDirectory};
pub use ownership::{AliasTargetOwnership, OwnershipKind, OwnershipPolicy, SuffixOwnership};
pub use provider::{ChangeBatch, DnsProvider, Record, RecordKey, RecordKind, Upsert};

use crate::controller::{HealthMonitor, HealthState, Updater};
use crate::error::Error;
use crate::metrics::Metrics;
use crate::snapshot::IngressSnapshot;

mod cf_dns;
mod directory;
mod ownership;
pub mod plan;
mod provider;

#[derive(Debug, Clone)]
pub struct DnsConfig {
    /// Name of the managed zone, e.g. `example.com`.
    pub zone: String,
    /// Alias label value the load balancers are looked up with.
    pub label_value: String,
}

pub struct DnsUpdater<P, D> {
    zone: String,
    label_value: String,
    provider: P,
    directory: D,
    ownership: Box<dyn OwnershipPolicy>,
    zone_id: Mutex<Option<String>>,
    health: HealthMonitor,
    metrics: Option<Arc<Metrics>>,
}

impl<P, D> DnsUpdater<P, D>
where
    P: DnsProvider,
    D: LoadBalancerDirectory,
{
    pub fn new(
        config: DnsConfig,
        provider: P,
        directory: D,
        ownership: Box<dyn OwnershipPolicy>,
    ) -> Result<Self, Error> {
        let zone = config.zone.trim().trim_end_matches('.').to_string();
        if zone.is_empty() {
            return Err(Error::construction("dns zone is required"));
        }

        if config.label_value.trim().is_empty() {
            return Err(Error::construction("load balancer label value is required"));
        }

        Ok(Self {
            zone,
            label_value: config.label_value,
            provider,
            directory,
            ownership,
            zone_id: Mutex::new(None),
            health: HealthMonitor::new(),
            metrics: None,
        })
    }

    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = Some(metrics);

        self
    }

    fn zone_id(&self) -> Option<String> {
        self.zone_id
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    fn set_zone_id(&self, zone_id: Option<String>) {
        *self
            .zone_id
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = zone_id;
    }
}

#[async_trait]
impl<P, D> Updater for DnsUpdater<P, D>
where
    P: DnsProvider,
    D: LoadBalancerDirectory,
{
    fn name(&self) -> &str {
        "dns"
    }

    #[instrument(err, skip(self), fields(zone = %self.zone))]
    async fn start(&self) -> anyhow::Result<()> {
        let zone_id = self
            .provider
            .resolve_zone(&self.zone)
            .await
            .tap_err(|err| error!(%err, "resolve zone id failed"))?;

        info!(%zone_id, "dns updater started");

        self.set_zone_id(Some(zone_id));

        Ok(())
    }

    #[instrument(err, skip(self), fields(zone = %self.zone))]
    async fn stop(&self) -> anyhow::Result<()> {
        self.set_zone_id(None);
        self.health.mark_unhealthy();

        info!("dns updater stopped");

        Ok(())
    }

    #[instrument(err, skip(self, snapshot), fields(zone = %self.zone, version = snapshot.version()))]
    async fn update(&self, snapshot: &IngressSnapshot) -> anyhow::Result<()> {
        // dropped without `succeed` when the update fails or is abandoned
        let guard = UpdateGuard::new(&self.health);

        let zone_id = self
            .zone_id()
            .ok_or_else(|| anyhow::anyhow!("dns updater is not started"))?;

        let load_balancers = self.directory.find(&self.label_value).await?;

        if load_balancers.is_empty() {
            warn!(label_value = %self.label_value, "no load balancer found");
        }

        let desired =
            plan::desired_records(&self.zone, &self.label_value, snapshot, &load_balancers);

        let existing = self
            .provider
            .list_records(&zone_id)
            .await
            .tap_err(|err| error!(%err, "list existing records failed"))?;

        let batch = plan::diff(&desired, &existing, |record| {
            self.ownership.owns(record, &load_balancers)
        });

        if batch.is_empty() {
            debug!(desired = desired.len(), "dns records are up to date");
        } else {
            info!(upserts = ?batch.upserts, deletes = ?batch.deletes, "apply dns changes");

            self.provider.apply(&zone_id, &batch).await?;

            if let Some(metrics) = &self.metrics {
                metrics.record_changes(batch.upserts.len(), batch.deletes.len());
            }
        }

        guard.succeed();

        Ok(())
    }

    fn health(&self) -> HealthState {
        self.health.state()
    }
}

struct UpdateGuard<'a> {
    health: &'a HealthMonitor,
    succeeded: bool,
}

impl<'a> UpdateGuard<'a> {
    fn new(health: &'a HealthMonitor) -> Self {
        Self {
            health,
            succeeded: false,
        }
    }

    fn succeed(mut self) {
        self.succeeded = true;
        self.health.mark_healthy();
    }
}

impl Drop for UpdateGuard<'_> {
    fn drop(&mut self) {
        if !self.succeeded {
            self.health.mark_unhealthy();
        }
    }
}
