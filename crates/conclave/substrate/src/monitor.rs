use std::sync::Arc;
use std::time::Duration;

use conclave_kernel_chain::EnvelopeDraft;
use conclave_kernel_ledger::LedgerStore;
use conclave_kernel_lifecycle::{LegitimacyBand, LegitimacyPayload, ViolationDensity};
use conclave_kernel_projection::ProjectionEngine;
use conclave_types::{ActorId, EntityId, EventKind, LegitimacyVerb};
use tokio::sync::watch;
use tracing::{info, warn};

use crate::error::SubstrateError;

/// Asks the density policy about every entity and records a decay where
/// the policy's band is worse than the current one. Never moves a band up.
pub struct LegitimacyMonitor {
    ledger: LedgerStore,
    projections: Arc<ProjectionEngine>,
    policy: Arc<dyn ViolationDensity>,
}

impl LegitimacyMonitor {
    pub fn new(
        ledger: LedgerStore,
        projections: Arc<ProjectionEngine>,
        policy: Arc<dyn ViolationDensity>,
    ) -> Self {
        Self {
            ledger,
            projections,
            policy,
        }
    }

    pub async fn evaluate(&self) -> Result<Vec<(EntityId, LegitimacyBand)>, SubstrateError> {
        self.ledger.halt_flag().check()?;
        self.projections.catch_up().await?;

        let now = self.ledger.clock().now();
        let decays: Vec<_> = self
            .projections
            .bands()
            .await
            .into_iter()
            .filter_map(|record| {
                let verdict = self.policy.assess(&record, now);
                (verdict > record.current_band).then_some((record, verdict))
            })
            .collect();

        let mut recorded = Vec::with_capacity(decays.len());
        for (record, band) in decays {
            let payload = LegitimacyPayload::new(record.entity_id.clone())
                .with_band(band)
                .with_detail("violation density");
            let draft = EnvelopeDraft::new(
                EventKind::Legitimacy(LegitimacyVerb::Decayed),
                ActorId::system(),
                serde_json::to_value(&payload)?,
            );
            let envelope = self.ledger.append(draft).await?;
            info!(
                entity_id = %record.entity_id,
                from = record.current_band.as_str(),
                to = band.as_str(),
                sequence = envelope.sequence,
                "Legitimacy band decayed"
            );
            recorded.push((record.entity_id, band));
        }
        Ok(recorded)
    }

    pub async fn run(&self, interval: Duration, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(interval);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if self.ledger.halt_flag().is_halted() {
                        continue;
                    }
                    if let Err(e) = self.evaluate().await {
                        warn!(error = %e, "Legitimacy evaluation failed");
                    }
                }
                _ = shutdown.changed() => break,
            }
        }
    }
}
