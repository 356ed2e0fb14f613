use std::sync::Arc;
use std::time::Duration;

use conclave_kernel_chain::EnvelopeDraft;
use conclave_kernel_ledger::{AppendError, LedgerStore};
use conclave_kernel_lifecycle::{DueTransition, TaskPayload, TimeoutPolicy};
use conclave_kernel_projection::ProjectionEngine;
use conclave_types::{ActorId, Branch, EventKind};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::error::SubstrateError;

/// Applies timeout-driven transitions. Every one is authored by `system`
/// under the administrative branch and carries no blame.
pub struct TimeoutSweeper {
    ledger: LedgerStore,
    projections: Arc<ProjectionEngine>,
    policy: TimeoutPolicy,
}

impl TimeoutSweeper {
    pub fn new(ledger: LedgerStore, projections: Arc<ProjectionEngine>, policy: TimeoutPolicy) -> Self {
        Self {
            ledger,
            projections,
            policy,
        }
    }

    pub fn policy(&self) -> &TimeoutPolicy {
        &self.policy
    }

    /// Append every transition due now. A task that moved on in the meantime
    /// is skipped.
    pub async fn sweep(&self) -> Result<Vec<DueTransition>, SubstrateError> {
        self.ledger.halt_flag().check()?;
        self.projections.catch_up().await?;

        let now = self.ledger.clock().now();
        let due = self
            .projections
            .with_views(|views| views.tasks.due(&self.policy, now))
            .await;

        let mut applied = Vec::with_capacity(due.len());
        for transition in due {
            let payload = TaskPayload::new(transition.task_id.clone())
                .with_reason(transition.reason.as_str())
                .automatic();
            let draft = EnvelopeDraft::new(
                EventKind::Task {
                    branch: Branch::Administrative,
                    verb: transition.verb,
                },
                ActorId::system(),
                serde_json::to_value(&payload)?,
            );
            match self.ledger.append(draft).await {
                Ok(envelope) => {
                    info!(
                        task_id = %transition.task_id,
                        from = transition.from.as_str(),
                        verb = %transition.verb,
                        reason = %transition.reason,
                        sequence = envelope.sequence,
                        "Timeout transition applied"
                    );
                    applied.push(transition);
                }
                Err(AppendError::IllegalTransition { task_id, error }) => {
                    debug!(task_id = %task_id, error = %error, "Timeout lost a race; skipped");
                }
                Err(e) => return Err(e.into()),
            }
        }
        Ok(applied)
    }

    pub async fn run(&self, interval: Duration, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(interval);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if self.ledger.halt_flag().is_halted() {
                        continue;
                    }
                    if let Err(e) = self.sweep().await {
                        warn!(error = %e, "Timeout sweep failed");
                    }
                }
                _ = shutdown.changed() => break,
            }
        }
    }
}
