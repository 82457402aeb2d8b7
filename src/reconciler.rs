//! Reconciliation of pending payments against chain state, and the expiry sweep.
//!
//! Neither pass returns an error: failures are logged per payment and the
//! payment simply stays `pending` until the next pass. The conditional write
//! in the repository is what keeps a payment from transitioning twice when
//! passes overlap.

use std::sync::Arc;

use chrono::Utc;
use futures::{stream, StreamExt};
use tracing::{debug, error, info};

use crate::{
    chain::AdapterRegistry,
    db::{
        repositories::models::payment::{Payment, PaymentStatus, Transition},
        PaymentRepository,
    },
    notifier::{Notifier, WebhookEvent},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconcileSettings {
    pub min_confirmations: u64,
    /// Upper bound on concurrent adapter calls within one pass.
    pub max_concurrency: usize,
}

impl Default for ReconcileSettings {
    fn default() -> Self {
        Self {
            min_confirmations: 1,
            max_concurrency: 8,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PassReport {
    pub checked: usize,
    pub completed: usize,
    /// Settled on chain but another pass had already moved the payment.
    pub conflicts: usize,
    pub failed: usize,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub expired: usize,
    pub notified: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Outcome {
    Pending,
    Completed,
    Conflict,
    Failed,
}

pub struct Reconciler<R> {
    repository: R,
    adapters: Arc<AdapterRegistry>,
    notifier: Arc<dyn Notifier>,
    settings: ReconcileSettings,
}

impl<R: PaymentRepository> Reconciler<R> {
    pub fn new(
        repository: R,
        adapters: Arc<AdapterRegistry>,
        notifier: Arc<dyn Notifier>,
        settings: ReconcileSettings,
    ) -> Self {
        Self {
            repository,
            adapters,
            notifier,
            settings,
        }
    }

    /// Checks every pending payment once.
    pub async fn reconcile_pending(&self) -> PassReport {
        let pending = match self.repository.find_pending().await {
            Ok(pending) => pending,
            Err(e) => {
                error!("Error listing pending payments: {}", e);
                return PassReport::default();
            }
        };

        let mut report = PassReport {
            checked: pending.len(),
            ..PassReport::default()
        };

        let outcomes: Vec<Outcome> = stream::iter(pending)
            .map(|payment| async move { self.reconcile_payment(&payment).await })
            .buffer_unordered(self.settings.max_concurrency.max(1))
            .collect()
            .await;

        for outcome in outcomes {
            match outcome {
                Outcome::Pending => {}
                Outcome::Completed => report.completed += 1,
                Outcome::Conflict => report.conflicts += 1,
                Outcome::Failed => report.failed += 1,
            }
        }

        debug!("Reconciliation pass finished: {:?}", report);
        report
    }

    async fn reconcile_payment(&self, payment: &Payment) -> Outcome {
        let detection = match self
            .adapters
            .detect(payment.currency, &payment.address, payment.expected_amount)
            .await
        {
            Ok(detection) => detection,
            Err(e) => {
                error!(
                    "Payment {} left pending for investigation: {}",
                    payment.id, e
                );
                return Outcome::Failed;
            }
        };

        if !detection.settles(self.settings.min_confirmations) {
            return Outcome::Pending;
        }
        let tx_hash = match detection.tx_hash {
            Some(tx_hash) => tx_hash,
            None => return Outcome::Pending,
        };

        let transition = Transition::Complete {
            tx_hash,
            confirmations: detection.confirmations,
        };
        let res = self
            .repository
            .conditional_update(&payment.id, PaymentStatus::Pending, &transition, Utc::now())
            .await;

        match res {
            Ok(Some(completed)) => {
                info!(
                    "Payment {} completed: {} {} to {} ({} confirmations)",
                    completed.id,
                    detection.amount,
                    completed.currency,
                    completed.address,
                    detection.confirmations
                );
                if completed.webhook_url.is_some() {
                    self.notifier
                        .notify(&completed, WebhookEvent::Completed)
                        .await;
                }
                Outcome::Completed
            }
            Ok(None) => Outcome::Conflict,
            Err(e) => {
                error!("Error marking payment {} complete: {}", payment.id, e);
                Outcome::Failed
            }
        }
    }

    /// Expires overdue pending payments and notifies each one exactly once.
    pub async fn sweep_expired(&self) -> SweepReport {
        let expired = match self.repository.expire_overdue(Utc::now()).await {
            Ok(expired) => expired,
            Err(e) => {
                error!("Error expiring overdue payments: {}", e);
                return SweepReport::default();
            }
        };

        for payment in &expired {
            info!("Payment {} expired unpaid ({})", payment.id, payment.address);
        }

        let subscribed: Vec<&Payment> = expired
            .iter()
            .filter(|payment| payment.webhook_url.is_some())
            .collect();
        let notified = subscribed.len();

        stream::iter(subscribed)
            .for_each_concurrent(self.settings.max_concurrency.max(1), |payment| async move {
                self.notifier.notify(payment, WebhookEvent::Expired).await;
            })
            .await;

        SweepReport {
            expired: expired.len(),
            notified,
        }
    }
}
