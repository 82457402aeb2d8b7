use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};

use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, warn};

use crate::{
    db::PaymentRepository,
    reconciler::{PassReport, Reconciler, SweepReport},
};

/// Single-flight flag for one loop.
#[derive(Debug, Default)]
pub struct PassGate {
    running: AtomicBool,
}

impl PassGate {
    pub fn try_enter(&self) -> Option<PassGuard<'_>> {
        self.running
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| PassGuard { gate: self })
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }
}

pub struct PassGuard<'a> {
    gate: &'a PassGate,
}

impl Drop for PassGuard<'_> {
    fn drop(&mut self) {
        self.gate.running.store(false, Ordering::Release);
    }
}

pub struct Scheduler<R> {
    reconciler: Arc<Reconciler<R>>,
    reconcile_interval: Duration,
    sweep_interval: Duration,
    reconcile_gate: PassGate,
    sweep_gate: PassGate,
}

impl<R: PaymentRepository> Scheduler<R> {
    pub fn new(
        reconciler: Arc<Reconciler<R>>,
        reconcile_interval: Duration,
        sweep_interval: Duration,
    ) -> Self {
        Self {
            reconciler,
            reconcile_interval,
            sweep_interval,
            reconcile_gate: PassGate::default(),
            sweep_gate: PassGate::default(),
        }
    }

    /// Runs one reconciliation pass unless one is already in progress.
    pub async fn tick_reconcile(&self) -> Option<PassReport> {
        let _guard = match self.reconcile_gate.try_enter() {
            Some(guard) => guard,
            None => {
                warn!("Previous reconciliation pass still running, skipping tick");
                return None;
            }
        };

        Some(self.reconciler.reconcile_pending().await)
    }

    /// Runs one expiry sweep unless one is already in progress.
    pub async fn tick_sweep(&self) -> Option<SweepReport> {
        let _guard = match self.sweep_gate.try_enter() {
            Some(guard) => guard,
            None => {
                warn!("Previous expiry sweep still running, skipping tick");
                return None;
            }
        };

        Some(self.reconciler.sweep_expired().await)
    }

    /// Drives both loops forever. The first tick of each fires immediately.
    pub async fn run(&self) {
        debug!(
            "Starting scheduler: reconcile every {:?}, sweep every {:?}",
            self.reconcile_interval, self.sweep_interval
        );

        tokio::join!(self.reconcile_loop(), self.sweep_loop());
    }

    async fn reconcile_loop(&self) {
        let mut ticker = interval(self.reconcile_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            ticker.tick().await;
            if let Some(report) = self.tick_reconcile().await {
                if report.completed > 0 || report.failed > 0 {
                    debug!("Reconciliation tick: {:?}", report);
                }
            }
        }
    }

    async fn sweep_loop(&self) {
        let mut ticker = interval(self.sweep_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            ticker.tick().await;
            if let Some(report) = self.tick_sweep().await {
                if report.expired > 0 {
                    debug!("Expiry tick: {:?}", report);
                }
            }
        }
    }
}
