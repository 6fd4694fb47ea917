//! Coordinator Catalog
//!
//! Process-wide registry of live coordinators keyed by transaction id. It
//! creates coordinators for new transactions, rebuilds them from persisted
//! documents after a restart and forgets them once they finish.

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{error, info, warn};

use super::error::CoordinatorError;
use super::gate::TicketPool;
use super::machine::{CoordinatorContext, CoordinatorHandle, StartPoint, TransactionCoordinator};
use super::metrics::StateMetrics;
use super::participant::ParticipantClient;
use super::store::DocumentStore;
use super::types::{ParticipantId, TxnId};
use crate::config::CoordinatorConfig;

/// What [`CoordinatorCatalog::recover_all`] found
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RecoveryReport {
    /// Documents without a decision, restarted at vote collection
    pub resumed_voting: usize,
    /// Documents with a decision, restarted at delivery
    pub resumed_delivery: usize,
    /// Unreadable or inconsistent documents left untouched
    pub skipped: usize,
}

impl RecoveryReport {
    pub fn total(&self) -> usize {
        self.resumed_voting + self.resumed_delivery
    }
}

pub struct CoordinatorCatalog {
    ctx: Arc<CoordinatorContext>,
    coordinators: Arc<DashMap<TxnId, CoordinatorHandle>>,
    recovered: AtomicBool,
}

impl CoordinatorCatalog {
    pub fn new(
        store: Arc<dyn DocumentStore>,
        gate: Arc<TicketPool>,
        client: Arc<dyn ParticipantClient>,
        config: CoordinatorConfig,
    ) -> Self {
        Self::with_context(CoordinatorContext {
            store,
            gate,
            client,
            metrics: Arc::new(StateMetrics::new()),
            config,
        })
    }

    pub fn with_context(ctx: CoordinatorContext) -> Self {
        Self {
            ctx: Arc::new(ctx),
            coordinators: Arc::new(DashMap::new()),
            recovered: AtomicBool::new(false),
        }
    }

    pub fn metrics(&self) -> &Arc<StateMetrics> {
        &self.ctx.metrics
    }

    pub fn store(&self) -> &Arc<dyn DocumentStore> {
        &self.ctx.store
    }

    /// Start the commit protocol for `txn`
    ///
    /// A second call for a transaction that is still live returns the
    /// existing coordinator's handle; its participant list is not replaced.
    pub fn create_coordinator(
        &self,
        txn: TxnId,
        participants: Vec<ParticipantId>,
    ) -> Result<CoordinatorHandle, CoordinatorError> {
        // reject bad lists before anything is registered
        super::document::CoordinatorDocument::new(txn, participants.clone())?;

        let (handle, coordinator) = match self.coordinators.entry(txn) {
            Entry::Occupied(existing) => {
                info!(txn = %txn, "Coordinator already exists, returning it");
                return Ok(existing.get().clone());
            }
            Entry::Vacant(slot) => {
                let coordinator =
                    TransactionCoordinator::new(txn, participants, self.ctx.clone());
                let handle = coordinator.handle();
                slot.insert(handle.clone());
                (handle, coordinator)
            }
        };

        info!(
            txn = %txn,
            participants = coordinator.participants().len(),
            "Coordinator created"
        );
        self.launch(coordinator, StartPoint::Fresh);
        Ok(handle)
    }

    /// Rebuild a coordinator for every persisted document
    ///
    /// Call once at startup, before new transactions are created. Documents
    /// with a decision resume delivery of exactly that decision; documents
    /// without one resume vote collection. Unreadable records are logged,
    /// counted as skipped and left in place.
    pub async fn recover_all(&self) -> Result<RecoveryReport, CoordinatorError> {
        if self.recovered.swap(true, Ordering::SeqCst) {
            return Err(CoordinatorError::ProtocolViolation(
                "recovery already ran".to_string(),
            ));
        }

        let scan = match self.ctx.store.scan_all().await {
            Ok(scan) => scan,
            Err(e) => {
                // nothing was resumed; allow another attempt
                self.recovered.store(false, Ordering::SeqCst);
                return Err(e);
            }
        };

        let mut report = RecoveryReport::default();
        for (key, e) in &scan.unreadable {
            error!(key = %key, error = %e, "Skipping unreadable coordinator document");
            report.skipped += 1;
        }

        for document in scan.documents {
            let start = match document.decision_message() {
                Ok(Some(decision)) => StartPoint::ResumeDelivery(decision),
                Ok(None) => StartPoint::ResumeVoting,
                Err(e) => {
                    error!(txn = %document.id, error = %e, "Skipping inconsistent coordinator document");
                    report.skipped += 1;
                    continue;
                }
            };

            let coordinator = match self.coordinators.entry(document.id) {
                Entry::Occupied(_) => {
                    warn!(txn = %document.id, "Coordinator already live, not recovering");
                    report.skipped += 1;
                    continue;
                }
                Entry::Vacant(slot) => {
                    let coordinator = TransactionCoordinator::new(
                        document.id,
                        document.participants.clone(),
                        self.ctx.clone(),
                    );
                    slot.insert(coordinator.handle());
                    coordinator
                }
            };

            match start {
                StartPoint::ResumeDelivery(_) => report.resumed_delivery += 1,
                _ => report.resumed_voting += 1,
            }
            info!(txn = %document.id, start = ?start, "Recovering coordinator");
            self.launch(coordinator, start);
        }

        info!(
            resumed = report.total(),
            resumed_voting = report.resumed_voting,
            resumed_delivery = report.resumed_delivery,
            skipped = report.skipped,
            "Coordinator recovery complete"
        );
        Ok(report)
    }

    pub fn get(&self, txn: TxnId) -> Option<CoordinatorHandle> {
        self.coordinators.get(&txn).map(|entry| entry.value().clone())
    }

    pub fn len(&self) -> usize {
        self.coordinators.len()
    }

    pub fn is_empty(&self) -> bool {
        self.coordinators.is_empty()
    }

    /// Fire the cancellation signal of `txn`'s coordinator, if live
    ///
    /// Returns false for an unknown transaction or one whose decision is
    /// already fixed.
    pub fn cancel(&self, txn: TxnId) -> bool {
        self.get(txn).is_some_and(|handle| handle.cancel())
    }

    /// Wait until every coordinator registered now has finished
    pub async fn join_all(&self) {
        let handles: Vec<CoordinatorHandle> = self
            .coordinators
            .iter()
            .map(|entry| entry.value().clone())
            .collect();
        for handle in handles {
            let _ = handle.on_completion().await;
        }
    }

    fn launch(&self, coordinator: Arc<TransactionCoordinator>, start: StartPoint) {
        let coordinators = self.coordinators.clone();
        let metrics = self.ctx.metrics.clone();
        tokio::spawn(async move {
            let result = coordinator.execute(start).await;
            let txn = coordinator.txn_id();
            coordinators.remove_if(&txn, |_, handle| {
                Arc::ptr_eq(handle.coordinator(), &coordinator)
            });
            metrics.release(coordinator.state());
            // waiters observe completion only after the entry is gone
            coordinator.publish(result);
        });
    }
}
