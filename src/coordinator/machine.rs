//! Transaction Coordinator State Machine
//!
//! Drives one transaction from participant-list persistence through the
//! decision, acknowledgment collection and cleanup.
//!
//! Cancellation is observed at two suspension points, write-ticket
//! acquisition for the participant list and the wait for votes, and once more
//! when entering PersistingDecision. All of them route to the abort decision.
//! From PersistingDecision on, the coordinator ignores cancellation: the
//! decision write (even while it waits for a ticket), its delivery and the
//! cleanup always run to completion or to the configured delivery give-up.

use futures::future::join_all;
use futures::stream::{FuturesUnordered, StreamExt};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::document::CoordinatorDocument;
use super::error::CoordinatorError;
use super::gate::{GateAcquisition, TicketPool};
use super::metrics::StateMetrics;
use super::participant::ParticipantClient;
use super::state::CoordinatorState;
use super::store::DocumentStore;
use super::types::{
    Decision, DecisionMessage, ParticipantId, PrepareResponse, Timestamp, TxnId, Vote,
};
use crate::config::CoordinatorConfig;

type Outcome = Option<Result<Decision, CoordinatorError>>;

/// Collaborators shared by every coordinator in a process
pub struct CoordinatorContext {
    pub store: Arc<dyn DocumentStore>,
    pub gate: Arc<TicketPool>,
    pub client: Arc<dyn ParticipantClient>,
    pub metrics: Arc<StateMetrics>,
    pub config: CoordinatorConfig,
}

/// Where a coordinator begins executing
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartPoint {
    /// New transaction: persist participants first
    Fresh,
    /// Recovered document without a decision: re-issue prepare
    ResumeVoting,
    /// Recovered document with a decision: deliver it, never re-decide
    ResumeDelivery(DecisionMessage),
}

/// One transaction's coordinator
pub struct TransactionCoordinator {
    txn: TxnId,
    participants: Vec<ParticipantId>,
    ctx: Arc<CoordinatorContext>,
    cancel: CancellationToken,
    state: Mutex<CoordinatorState>,
    decision_tx: watch::Sender<Outcome>,
    completion_tx: watch::Sender<Outcome>,
    lifetime_timer: Mutex<Option<JoinHandle<()>>>,
}

impl TransactionCoordinator {
    /// Construct in Uninitialized; nothing runs until [`Self::spawn`]
    pub fn new(
        txn: TxnId,
        participants: Vec<ParticipantId>,
        ctx: Arc<CoordinatorContext>,
    ) -> Arc<Self> {
        let (decision_tx, _) = watch::channel(None);
        let (completion_tx, _) = watch::channel(None);
        ctx.metrics.transition(None, CoordinatorState::Uninitialized);
        Arc::new(Self {
            txn,
            participants,
            ctx,
            cancel: CancellationToken::new(),
            state: Mutex::new(CoordinatorState::Uninitialized),
            decision_tx,
            completion_tx,
            lifetime_timer: Mutex::new(None),
        })
    }

    /// Start driving the state machine on the runtime
    pub fn spawn(self: &Arc<Self>, start: StartPoint) -> JoinHandle<()> {
        let coordinator = self.clone();
        tokio::spawn(async move { coordinator.run(start).await })
    }

    pub fn txn_id(&self) -> TxnId {
        self.txn
    }

    pub fn participants(&self) -> &[ParticipantId] {
        &self.participants
    }

    pub fn state(&self) -> CoordinatorState {
        *self.lock_state()
    }

    fn lock_state(&self) -> MutexGuard<'_, CoordinatorState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Fire the cancellation signal
    ///
    /// Returns whether the signal still decides the outcome: until the
    /// coordinator enters PersistingDecision it forces Abort; from then on it
    /// is ignored, including while the decision write waits for a ticket.
    pub fn cancel(&self) -> bool {
        // same lock as the transition into PersistingDecision
        let state = self.lock_state();
        self.cancel.cancel();
        let effective = state.is_cancellable();
        if !effective {
            debug!(txn = %self.txn, state = %*state, "Cancellation ignored, decision already fixed");
        }
        effective
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn handle(self: &Arc<Self>) -> CoordinatorHandle {
        CoordinatorHandle {
            inner: self.clone(),
        }
    }

    /// Run to Done (or a fatal error) and publish the outcome
    pub async fn run(self: Arc<Self>, start: StartPoint) {
        let result = self.execute(start).await;
        self.publish(result);
    }

    /// Drive the state machine without publishing the final outcome
    pub(crate) async fn execute(&self, start: StartPoint) -> Result<Decision, CoordinatorError> {
        self.arm_lifetime_timer();
        let result = self.drive(start).await;
        self.disarm_lifetime_timer();
        result
    }

    /// Release every run_commit() / on_completion() waiter
    pub(crate) fn publish(&self, result: Result<Decision, CoordinatorError>) {
        match &result {
            Ok(decision) => info!(txn = %self.txn, decision = %decision, "Coordinator finished"),
            Err(e) if self.state().is_past_commit_point() => error!(
                txn = %self.txn,
                state = %self.state(),
                code = e.code(),
                error = %e,
                "Coordinator stopped after the commit point, document kept for recovery"
            ),
            Err(e) => error!(
                txn = %self.txn,
                state = %self.state(),
                code = e.code(),
                error = %e,
                "Coordinator stopped"
            ),
        }

        // a failure before the commit point still has to release run_commit() callers
        self.decision_tx.send_if_modified(|slot| {
            if slot.is_none() {
                *slot = Some(result.clone());
                true
            } else {
                false
            }
        });
        self.completion_tx.send_replace(Some(result));
    }

    async fn drive(&self, start: StartPoint) -> Result<Decision, CoordinatorError> {
        let decision = match start {
            StartPoint::Fresh => {
                self.transition(CoordinatorState::PersistingParticipants);
                let proposed = if self.persist_participants().await? {
                    self.transition(CoordinatorState::CollectingVotes);
                    self.collect_votes().await
                } else {
                    DecisionMessage::Abort
                };
                self.persist_decision(proposed).await?
            }
            StartPoint::ResumeVoting => {
                self.transition(CoordinatorState::CollectingVotes);
                let proposed = self.collect_votes().await;
                self.persist_decision(proposed).await?
            }
            StartPoint::ResumeDelivery(decision) => decision,
        };
        self.disarm_lifetime_timer();
        self.decision_tx
            .send_replace(Some(Ok(decision.decision())));

        self.transition(CoordinatorState::DeliveringDecision);
        self.deliver_decision(decision).await?;

        self.transition(CoordinatorState::Cleanup);
        self.cleanup().await;

        self.transition(CoordinatorState::Done);
        Ok(decision.decision())
    }

    fn transition(&self, to: CoordinatorState) {
        let mut state = self.lock_state();
        self.transition_locked(&mut state, to);
    }

    fn transition_locked(&self, state: &mut MutexGuard<'_, CoordinatorState>, to: CoordinatorState) {
        let from = **state;
        debug_assert!(to > from, "illegal transition {} -> {}", from, to);
        **state = to;
        // metrics move under the state lock
        self.ctx.metrics.transition(Some(from), to);
        info!(txn = %self.txn, from = %from, to = %to, "Coordinator state transition");
    }

    /// Durably write the participant list
    ///
    /// Returns `Ok(false)` when interrupted before anything was written.
    async fn persist_participants(&self) -> Result<bool, CoordinatorError> {
        let document = CoordinatorDocument::new(self.txn, self.participants.clone())?;
        let mut backoff = self.ctx.config.retry.backoff();

        loop {
            let permit = match self.ctx.gate.acquire(&self.cancel).await {
                GateAcquisition::Acquired(permit) => permit,
                GateAcquisition::Interrupted => {
                    info!(
                        txn = %self.txn,
                        "Interrupted waiting for a write ticket, aborting transaction"
                    );
                    return Ok(false);
                }
            };
            let result = self.ctx.store.put(&document).await;
            drop(permit);

            match result {
                Ok(()) => {
                    debug!(txn = %self.txn, participants = self.participants.len(), "Participant list persisted");
                    return Ok(true);
                }
                Err(e) if e.is_retryable() => {
                    warn!(
                        txn = %self.txn,
                        attempt = backoff.attempts() + 1,
                        error = %e,
                        "Failed to persist participant list (will retry)"
                    );
                    tokio::select! {
                        _ = backoff.wait() => {}
                        _ = self.cancel.cancelled() => return Ok(false),
                    }
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Send prepare to every participant and reduce the votes to a decision
    ///
    /// Any abort vote, transport failure or cancellation yields Abort. The
    /// commit timestamp is the largest prepare timestamp.
    async fn collect_votes(&self) -> DecisionMessage {
        let mut pending: FuturesUnordered<_> = self
            .participants
            .iter()
            .map(|participant| async move {
                let response: PrepareResponse =
                    self.ctx.client.prepare(participant, self.txn).await.into();
                (participant, response)
            })
            .collect();

        let mut commit_timestamp = Timestamp::default();
        let mut votes = 0usize;

        loop {
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => {
                    info!(
                        txn = %self.txn,
                        votes,
                        expected = self.participants.len(),
                        "Cancelled while collecting votes, aborting transaction"
                    );
                    return DecisionMessage::Abort;
                }
                next = pending.next() => match next {
                    None => {
                        debug!(txn = %self.txn, votes, commit_timestamp = %commit_timestamp, "All participants voted to commit");
                        return DecisionMessage::Commit { commit_timestamp };
                    }
                    Some((_, PrepareResponse::Vote(Vote::Commit { prepare_timestamp }))) => {
                        commit_timestamp = commit_timestamp.max(prepare_timestamp);
                        votes += 1;
                    }
                    Some((participant, PrepareResponse::Vote(Vote::Abort))) => {
                        info!(txn = %self.txn, participant = %participant, "Participant voted to abort");
                        return DecisionMessage::Abort;
                    }
                    Some((participant, PrepareResponse::TransportFailed(e))) => {
                        warn!(
                            txn = %self.txn,
                            participant = %participant,
                            error = %e,
                            "Prepare failed, counting as abort vote"
                        );
                        return DecisionMessage::Abort;
                    }
                },
            }
        }
    }

    /// Durably write the decision: the commit point
    ///
    /// Not cancellable. Storage errors are retried; a conflicting persisted
    /// decision is a protocol violation that stops this coordinator.
    async fn persist_decision(
        &self,
        proposed: DecisionMessage,
    ) -> Result<DecisionMessage, CoordinatorError> {
        let decision = self.enter_persisting_decision(proposed);
        let document =
            CoordinatorDocument::new(self.txn, self.participants.clone())?.with_decision(decision);
        let mut backoff = self.ctx.config.retry.backoff();

        loop {
            let permit = self.ctx.gate.acquire_uninterruptible().await.ok_or_else(|| {
                CoordinatorError::Storage("write ticket pool closed".to_string())
            })?;
            let result = self.ctx.store.put(&document).await;
            drop(permit);

            match result {
                Ok(()) => {
                    info!(txn = %self.txn, decision = %decision.decision(), "Decision persisted");
                    return Ok(decision);
                }
                Err(e) if e.is_retryable() => {
                    warn!(
                        txn = %self.txn,
                        attempt = backoff.attempts() + 1,
                        error = %e,
                        "Failed to persist decision (will retry)"
                    );
                    backoff.wait().await;
                }
                Err(e) => {
                    error!(txn = %self.txn, error = %e, "Refusing to persist decision");
                    return Err(e);
                }
            }
        }
    }

    /// Fix the decision and enter PersistingDecision
    ///
    /// A signal that fired after the votes resolved but before this
    /// transition still turns the decision into Abort.
    fn enter_persisting_decision(&self, proposed: DecisionMessage) -> DecisionMessage {
        let mut state = self.lock_state();
        let decision = if self.cancel.is_cancelled() && state.is_cancellable() {
            if proposed != DecisionMessage::Abort {
                info!(txn = %self.txn, "Cancelled before the decision was fixed, aborting transaction");
            }
            DecisionMessage::Abort
        } else {
            proposed
        };
        self.transition_locked(&mut state, CoordinatorState::PersistingDecision);
        decision
    }

    /// Push the decision to all participants until each acknowledges
    async fn deliver_decision(&self, decision: DecisionMessage) -> Result<(), CoordinatorError> {
        let results = join_all(
            self.participants
                .iter()
                .map(|participant| self.deliver_to(participant, decision)),
        )
        .await;
        results.into_iter().collect()
    }

    async fn deliver_to(
        &self,
        participant: &ParticipantId,
        decision: DecisionMessage,
    ) -> Result<(), CoordinatorError> {
        let mut backoff = self.ctx.config.retry.backoff();
        loop {
            match self
                .ctx
                .client
                .send_decision(participant, self.txn, decision)
                .await
            {
                Ok(()) => {
                    debug!(txn = %self.txn, participant = %participant, "Decision acknowledged");
                    return Ok(());
                }
                Err(e) => {
                    let attempts = backoff.attempts() + 1;
                    if !self.ctx.config.delivery.allows_retry(attempts) {
                        error!(
                            txn = %self.txn,
                            participant = %participant,
                            attempts,
                            "Giving up on decision delivery, document kept for operator"
                        );
                        return Err(CoordinatorError::DeliveryAbandoned {
                            participant: participant.clone(),
                            attempts,
                        });
                    }
                    warn!(
                        txn = %self.txn,
                        participant = %participant,
                        attempt = attempts,
                        error = %e,
                        "Decision delivery failed (will retry)"
                    );
                    backoff.wait().await;
                }
            }
        }
    }

    /// Delete the coordinator document, retrying until it is gone
    async fn cleanup(&self) {
        let mut backoff = self.ctx.config.retry.backoff();
        loop {
            let result = match self.ctx.gate.acquire_uninterruptible().await {
                Some(permit) => {
                    let result = self.ctx.store.remove(self.txn).await;
                    drop(permit);
                    result
                }
                None => Err(CoordinatorError::Storage(
                    "write ticket pool closed".to_string(),
                )),
            };

            match result {
                Ok(()) => return,
                Err(e) => {
                    warn!(
                        txn = %self.txn,
                        attempt = backoff.attempts() + 1,
                        error = %e,
                        "Failed to delete coordinator document (will retry)"
                    );
                    backoff.wait().await;
                }
            }
        }
    }

    fn arm_lifetime_timer(&self) {
        let Some(limit) = self.ctx.config.lifetime_limit() else {
            return;
        };
        let cancel = self.cancel.clone();
        let txn = self.txn;
        let timer = tokio::spawn(async move {
            tokio::time::sleep(limit).await;
            info!(txn = %txn, limit_ms = limit.as_millis() as u64, "Transaction lifetime limit reached");
            cancel.cancel();
        });
        *self.lifetime_timer.lock().unwrap_or_else(|e| e.into_inner()) = Some(timer);
    }

    fn disarm_lifetime_timer(&self) {
        if let Some(timer) = self
            .lifetime_timer
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
        {
            timer.abort();
        }
    }
}

/// Driver-facing handle to a coordinator
#[derive(Clone)]
pub struct CoordinatorHandle {
    inner: Arc<TransactionCoordinator>,
}

impl CoordinatorHandle {
    pub fn txn_id(&self) -> TxnId {
        self.inner.txn
    }

    pub fn participants(&self) -> &[ParticipantId] {
        self.inner.participants()
    }

    pub fn state(&self) -> CoordinatorState {
        self.inner.state()
    }

    /// See [`TransactionCoordinator::cancel`]
    pub fn cancel(&self) -> bool {
        self.inner.cancel()
    }

    /// Resolves once the decision is known (durable), before cleanup
    pub async fn run_commit(&self) -> Result<Decision, CoordinatorError> {
        wait_for_outcome(self.inner.decision_tx.subscribe()).await
    }

    /// Resolves when the coordinator reaches Done (or stops on an error)
    pub async fn on_completion(&self) -> Result<Decision, CoordinatorError> {
        wait_for_outcome(self.inner.completion_tx.subscribe()).await
    }

    pub(crate) fn coordinator(&self) -> &Arc<TransactionCoordinator> {
        &self.inner
    }
}

async fn wait_for_outcome(
    mut rx: watch::Receiver<Outcome>,
) -> Result<Decision, CoordinatorError> {
    match rx.wait_for(|outcome| outcome.is_some()).await {
        Ok(outcome) => outcome.clone().unwrap_or(Err(CoordinatorError::CoordinatorGone)),
        Err(_) => Err(CoordinatorError::CoordinatorGone),
    }
}
