//! In-process Participant Transport
//!
//! Request/response channels between coordinators and participants running
//! in the same process. Each participant drains its own
//! [`ParticipantEndpoint`]; every request carries a oneshot reply sender.

use async_trait::async_trait;
use dashmap::DashMap;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tracing::debug;

use super::participant::ParticipantClient;
use super::types::{DecisionMessage, ParticipantId, TransportError, TxnId, Vote};

// ============================================================================
// Request Types
// ============================================================================

/// Request delivered to a participant endpoint
#[derive(Debug)]
pub enum ParticipantRequest {
    Prepare {
        txn: TxnId,
        reply: oneshot::Sender<Vote>,
    },
    Decision {
        txn: TxnId,
        decision: DecisionMessage,
        /// Send `()` to acknowledge
        reply: oneshot::Sender<()>,
    },
}

/// Receiving side, owned by the participant
pub struct ParticipantEndpoint {
    rx: mpsc::Receiver<ParticipantRequest>,
}

impl ParticipantEndpoint {
    /// Receive the next request (None once every sender is gone)
    pub async fn recv(&mut self) -> Option<ParticipantRequest> {
        self.rx.recv().await
    }

    pub fn try_recv(&mut self) -> Option<ParticipantRequest> {
        self.rx.try_recv().ok()
    }
}

// ============================================================================
// Client
// ============================================================================

/// [`ParticipantClient`] over in-process channels
pub struct ChannelParticipantClient {
    routes: DashMap<ParticipantId, mpsc::Sender<ParticipantRequest>>,
    request_timeout: Duration,
}

impl ChannelParticipantClient {
    pub fn new(request_timeout: Duration) -> Self {
        Self {
            routes: DashMap::new(),
            request_timeout,
        }
    }

    /// Create the endpoint for `participant`, replacing any previous route
    pub fn register(&self, participant: ParticipantId, buffer: usize) -> ParticipantEndpoint {
        let (tx, rx) = mpsc::channel(buffer);
        self.routes.insert(participant, tx);
        ParticipantEndpoint { rx }
    }

    /// Drop the route; later requests fail as transport errors
    pub fn unregister(&self, participant: &ParticipantId) {
        self.routes.remove(participant);
    }

    async fn call<T>(
        &self,
        participant: &ParticipantId,
        make_request: impl FnOnce(oneshot::Sender<T>) -> ParticipantRequest,
    ) -> Result<T, TransportError> {
        let sender = self
            .routes
            .get(participant)
            .map(|route| route.value().clone())
            .ok_or_else(|| TransportError(format!("no route to {}", participant)))?;

        let (reply_tx, reply_rx) = oneshot::channel();
        sender
            .send(make_request(reply_tx))
            .await
            .map_err(|_| TransportError(format!("{} endpoint closed", participant)))?;

        match tokio::time::timeout(self.request_timeout, reply_rx).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(_)) => Err(TransportError(format!(
                "{} dropped the request",
                participant
            ))),
            Err(_) => {
                debug!(participant = %participant, "Participant request timed out");
                Err(TransportError(format!(
                    "{} did not answer within {:?}",
                    participant, self.request_timeout
                )))
            }
        }
    }
}

#[async_trait]
impl ParticipantClient for ChannelParticipantClient {
    async fn prepare(
        &self,
        participant: &ParticipantId,
        txn: TxnId,
    ) -> Result<Vote, TransportError> {
        self.call(participant, |reply| ParticipantRequest::Prepare { txn, reply })
            .await
    }

    async fn send_decision(
        &self,
        participant: &ParticipantId,
        txn: TxnId,
        decision: DecisionMessage,
    ) -> Result<(), TransportError> {
        self.call(participant, |reply| ParticipantRequest::Decision {
            txn,
            decision,
            reply,
        })
        .await
    }
}
