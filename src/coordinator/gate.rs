//! Ticket-Gated Write Gate
//!
//! Every durable write the coordinator performs first takes a ticket from a
//! bounded pool shared with unrelated storage writers. The permit is held
//! only across the local write, never across a participant round-trip.

use std::sync::Arc;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Scoped write ticket; released on drop on every exit path
#[derive(Debug)]
pub struct WritePermit {
    _permit: OwnedSemaphorePermit,
}

/// Result of a cancellable acquisition
///
/// `Interrupted` is a routine outcome, not a failure: it is what sends a
/// coordinator down the abort path.
#[derive(Debug)]
pub enum GateAcquisition {
    Acquired(WritePermit),
    Interrupted,
}

/// Bounded pool of write tickets
#[derive(Debug)]
pub struct TicketPool {
    semaphore: Arc<Semaphore>,
    capacity: usize,
}

impl TicketPool {
    pub fn new(capacity: usize) -> Self {
        Self {
            semaphore: Arc::new(Semaphore::new(capacity)),
            capacity,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Tickets currently free
    pub fn available(&self) -> usize {
        self.semaphore.available_permits()
    }

    /// Block until a ticket is free or `cancel` fires
    ///
    /// A ticket that becomes available at the same instant as the signal is
    /// preferred, so a write that already got its ticket is never abandoned.
    pub async fn acquire(&self, cancel: &CancellationToken) -> GateAcquisition {
        tokio::select! {
            biased;
            permit = self.semaphore.clone().acquire_owned() => match permit {
                Ok(permit) => GateAcquisition::Acquired(WritePermit { _permit: permit }),
                // the pool is never closed; treat it like an interruption
                Err(_) => GateAcquisition::Interrupted,
            },
            _ = cancel.cancelled() => {
                debug!("Write ticket acquisition interrupted");
                GateAcquisition::Interrupted
            }
        }
    }

    /// Block until a ticket is free, ignoring cancellation
    ///
    /// Used once the commit point is reached or decided: those writes must
    /// eventually happen.
    pub async fn acquire_uninterruptible(&self) -> Option<WritePermit> {
        self.semaphore
            .clone()
            .acquire_owned()
            .await
            .ok()
            .map(|permit| WritePermit { _permit: permit })
    }

    /// Non-blocking acquisition, for host writers that share the pool
    pub fn try_acquire(&self) -> Option<WritePermit> {
        self.semaphore
            .clone()
            .try_acquire_owned()
            .ok()
            .map(|permit| WritePermit { _permit: permit })
    }
}
