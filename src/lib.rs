//! Distributed Transaction Coordinator
//!
//! Two-phase commit coordination over a durable document store.
//!
//! # Modules
//!
//! - [`coordinator`] - State machine, document store, write gate, catalog
//! - [`config`] - YAML application configuration
//! - [`logging`] - Tracing subscriber setup

pub mod config;
pub mod coordinator;
pub mod logging;

// Convenient re-exports at crate root
pub use config::{AppConfig, CoordinatorConfig, LoggingConfig, StoreConfig};
pub use coordinator::{
    CoordinatorCatalog, CoordinatorError, CoordinatorHandle, CoordinatorState, Decision,
    DecisionMessage, DocumentStore, ParticipantClient, ParticipantId, TicketPool, TxnId,
};
