//! Transfer Reconciler
//!
//! Keeps local transaction records consistent with an external banking
//! provider that reports outcomes through asynchronous status callbacks.
//!
//! # Modules
//!
//! - [`reconcile`] - Callback consumer, claim state machine, sweep and pot close
//! - [`provider`] - Banking provider client
//! - [`queue`] - Reliable Redis list queue for status callbacks
//! - [`ratelimit`] - Fixed-window request limiter
//! - [`notify`] - Fire-and-forget user notifications
//! - [`config`] - YAML configuration
//! - [`db`] - PostgreSQL pool
//! - [`logging`] - tracing subscriber setup

pub mod config;
pub mod db;
pub mod logging;
pub mod notify;
pub mod provider;
pub mod queue;
pub mod ratelimit;
pub mod reconcile;

// Convenient re-exports at crate root
pub use config::AppConfig;
pub use reconcile::{
    ClaimService, EventConsumer, PotFinalizer, ReconcileError, ReconciliationSweep,
    StateTransitionHandler, TransactionResolver,
};
