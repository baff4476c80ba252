//! Transfer Reconciliation Engine
//!
//! Reconciles locally-initiated transfers with at-least-once, possibly
//! duplicated and out-of-order provider status callbacks.
//!
//! # Architecture
//!
//! ```text
//! queue → EventConsumer → TransactionResolver → StateTransitionHandler
//!                                                   │ (pot claims)
//!                                                   ▼
//!                                         claim state token (CAS)
//!                                                   ▲
//! SweepWorker → ReconciliationSweep ────────────────┘ → provider retry
//!
//! PotFinalizer ── finalization lock ── pot close / refund
//! ```
//!
//! # Claim State Machine
//!
//! ```text
//! created → transfer_initiated ──(provider failed)──→ reconcile_retry_requested
//!    │                                                   ▲            │
//!    └──(operator confirms no payout)────────────────────┘            ▼
//!                                               reconcile_retry_inflight
//!                                 ┌───────────────────┼──────────────────┐
//!                                 ▼                   ▼                  ▼
//!                  reconcile_retry_initiated  reconcile_retry_rejected  reconcile_retry_unknown
//! ```
//!
//! # Safety Invariants
//!
//! 1. **Completed is final**: nothing moves a completed transaction back
//! 2. **Explicit Fail Rule**: only an explicit provider rejection compensates;
//!    timeouts and unknown outcomes never do
//! 3. **No blind retry**: `created` or empty claim tokens are never retried
//!    automatically
//! 4. **Conditional updates**: every racing write is a storage-level CAS

pub mod claims;
pub mod consumer;
pub mod db;
pub mod error;
pub mod finalize;
pub mod repository;
pub mod resolver;
pub mod state;
pub mod sweep;
pub mod transition;
pub mod types;

#[cfg(test)]
pub mod mock;


// Re-exports for convenience
pub use claims::{ClaimReceipt, ClaimRequest, ClaimService};
pub use consumer::EventConsumer;
pub use db::PgReconcileRepository;
pub use error::ReconcileError;
pub use finalize::{CloseOutcome, PotFinalizer};
pub use repository::ReconcileRepository;
pub use resolver::TransactionResolver;
pub use state::{ClaimState, PotRef, StateToken, TokenError, is_auto_retry_eligible};
pub use sweep::{ReconciliationSweep, SweepReport, SweepWorker};
pub use transition::{StateTransitionHandler, TransitionOutcome};
pub use types::{
    InboundStatusEvent, MinorAmount, Pot, PotStatus, Transaction, TransactionKind,
    TransactionStatus,
};
