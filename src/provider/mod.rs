//! Banking Provider Client
//!
//! The provider physically moves money between its accounts. This crate only
//! needs to start transfers and read balances; outcomes arrive later through
//! the status callback queue.

pub mod error;
pub mod http;

pub use error::ProviderError;
pub use http::HttpTransferProvider;

use async_trait::async_trait;

use crate::reconcile::types::MinorAmount;

/// External transfer API
///
/// Errors must be classifiable via [`ProviderError::is_explicit_rejection`].
#[async_trait]
pub trait TransferProvider: Send + Sync {
    /// Provider name for logging
    fn name(&self) -> &'static str;

    /// Start a transfer; returns the provider-assigned transfer id
    async fn initiate_transfer(
        &self,
        source_account_ref: &str,
        destination_account_ref: &str,
        reason: &str,
        amount: MinorAmount,
    ) -> Result<String, ProviderError>;

    /// Available balance of a provider account
    async fn get_balance(&self, account_ref: &str) -> Result<MinorAmount, ProviderError>;
}


#[cfg(test)]
pub use mock::MockProvider;
