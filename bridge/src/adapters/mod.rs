//! Wallet adapter capability set.
//!
//! Adapters are network-bound and never retry internally. Callers that want resilience wrap
//! idempotent calls in [`crate::retry`] themselves.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::errors::BridgeResult;

#[cfg(feature = "native")]
pub mod http;
pub mod invoice;
pub mod memory;

#[cfg(feature = "native")]
pub use http::{BackendClient, HttpLightningAdapter, HttpSparkAdapter};
pub use invoice::{decode_invoice, invoice_prefix, DecodedInvoice, InvoicePrefix};
pub use memory::{InMemoryLightning, InMemorySpark};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BitcoinNetwork {
    Mainnet,
    Testnet,
    Regtest,
}

/// Static capability tag carried by every adapter type.
pub trait Capability: Send + Sync + 'static {
    const ALLOW_LIGHTNING: bool;
    const ALLOW_ONCHAIN: bool;
}

pub enum LightningEnabled {}

pub enum OnchainEnabled {}

impl Capability for LightningEnabled {
    const ALLOW_LIGHTNING: bool = true;
    const ALLOW_ONCHAIN: bool = false;
}

impl Capability for OnchainEnabled {
    const ALLOW_LIGHTNING: bool = false;
    const ALLOW_ONCHAIN: bool = true;
}

pub trait WalletAdapter: Send + Sync {
    type Capability: Capability;

    fn backend_name(&self) -> &str;
}

pub fn allows_lightning<A: WalletAdapter>(_adapter: &A) -> bool {
    <A::Capability as Capability>::ALLOW_LIGHTNING
}

pub fn allows_onchain<A: WalletAdapter>(_adapter: &A) -> bool {
    <A::Capability as Capability>::ALLOW_ONCHAIN
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LightningInvoice {
    pub invoice: String,
    pub service_fee_sat: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OnchainBalance {
    pub confirmed_sats: u64,
    pub pending_sats: u64,
}

#[async_trait]
pub trait LightningAdapter: Send + Sync {
    /// Returns true once the payment has settled.
    async fn pay_lightning_invoice(&self, invoice: &str) -> BridgeResult<bool>;

    async fn create_lightning_invoice(
        &self,
        amount_sats: u64,
        memo: &str,
    ) -> BridgeResult<LightningInvoice>;

    async fn is_invoice_paid(&self, invoice: &str) -> BridgeResult<bool>;
}

#[async_trait]
pub trait OnchainAdapter: Send + Sync {
    /// Broadcasts a payment and returns its transaction id.
    async fn send_onchain(&self, address: &str, amount_sats: u64) -> BridgeResult<String>;

    async fn receive_address(&self) -> BridgeResult<String>;

    async fn balance(&self) -> BridgeResult<OnchainBalance>;

    async fn confirmations(&self, txid: &str) -> BridgeResult<u32>;
}

/// Adapters resolved once at startup and shared read-only afterwards.
#[derive(Clone)]
pub struct AdapterSet {
    lightning: Arc<dyn LightningAdapter>,
    spark: Arc<dyn OnchainAdapter>,
    lightning_backend: String,
    spark_backend: String,
}

impl AdapterSet {
    pub fn new<L, S>(lightning: L, spark: S) -> Self
    where
        L: LightningAdapter + WalletAdapter<Capability = LightningEnabled> + 'static,
        S: OnchainAdapter + WalletAdapter<Capability = OnchainEnabled> + 'static,
    {
        Self::from_shared(Arc::new(lightning), Arc::new(spark))
    }

    pub fn from_shared<L, S>(lightning: Arc<L>, spark: Arc<S>) -> Self
    where
        L: LightningAdapter + WalletAdapter<Capability = LightningEnabled> + 'static,
        S: OnchainAdapter + WalletAdapter<Capability = OnchainEnabled> + 'static,
    {
        let lightning_backend = lightning.backend_name().to_string();
        let spark_backend = spark.backend_name().to_string();
        log::info!(
            "wallet adapters resolved: lightning={} spark={}",
            lightning_backend,
            spark_backend
        );
        Self {
            lightning,
            spark,
            lightning_backend,
            spark_backend,
        }
    }

    pub fn lightning(&self) -> &dyn LightningAdapter {
        self.lightning.as_ref()
    }

    pub fn spark(&self) -> &dyn OnchainAdapter {
        self.spark.as_ref()
    }

    pub fn lightning_backend(&self) -> &str {
        &self.lightning_backend
    }

    pub fn spark_backend(&self) -> &str {
        &self.spark_backend
    }
}

impl std::fmt::Debug for AdapterSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AdapterSet")
            .field("lightning", &self.lightning_backend)
            .field("spark", &self.spark_backend)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn capability_tags_are_static() {
        let lightning = InMemoryLightning::new(BitcoinNetwork::Regtest, 0);
        let spark = InMemorySpark::new(BitcoinNetwork::Regtest, 0);
        assert!(allows_lightning(&lightning));
        assert!(!allows_onchain(&lightning));
        assert!(allows_onchain(&spark));
        assert!(!allows_lightning(&spark));

        let set = AdapterSet::new(lightning, spark);
        assert_eq!(set.lightning_backend(), "in-memory-lightning");
        assert_eq!(set.spark_backend(), "in-memory-spark");
    }
}
