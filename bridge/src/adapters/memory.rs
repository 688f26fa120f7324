//! In-process Lightning and Spark backends with real balances and invoice state.
//!
//! Used by regtest hosts and by tests. `fail_next` injects backend outages so callers can
//! exercise their retry paths.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};

use async_trait::async_trait;
use bech32::segwit;
use bech32::Hrp;
use parking_lot::Mutex;
use rand::RngCore;

use crate::adapters::invoice::{decode_invoice, encode_invoice};
use crate::adapters::{
    BitcoinNetwork, LightningAdapter, LightningEnabled, LightningInvoice, OnchainAdapter,
    OnchainBalance, OnchainEnabled, WalletAdapter,
};
use crate::errors::{BridgeError, BridgeResult};

#[derive(Debug, Default)]
struct Faults(AtomicU32);

impl Faults {
    fn arm(&self, count: u32) {
        self.0.store(count, Ordering::SeqCst);
    }

    fn check(&self, backend: &str) -> BridgeResult<()> {
        let tripped = self
            .0
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
            .is_ok();
        if tripped {
            return Err(BridgeError::BackendUnreachable(format!(
                "{} backend unavailable",
                backend
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Clone)]
struct InvoiceRecord {
    amount_sats: u64,
    paid: bool,
}

#[derive(Debug, Default)]
struct LightningState {
    balance_sats: u64,
    invoices: HashMap<[u8; 32], InvoiceRecord>,
    issued: u64,
}

#[derive(Debug)]
pub struct InMemoryLightning {
    network: BitcoinNetwork,
    service_fee_sat: u64,
    state: Mutex<LightningState>,
    faults: Faults,
}

impl InMemoryLightning {
    pub fn new(network: BitcoinNetwork, balance_sats: u64) -> Self {
        Self {
            network,
            service_fee_sat: 0,
            state: Mutex::new(LightningState {
                balance_sats,
                ..LightningState::default()
            }),
            faults: Faults::default(),
        }
    }

    pub fn with_service_fee(mut self, service_fee_sat: u64) -> Self {
        self.service_fee_sat = service_fee_sat;
        self
    }

    /// Make the next `count` calls fail with `BackendUnreachable`.
    pub fn fail_next(&self, count: u32) {
        self.faults.arm(count);
    }

    pub fn balance_sats(&self) -> u64 {
        self.state.lock().balance_sats
    }
}

impl WalletAdapter for InMemoryLightning {
    type Capability = LightningEnabled;

    fn backend_name(&self) -> &str {
        "in-memory-lightning"
    }
}

#[async_trait]
impl LightningAdapter for InMemoryLightning {
    async fn pay_lightning_invoice(&self, invoice: &str) -> BridgeResult<bool> {
        self.faults.check(self.backend_name())?;
        let decoded = decode_invoice(invoice)?;
        let payment_hash = decoded.require_payment_hash()?;
        if decoded.network != self.network {
            return Err(BridgeError::InvalidInvoice(format!(
                "invoice is for {:?}, wallet is on {:?}",
                decoded.network, self.network
            )));
        }
        let amount_sats = decoded.amount_sats.ok_or_else(|| {
            BridgeError::InvalidInvoice("amountless invoices are not supported".to_string())
        })?;

        let mut state = self.state.lock();
        if let Some(record) = state.invoices.get(&payment_hash) {
            if record.paid {
                return Ok(true);
            }
        }

        let total = amount_sats.saturating_add(self.service_fee_sat);
        if total > state.balance_sats {
            return Err(BridgeError::InsufficientBalance {
                requested_sats: total,
                available_sats: state.balance_sats,
            });
        }
        state.balance_sats -= total;
        state
            .invoices
            .entry(payment_hash)
            .and_modify(|record| record.paid = true)
            .or_insert(InvoiceRecord {
                amount_sats,
                paid: true,
            });
        log::debug!("paid lightning invoice for {} sats", amount_sats);
        Ok(true)
    }

    async fn create_lightning_invoice(
        &self,
        amount_sats: u64,
        memo: &str,
    ) -> BridgeResult<LightningInvoice> {
        self.faults.check(self.backend_name())?;
        if amount_sats == 0 {
            return Err(BridgeError::InvalidParams(
                "invoice amount must be positive".to_string(),
            ));
        }

        let mut state = self.state.lock();
        state.issued += 1;
        let mut nonce = [0u8; 16];
        rand::thread_rng().fill_bytes(&mut nonce);
        let mut hasher = blake3::Hasher::new();
        hasher.update(&state.issued.to_le_bytes());
        hasher.update(&nonce);
        hasher.update(memo.as_bytes());
        let payment_hash = *hasher.finalize().as_bytes();

        let invoice = encode_invoice(
            self.network,
            amount_sats,
            payment_hash,
            memo,
            chrono::Utc::now().timestamp().max(0) as u64,
        )?;
        state.invoices.insert(
            payment_hash,
            InvoiceRecord {
                amount_sats,
                paid: false,
            },
        );

        Ok(LightningInvoice {
            invoice,
            service_fee_sat: self.service_fee_sat,
        })
    }

    async fn is_invoice_paid(&self, invoice: &str) -> BridgeResult<bool> {
        self.faults.check(self.backend_name())?;
        let decoded = decode_invoice(invoice)?;
        let payment_hash = decoded.require_payment_hash()?;
        let state = self.state.lock();
        Ok(state
            .invoices
            .get(&payment_hash)
            .map(|record| record.paid && Some(record.amount_sats) == decoded.amount_sats)
            .unwrap_or(false))
    }
}

#[derive(Debug, Clone)]
struct TxRecord {
    confirmations: u32,
}

#[derive(Debug, Default)]
struct SparkState {
    balance: OnchainBalance,
    transactions: HashMap<String, TxRecord>,
    addresses_issued: u64,
    sends: u64,
}

#[derive(Debug)]
pub struct InMemorySpark {
    network: BitcoinNetwork,
    state: Mutex<SparkState>,
    faults: Faults,
}

impl InMemorySpark {
    pub fn new(network: BitcoinNetwork, confirmed_sats: u64) -> Self {
        Self {
            network,
            state: Mutex::new(SparkState {
                balance: OnchainBalance {
                    confirmed_sats,
                    pending_sats: 0,
                },
                ..SparkState::default()
            }),
            faults: Faults::default(),
        }
    }

    pub fn fail_next(&self, count: u32) {
        self.faults.arm(count);
    }

    /// Advance the simulated chain, confirming every known transaction by `blocks`.
    pub fn mine_blocks(&self, blocks: u32) {
        let mut state = self.state.lock();
        for tx in state.transactions.values_mut() {
            tx.confirmations = tx.confirmations.saturating_add(blocks);
        }
    }

    fn hrp(&self) -> Hrp {
        match self.network {
            BitcoinNetwork::Mainnet => bech32::hrp::BC,
            BitcoinNetwork::Testnet => bech32::hrp::TB,
            BitcoinNetwork::Regtest => bech32::hrp::BCRT,
        }
    }

    fn validate_address(&self, address: &str) -> BridgeResult<()> {
        let (hrp, _version, program) = segwit::decode(address)
            .map_err(|e| BridgeError::InvalidAddress(format!("{}: {}", address, e)))?;
        if hrp != self.hrp() {
            return Err(BridgeError::InvalidAddress(format!(
                "{} is not a {:?} address",
                address, self.network
            )));
        }
        if program.len() != 20 && program.len() != 32 {
            return Err(BridgeError::InvalidAddress(format!(
                "{} has an unexpected witness program length",
                address
            )));
        }
        Ok(())
    }
}

impl WalletAdapter for InMemorySpark {
    type Capability = OnchainEnabled;

    fn backend_name(&self) -> &str {
        "in-memory-spark"
    }
}

#[async_trait]
impl OnchainAdapter for InMemorySpark {
    async fn send_onchain(&self, address: &str, amount_sats: u64) -> BridgeResult<String> {
        self.faults.check(self.backend_name())?;
        self.validate_address(address)?;
        if amount_sats == 0 {
            return Err(BridgeError::InvalidParams(
                "amount must be positive".to_string(),
            ));
        }

        let mut state = self.state.lock();
        if amount_sats > state.balance.confirmed_sats {
            return Err(BridgeError::InsufficientBalance {
                requested_sats: amount_sats,
                available_sats: state.balance.confirmed_sats,
            });
        }
        state.balance.confirmed_sats -= amount_sats;
        state.sends += 1;

        let mut hasher = blake3::Hasher::new();
        hasher.update(address.as_bytes());
        hasher.update(&amount_sats.to_le_bytes());
        hasher.update(&state.sends.to_le_bytes());
        let txid = hex::encode(hasher.finalize().as_bytes());
        state
            .transactions
            .insert(txid.clone(), TxRecord { confirmations: 0 });
        log::debug!("broadcast {} sats to {} as {}", amount_sats, address, txid);
        Ok(txid)
    }

    async fn receive_address(&self) -> BridgeResult<String> {
        self.faults.check(self.backend_name())?;
        let mut state = self.state.lock();
        state.addresses_issued += 1;
        let digest = blake3::hash(&state.addresses_issued.to_le_bytes());
        segwit::encode(self.hrp(), segwit::VERSION_0, &digest.as_bytes()[..20])
            .map_err(|e| BridgeError::Internal(format!("address encoding: {}", e)))
    }

    async fn balance(&self) -> BridgeResult<OnchainBalance> {
        self.faults.check(self.backend_name())?;
        Ok(self.state.lock().balance)
    }

    async fn confirmations(&self, txid: &str) -> BridgeResult<u32> {
        self.faults.check(self.backend_name())?;
        self.state
            .lock()
            .transactions
            .get(txid)
            .map(|tx| tx.confirmations)
            .ok_or_else(|| BridgeError::InvalidParams(format!("unknown transaction {}", txid)))
    }
}
