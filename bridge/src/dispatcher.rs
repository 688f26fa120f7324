//! Background-side handler that turns an `RpcRequest` into adapter and key-manager calls.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::adapters::{decode_invoice, invoice_prefix, AdapterSet};
use crate::errors::{BridgeError, BridgeResult};
use crate::network::{format_chain_id, parse_chain_id, NetworkRegistry};
use crate::protocol::{EventNotification, EvmRpcMethod, ProviderEventKind, RpcRequest};
use crate::retry::{with_retry_if, RetryPolicy};
use crate::storage::KeyValueStore;

pub const ETH_ACCOUNTS_PERMISSION: &str = "eth_accounts";

/// Key-management collaborator. A locked wallet answers with `Unauthorized`.
pub trait KeyManager: Send + Sync {
    fn accounts(&self) -> BridgeResult<Vec<String>>;

    fn sign_message(&self, address: &str, message: &[u8]) -> BridgeResult<String>;

    fn sign_typed_data(&self, address: &str, typed_data: &Value) -> BridgeResult<String>;

    fn lock(&self);
}

/// What the user is asked to confirm.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ApprovalRequest {
    pub origin: String,
    pub method: EvmRpcMethod,
    pub details: Value,
}

#[async_trait]
pub trait ApprovalPrompt: Send + Sync {
    async fn approve(&self, request: &ApprovalRequest) -> bool;
}

/// Fixed decision for headless hosts and tests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StaticApproval {
    approve: bool,
}

impl StaticApproval {
    pub fn allow() -> Self {
        Self { approve: true }
    }

    pub fn deny() -> Self {
        Self { approve: false }
    }
}

#[async_trait]
impl ApprovalPrompt for StaticApproval {
    async fn approve(&self, request: &ApprovalRequest) -> bool {
        log::debug!(
            "{} {} from {}",
            if self.approve { "auto-approving" } else { "auto-denying" },
            request.method,
            request.origin
        );
        self.approve
    }
}

/// Result of one dispatch plus the events it caused.
#[derive(Debug)]
pub struct DispatchOutcome {
    pub result: BridgeResult<Value>,
    pub events: Vec<EventNotification>,
}

#[derive(Debug, Deserialize)]
struct TransactionRequest {
    from: String,
    to: String,
    #[serde(default)]
    value: Option<String>,
}

pub struct RpcDispatcher {
    adapters: AdapterSet,
    keys: Arc<dyn KeyManager>,
    approvals: Arc<dyn ApprovalPrompt>,
    store: Arc<dyn KeyValueStore>,
    networks: Arc<NetworkRegistry>,
    active_chain: RwLock<u64>,
    retry: RetryPolicy,
}

impl RpcDispatcher {
    pub fn new(
        adapters: AdapterSet,
        keys: Arc<dyn KeyManager>,
        approvals: Arc<dyn ApprovalPrompt>,
        store: Arc<dyn KeyValueStore>,
        networks: Arc<NetworkRegistry>,
    ) -> Self {
        let initial = networks.iter().map(|n| n.chain_id).min().unwrap_or(1);
        Self {
            adapters,
            keys,
            approvals,
            store,
            networks,
            active_chain: RwLock::new(initial),
            retry: RetryPolicy::default(),
        }
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_active_chain(self, chain_id: u64) -> BridgeResult<Self> {
        if !self.networks.contains(chain_id) {
            return Err(BridgeError::UnrecognizedChain(format_chain_id(chain_id)));
        }
        *self.active_chain.write() = chain_id;
        Ok(self)
    }

    pub fn active_chain_id(&self) -> u64 {
        *self.active_chain.read()
    }

    pub fn adapters(&self) -> &AdapterSet {
        &self.adapters
    }

    pub async fn dispatch(&self, origin: &str, request: &RpcRequest) -> DispatchOutcome {
        let mut events = Vec::new();
        let result = match request.evm_method() {
            Ok(method) => {
                log::debug!("dispatching {} for {}", method, origin);
                self.handle(method, origin, request, &mut events).await
            }
            Err(e) => Err(e),
        };

        if let Err(e) = &result {
            log::debug!("{} for {} failed: {}", request.method, origin, e);
        }
        DispatchOutcome { result, events }
    }

    async fn handle(
        &self,
        method: EvmRpcMethod,
        origin: &str,
        request: &RpcRequest,
        events: &mut Vec<EventNotification>,
    ) -> BridgeResult<Value> {
        match method {
            EvmRpcMethod::EthChainId => Ok(json!(format_chain_id(self.active_chain_id()))),
            EvmRpcMethod::EthAccounts => self.eth_accounts(origin).await,
            EvmRpcMethod::EthRequestAccounts => self.request_accounts(origin, events).await,
            EvmRpcMethod::WalletRequestPermissions => {
                self.request_permissions(origin, request, events).await
            }
            EvmRpcMethod::PersonalSign => self.personal_sign(origin, request).await,
            EvmRpcMethod::EthSignTypedDataV4 => self.sign_typed_data(origin, request).await,
            EvmRpcMethod::EthSendTransaction => self.send_transaction(origin, request).await,
            EvmRpcMethod::WalletSwitchEthereumChain => self.switch_chain(request, events),
        }
    }

    // Permissions

    fn permission_key(origin: &str) -> String {
        format!("permissions:{}", origin)
    }

    pub async fn permissions(&self, origin: &str) -> BridgeResult<Vec<String>> {
        match self.store.get(&Self::permission_key(origin)).await? {
            Some(value) => serde_json::from_value(value).map_err(|e| {
                BridgeError::StorageError(format!("corrupt permissions for {}: {}", origin, e))
            }),
            None => Ok(Vec::new()),
        }
    }

    async fn has_account_permission(&self, origin: &str) -> BridgeResult<bool> {
        Ok(self
            .permissions(origin)
            .await?
            .iter()
            .any(|granted| granted == ETH_ACCOUNTS_PERMISSION))
    }

    /// Returns true when the permission was not held before.
    async fn grant_account_permission(&self, origin: &str) -> BridgeResult<bool> {
        let mut granted = self.permissions(origin).await?;
        if granted.iter().any(|p| p == ETH_ACCOUNTS_PERMISSION) {
            return Ok(false);
        }
        granted.push(ETH_ACCOUNTS_PERMISSION.to_string());

        let mut entries = BTreeMap::new();
        entries.insert(Self::permission_key(origin), json!(granted));
        self.store.set(entries).await?;
        log::info!("granted {} to {}", ETH_ACCOUNTS_PERMISSION, origin);
        Ok(true)
    }

    /// Forget what `origin` was granted. The returned event tells that origin it has no
    /// accounts any more.
    pub async fn revoke_permissions(&self, origin: &str) -> BridgeResult<EventNotification> {
        let mut entries = BTreeMap::new();
        entries.insert(Self::permission_key(origin), json!([]));
        self.store.set(entries).await?;
        log::info!("revoked permissions for {}", origin);
        Ok(EventNotification::new(
            ProviderEventKind::AccountsChanged,
            json!([]),
        ))
    }

    /// Lock the key manager. Every page should be told it lost its accounts.
    pub fn lock_wallet(&self) -> EventNotification {
        self.keys.lock();
        log::info!("wallet locked");
        EventNotification::new(ProviderEventKind::AccountsChanged, json!([]))
    }

    /// The `connect` payload for a page that just attached.
    pub fn connect_event(&self) -> EventNotification {
        EventNotification::new(
            ProviderEventKind::Connect,
            json!({ "chainId": format_chain_id(self.active_chain_id()) }),
        )
    }

    async fn require_approval(
        &self,
        origin: &str,
        method: EvmRpcMethod,
        details: Value,
    ) -> BridgeResult<()> {
        let request = ApprovalRequest {
            origin: origin.to_string(),
            method,
            details,
        };
        if self.approvals.approve(&request).await {
            Ok(())
        } else {
            log::info!("user rejected {} from {}", method, origin);
            Err(BridgeError::UserRejected(format!(
                "User rejected {}",
                method
            )))
        }
    }

    async fn authorize_account(&self, origin: &str, address: &str) -> BridgeResult<()> {
        if !self.has_account_permission(origin).await? {
            return Err(BridgeError::Unauthorized(format!(
                "{} has not been granted account access",
                origin
            )));
        }
        let accounts = self.keys.accounts()?;
        if !accounts.iter().any(|a| a.eq_ignore_ascii_case(address)) {
            return Err(BridgeError::Unauthorized(format!(
                "Address {} is not managed by this wallet",
                address
            )));
        }
        Ok(())
    }

    // Accounts

    async fn eth_accounts(&self, origin: &str) -> BridgeResult<Value> {
        if !self.has_account_permission(origin).await? {
            return Ok(json!([]));
        }
        match self.keys.accounts() {
            Ok(accounts) => Ok(json!(accounts)),
            Err(BridgeError::Unauthorized(_)) => Ok(json!([])),
            Err(e) => Err(e),
        }
    }

    async fn request_accounts(
        &self,
        origin: &str,
        events: &mut Vec<EventNotification>,
    ) -> BridgeResult<Value> {
        let accounts = self.keys.accounts()?;
        if accounts.is_empty() {
            return Err(BridgeError::Unauthorized(
                "No accounts available".to_string(),
            ));
        }

        if !self.has_account_permission(origin).await? {
            self.require_approval(
                origin,
                EvmRpcMethod::EthRequestAccounts,
                json!({ "accounts": accounts }),
            )
            .await?;
            if self.grant_account_permission(origin).await? {
                events.push(EventNotification::new(
                    ProviderEventKind::AccountsChanged,
                    json!(accounts),
                ));
            }
        }
        Ok(json!(accounts))
    }

    async fn request_permissions(
        &self,
        origin: &str,
        request: &RpcRequest,
        events: &mut Vec<EventNotification>,
    ) -> BridgeResult<Value> {
        let requested = request.param(0)?.as_object().ok_or_else(|| {
            BridgeError::InvalidParams("permissions request must be an object".to_string())
        })?;
        if !requested.contains_key(ETH_ACCOUNTS_PERMISSION) || requested.len() != 1 {
            return Err(BridgeError::InvalidParams(format!(
                "only the {} permission can be requested",
                ETH_ACCOUNTS_PERMISSION
            )));
        }

        let accounts = self.keys.accounts()?;
        self.require_approval(
            origin,
            EvmRpcMethod::WalletRequestPermissions,
            json!({ "permissions": [ETH_ACCOUNTS_PERMISSION] }),
        )
        .await?;
        if self.grant_account_permission(origin).await? {
            events.push(EventNotification::new(
                ProviderEventKind::AccountsChanged,
                json!(accounts),
            ));
        }

        Ok(json!([{
            "parentCapability": ETH_ACCOUNTS_PERMISSION,
            "invoker": origin,
            "caveats": [],
        }]))
    }

    // Signing

    async fn personal_sign(&self, origin: &str, request: &RpcRequest) -> BridgeResult<Value> {
        let message = request.str_param(0)?;
        let address = request.str_param(1)?;
        self.authorize_account(origin, address).await?;

        let bytes = decode_message(message);
        self.require_approval(
            origin,
            EvmRpcMethod::PersonalSign,
            json!({ "address": address, "message": String::from_utf8_lossy(&bytes) }),
        )
        .await?;

        Ok(json!(self.keys.sign_message(address, &bytes)?))
    }

    async fn sign_typed_data(&self, origin: &str, request: &RpcRequest) -> BridgeResult<Value> {
        let address = request.str_param(0)?;
        let typed_data = match request.param(1)? {
            Value::String(raw) => serde_json::from_str(raw).map_err(|e| {
                BridgeError::InvalidParams(format!("typed data is not valid JSON: {}", e))
            })?,
            Value::Object(_) => request.param(1)?.clone(),
            _ => {
                return Err(BridgeError::InvalidParams(
                    "typed data must be an object or a JSON string".to_string(),
                ))
            }
        };
        self.authorize_account(origin, address).await?;

        self.require_approval(
            origin,
            EvmRpcMethod::EthSignTypedDataV4,
            json!({ "address": address, "typedData": typed_data }),
        )
        .await?;

        Ok(json!(self.keys.sign_typed_data(address, &typed_data)?))
    }

    // Payments

    async fn send_transaction(&self, origin: &str, request: &RpcRequest) -> BridgeResult<Value> {
        let tx: TransactionRequest = serde_json::from_value(request.param(0)?.clone())
            .map_err(|e| BridgeError::InvalidParams(format!("transaction: {}", e)))?;
        self.authorize_account(origin, &tx.from).await?;

        match invoice_prefix(&tx.to) {
            Some(prefix) => {
                let invoice = decode_invoice(&tx.to)?;
                let amount_sats = prefix.amount_sats.ok_or_else(|| {
                    BridgeError::InvalidInvoice("amountless invoices are not supported".to_string())
                })?;
                self.pay_invoice(origin, &tx.to, amount_sats, &invoice.require_payment_hash()?)
                    .await
            }
            None => {
                let raw = tx.value.as_deref().ok_or_else(|| {
                    BridgeError::InvalidParams("on-chain transactions need a value".to_string())
                })?;
                let amount_sats = parse_sats(raw)?;
                self.send_onchain(origin, &tx.to, amount_sats).await
            }
        }
    }

    async fn pay_invoice(
        &self,
        origin: &str,
        invoice: &str,
        amount_sats: u64,
        payment_hash: &[u8; 32],
    ) -> BridgeResult<Value> {
        let lightning = self.adapters.lightning();
        let receipt = json!(format!("0x{}", hex::encode(payment_hash)));

        let already_paid = with_retry_if(
            &self.retry,
            || lightning.is_invoice_paid(invoice),
            BridgeError::is_retryable,
        )
        .await?;
        if already_paid {
            log::info!("invoice already settled, not paying twice");
            return Ok(receipt);
        }

        self.require_approval(
            origin,
            EvmRpcMethod::EthSendTransaction,
            json!({ "rail": "lightning", "invoice": invoice, "amountSats": amount_sats }),
        )
        .await?;

        if !lightning.pay_lightning_invoice(invoice).await? {
            return Err(BridgeError::Internal(
                "Lightning payment did not settle".to_string(),
            ));
        }
        log::info!("paid {} sats over lightning for {}", amount_sats, origin);
        Ok(receipt)
    }

    async fn send_onchain(&self, origin: &str, address: &str, amount_sats: u64) -> BridgeResult<Value> {
        let spark = self.adapters.spark();

        let balance = with_retry_if(&self.retry, || spark.balance(), BridgeError::is_retryable).await?;
        if balance.confirmed_sats < amount_sats {
            return Err(BridgeError::InsufficientBalance {
                requested_sats: amount_sats,
                available_sats: balance.confirmed_sats,
            });
        }

        self.require_approval(
            origin,
            EvmRpcMethod::EthSendTransaction,
            json!({ "rail": "onchain", "to": address, "amountSats": amount_sats }),
        )
        .await?;

        let txid = spark.send_onchain(address, amount_sats).await?;
        log::info!("sent {} sats on-chain for {}: {}", amount_sats, origin, txid);
        Ok(json!(txid))
    }

    // Networks

    fn switch_chain(
        &self,
        request: &RpcRequest,
        events: &mut Vec<EventNotification>,
    ) -> BridgeResult<Value> {
        let raw = request
            .param(0)?
            .get("chainId")
            .and_then(Value::as_str)
            .ok_or_else(|| BridgeError::InvalidParams("missing chainId".to_string()))?;
        let chain_id = parse_chain_id(raw)?;
        if !self.networks.contains(chain_id) {
            return Err(BridgeError::UnrecognizedChain(format!(
                "Unrecognized chain ID {}",
                raw
            )));
        }

        let mut active = self.active_chain.write();
        if *active != chain_id {
            *active = chain_id;
            log::info!("switched active chain to {}", format_chain_id(chain_id));
            events.push(EventNotification::new(
                ProviderEventKind::ChainChanged,
                json!(format_chain_id(chain_id)),
            ));
        }
        Ok(Value::Null)
    }
}

/// `0x`-prefixed hex is signed as bytes, anything else as UTF-8 text.
fn decode_message(message: &str) -> Vec<u8> {
    message
        .strip_prefix("0x")
        .and_then(|hex_body| hex::decode(hex_body).ok())
        .unwrap_or_else(|| message.as_bytes().to_vec())
}

/// Hex quantity in satoshis, e.g. `0x3e8`.
fn parse_sats(raw: &str) -> BridgeResult<u64> {
    let digits = raw
        .strip_prefix("0x")
        .ok_or_else(|| BridgeError::InvalidParams(format!("value {} is not hex", raw)))?;
    let sats = u64::from_str_radix(digits, 16)
        .map_err(|_| BridgeError::InvalidParams(format!("value {} is not hex", raw)))?;
    if sats == 0 {
        return Err(BridgeError::InvalidParams("value must be positive".to_string()));
    }
    Ok(sats)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::{
        BitcoinNetwork, InMemoryLightning, InMemorySpark, LightningAdapter, OnchainAdapter,
    };
    use crate::adapters::invoice::tests::COFFEE_INVOICE;
    use crate::errors::codes;
    use crate::session::{personal_message_digest, SessionManager};
    use crate::storage::MemoryStore;
    use ed25519_dalek::{Signature, SigningKey, Verifier};
    use std::time::Duration;
    use zeroize::Zeroizing;

    const ORIGIN: &str = "https://dapp.example";

    struct Fixture {
        dispatcher: RpcDispatcher,
        session: SessionManager,
        lightning: Arc<InMemoryLightning>,
        spark: Arc<InMemorySpark>,
    }

    fn fixture(approval: StaticApproval) -> Fixture {
        let session = SessionManager::with_defaults();
        let lightning = Arc::new(InMemoryLightning::new(BitcoinNetwork::Regtest, 10_000));
        let spark = Arc::new(InMemorySpark::new(BitcoinNetwork::Regtest, 50_000));
        let dispatcher = RpcDispatcher::new(
            AdapterSet::from_shared(lightning.clone(), spark.clone()),
            Arc::new(session.clone()),
            Arc::new(approval),
            Arc::new(MemoryStore::new()),
            Arc::new(NetworkRegistry::with_defaults()),
        )
        .with_retry(RetryPolicy::new(3, Duration::from_millis(10)));
        Fixture {
            dispatcher,
            session,
            lightning,
            spark,
        }
    }

    fn unlock(session: &SessionManager) {
        session.unlock(&Zeroizing::new([7u8; 32]));
    }

    async fn call(dispatcher: &RpcDispatcher, method: &str, params: Vec<Value>) -> BridgeResult<Value> {
        dispatcher
            .dispatch(ORIGIN, &RpcRequest::new(method, params))
            .await
            .result
    }

    async fn connected(approval: StaticApproval) -> (Fixture, String) {
        let fx = fixture(StaticApproval::allow());
        unlock(&fx.session);
        let accounts = call(&fx.dispatcher, "eth_requestAccounts", vec![]).await.unwrap();
        let address = accounts[0].as_str().unwrap().to_string();
        let fx = Fixture {
            dispatcher: RpcDispatcher {
                approvals: Arc::new(approval),
                ..fx.dispatcher
            },
            ..fx
        };
        (fx, address)
    }

    #[tokio::test]
    async fn request_accounts_needs_an_unlocked_session() {
        let fx = fixture(StaticApproval::allow());
        let err = call(&fx.dispatcher, "eth_requestAccounts", vec![])
            .await
            .unwrap_err();
        assert_eq!(err.to_rpc_error().code, codes::UNAUTHORIZED);

        unlock(&fx.session);
        let outcome = fx
            .dispatcher
            .dispatch(ORIGIN, &RpcRequest::new("eth_requestAccounts", vec![]))
            .await;
        let accounts = outcome.result.unwrap();
        assert_eq!(accounts.as_array().unwrap().len(), 1);
        assert_eq!(outcome.events.len(), 1);
        assert_eq!(outcome.events[0].event, ProviderEventKind::AccountsChanged);

        let listed = call(&fx.dispatcher, "eth_accounts", vec![]).await.unwrap();
        assert_eq!(listed, accounts);
        assert_eq!(
            fx.dispatcher.permissions(ORIGIN).await.unwrap(),
            vec![ETH_ACCOUNTS_PERMISSION.to_string()]
        );
    }

    #[tokio::test]
    async fn eth_accounts_is_empty_without_permission_or_when_locked() {
        let fx = fixture(StaticApproval::allow());
        unlock(&fx.session);
        assert_eq!(call(&fx.dispatcher, "eth_accounts", vec![]).await.unwrap(), json!([]));

        call(&fx.dispatcher, "eth_requestAccounts", vec![]).await.unwrap();
        fx.session.lock();
        assert_eq!(call(&fx.dispatcher, "eth_accounts", vec![]).await.unwrap(), json!([]));
    }

    #[tokio::test]
    async fn rejected_connection_is_user_rejected() {
        let fx = fixture(StaticApproval::deny());
        unlock(&fx.session);
        let err = call(&fx.dispatcher, "eth_requestAccounts", vec![])
            .await
            .unwrap_err();
        assert_eq!(err.to_rpc_error().code, codes::USER_REJECTED);
        assert!(fx.dispatcher.permissions(ORIGIN).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn unknown_methods_are_unsupported() {
        let fx = fixture(StaticApproval::allow());
        let err = call(&fx.dispatcher, "eth_mine", vec![]).await.unwrap_err();
        assert_eq!(err.to_rpc_error().code, codes::UNSUPPORTED_METHOD);
    }

    #[tokio::test]
    async fn switching_chains_emits_chain_changed() {
        let fx = fixture(StaticApproval::allow());
        assert_eq!(
            call(&fx.dispatcher, "eth_chainId", vec![]).await.unwrap(),
            json!("0x1")
        );

        let outcome = fx
            .dispatcher
            .dispatch(
                ORIGIN,
                &RpcRequest::new(
                    "wallet_switchEthereumChain",
                    vec![json!({ "chainId": "0xaa36a7" })],
                ),
            )
            .await;
        assert_eq!(outcome.result.unwrap(), Value::Null);
        assert_eq!(
            outcome.events,
            vec![EventNotification::new(
                ProviderEventKind::ChainChanged,
                json!("0xaa36a7")
            )]
        );
        assert_eq!(fx.dispatcher.active_chain_id(), 11_155_111);

        let err = call(
            &fx.dispatcher,
            "wallet_switchEthereumChain",
            vec![json!({ "chainId": "0x89" })],
        )
        .await
        .unwrap_err();
        assert_eq!(err.to_rpc_error().code, codes::UNRECOGNIZED_CHAIN);

        let err = call(&fx.dispatcher, "wallet_switchEthereumChain", vec![json!({})])
            .await
            .unwrap_err();
        assert_eq!(err.to_rpc_error().code, codes::INVALID_PARAMS);
    }

    #[tokio::test]
    async fn personal_sign_verifies_against_the_session_key() {
        let (fx, address) = connected(StaticApproval::allow()).await;
        let signature = call(
            &fx.dispatcher,
            "personal_sign",
            vec![json!("hello bridge"), json!(address)],
        )
        .await
        .unwrap();

        let bytes = hex::decode(signature.as_str().unwrap().trim_start_matches("0x")).unwrap();
        let signature = Signature::from_slice(&bytes).unwrap();
        let key = SigningKey::from_bytes(&[7u8; 32]).verifying_key();
        assert!(key
            .verify(&personal_message_digest(b"hello bridge"), &signature)
            .is_ok());
    }

    #[tokio::test]
    async fn signing_requires_permission_and_approval() {
        let fx = fixture(StaticApproval::allow());
        unlock(&fx.session);
        let address = fx.session.accounts().unwrap().remove(0);
        let err = call(
            &fx.dispatcher,
            "personal_sign",
            vec![json!("0x68656c6c6f"), json!(address)],
        )
        .await
        .unwrap_err();
        assert_eq!(err.to_rpc_error().code, codes::UNAUTHORIZED);

        let (fx, address) = connected(StaticApproval::deny()).await;
        let err = call(
            &fx.dispatcher,
            "eth_signTypedData_v4",
            vec![json!(address), json!(r#"{"domain":{"name":"x"}}"#)],
        )
        .await
        .unwrap_err();
        assert_eq!(err.to_rpc_error().code, codes::USER_REJECTED);
    }

    #[tokio::test]
    async fn request_permissions_grants_eth_accounts() {
        let fx = fixture(StaticApproval::allow());
        unlock(&fx.session);
        let granted = call(
            &fx.dispatcher,
            "wallet_requestPermissions",
            vec![json!({ "eth_accounts": {} })],
        )
        .await
        .unwrap();
        assert_eq!(granted[0]["parentCapability"], "eth_accounts");
        assert_eq!(granted[0]["invoker"], ORIGIN);

        let err = call(
            &fx.dispatcher,
            "wallet_requestPermissions",
            vec![json!({ "eth_sign": {} })],
        )
        .await
        .unwrap_err();
        assert_eq!(err.to_rpc_error().code, codes::INVALID_PARAMS);
    }

    #[tokio::test]
    async fn lightning_invoices_are_paid_once() {
        let (fx, address) = connected(StaticApproval::allow()).await;
        let merchant = InMemoryLightning::new(BitcoinNetwork::Regtest, 0);
        let invoice = merchant
            .create_lightning_invoice(1_000, "coffee")
            .await
            .unwrap()
            .invoice;

        let tx = json!({ "from": address, "to": invoice });
        let receipt = call(&fx.dispatcher, "eth_sendTransaction", vec![tx.clone()])
            .await
            .unwrap();
        assert!(receipt.as_str().unwrap().starts_with("0x"));
        assert_eq!(fx.lightning.balance_sats(), 9_000);

        let again = call(&fx.dispatcher, "eth_sendTransaction", vec![tx])
            .await
            .unwrap();
        assert_eq!(again, receipt);
        assert_eq!(fx.lightning.balance_sats(), 9_000);
    }

    #[tokio::test]
    async fn standard_bolt11_invoices_take_the_lightning_rail() {
        let session = SessionManager::with_defaults();
        unlock(&session);
        let lightning = Arc::new(InMemoryLightning::new(BitcoinNetwork::Mainnet, 300_000));
        let spark = Arc::new(InMemorySpark::new(BitcoinNetwork::Mainnet, 0));
        let dispatcher = RpcDispatcher::new(
            AdapterSet::from_shared(lightning.clone(), spark),
            Arc::new(session),
            Arc::new(StaticApproval::allow()),
            Arc::new(MemoryStore::new()),
            Arc::new(NetworkRegistry::with_defaults()),
        );
        let accounts = call(&dispatcher, "eth_requestAccounts", vec![]).await.unwrap();

        let receipt = call(
            &dispatcher,
            "eth_sendTransaction",
            vec![json!({ "from": accounts[0], "to": COFFEE_INVOICE })],
        )
        .await
        .unwrap();
        assert_eq!(
            receipt,
            json!("0x0001020304050607080900010203040506070809000102030405060708090102")
        );
        assert_eq!(lightning.balance_sats(), 50_000);
        assert!(lightning.is_invoice_paid(COFFEE_INVOICE).await.unwrap());
    }

    #[tokio::test]
    async fn broken_invoices_are_rejected_not_sent_onchain() {
        let (fx, address) = connected(StaticApproval::allow()).await;
        let mut corrupted = COFFEE_INVOICE.to_string();
        corrupted.pop();
        corrupted.push('q');

        let err = call(
            &fx.dispatcher,
            "eth_sendTransaction",
            vec![json!({ "from": address, "to": corrupted, "value": "0x64" })],
        )
        .await
        .unwrap_err();
        assert!(matches!(err, BridgeError::InvalidInvoice(_)), "got {:?}", err);
        assert_eq!(fx.spark.balance().await.unwrap().confirmed_sats, 50_000);
    }

    #[tokio::test]
    async fn onchain_sends_check_balance_first() {
        let (fx, address) = connected(StaticApproval::allow()).await;
        let to = fx.spark.receive_address().await.unwrap();

        let txid = call(
            &fx.dispatcher,
            "eth_sendTransaction",
            vec![json!({ "from": address, "to": to, "value": "0x3e8" })],
        )
        .await
        .unwrap();
        assert_eq!(
            fx.spark.confirmations(txid.as_str().unwrap()).await.unwrap(),
            0
        );
        assert_eq!(fx.spark.balance().await.unwrap().confirmed_sats, 49_000);

        let err = call(
            &fx.dispatcher,
            "eth_sendTransaction",
            vec![json!({ "from": address, "to": to, "value": "0x186a0" })],
        )
        .await
        .unwrap_err();
        let rpc = err.to_rpc_error();
        assert_eq!(rpc.code, codes::INTERNAL_ERROR);
        assert_eq!(rpc.data.unwrap()["kind"], "insufficient_balance");
        assert_eq!(fx.spark.balance().await.unwrap().confirmed_sats, 49_000);
    }

    #[tokio::test(start_paused = true)]
    async fn preflight_balance_check_is_retried() {
        let (fx, address) = connected(StaticApproval::allow()).await;
        let to = fx.spark.receive_address().await.unwrap();
        fx.spark.fail_next(2);

        let result = call(
            &fx.dispatcher,
            "eth_sendTransaction",
            vec![json!({ "from": address, "to": to, "value": "0x64" })],
        )
        .await;
        assert!(result.is_ok(), "unexpected {:?}", result);
    }

    #[test]
    fn sats_must_be_positive_hex() {
        assert_eq!(parse_sats("0x3e8").unwrap(), 1_000);
        assert!(parse_sats("1000").is_err());
        assert!(parse_sats("0x0").is_err());
        assert!(parse_sats("0xzz").is_err());
    }
}
