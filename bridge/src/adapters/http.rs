/// JSON-RPC backends for the Lightning and Spark adapters
///
/// Both adapters talk to a wallet service over HTTP JSON-RPC. Transport failures and 5xx
/// responses are reported as `BackendUnreachable`; backend error codes are mapped to the
/// adapter error kinds so the dispatcher can pick a stable RPC code.
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::adapters::{
    LightningAdapter, LightningEnabled, LightningInvoice, OnchainAdapter, OnchainBalance,
    OnchainEnabled, WalletAdapter,
};
use crate::errors::{BridgeError, BridgeResult};

/// Backend error codes understood by [`classify_backend_error`].
pub const BACKEND_INSUFFICIENT_BALANCE: i32 = -32001;
pub const BACKEND_INVALID_INVOICE: i32 = -32002;
pub const BACKEND_INVALID_ADDRESS: i32 = -32003;

/// HTTP client for wallet backend RPC communication
pub struct BackendClient {
    client: Client,
    base_url: String,
    next_id: AtomicU64,
}

/// JSON-RPC request structure
#[derive(Debug, Serialize)]
struct JsonRpcRequest<'a, T: Serialize> {
    jsonrpc: &'static str,
    method: &'a str,
    params: T,
    id: u64,
}

/// JSON-RPC response structure
#[derive(Debug, Deserialize)]
struct JsonRpcResponse<T> {
    result: Option<T>,
    error: Option<JsonRpcError>,
}

/// JSON-RPC error structure
#[derive(Debug, Deserialize)]
struct JsonRpcError {
    code: i32,
    message: String,
    #[serde(default)]
    data: Option<Value>,
}

impl BackendClient {
    pub fn new(base_url: impl Into<String>) -> BridgeResult<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| {
                BridgeError::BackendUnreachable(format!("Failed to create HTTP client: {}", e))
            })?;

        Ok(BackendClient {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            next_id: AtomicU64::new(1),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Make a JSON-RPC call to the backend
    pub async fn rpc_call<T: for<'de> Deserialize<'de>>(
        &self,
        method: &str,
        params: Value,
    ) -> BridgeResult<T> {
        let request = JsonRpcRequest {
            jsonrpc: "2.0",
            method,
            params,
            id: self.next_id.fetch_add(1, Ordering::Relaxed),
        };

        let url = format!("{}/jsonrpc", self.base_url);
        let response = self
            .client
            .post(&url)
            .json(&request)
            .send()
            .await
            .map_err(|e| BridgeError::BackendUnreachable(format!("HTTP request failed: {}", e)))?;

        let status = response.status();
        if status.is_server_error() {
            return Err(BridgeError::BackendUnreachable(format!(
                "HTTP error: {}",
                status
            )));
        }
        if !status.is_success() {
            return Err(BridgeError::Internal(format!("HTTP error: {}", status)));
        }

        let rpc_response: JsonRpcResponse<T> = response.json().await.map_err(|e| {
            BridgeError::BackendUnreachable(format!("Failed to parse response: {}", e))
        })?;

        if let Some(error) = rpc_response.error {
            return Err(classify_backend_error(
                error.code,
                error.message,
                error.data.as_ref(),
            ));
        }

        rpc_response
            .result
            .ok_or_else(|| BridgeError::Internal("No result in RPC response".to_string()))
    }
}

pub fn classify_backend_error(code: i32, message: String, data: Option<&Value>) -> BridgeError {
    match code {
        BACKEND_INSUFFICIENT_BALANCE => {
            let field = |name: &str| {
                data.and_then(|data| data.get(name))
                    .and_then(Value::as_u64)
                    .unwrap_or(0)
            };
            BridgeError::InsufficientBalance {
                requested_sats: field("requestedSats"),
                available_sats: field("availableSats"),
            }
        }
        BACKEND_INVALID_INVOICE => BridgeError::InvalidInvoice(message),
        BACKEND_INVALID_ADDRESS => BridgeError::InvalidAddress(message),
        -32099..=-32010 => BridgeError::BackendUnreachable(message),
        _ => BridgeError::Internal(format!("RPC error {}: {}", code, message)),
    }
}

#[derive(Debug, Deserialize)]
struct Settled {
    settled: bool,
}

#[derive(Debug, Deserialize)]
struct Paid {
    paid: bool,
}

#[derive(Debug, Deserialize)]
struct Broadcast {
    txid: String,
}

#[derive(Debug, Deserialize)]
struct IssuedAddress {
    address: String,
}

#[derive(Debug, Deserialize)]
struct Confirmations {
    confirmations: u32,
}

pub struct HttpLightningAdapter {
    client: BackendClient,
}

impl HttpLightningAdapter {
    pub fn new(base_url: impl Into<String>) -> BridgeResult<Self> {
        Ok(Self {
            client: BackendClient::new(base_url)?,
        })
    }
}

impl WalletAdapter for HttpLightningAdapter {
    type Capability = LightningEnabled;

    fn backend_name(&self) -> &str {
        self.client.base_url()
    }
}

#[async_trait]
impl LightningAdapter for HttpLightningAdapter {
    async fn pay_lightning_invoice(&self, invoice: &str) -> BridgeResult<bool> {
        let params = serde_json::json!({ "invoice": invoice });
        let response: Settled = self.client.rpc_call("lightning_pay_invoice", params).await?;
        Ok(response.settled)
    }

    async fn create_lightning_invoice(
        &self,
        amount_sats: u64,
        memo: &str,
    ) -> BridgeResult<LightningInvoice> {
        let params = serde_json::json!({ "amountSats": amount_sats, "memo": memo });
        self.client
            .rpc_call("lightning_create_invoice", params)
            .await
    }

    async fn is_invoice_paid(&self, invoice: &str) -> BridgeResult<bool> {
        let params = serde_json::json!({ "invoice": invoice });
        let response: Paid = self
            .client
            .rpc_call("lightning_invoice_status", params)
            .await?;
        Ok(response.paid)
    }
}

pub struct HttpSparkAdapter {
    client: BackendClient,
}

impl HttpSparkAdapter {
    pub fn new(base_url: impl Into<String>) -> BridgeResult<Self> {
        Ok(Self {
            client: BackendClient::new(base_url)?,
        })
    }
}

impl WalletAdapter for HttpSparkAdapter {
    type Capability = OnchainEnabled;

    fn backend_name(&self) -> &str {
        self.client.base_url()
    }
}

#[async_trait]
impl OnchainAdapter for HttpSparkAdapter {
    async fn send_onchain(&self, address: &str, amount_sats: u64) -> BridgeResult<String> {
        let params = serde_json::json!({ "address": address, "amountSats": amount_sats });
        let response: Broadcast = self.client.rpc_call("spark_send", params).await?;
        Ok(response.txid)
    }

    async fn receive_address(&self) -> BridgeResult<String> {
        let response: IssuedAddress = self
            .client
            .rpc_call("spark_receive_address", Value::Null)
            .await?;
        Ok(response.address)
    }

    async fn balance(&self) -> BridgeResult<OnchainBalance> {
        self.client.rpc_call("spark_balance", Value::Null).await
    }

    async fn confirmations(&self, txid: &str) -> BridgeResult<u32> {
        let params = serde_json::json!({ "txid": txid });
        let response: Confirmations = self
            .client
            .rpc_call("spark_confirmations", params)
            .await?;
        Ok(response.confirmations)
    }
}
