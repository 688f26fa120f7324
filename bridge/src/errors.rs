use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

/// Standard EIP-1193 / JSON-RPC error codes surfaced to page code.
pub mod codes {
    pub const USER_REJECTED: i64 = 4001;
    pub const UNAUTHORIZED: i64 = 4100;
    pub const UNSUPPORTED_METHOD: i64 = 4200;
    pub const DISCONNECTED: i64 = 4900;
    pub const CHAIN_DISCONNECTED: i64 = 4901;
    pub const UNRECOGNIZED_CHAIN: i64 = 4902;
    pub const INVALID_PARAMS: i64 = -32602;
    pub const INTERNAL_ERROR: i64 = -32603;
    pub const BACKEND_UNREACHABLE: i64 = -32000;
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum BridgeError {
    // Transport errors
    Disconnected(String),
    ChainDisconnected(String),
    TransportClosed,
    Timeout(String),

    // Protocol errors
    UnsupportedMethod(String),
    InvalidParams(String),
    MalformedEnvelope(String),

    // Authorization errors
    Unauthorized(String),
    UserRejected(String),
    UnrecognizedChain(String),

    // Adapter errors
    BackendUnreachable(String),
    InvalidInvoice(String),
    InvalidAddress(String),
    InsufficientBalance { requested_sats: u64, available_sats: u64 },

    // Storage and configuration errors
    StorageError(String),
    ValidationError(String),
    NotInitialized,

    // Generic errors
    Internal(String),
}

impl fmt::Display for BridgeError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            BridgeError::Disconnected(msg) => write!(f, "Disconnected: {}", msg),
            BridgeError::ChainDisconnected(msg) => write!(f, "Chain disconnected: {}", msg),
            BridgeError::TransportClosed => write!(f, "Transport closed"),
            BridgeError::Timeout(msg) => write!(f, "Timed out: {}", msg),

            BridgeError::UnsupportedMethod(method) => {
                write!(f, "The provider does not support the method: {}", method)
            }
            BridgeError::InvalidParams(msg) => write!(f, "Invalid params: {}", msg),
            BridgeError::MalformedEnvelope(msg) => write!(f, "Malformed envelope: {}", msg),

            BridgeError::Unauthorized(msg) => write!(f, "Unauthorized: {}", msg),
            BridgeError::UserRejected(msg) => write!(f, "User rejected the request: {}", msg),
            BridgeError::UnrecognizedChain(chain) => write!(f, "Unrecognized chain ID {}", chain),

            BridgeError::BackendUnreachable(msg) => write!(f, "Backend unreachable: {}", msg),
            BridgeError::InvalidInvoice(msg) => write!(f, "Invalid invoice: {}", msg),
            BridgeError::InvalidAddress(msg) => write!(f, "Invalid address: {}", msg),
            BridgeError::InsufficientBalance {
                requested_sats,
                available_sats,
            } => write!(
                f,
                "Insufficient balance: requested {} sats, available {} sats",
                requested_sats, available_sats
            ),

            BridgeError::StorageError(msg) => write!(f, "Storage error: {}", msg),
            BridgeError::ValidationError(msg) => write!(f, "Validation error: {}", msg),
            BridgeError::NotInitialized => write!(f, "Bridge not initialized"),

            BridgeError::Internal(msg) => write!(f, "Internal error: {}", msg),
        }
    }
}

impl std::error::Error for BridgeError {}

pub type BridgeResult<T> = Result<T, BridgeError>;

impl BridgeError {
    /// Only an unreachable backend is eligible for the retry combinator.
    pub fn is_retryable(&self) -> bool {
        matches!(self, BridgeError::BackendUnreachable(_))
    }

    /// Short machine-readable kind carried in `ProviderRpcError::data`.
    pub fn kind(&self) -> &'static str {
        match self {
            BridgeError::Disconnected(_) => "disconnected",
            BridgeError::ChainDisconnected(_) => "chain_disconnected",
            BridgeError::TransportClosed => "transport_closed",
            BridgeError::Timeout(_) => "timeout",
            BridgeError::UnsupportedMethod(_) => "unsupported_method",
            BridgeError::InvalidParams(_) => "invalid_params",
            BridgeError::MalformedEnvelope(_) => "malformed_envelope",
            BridgeError::Unauthorized(_) => "unauthorized",
            BridgeError::UserRejected(_) => "user_rejected",
            BridgeError::UnrecognizedChain(_) => "unrecognized_chain",
            BridgeError::BackendUnreachable(_) => "backend_unreachable",
            BridgeError::InvalidInvoice(_) => "invalid_invoice",
            BridgeError::InvalidAddress(_) => "invalid_address",
            BridgeError::InsufficientBalance { .. } => "insufficient_balance",
            BridgeError::StorageError(_) => "storage",
            BridgeError::ValidationError(_) => "validation",
            BridgeError::NotInitialized => "not_initialized",
            BridgeError::Internal(_) => "internal",
        }
    }

    /// Translate into the error shape page code pattern-matches on.
    pub fn to_rpc_error(&self) -> ProviderRpcError {
        let code = match self {
            BridgeError::UserRejected(_) => codes::USER_REJECTED,
            BridgeError::Unauthorized(_) => codes::UNAUTHORIZED,
            BridgeError::UnsupportedMethod(_) => codes::UNSUPPORTED_METHOD,
            BridgeError::Disconnected(_)
            | BridgeError::TransportClosed
            | BridgeError::Timeout(_) => codes::DISCONNECTED,
            BridgeError::ChainDisconnected(_) => codes::CHAIN_DISCONNECTED,
            BridgeError::UnrecognizedChain(_) => codes::UNRECOGNIZED_CHAIN,
            BridgeError::InvalidParams(_)
            | BridgeError::MalformedEnvelope(_)
            | BridgeError::InvalidInvoice(_)
            | BridgeError::InvalidAddress(_) => codes::INVALID_PARAMS,
            BridgeError::BackendUnreachable(_) => codes::BACKEND_UNREACHABLE,
            BridgeError::InsufficientBalance { .. }
            | BridgeError::StorageError(_)
            | BridgeError::ValidationError(_)
            | BridgeError::NotInitialized
            | BridgeError::Internal(_) => codes::INTERNAL_ERROR,
        };

        ProviderRpcError {
            code,
            message: self.to_string(),
            data: Some(serde_json::json!({ "kind": self.kind() })),
        }
    }
}

/// The only error shape that crosses a context boundary.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ProviderRpcError {
    pub code: i64,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl ProviderRpcError {
    pub fn new(code: i64, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            data: None,
        }
    }

    pub fn disconnected(message: impl Into<String>) -> Self {
        Self::new(codes::DISCONNECTED, message)
    }

    /// Recover a typed error on the Rust side of a boundary.
    pub fn into_bridge_error(self) -> BridgeError {
        let kind = self
            .data
            .as_ref()
            .and_then(|data| data.get("kind"))
            .and_then(Value::as_str)
            .map(str::to_owned);

        match (self.code, kind.as_deref()) {
            (codes::USER_REJECTED, _) => BridgeError::UserRejected(self.message),
            (codes::UNAUTHORIZED, _) => BridgeError::Unauthorized(self.message),
            (codes::UNSUPPORTED_METHOD, _) => BridgeError::UnsupportedMethod(self.message),
            (codes::DISCONNECTED, _) => BridgeError::Disconnected(self.message),
            (codes::CHAIN_DISCONNECTED, _) => BridgeError::ChainDisconnected(self.message),
            (codes::UNRECOGNIZED_CHAIN, _) => BridgeError::UnrecognizedChain(self.message),
            (codes::BACKEND_UNREACHABLE, _) => BridgeError::BackendUnreachable(self.message),
            (_, Some("invalid_invoice")) => BridgeError::InvalidInvoice(self.message),
            (_, Some("invalid_address")) => BridgeError::InvalidAddress(self.message),
            (codes::INVALID_PARAMS, _) => BridgeError::InvalidParams(self.message),
            _ => BridgeError::Internal(self.message),
        }
    }
}

impl fmt::Display for ProviderRpcError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "[{}] {}", self.code, self.message)
    }
}

impl std::error::Error for ProviderRpcError {}

impl From<BridgeError> for ProviderRpcError {
    fn from(error: BridgeError) -> Self {
        error.to_rpc_error()
    }
}

// Conversion helpers
impl From<std::io::Error> for BridgeError {
    fn from(error: std::io::Error) -> Self {
        match error.kind() {
            std::io::ErrorKind::UnexpectedEof | std::io::ErrorKind::BrokenPipe => {
                BridgeError::TransportClosed
            }
            _ => BridgeError::StorageError(error.to_string()),
        }
    }
}

impl From<serde_json::Error> for BridgeError {
    fn from(error: serde_json::Error) -> Self {
        BridgeError::ValidationError(format!("JSON error: {}", error))
    }
}
