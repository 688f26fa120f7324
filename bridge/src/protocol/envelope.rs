use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::errors::{BridgeError, BridgeResult, ProviderRpcError};
use crate::protocol::methods::EvmRpcMethod;

/// Fresh correlation id for an outgoing call or event.
pub fn new_call_id() -> String {
    Uuid::new_v4().to_string()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    ToBackground,
    ToPage,
}

/// EIP-1193 request arguments: `{ method, params? }`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcRequest {
    pub method: String,
    #[serde(default)]
    pub params: Vec<Value>,
}

impl RpcRequest {
    pub fn new(method: impl Into<String>, params: Vec<Value>) -> Self {
        Self {
            method: method.into(),
            params,
        }
    }

    pub fn evm_method(&self) -> BridgeResult<EvmRpcMethod> {
        self.method.parse()
    }

    pub fn param(&self, index: usize) -> BridgeResult<&Value> {
        self.params.get(index).ok_or_else(|| {
            BridgeError::InvalidParams(format!(
                "{} expects a parameter at position {}",
                self.method, index
            ))
        })
    }

    pub fn str_param(&self, index: usize) -> BridgeResult<&str> {
        self.param(index)?.as_str().ok_or_else(|| {
            BridgeError::InvalidParams(format!(
                "{} expects a string at position {}",
                self.method, index
            ))
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RpcOutcome {
    Result(Value),
    Error(ProviderRpcError),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcResponse {
    pub id: String,
    #[serde(flatten)]
    pub outcome: RpcOutcome,
}

impl RpcResponse {
    pub fn result(id: impl Into<String>, value: Value) -> Self {
        Self {
            id: id.into(),
            outcome: RpcOutcome::Result(value),
        }
    }

    pub fn error(id: impl Into<String>, error: ProviderRpcError) -> Self {
        Self {
            id: id.into(),
            outcome: RpcOutcome::Error(error),
        }
    }

    pub fn from_result(id: impl Into<String>, result: BridgeResult<Value>) -> Self {
        match result {
            Ok(value) => Self::result(id, value),
            Err(error) => Self::error(id, error.to_rpc_error()),
        }
    }

    pub fn into_result(self) -> Result<Value, ProviderRpcError> {
        match self.outcome {
            RpcOutcome::Result(value) => Ok(value),
            RpcOutcome::Error(error) => Err(error),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ProviderEventKind {
    Connect,
    Disconnect,
    ChainChanged,
    AccountsChanged,
    Message,
}

impl ProviderEventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProviderEventKind::Connect => "connect",
            ProviderEventKind::Disconnect => "disconnect",
            ProviderEventKind::ChainChanged => "chainChanged",
            ProviderEventKind::AccountsChanged => "accountsChanged",
            ProviderEventKind::Message => "message",
        }
    }

    pub fn parse(name: &str) -> Option<Self> {
        [
            ProviderEventKind::Connect,
            ProviderEventKind::Disconnect,
            ProviderEventKind::ChainChanged,
            ProviderEventKind::AccountsChanged,
            ProviderEventKind::Message,
        ]
        .into_iter()
        .find(|kind| kind.as_str() == name)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventNotification {
    pub event: ProviderEventKind,
    #[serde(default)]
    pub data: Value,
}

impl EventNotification {
    pub fn new(event: ProviderEventKind, data: Value) -> Self {
        Self { event, data }
    }
}

/// Everything that may travel inside an envelope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "data", rename_all = "snake_case")]
pub enum Payload {
    Request(RpcRequest),
    Response(RpcResponse),
    Event(EventNotification),
    Passthrough(Value),
}

impl Payload {
    pub fn kind(&self) -> &'static str {
        match self {
            Payload::Request(_) => "request",
            Payload::Response(_) => "response",
            Payload::Event(_) => "event",
            Payload::Passthrough(_) => "passthrough",
        }
    }
}

/// Transport unit exchanged between isolated contexts. `id` is the sole correlation key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageEnvelope {
    pub id: String,
    pub direction: Direction,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub origin: Option<String>,
    pub payload: Payload,
}

impl MessageEnvelope {
    pub fn request(id: impl Into<String>, origin: Option<String>, request: RpcRequest) -> Self {
        Self {
            id: id.into(),
            direction: Direction::ToBackground,
            origin,
            payload: Payload::Request(request),
        }
    }

    pub fn response(response: RpcResponse, origin: Option<String>) -> Self {
        Self {
            id: response.id.clone(),
            direction: Direction::ToPage,
            origin,
            payload: Payload::Response(response),
        }
    }

    pub fn event(event: EventNotification, origin: Option<String>) -> Self {
        Self {
            id: new_call_id(),
            direction: Direction::ToPage,
            origin,
            payload: Payload::Event(event),
        }
    }

    pub fn passthrough(direction: Direction, value: Value) -> Self {
        Self {
            id: new_call_id(),
            direction,
            origin: None,
            payload: Payload::Passthrough(value),
        }
    }

    /// Parse and validate an envelope arriving from another context.
    pub fn from_value(raw: Value) -> BridgeResult<Self> {
        let id = raw
            .get("id")
            .and_then(Value::as_str)
            .ok_or_else(|| BridgeError::MalformedEnvelope("missing string id".into()))?;
        if id.trim().is_empty() {
            return Err(BridgeError::MalformedEnvelope("empty id".into()));
        }

        if let Some(data) = raw
            .get("payload")
            .filter(|payload| payload.get("kind").and_then(Value::as_str) == Some("response"))
            .and_then(|payload| payload.get("data"))
        {
            let has_result = data.get("result").is_some();
            let has_error = data.get("error").is_some();
            if has_result == has_error {
                return Err(BridgeError::MalformedEnvelope(
                    "response must carry exactly one of result or error".into(),
                ));
            }
        }

        let envelope: MessageEnvelope = serde_json::from_value(raw)
            .map_err(|e| BridgeError::MalformedEnvelope(e.to_string()))?;

        let expected = match &envelope.payload {
            Payload::Request(_) => Some(Direction::ToBackground),
            Payload::Response(_) | Payload::Event(_) => Some(Direction::ToPage),
            Payload::Passthrough(_) => None,
        };
        if let Some(expected) = expected.filter(|&d| d != envelope.direction) {
            return Err(BridgeError::MalformedEnvelope(format!(
                "{} payload cannot travel {:?}",
                envelope.payload.kind(),
                envelope.direction
            )));
        }

        if let Payload::Response(response) = &envelope.payload {
            if response.id != envelope.id {
                return Err(BridgeError::MalformedEnvelope(format!(
                    "response id {} does not match envelope id {}",
                    response.id, envelope.id
                )));
            }
        }

        Ok(envelope)
    }

    pub fn from_json(raw: &str) -> BridgeResult<Self> {
        let value: Value = serde_json::from_str(raw)
            .map_err(|e| BridgeError::MalformedEnvelope(e.to_string()))?;
        Self::from_value(value)
    }

    pub fn to_json(&self) -> BridgeResult<String> {
        Ok(serde_json::to_string(self)?)
    }
}
