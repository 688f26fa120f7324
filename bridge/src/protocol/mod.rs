pub mod envelope;
pub mod methods;

pub use envelope::{
    new_call_id, Direction, EventNotification, MessageEnvelope, Payload, ProviderEventKind,
    RpcOutcome, RpcRequest, RpcResponse,
};
pub use methods::EvmRpcMethod;
