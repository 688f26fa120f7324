// lib.rs - Core library structure for the wallet provider bridge

pub mod adapters;
pub mod announce;
#[cfg(feature = "native")]
pub mod background;
pub mod config;
pub mod dispatcher;
pub mod errors;
pub mod native_messaging;
pub mod network;
pub mod protocol;
pub mod provider;
pub mod relay;
pub mod retry;
pub mod session;
pub mod storage;

// Re-export common types
pub use adapters::{
    AdapterSet, BitcoinNetwork, InMemoryLightning, InMemorySpark, LightningAdapter,
    LightningInvoice, OnchainAdapter, OnchainBalance, WalletAdapter,
};
#[cfg(feature = "native")]
pub use adapters::{HttpLightningAdapter, HttpSparkAdapter};
pub use announce::{AnnouncementService, ProviderDetail, ProviderInfo, ProviderRegistry};
#[cfg(feature = "native")]
pub use background::{BackgroundCommand, BackgroundService};
pub use config::{init_config, BridgeConfig, ConfigStore, Environment};
pub use dispatcher::{ApprovalPrompt, KeyManager, RpcDispatcher, StaticApproval};
pub use errors::{BridgeError, BridgeResult, ProviderRpcError};
pub use native_messaging::NativeMessagingCodec;
pub use network::{NetworkInfo, NetworkRegistry};
pub use protocol::{
    EventNotification, EvmRpcMethod, MessageEnvelope, Payload, ProviderEventKind, RpcRequest,
    RpcResponse,
};
pub use provider::{Eip1193Provider, PendingRequest};
pub use relay::{channel_transport, ChannelTransport, MessengerRelay, PendingCalls, Route, Transport};
pub use retry::{with_retry, with_retry_cancellable, with_retry_if, CancellationFlag, RetryPolicy};
pub use session::SessionManager;
pub use storage::{FileStore, KeyValueStore, MemoryStore};
