//! EIP-1193 provider façade for the page context.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use futures::channel::oneshot;
use parking_lot::Mutex;
use serde_json::{json, Value};

use crate::errors::{BridgeError, ProviderRpcError};
use crate::protocol::{
    EventNotification, MessageEnvelope, Payload, ProviderEventKind, RpcRequest, RpcResponse,
};
use crate::relay::{CallState, MessengerRelay, PendingCalls, Resolution, Transport};
use crate::retry::{delay, Delay};

pub type ListenerId = u64;

type Listener = Arc<dyn Fn(&Value) + Send + Sync>;

#[derive(Default)]
struct Listeners {
    next_id: ListenerId,
    by_event: HashMap<ProviderEventKind, Vec<(ListenerId, Listener)>>,
}

#[derive(Debug, Clone)]
struct ProviderState {
    connected: bool,
    chain_id: Option<String>,
    accounts: Vec<String>,
}

struct ProviderInner<T> {
    relay: MessengerRelay<T>,
    pending: Arc<PendingCalls>,
    listeners: Mutex<Listeners>,
    state: Mutex<ProviderState>,
    origin: Option<String>,
    request_timeout: Duration,
}

/// Page-side provider. Cloning shares the pending table and listeners.
pub struct Eip1193Provider<T> {
    inner: Arc<ProviderInner<T>>,
}

impl<T> Clone for Eip1193Provider<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T: Transport> Eip1193Provider<T> {
    pub fn new(transport: T, origin: Option<String>, request_timeout: Duration) -> Self {
        Self {
            inner: Arc::new(ProviderInner {
                relay: MessengerRelay::new(transport),
                pending: Arc::new(PendingCalls::new()),
                listeners: Mutex::new(Listeners::default()),
                state: Mutex::new(ProviderState {
                    connected: true,
                    chain_id: None,
                    accounts: Vec::new(),
                }),
                origin,
                request_timeout,
            }),
        }
    }

    /// Send `args` to the background context. The returned future settles at most once.
    pub fn request(&self, args: RpcRequest) -> PendingRequest {
        let pending = Arc::clone(&self.inner.pending);
        let (id, receiver) = pending.register();

        if !self.is_connected() {
            pending.expire(&id);
            return PendingRequest::failed(
                id,
                pending,
                ProviderRpcError::disconnected("Provider is disconnected"),
            );
        }

        let envelope = MessageEnvelope::request(id.clone(), self.inner.origin.clone(), args);
        if let Err(e) = self.inner.relay.send_generic_message_to_background(envelope) {
            log::warn!("failed to publish request {}: {}", id, e);
            pending.expire(&id);
            return PendingRequest::failed(id, pending, e.to_rpc_error());
        }
        pending.mark_sent(&id);

        PendingRequest {
            id,
            pending,
            state: RequestState::Waiting {
                receiver,
                timeout: delay(self.inner.request_timeout),
                awaiting: false,
            },
        }
    }

    /// Abandon a request. Its future never settles and a late response is discarded.
    pub fn cancel(&self, id: &str) -> bool {
        self.inner.pending.cancel(id)
    }

    pub fn state_of(&self, id: &str) -> Option<CallState> {
        self.inner.pending.state_of(id)
    }

    pub fn in_flight(&self) -> usize {
        self.inner.pending.in_flight()
    }

    pub fn orphaned_count(&self) -> u64 {
        self.inner.pending.orphaned_count()
    }

    pub fn is_connected(&self) -> bool {
        self.inner.state.lock().connected
    }

    pub fn chain_id(&self) -> Option<String> {
        self.inner.state.lock().chain_id.clone()
    }

    pub fn accounts(&self) -> Vec<String> {
        self.inner.state.lock().accounts.clone()
    }

    pub fn on<F>(&self, event: ProviderEventKind, listener: F) -> ListenerId
    where
        F: Fn(&Value) + Send + Sync + 'static,
    {
        let mut listeners = self.inner.listeners.lock();
        listeners.next_id += 1;
        let id = listeners.next_id;
        listeners
            .by_event
            .entry(event)
            .or_default()
            .push((id, Arc::new(listener)));
        id
    }

    pub fn remove_listener(&self, event: ProviderEventKind, id: ListenerId) -> bool {
        let mut listeners = self.inner.listeners.lock();
        let Some(registered) = listeners.by_event.get_mut(&event) else {
            return false;
        };
        let before = registered.len();
        registered.retain(|(listener_id, _)| *listener_id != id);
        before != registered.len()
    }

    /// Entry point for raw page-bound messages.
    pub fn handle_inbound_value(&self, raw: Value) {
        match MessageEnvelope::from_value(raw.clone()) {
            Ok(envelope) => self.handle_inbound(envelope),
            Err(e) => {
                let id = raw.get("id").and_then(Value::as_str);
                match id.filter(|id| self.inner.pending.contains(id)) {
                    Some(id) => {
                        log::warn!("malformed response for {}: {}", id, e);
                        self.inner
                            .pending
                            .resolve(RpcResponse::error(id, e.to_rpc_error()));
                    }
                    None => log::debug!("dropping malformed envelope: {}", e),
                }
            }
        }
    }

    pub fn handle_inbound(&self, envelope: MessageEnvelope) {
        if let (Some(ours), Some(theirs)) = (&self.inner.origin, &envelope.origin) {
            if ours != theirs {
                return;
            }
        }

        match envelope.payload {
            Payload::Response(response) => {
                if self.inner.pending.resolve(response) == Resolution::Orphaned {
                    log::debug!("response {} had no waiting caller", envelope.id);
                }
            }
            Payload::Event(event) => self.apply_event(event),
            Payload::Passthrough(data) => self.emit(
                ProviderEventKind::Message,
                &json!({ "type": "passthrough", "data": data }),
            ),
            Payload::Request(_) => {
                log::warn!("ignoring request envelope {} sent to the page", envelope.id)
            }
        }
    }

    fn apply_event(&self, event: EventNotification) {
        {
            let mut state = self.inner.state.lock();
            match event.event {
                ProviderEventKind::Connect => {
                    state.connected = true;
                    if let Some(chain_id) = event.data.get("chainId").and_then(Value::as_str) {
                        state.chain_id = Some(chain_id.to_string());
                    }
                }
                ProviderEventKind::Disconnect => state.connected = false,
                ProviderEventKind::ChainChanged => {
                    state.chain_id = event.data.as_str().map(str::to_owned);
                }
                ProviderEventKind::AccountsChanged => {
                    state.accounts = serde_json::from_value(event.data.clone()).unwrap_or_default();
                }
                ProviderEventKind::Message => {}
            }
        }

        if event.event == ProviderEventKind::Disconnect {
            let error = serde_json::from_value::<ProviderRpcError>(event.data.clone())
                .unwrap_or_else(|_| ProviderRpcError::disconnected("Provider disconnected"));
            let failed = self.inner.pending.fail_all(&error);
            log::info!("provider disconnected, failed {} in-flight requests", failed);
        }

        self.emit(event.event, &event.data);
    }

    fn emit(&self, event: ProviderEventKind, data: &Value) {
        let listeners: Vec<Listener> = self
            .inner
            .listeners
            .lock()
            .by_event
            .get(&event)
            .map(|registered| registered.iter().map(|(_, l)| Arc::clone(l)).collect())
            .unwrap_or_default();
        for listener in listeners {
            listener(data);
        }
    }
}

enum RequestState {
    Failed(Option<ProviderRpcError>),
    Waiting {
        receiver: oneshot::Receiver<RpcResponse>,
        timeout: Delay,
        awaiting: bool,
    },
    Done,
    Abandoned,
}

/// Future returned by [`Eip1193Provider::request`]. Dropping it cancels the call.
pub struct PendingRequest {
    id: String,
    pending: Arc<PendingCalls>,
    state: RequestState,
}

impl PendingRequest {
    fn failed(id: String, pending: Arc<PendingCalls>, error: ProviderRpcError) -> Self {
        Self {
            id,
            pending,
            state: RequestState::Failed(Some(error)),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }
}

impl Future for PendingRequest {
    type Output = Result<Value, ProviderRpcError>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        let outcome = match &mut this.state {
            RequestState::Failed(error) => Some(Err(error
                .take()
                .unwrap_or_else(|| ProviderRpcError::disconnected("Provider is disconnected")))),
            RequestState::Waiting {
                receiver,
                timeout,
                awaiting,
            } => {
                if !*awaiting {
                    this.pending.mark_awaiting(&this.id);
                    *awaiting = true;
                }
                match Pin::new(&mut *receiver).poll(cx) {
                    Poll::Ready(Ok(response)) => Some(response.into_result()),
                    Poll::Ready(Err(oneshot::Canceled)) => None,
                    Poll::Pending => match timeout.as_mut().poll(cx) {
                        Poll::Ready(()) if this.pending.expire(&this.id) => {
                            log::debug!("request {} timed out", this.id);
                            Some(Err(BridgeError::Timeout(format!(
                                "no response to request {}",
                                this.id
                            ))
                            .to_rpc_error()))
                        }
                        // Settled or cancelled between the two polls.
                        Poll::Ready(()) => match receiver.try_recv() {
                            Ok(Some(response)) => Some(response.into_result()),
                            _ => None,
                        },
                        Poll::Pending => return Poll::Pending,
                    },
                }
            }
            RequestState::Done | RequestState::Abandoned => return Poll::Pending,
        };

        match outcome {
            Some(result) => {
                this.state = RequestState::Done;
                Poll::Ready(result)
            }
            None => {
                this.state = RequestState::Abandoned;
                Poll::Pending
            }
        }
    }
}

impl Drop for PendingRequest {
    fn drop(&mut self) {
        if matches!(self.state, RequestState::Waiting { .. }) {
            self.pending.cancel(&self.id);
        }
    }
}
