//! Messenger relay between the page, content-script and background contexts.
//!
//! Every send is a one-way publish. Request/response pairing happens in [`PendingCalls`]:
//! a caller registers a one-shot listener keyed by the envelope id before publishing, and an
//! inbound response with the same id settles it exactly once.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use futures::channel::{mpsc, oneshot};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::errors::{BridgeError, BridgeResult, ProviderRpcError};
use crate::protocol::{
    new_call_id, Direction, EventNotification, MessageEnvelope, Payload, RpcOutcome, RpcResponse,
};

const TERMINAL_HISTORY: usize = 1024;

/// The hop an envelope is published on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Route {
    PopupToActiveTabs,
    PopupEventToContentScript,
    ContentScriptToContentScript,
    ToBackground,
}

/// One-way channel into another context. Delivery is not guaranteed.
pub trait Transport: Send + Sync {
    fn publish(&self, route: Route, envelope: MessageEnvelope) -> BridgeResult<()>;
}

impl<T: Transport + ?Sized> Transport for Arc<T> {
    fn publish(&self, route: Route, envelope: MessageEnvelope) -> BridgeResult<()> {
        (**self).publish(route, envelope)
    }
}

/// In-process transport backed by an unbounded channel.
#[derive(Debug, Clone)]
pub struct ChannelTransport {
    sender: mpsc::UnboundedSender<(Route, MessageEnvelope)>,
}

pub fn channel_transport() -> (ChannelTransport, mpsc::UnboundedReceiver<(Route, MessageEnvelope)>) {
    let (sender, receiver) = mpsc::unbounded();
    (ChannelTransport { sender }, receiver)
}

impl Transport for ChannelTransport {
    fn publish(&self, route: Route, envelope: MessageEnvelope) -> BridgeResult<()> {
        self.sender
            .unbounded_send((route, envelope))
            .map_err(|_| BridgeError::TransportClosed)
    }
}

#[derive(Debug, Clone)]
pub struct MessengerRelay<T> {
    transport: T,
}

impl<T: Transport> MessengerRelay<T> {
    pub fn new(transport: T) -> Self {
        Self { transport }
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn send_response_to_active_tabs_from_popup_to_content_script(
        &self,
        response: RpcResponse,
        origin: Option<String>,
    ) -> BridgeResult<()> {
        self.transport.publish(
            Route::PopupToActiveTabs,
            MessageEnvelope::response(response, origin),
        )
    }

    pub fn send_event_callback_from_popup_to_content_script(
        &self,
        event: EventNotification,
        origin: Option<String>,
    ) -> BridgeResult<()> {
        self.transport.publish(
            Route::PopupEventToContentScript,
            MessageEnvelope::event(event, origin),
        )
    }

    /// Forward a page-bound envelope (response or event) unchanged.
    pub fn send_response_from_content_script_to_content_script(
        &self,
        envelope: MessageEnvelope,
    ) -> BridgeResult<()> {
        if envelope.direction != Direction::ToPage {
            return Err(BridgeError::MalformedEnvelope(format!(
                "envelope {} is not page-bound",
                envelope.id
            )));
        }
        self.transport
            .publish(Route::ContentScriptToContentScript, envelope)
    }

    pub fn send_generic_message_to_background(&self, envelope: MessageEnvelope) -> BridgeResult<()> {
        if envelope.direction != Direction::ToBackground {
            return Err(BridgeError::MalformedEnvelope(format!(
                "envelope {} is not background-bound",
                envelope.id
            )));
        }
        if matches!(envelope.payload, Payload::Response(_) | Payload::Event(_)) {
            return Err(BridgeError::MalformedEnvelope(format!(
                "envelope {} carries a page-bound payload",
                envelope.id
            )));
        }
        self.transport.publish(Route::ToBackground, envelope)
    }
}

/// Lifecycle of one outstanding call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallState {
    Created,
    Sent,
    AwaitingResponse,
    Resolved,
    Rejected,
    Cancelled,
    Orphaned,
}

impl CallState {
    pub fn is_terminal(&self) -> bool {
        !matches!(
            self,
            CallState::Created | CallState::Sent | CallState::AwaitingResponse
        )
    }
}

/// Result of offering an inbound response to the pending table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolution {
    Delivered(CallState),
    Orphaned,
}

#[derive(Debug)]
struct PendingEntry {
    state: CallState,
    listener: oneshot::Sender<RpcResponse>,
}

#[derive(Debug, Default)]
struct PendingInner {
    calls: HashMap<String, PendingEntry>,
    history: VecDeque<(String, CallState)>,
    orphaned: u64,
}

impl PendingInner {
    fn finish(&mut self, id: String, state: CallState) {
        if self.history.len() == TERMINAL_HISTORY {
            self.history.pop_front();
        }
        self.history.push_back((id, state));
    }
}

/// Id-keyed registry of one-shot response listeners.
#[derive(Debug, Default)]
pub struct PendingCalls {
    inner: Mutex<PendingInner>,
}

impl PendingCalls {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a listener under a fresh id unique among in-flight calls.
    pub fn register(&self) -> (String, oneshot::Receiver<RpcResponse>) {
        let mut inner = self.inner.lock();
        let mut id = new_call_id();
        while inner.calls.contains_key(&id) {
            id = new_call_id();
        }
        let (listener, receiver) = oneshot::channel();
        inner.calls.insert(
            id.clone(),
            PendingEntry {
                state: CallState::Created,
                listener,
            },
        );
        (id, receiver)
    }

    fn transition(&self, id: &str, from: CallState, to: CallState) {
        if let Some(entry) = self.inner.lock().calls.get_mut(id) {
            if entry.state == from {
                entry.state = to;
            }
        }
    }

    pub fn mark_sent(&self, id: &str) {
        self.transition(id, CallState::Created, CallState::Sent);
    }

    pub fn mark_awaiting(&self, id: &str) {
        self.transition(id, CallState::Sent, CallState::AwaitingResponse);
    }

    /// Settle the matching call. Unknown or late ids are orphaned, never an error.
    pub fn resolve(&self, response: RpcResponse) -> Resolution {
        let mut inner = self.inner.lock();
        let Some(entry) = inner.calls.remove(&response.id) else {
            inner.orphaned += 1;
            log::debug!("dropping response for unknown call {}", response.id);
            return Resolution::Orphaned;
        };

        let state = match response.outcome {
            RpcOutcome::Result(_) => CallState::Resolved,
            RpcOutcome::Error(_) => CallState::Rejected,
        };
        let id = response.id.clone();
        if entry.listener.send(response).is_err() {
            inner.orphaned += 1;
            inner.finish(id, CallState::Orphaned);
            return Resolution::Orphaned;
        }
        inner.finish(id, state);
        Resolution::Delivered(state)
    }

    /// Abandon a call. Its listener is dropped and any later response is orphaned.
    pub fn cancel(&self, id: &str) -> bool {
        let mut inner = self.inner.lock();
        match inner.calls.remove(id) {
            Some(_) => {
                inner.finish(id.to_string(), CallState::Cancelled);
                true
            }
            None => false,
        }
    }

    /// Reject a call locally (e.g. on timeout) without waiting for the other side.
    pub fn expire(&self, id: &str) -> bool {
        let mut inner = self.inner.lock();
        match inner.calls.remove(id) {
            Some(_) => {
                inner.finish(id.to_string(), CallState::Rejected);
                true
            }
            None => false,
        }
    }

    /// Settle every in-flight call with `error`.
    pub fn fail_all(&self, error: &ProviderRpcError) -> usize {
        let mut inner = self.inner.lock();
        let drained: Vec<(String, PendingEntry)> = inner.calls.drain().collect();
        let count = drained.len();
        for (id, entry) in drained {
            let _ = entry
                .listener
                .send(RpcResponse::error(id.clone(), error.clone()));
            inner.finish(id, CallState::Rejected);
        }
        count
    }

    pub fn state_of(&self, id: &str) -> Option<CallState> {
        let inner = self.inner.lock();
        if let Some(entry) = inner.calls.get(id) {
            return Some(entry.state);
        }
        inner
            .history
            .iter()
            .rev()
            .find(|(finished, _)| finished == id)
            .map(|(_, state)| *state)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.inner.lock().calls.contains_key(id)
    }

    pub fn in_flight(&self) -> usize {
        self.inner.lock().calls.len()
    }

    pub fn orphaned_count(&self) -> u64 {
        self.inner.lock().orphaned
    }
}
