//! Privileged-context service: validates inbound envelopes and runs them through the
//! dispatcher with one FIFO worker per session.
//!
//! A worker announces `connect` when it starts, stops after sitting idle, and bounds every
//! dispatch by the request timeout so a stuck backend cannot wedge its session.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use futures::{Stream, StreamExt};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::mpsc;

use crate::config::DEFAULT_REQUEST_TIMEOUT_MS;
use crate::dispatcher::{DispatchOutcome, RpcDispatcher};
use crate::errors::{BridgeError, BridgeResult};
use crate::protocol::{
    EventNotification, MessageEnvelope, Payload, ProviderEventKind, RpcRequest, RpcResponse,
};
use crate::relay::{MessengerRelay, Transport};

/// Origin used for envelopes that arrive without one.
pub const ANONYMOUS_SESSION: &str = "unknown-origin";

const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(15 * 60);

/// Wallet-side instructions carried as passthrough envelopes from the extension UI.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum BackgroundCommand {
    Lock,
    Revoke { origin: String },
    TabClosed { origin: String },
}

#[derive(Debug)]
enum Job {
    Request { id: String, request: RpcRequest },
    Revoke,
}

#[derive(Debug, Clone, Copy)]
struct WorkerLimits {
    request_timeout: Duration,
    idle_timeout: Duration,
}

type Sessions = Arc<Mutex<HashMap<String, mpsc::UnboundedSender<Job>>>>;

pub struct BackgroundService<T> {
    dispatcher: Arc<RpcDispatcher>,
    relay: Arc<MessengerRelay<T>>,
    sessions: Sessions,
    limits: WorkerLimits,
}

impl<T: Transport + 'static> BackgroundService<T> {
    pub fn new(dispatcher: Arc<RpcDispatcher>, transport: T) -> Self {
        Self {
            dispatcher,
            relay: Arc::new(MessengerRelay::new(transport)),
            sessions: Arc::new(Mutex::new(HashMap::new())),
            limits: WorkerLimits {
                request_timeout: Duration::from_millis(DEFAULT_REQUEST_TIMEOUT_MS),
                idle_timeout: DEFAULT_IDLE_TIMEOUT,
            },
        }
    }

    /// Upper bound on a single dispatch. Expiry answers the page with code 4900.
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.limits.request_timeout = timeout;
        self
    }

    /// How long a session worker may sit without work before it is reaped.
    pub fn with_idle_timeout(mut self, timeout: Duration) -> Self {
        self.limits.idle_timeout = timeout;
        self
    }

    pub fn dispatcher(&self) -> &RpcDispatcher {
        &self.dispatcher
    }

    /// Consume raw inbound messages until the stream ends.
    pub async fn run<S>(&self, mut inbound: S)
    where
        S: Stream<Item = Value> + Unpin,
    {
        while let Some(raw) = inbound.next().await {
            self.handle_value(raw);
        }
        log::info!("inbound stream closed, {} sessions open", self.session_count());
    }

    /// Validate a raw message. Malformed requests that still carry an id get an error reply.
    pub fn handle_value(&self, raw: Value) {
        match MessageEnvelope::from_value(raw.clone()) {
            Ok(envelope) => self.handle_envelope(envelope),
            Err(e) => {
                log::warn!("rejecting malformed envelope: {}", e);
                if let Some(id) = raw.get("id").and_then(Value::as_str) {
                    let origin = raw.get("origin").and_then(Value::as_str).map(str::to_owned);
                    self.respond(RpcResponse::error(id, e.to_rpc_error()), origin);
                }
            }
        }
    }

    pub fn handle_envelope(&self, envelope: MessageEnvelope) {
        match envelope.payload {
            Payload::Request(request) => {
                let origin = envelope
                    .origin
                    .unwrap_or_else(|| ANONYMOUS_SESSION.to_string());
                self.enqueue(origin, Job::Request {
                    id: envelope.id,
                    request,
                });
            }
            Payload::Passthrough(data) => {
                match serde_json::from_value::<BackgroundCommand>(data) {
                    Ok(command) => self.handle_command(command),
                    Err(_) => log::debug!(
                        "passthrough envelope {} is not a command, ignoring",
                        envelope.id
                    ),
                }
            }
            Payload::Response(_) | Payload::Event(_) => {
                log::warn!("ignoring page-bound envelope {} in the background", envelope.id)
            }
        }
    }

    pub fn handle_command(&self, command: BackgroundCommand) {
        log::debug!("background command {:?}", command);
        match command {
            BackgroundCommand::Lock => {
                let event = self.dispatcher.lock_wallet();
                if let Err(e) = self.broadcast_event(event) {
                    log::warn!("failed to announce wallet lock: {}", e);
                }
            }
            BackgroundCommand::Revoke { origin } => self.enqueue(origin, Job::Revoke),
            BackgroundCommand::TabClosed { origin } => {
                self.close_session(&origin);
            }
        }
    }

    fn enqueue(&self, origin: String, job: Job) {
        let mut sessions = self.sessions.lock();
        let job = match sessions.get(&origin) {
            Some(worker) => match worker.send(job) {
                Ok(()) => return,
                Err(mpsc::error::SendError(job)) => job,
            },
            None => job,
        };

        let worker = self.spawn_worker(origin.clone());
        if worker.send(job).is_err() {
            log::error!("session worker for {} exited immediately", origin);
            return;
        }
        sessions.insert(origin, worker);
    }

    fn spawn_worker(&self, origin: String) -> mpsc::UnboundedSender<Job> {
        let (sender, mut receiver) = mpsc::unbounded_channel::<Job>();
        let dispatcher = Arc::clone(&self.dispatcher);
        let relay = Arc::clone(&self.relay);
        let sessions = Arc::clone(&self.sessions);
        let limits = self.limits;
        let registered = sender.downgrade();
        log::debug!("starting session worker for {}", origin);

        tokio::spawn(async move {
            publish_event(&relay, &origin, dispatcher.connect_event());
            loop {
                let next = match tokio::time::timeout(limits.idle_timeout, receiver.recv()).await {
                    Ok(job) => job,
                    Err(_) => reap_if_idle(&sessions, &origin, &registered, &mut receiver),
                };
                let Some(job) = next else {
                    break;
                };
                match job {
                    Job::Request { id, request } => {
                        run_request(&dispatcher, &relay, &origin, limits, id, request).await
                    }
                    Job::Revoke => match dispatcher.revoke_permissions(&origin).await {
                        Ok(event) => publish_event(&relay, &origin, event),
                        Err(e) => log::warn!("failed to revoke {}: {}", origin, e),
                    },
                }
            }
            log::debug!("session worker for {} stopped", origin);
        });

        sender
    }

    fn respond(&self, response: RpcResponse, origin: Option<String>) {
        if let Err(e) = self
            .relay
            .send_response_to_active_tabs_from_popup_to_content_script(response, origin)
        {
            log::warn!("failed to publish response: {}", e);
        }
    }

    /// Push a wallet-initiated event to every page.
    pub fn broadcast_event(&self, event: EventNotification) -> BridgeResult<()> {
        self.relay
            .send_event_callback_from_popup_to_content_script(event, None)
    }

    /// Stop the worker for `origin` once its queued requests drain.
    pub fn close_session(&self, origin: &str) -> bool {
        self.sessions.lock().remove(origin).is_some()
    }

    pub fn session_count(&self) -> usize {
        self.sessions.lock().len()
    }
}

/// Called when a worker's idle timer fires. Holding the session lock while checking the queue
/// keeps `enqueue` from slipping a job in between the check and the removal.
fn reap_if_idle(
    sessions: &Sessions,
    origin: &str,
    registered: &mpsc::WeakUnboundedSender<Job>,
    receiver: &mut mpsc::UnboundedReceiver<Job>,
) -> Option<Job> {
    let mut sessions = sessions.lock();
    if let Ok(job) = receiver.try_recv() {
        return Some(job);
    }
    if let Some(current) = registered.upgrade() {
        if sessions
            .get(origin)
            .is_some_and(|worker| worker.same_channel(&current))
        {
            sessions.remove(origin);
        }
    }
    log::debug!("session {} idle, reaping worker", origin);
    None
}

async fn run_request<T: Transport>(
    dispatcher: &RpcDispatcher,
    relay: &MessengerRelay<T>,
    origin: &str,
    limits: WorkerLimits,
    id: String,
    request: RpcRequest,
) {
    let outcome = match tokio::time::timeout(
        limits.request_timeout,
        dispatcher.dispatch(origin, &request),
    )
    .await
    {
        Ok(outcome) => outcome,
        Err(_) => {
            log::warn!("{} from {} timed out", request.method, origin);
            DispatchOutcome {
                result: Err(BridgeError::Timeout(format!(
                    "{} did not finish within {} ms",
                    request.method,
                    limits.request_timeout.as_millis()
                ))),
                events: Vec::new(),
            }
        }
    };

    // Events first, so listeners see the new state before the caller's promise settles.
    for event in outcome.events {
        publish_event(relay, origin, event);
    }
    let response = RpcResponse::from_result(id, outcome.result);
    if let Err(e) = relay
        .send_response_to_active_tabs_from_popup_to_content_script(response, Some(origin.to_string()))
    {
        log::warn!("failed to publish response for {}: {}", origin, e);
    }
}

/// Chain changes reach every page; connection and account events only the session's own.
fn publish_event<T: Transport>(relay: &MessengerRelay<T>, origin: &str, event: EventNotification) {
    let scope = (event.event != ProviderEventKind::ChainChanged).then(|| origin.to_string());
    if let Err(e) = relay.send_event_callback_from_popup_to_content_script(event, scope) {
        log::warn!("failed to publish event for {}: {}", origin, e);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::{AdapterSet, BitcoinNetwork, InMemoryLightning, InMemorySpark};
    use crate::dispatcher::{ApprovalPrompt, ApprovalRequest, StaticApproval};
    use crate::errors::codes;
    use crate::network::NetworkRegistry;
    use crate::relay::{channel_transport, ChannelTransport, Route};
    use crate::session::SessionManager;
    use crate::storage::MemoryStore;
    use async_trait::async_trait;
    use futures::channel::mpsc::UnboundedReceiver;
    use serde_json::json;
    use zeroize::Zeroizing;

    type Outbox = UnboundedReceiver<(Route, MessageEnvelope)>;

    struct NeverAnswers;

    #[async_trait]
    impl ApprovalPrompt for NeverAnswers {
        async fn approve(&self, _request: &ApprovalRequest) -> bool {
            futures::future::pending().await
        }
    }

    fn dispatcher_with(
        session: SessionManager,
        approvals: Arc<dyn ApprovalPrompt>,
    ) -> RpcDispatcher {
        RpcDispatcher::new(
            AdapterSet::new(
                InMemoryLightning::new(BitcoinNetwork::Regtest, 0),
                InMemorySpark::new(BitcoinNetwork::Regtest, 0),
            ),
            Arc::new(session),
            approvals,
            Arc::new(MemoryStore::new()),
            Arc::new(NetworkRegistry::with_defaults()),
        )
    }

    fn service() -> (BackgroundService<ChannelTransport>, Outbox) {
        let dispatcher =
            dispatcher_with(SessionManager::with_defaults(), Arc::new(StaticApproval::allow()));
        let (transport, outbox) = channel_transport();
        (BackgroundService::new(Arc::new(dispatcher), transport), outbox)
    }

    fn request(id: &str, origin: &str, method: &str, params: Vec<Value>) -> MessageEnvelope {
        MessageEnvelope::request(id, Some(origin.into()), RpcRequest::new(method, params))
    }

    async fn next_response(outbox: &mut Outbox) -> RpcResponse {
        loop {
            let (route, envelope) = outbox.next().await.unwrap();
            if let Payload::Response(response) = envelope.payload {
                assert_eq!(route, Route::PopupToActiveTabs);
                return response;
            }
        }
    }

    async fn next_event(outbox: &mut Outbox) -> (Option<String>, EventNotification) {
        loop {
            let (route, envelope) = outbox.next().await.unwrap();
            if let Payload::Event(event) = envelope.payload {
                assert_eq!(route, Route::PopupEventToContentScript);
                return (envelope.origin, event);
            }
        }
    }

    #[tokio::test]
    async fn requests_from_one_session_are_answered_in_order() {
        let (service, mut outbox) = service();
        let origin = "https://dapp.example";
        service.handle_envelope(request(
            "1",
            origin,
            "wallet_switchEthereumChain",
            vec![json!({ "chainId": "0xaa36a7" })],
        ));
        service.handle_envelope(request("2", origin, "eth_chainId", vec![]));
        service.handle_envelope(request("3", origin, "eth_mine", vec![]));

        let first = next_response(&mut outbox).await;
        let second = next_response(&mut outbox).await;
        let third = next_response(&mut outbox).await;
        assert_eq!(first.id, "1");
        assert_eq!(second.id, "2");
        assert_eq!(second.into_result().unwrap(), json!("0xaa36a7"));
        assert_eq!(third.into_result().unwrap_err().code, codes::UNSUPPORTED_METHOD);
        assert_eq!(service.session_count(), 1);
    }

    #[tokio::test]
    async fn new_sessions_hear_connect_first() {
        let (service, mut outbox) = service();
        service.handle_envelope(request("1", "https://dapp.example", "eth_accounts", vec![]));

        let (route, envelope) = outbox.next().await.unwrap();
        assert_eq!(route, Route::PopupEventToContentScript);
        assert_eq!(envelope.origin.as_deref(), Some("https://dapp.example"));
        match envelope.payload {
            Payload::Event(event) => {
                assert_eq!(event.event, ProviderEventKind::Connect);
                assert_eq!(event.data, json!({ "chainId": "0x1" }));
            }
            other => panic!("expected connect, got {:?}", other),
        }
        assert_eq!(next_response(&mut outbox).await.id, "1");
    }

    #[tokio::test]
    async fn chain_switch_publishes_an_event_before_the_response() {
        let (service, mut outbox) = service();
        service.handle_envelope(request(
            "9",
            "https://dapp.example",
            "wallet_switchEthereumChain",
            vec![json!({ "chainId": "0x13fb" })],
        ));

        let (_, connect) = next_event(&mut outbox).await;
        assert_eq!(connect.event, ProviderEventKind::Connect);

        let (route, envelope) = outbox.next().await.unwrap();
        assert_eq!(route, Route::PopupEventToContentScript);
        assert_eq!(envelope.origin, None);
        match envelope.payload {
            Payload::Event(event) => {
                assert_eq!(event.event, ProviderEventKind::ChainChanged);
                assert_eq!(event.data, json!("0x13fb"));
            }
            other => panic!("expected event, got {:?}", other),
        }
        assert_eq!(next_response(&mut outbox).await.id, "9");
    }

    #[tokio::test]
    async fn malformed_requests_with_an_id_get_an_error() {
        let (service, mut outbox) = service();
        service.handle_value(json!({
            "id": "bad",
            "direction": "to_background",
            "payload": { "kind": "request", "data": { "method": 42 } }
        }));
        let response = next_response(&mut outbox).await;
        assert_eq!(response.id, "bad");
        assert_eq!(response.into_result().unwrap_err().code, codes::INVALID_PARAMS);

        service.handle_value(json!({
            "id": "wrong-way",
            "direction": "to_page",
            "payload": { "kind": "request", "data": { "method": "eth_accounts" } }
        }));
        let response = next_response(&mut outbox).await;
        assert_eq!(response.id, "wrong-way");
        assert_eq!(response.into_result().unwrap_err().code, codes::INVALID_PARAMS);

        service.handle_value(json!({ "payload": "nothing" }));
        assert_eq!(service.session_count(), 0);
    }

    #[tokio::test]
    async fn sessions_get_their_own_workers() {
        let (service, mut outbox) = service();
        service.handle_envelope(request("a", "https://one.example", "eth_chainId", vec![]));
        service.handle_envelope(request("b", "https://two.example", "eth_chainId", vec![]));
        let mut ids = vec![
            next_response(&mut outbox).await.id,
            next_response(&mut outbox).await.id,
        ];
        ids.sort();
        assert_eq!(ids, vec!["a", "b"]);
        assert_eq!(service.session_count(), 2);

        service.handle_envelope(MessageEnvelope::passthrough(
            crate::protocol::Direction::ToBackground,
            json!({ "action": "tab_closed", "origin": "https://one.example" }),
        ));
        assert_eq!(service.session_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn idle_sessions_are_reaped() {
        let (service, mut outbox) = service();
        let service = service.with_idle_timeout(Duration::from_secs(60));
        let origin = "https://dapp.example";

        service.handle_envelope(request("1", origin, "eth_chainId", vec![]));
        assert_eq!(next_response(&mut outbox).await.id, "1");
        assert_eq!(service.session_count(), 1);

        tokio::time::sleep(Duration::from_secs(61)).await;
        for _ in 0..10 {
            if service.session_count() == 0 {
                break;
            }
            tokio::task::yield_now().await;
        }
        assert_eq!(service.session_count(), 0);

        // The next request starts a fresh worker.
        service.handle_envelope(request("2", origin, "eth_chainId", vec![]));
        let (_, connect) = next_event(&mut outbox).await;
        assert_eq!(connect.event, ProviderEventKind::Connect);
        assert_eq!(next_response(&mut outbox).await.id, "2");
        assert_eq!(service.session_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn stuck_dispatch_times_out_and_frees_the_session() {
        let session = SessionManager::with_defaults();
        session.unlock(&Zeroizing::new([5u8; 32]));
        let (transport, mut outbox) = channel_transport();
        let service = BackgroundService::new(
            Arc::new(dispatcher_with(session, Arc::new(NeverAnswers))),
            transport,
        )
        .with_request_timeout(Duration::from_secs(5));
        let origin = "https://dapp.example";

        service.handle_envelope(request("1", origin, "eth_requestAccounts", vec![]));
        service.handle_envelope(request("2", origin, "eth_chainId", vec![]));

        let stuck = next_response(&mut outbox).await;
        assert_eq!(stuck.id, "1");
        let error = stuck.into_result().unwrap_err();
        assert_eq!(error.code, codes::DISCONNECTED);
        assert_eq!(error.data.unwrap()["kind"], "timeout");

        let next = next_response(&mut outbox).await;
        assert_eq!(next.id, "2");
        assert!(next.into_result().is_ok());
    }

    #[tokio::test]
    async fn lock_command_tells_every_page() {
        let session = SessionManager::with_defaults();
        session.unlock(&Zeroizing::new([5u8; 32]));
        let (transport, mut outbox) = channel_transport();
        let service = BackgroundService::new(
            Arc::new(dispatcher_with(session.clone(), Arc::new(StaticApproval::allow()))),
            transport,
        );

        service.handle_command(BackgroundCommand::Lock);
        assert!(session.is_locked());
        let (scope, event) = next_event(&mut outbox).await;
        assert_eq!(scope, None);
        assert_eq!(event.event, ProviderEventKind::AccountsChanged);
        assert_eq!(event.data, json!([]));
    }

    #[tokio::test]
    async fn revoke_command_clears_the_origin() {
        let session = SessionManager::with_defaults();
        session.unlock(&Zeroizing::new([5u8; 32]));
        let (transport, mut outbox) = channel_transport();
        let service = BackgroundService::new(
            Arc::new(dispatcher_with(session, Arc::new(StaticApproval::allow()))),
            transport,
        );
        let origin = "https://dapp.example";

        service.handle_envelope(request("1", origin, "eth_requestAccounts", vec![]));
        assert!(next_response(&mut outbox).await.into_result().is_ok());

        service.handle_command(BackgroundCommand::Revoke {
            origin: origin.to_string(),
        });
        service.handle_envelope(request("2", origin, "eth_accounts", vec![]));

        let (scope, event) = next_event(&mut outbox).await;
        assert_eq!(scope.as_deref(), Some(origin));
        assert_eq!(event.event, ProviderEventKind::AccountsChanged);
        assert_eq!(event.data, json!([]));
        assert_eq!(next_response(&mut outbox).await.into_result().unwrap(), json!([]));
        assert!(service.dispatcher().permissions(origin).await.unwrap().is_empty());
    }
}
