//! Wallet Bridge WebAssembly Library
//!
//! Page-context bindings: the EIP-1193 provider object handed to dApps and the EIP-6963
//! announcement that lets them discover it. Envelopes travel to the content script through
//! `window.postMessage`.

use std::cell::{Cell, RefCell};
use std::rc::Rc;
use std::time::Duration;

use js_sys::{Function, Object, Promise, Reflect};
use serde::Serialize;
use serde_json::Value;
use wasm_bindgen::prelude::*;
use wasm_bindgen::JsCast;
use web_sys::{CustomEvent, CustomEventInit, MessageEvent};

use wallet_bridge_lib::announce::{
    AnnouncementService, EventTarget, ProviderDetail, ProviderInfo, ANNOUNCE_PROVIDER_EVENT,
    REQUEST_PROVIDER_EVENT,
};
use wallet_bridge_lib::config::DEFAULT_REQUEST_TIMEOUT_MS;
use wallet_bridge_lib::provider::ListenerId;
use wallet_bridge_lib::{
    BridgeError, BridgeResult, Eip1193Provider, MessageEnvelope, ProviderEventKind,
    ProviderRpcError, Route, RpcRequest, Transport,
};

/// Tag on every `postMessage` payload owned by the bridge.
pub const BRIDGE_CHANNEL: &str = "wallet-bridge";

fn to_js<T: Serialize + ?Sized>(value: &T) -> Result<JsValue, JsValue> {
    value
        .serialize(&serde_wasm_bindgen::Serializer::json_compatible())
        .map_err(JsValue::from)
}

fn rpc_error_to_js(error: &ProviderRpcError) -> JsValue {
    to_js(error).unwrap_or_else(|_| JsValue::from_str(&error.to_string()))
}

fn parse_request(args: JsValue) -> Result<RpcRequest, ProviderRpcError> {
    serde_wasm_bindgen::from_value(args).map_err(|e| {
        BridgeError::InvalidParams(format!("request arguments: {}", e)).to_rpc_error()
    })
}

/// Posts envelopes to the content script listening on the same window.
#[derive(Debug, Clone, Copy, Default)]
pub struct WindowTransport;

impl Transport for WindowTransport {
    fn publish(&self, route: Route, envelope: MessageEnvelope) -> BridgeResult<()> {
        let window = web_sys::window().ok_or(BridgeError::TransportClosed)?;
        let message = serde_json::json!({
            "channel": BRIDGE_CHANNEL,
            "route": route,
            "envelope": envelope,
        });
        let value = to_js(&message).map_err(|_| {
            BridgeError::Internal("envelope is not representable in JavaScript".to_string())
        })?;
        window
            .post_message(&value, &window.origin())
            .map_err(|_| BridgeError::TransportClosed)
    }
}

struct JsListener {
    key: u64,
    event: ProviderEventKind,
    id: ListenerId,
    callback: Function,
}

thread_local! {
    static JS_LISTENERS: RefCell<Vec<JsListener>> = RefCell::new(Vec::new());
    static NEXT_LISTENER_KEY: Cell<u64> = Cell::new(0);
}

fn call_js_listener(key: u64, data: &Value) {
    let callback = JS_LISTENERS.with(|listeners| {
        listeners
            .borrow()
            .iter()
            .find(|listener| listener.key == key)
            .map(|listener| listener.callback.clone())
    });
    if let (Some(callback), Ok(arg)) = (callback, to_js(data)) {
        if let Err(e) = callback.call1(&JsValue::NULL, &arg) {
            web_sys::console::error_2(&"wallet bridge listener threw".into(), &e);
        }
    }
}

/// EIP-1193 provider object exposed to page code.
#[wasm_bindgen]
#[derive(Clone)]
pub struct WalletProvider {
    inner: Eip1193Provider<WindowTransport>,
}

#[wasm_bindgen]
impl WalletProvider {
    /// `request({ method, params })`, settled by the background context.
    pub fn request(&self, args: JsValue) -> Promise {
        let request = match parse_request(args) {
            Ok(request) => request,
            Err(error) => return Promise::reject(&rpc_error_to_js(&error)),
        };
        let pending = self.inner.request(request);
        wasm_bindgen_futures::future_to_promise(async move {
            match pending.await {
                Ok(value) => to_js(&value),
                Err(error) => Err(rpc_error_to_js(&error)),
            }
        })
    }

    pub fn on(&self, event: &str, callback: Function) -> Result<(), JsValue> {
        let kind = ProviderEventKind::parse(event)
            .ok_or_else(|| JsError::new(&format!("unknown provider event '{}'", event)))?;
        let key = NEXT_LISTENER_KEY.with(|next| {
            let key = next.get() + 1;
            next.set(key);
            key
        });
        let id = self.inner.on(kind, move |data| call_js_listener(key, data));
        JS_LISTENERS.with(|listeners| {
            listeners.borrow_mut().push(JsListener {
                key,
                event: kind,
                id,
                callback,
            })
        });
        Ok(())
    }

    #[wasm_bindgen(js_name = removeListener)]
    pub fn remove_listener(&self, event: &str, callback: &Function) -> bool {
        let Some(kind) = ProviderEventKind::parse(event) else {
            return false;
        };
        let removed = JS_LISTENERS.with(|listeners| {
            let mut listeners = listeners.borrow_mut();
            let position = listeners.iter().position(|listener| {
                listener.event == kind && &listener.callback == callback
            })?;
            Some(listeners.remove(position))
        });
        match removed {
            Some(listener) => self.inner.remove_listener(kind, listener.id),
            None => false,
        }
    }

    #[wasm_bindgen(js_name = isConnected)]
    pub fn is_connected(&self) -> bool {
        self.inner.is_connected()
    }

    #[wasm_bindgen(getter, js_name = chainId)]
    pub fn chain_id(&self) -> Option<String> {
        self.inner.chain_id()
    }
}

/// Dispatches `eip6963:announceProvider` on the window.
struct WindowEventTarget;

impl EventTarget<JsValue> for WindowEventTarget {
    fn dispatch_announce(&self, detail: &ProviderDetail<JsValue>) -> BridgeResult<()> {
        let window = web_sys::window().ok_or(BridgeError::NotInitialized)?;
        let js_error = |_| BridgeError::Internal("failed to build announcement".to_string());

        let payload = Object::new();
        Reflect::set(&payload, &"info".into(), &to_js(detail.info()).map_err(js_error)?)
            .map_err(js_error)?;
        Reflect::set(&payload, &"provider".into(), detail.provider()).map_err(js_error)?;
        let frozen = Object::freeze(&payload);

        let init = CustomEventInit::new();
        init.set_detail(&frozen);
        let event = CustomEvent::new_with_event_init_dict(ANNOUNCE_PROVIDER_EVENT, &init)
            .map_err(js_error)?;
        window.dispatch_event(&event).map_err(js_error)?;
        Ok(())
    }
}

fn listen(window: &web_sys::Window, event: &str, handler: Closure<dyn FnMut(JsValue)>) -> Result<(), JsValue> {
    window.add_event_listener_with_callback(event, handler.as_ref().unchecked_ref())?;
    // Page-lifetime listener.
    handler.forget();
    Ok(())
}

/// Create the provider, wire it to the content script and announce it.
///
/// `info` overrides the default provider identity; `request_timeout_ms` bounds how long a
/// request waits for the background context before failing with code 4900.
#[wasm_bindgen(js_name = installProvider)]
pub fn install_provider(info: JsValue, request_timeout_ms: Option<u32>) -> Result<JsValue, JsValue> {
    let window = web_sys::window().ok_or_else(|| JsError::new("no window available"))?;
    let info: ProviderInfo = if info.is_undefined() || info.is_null() {
        ProviderInfo::default()
    } else {
        serde_wasm_bindgen::from_value(info)?
    };

    let timeout = request_timeout_ms
        .map(|ms| Duration::from_millis(ms as u64))
        .unwrap_or(Duration::from_millis(DEFAULT_REQUEST_TIMEOUT_MS));
    let provider = Eip1193Provider::new(WindowTransport, Some(window.origin()), timeout);

    let page = provider.clone();
    listen(
        &window,
        "message",
        Closure::new(move |event: JsValue| {
            let Some(event) = event.dyn_ref::<MessageEvent>() else {
                return;
            };
            let Ok(data) = serde_wasm_bindgen::from_value::<Value>(event.data()) else {
                return;
            };
            if data.get("channel").and_then(Value::as_str) != Some(BRIDGE_CHANNEL) {
                return;
            }
            match data.get("envelope") {
                Some(envelope)
                    if envelope.get("direction").and_then(Value::as_str) == Some("to_page") =>
                {
                    page.handle_inbound_value(envelope.clone())
                }
                _ => {}
            }
        }),
    )?;

    let handle: JsValue = WalletProvider {
        inner: provider.clone(),
    }
    .into();
    let detail = ProviderDetail::new(info, handle.clone())
        .map_err(|e| JsError::new(&e.to_string()))?;
    let announcer = Rc::new(AnnouncementService::new(detail, WindowEventTarget));
    announcer
        .announce()
        .map_err(|e| JsError::new(&e.to_string()))?;

    let responder = Rc::clone(&announcer);
    listen(
        &window,
        REQUEST_PROVIDER_EVENT,
        Closure::new(move |_event: JsValue| {
            if let Err(e) = responder.handle_request_provider() {
                web_sys::console::warn_1(&format!("re-announcement failed: {}", e).into());
            }
        }),
    )?;

    Ok(handle)
}

// Module initialization
#[wasm_bindgen(start)]
pub fn main() {
    #[cfg(feature = "console_error_panic_hook")]
    console_error_panic_hook::set_once();
    web_sys::console::log_1(&"Wallet bridge WASM module loaded".into());
}

#[cfg(all(test, target_arch = "wasm32"))]
mod tests {
    use super::*;
    use wasm_bindgen_test::*;

    #[wasm_bindgen_test]
    fn request_arguments_need_a_method() {
        let args = Object::new();
        Reflect::set(&args, &"params".into(), &js_sys::Array::new()).unwrap();
        let err = parse_request(args.into()).unwrap_err();
        assert_eq!(err.code, -32602);

        let args = Object::new();
        Reflect::set(&args, &"method".into(), &"eth_chainId".into()).unwrap();
        let request = parse_request(args.into()).unwrap();
        assert_eq!(request.method, "eth_chainId");
        assert!(request.params.is_empty());
    }

    #[wasm_bindgen_test]
    fn rpc_errors_become_plain_objects() {
        let error = ProviderRpcError::new(4001, "User rejected the request");
        let value = rpc_error_to_js(&error);
        let code = Reflect::get(&value, &"code".into()).unwrap();
        assert_eq!(code.as_f64(), Some(4001.0));
    }
}
