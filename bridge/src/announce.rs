//! EIP-6963 provider announcement.
//!
//! The page context announces a [`ProviderDetail`] on load and again whenever a dApp
//! dispatches `eip6963:requestProvider`. Announcing is fire-and-forget; there is no timer.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::errors::{BridgeError, BridgeResult};

pub const ANNOUNCE_PROVIDER_EVENT: &str = "eip6963:announceProvider";
pub const REQUEST_PROVIDER_EVENT: &str = "eip6963:requestProvider";

const DEFAULT_ICON: &str = "data:image/svg+xml;base64,PHN2ZyB4bWxucz0iaHR0cDovL3d3dy53My5vcmcvMjAwMC9zdmciIHZpZXdCb3g9IjAgMCAzMiAzMiI+PGNpcmNsZSBjeD0iMTYiIGN5PSIxNiIgcj0iMTYiIGZpbGw9IiNmNzkzMWEiLz48cGF0aCBkPSJNMTggNCA5IDE4aDZsLTIgMTAgOS0xNGgtNnoiIGZpbGw9IiNmZmYiLz48L3N2Zz4=";

/// Immutable identity of a provider. `rdns` is the key dApps deduplicate on.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderInfo {
    pub uuid: String,
    pub name: String,
    pub icon: String,
    pub rdns: String,
}

impl ProviderInfo {
    pub fn new(name: impl Into<String>, icon: impl Into<String>, rdns: impl Into<String>) -> Self {
        Self {
            uuid: Uuid::new_v4().to_string(),
            name: name.into(),
            icon: icon.into(),
            rdns: rdns.into(),
        }
    }

    pub fn validate(&self) -> BridgeResult<()> {
        let uuid = Uuid::parse_str(&self.uuid).map_err(|e| {
            BridgeError::ValidationError(format!("provider uuid is not a UUID: {}", e))
        })?;
        if uuid.get_version_num() != 4 {
            return Err(BridgeError::ValidationError(
                "provider uuid must be a version 4 UUID".to_string(),
            ));
        }

        if self.name.trim().is_empty() {
            return Err(BridgeError::ValidationError(
                "provider name cannot be empty".to_string(),
            ));
        }

        if !self.icon.starts_with("data:image/") {
            return Err(BridgeError::ValidationError(
                "provider icon must be a data URI".to_string(),
            ));
        }

        let labels: Vec<&str> = self.rdns.split('.').collect();
        let valid_label = |label: &&str| {
            !label.is_empty()
                && label
                    .chars()
                    .all(|c| c.is_ascii_alphanumeric() || c == '-')
        };
        if labels.len() < 2 || !labels.iter().all(valid_label) {
            return Err(BridgeError::ValidationError(format!(
                "provider rdns '{}' is not a reverse-DNS name",
                self.rdns
            )));
        }

        Ok(())
    }
}

impl Default for ProviderInfo {
    fn default() -> Self {
        Self::new("Silica Wallet", DEFAULT_ICON, "org.silicaprotocol.wallet")
    }
}

/// Identity paired with the callable provider, created once and never mutated.
#[derive(Debug, Clone)]
pub struct ProviderDetail<P> {
    info: ProviderInfo,
    provider: P,
}

impl<P> ProviderDetail<P> {
    pub fn new(info: ProviderInfo, provider: P) -> BridgeResult<Self> {
        info.validate()?;
        Ok(Self { info, provider })
    }

    pub fn info(&self) -> &ProviderInfo {
        &self.info
    }

    pub fn provider(&self) -> &P {
        &self.provider
    }
}

/// Page-level event surface the announcement is dispatched on.
pub trait EventTarget<P> {
    fn dispatch_announce(&self, detail: &ProviderDetail<P>) -> BridgeResult<()>;
}

pub struct AnnouncementService<P, T> {
    detail: ProviderDetail<P>,
    target: T,
    announcements: AtomicU64,
}

impl<P, T: EventTarget<P>> AnnouncementService<P, T> {
    pub fn new(detail: ProviderDetail<P>, target: T) -> Self {
        Self {
            detail,
            target,
            announcements: AtomicU64::new(0),
        }
    }

    pub fn announce(&self) -> BridgeResult<()> {
        self.target.dispatch_announce(&self.detail)?;
        let count = self.announcements.fetch_add(1, Ordering::Relaxed) + 1;
        log::debug!(
            "announced provider {} ({}) #{}",
            self.detail.info.name,
            self.detail.info.rdns,
            count
        );
        Ok(())
    }

    /// Reply to `eip6963:requestProvider` by announcing the same detail again.
    pub fn handle_request_provider(&self) -> BridgeResult<()> {
        self.announce()
    }

    pub fn detail(&self) -> &ProviderDetail<P> {
        &self.detail
    }

    pub fn target(&self) -> &T {
        &self.target
    }

    pub fn announcement_count(&self) -> u64 {
        self.announcements.load(Ordering::Relaxed)
    }
}

/// dApp-side view of announced providers, keyed by `rdns`.
#[derive(Debug, Clone)]
pub struct ProviderRegistry<P> {
    providers: BTreeMap<String, ProviderDetail<P>>,
}

impl<P> Default for ProviderRegistry<P> {
    fn default() -> Self {
        Self {
            providers: BTreeMap::new(),
        }
    }
}

impl<P: Clone> ProviderRegistry<P> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns true when the announcement introduced a new `rdns`.
    pub fn record(&mut self, detail: &ProviderDetail<P>) -> bool {
        if self.providers.contains_key(&detail.info.rdns) {
            return false;
        }
        self.providers
            .insert(detail.info.rdns.clone(), detail.clone());
        true
    }

    pub fn get(&self, rdns: &str) -> Option<&ProviderDetail<P>> {
        self.providers.get(rdns)
    }

    pub fn rdns(&self) -> impl Iterator<Item = &str> {
        self.providers.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.providers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.providers.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::sync::Arc;

    #[derive(Clone, Default)]
    struct PageWindow {
        registry: Arc<Mutex<ProviderRegistry<&'static str>>>,
        dispatched: Arc<AtomicU64>,
    }

    impl EventTarget<&'static str> for PageWindow {
        fn dispatch_announce(&self, detail: &ProviderDetail<&'static str>) -> BridgeResult<()> {
            self.dispatched.fetch_add(1, Ordering::Relaxed);
            self.registry.lock().record(detail);
            Ok(())
        }
    }

    #[test]
    fn repeated_announcements_are_idempotent() {
        let window = PageWindow::default();
        let detail = ProviderDetail::new(ProviderInfo::default(), "provider").unwrap();
        let service = AnnouncementService::new(detail, window.clone());

        service.announce().unwrap();
        let after_first: Vec<String> = window
            .registry
            .lock()
            .rdns()
            .map(str::to_owned)
            .collect();

        service.handle_request_provider().unwrap();
        let after_second: Vec<String> = window
            .registry
            .lock()
            .rdns()
            .map(str::to_owned)
            .collect();

        assert_eq!(after_first, after_second);
        assert_eq!(window.registry.lock().len(), 1);
        assert_eq!(window.dispatched.load(Ordering::Relaxed), 2);
        assert_eq!(service.announcement_count(), 2);
    }

    #[test]
    fn distinct_wallets_are_both_kept() {
        let mut registry = ProviderRegistry::new();
        let ours = ProviderDetail::new(ProviderInfo::default(), 1).unwrap();
        let other = ProviderDetail::new(
            ProviderInfo::new("Other", DEFAULT_ICON, "com.example.other"),
            2,
        )
        .unwrap();

        assert!(registry.record(&ours));
        assert!(registry.record(&other));
        assert!(!registry.record(&ours));
        assert_eq!(registry.len(), 2);
        assert_eq!(*registry.get("com.example.other").unwrap().provider(), 2);
    }

    #[test]
    fn invalid_identities_are_refused() {
        let mut info = ProviderInfo::default();
        info.rdns = "wallet".into();
        assert!(info.validate().is_err());

        let mut info = ProviderInfo::default();
        info.icon = "https://example.com/icon.png".into();
        assert!(info.validate().is_err());

        let mut info = ProviderInfo::default();
        info.uuid = "00000000-0000-1000-8000-000000000000".into();
        assert!(info.validate().is_err());

        assert!(ProviderInfo::default().validate().is_ok());
    }
}
