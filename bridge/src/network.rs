use std::collections::BTreeMap;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::errors::{BridgeError, BridgeResult};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct NetworkInfo {
    pub chain_id: u64,
    pub ticker: String,
    pub decimals: u8,
    pub explorer_url: String,
    pub rpc_url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub know_more_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub is_testnet: Option<bool>,
}

impl NetworkInfo {
    pub fn is_testnet(&self) -> bool {
        self.is_testnet.unwrap_or(false)
    }

    pub fn chain_id_hex(&self) -> String {
        format_chain_id(self.chain_id)
    }
}

/// Static per-chain table, loaded once at startup and read-only afterwards.
#[derive(Debug, Clone)]
pub struct NetworkRegistry {
    networks: BTreeMap<u64, NetworkInfo>,
}

impl NetworkRegistry {
    pub fn new(networks: impl IntoIterator<Item = NetworkInfo>) -> BridgeResult<Self> {
        let mut table = BTreeMap::new();
        for network in networks {
            if network.rpc_url.trim().is_empty() {
                return Err(BridgeError::ValidationError(format!(
                    "network {} has no rpc url",
                    network.chain_id
                )));
            }
            if table.insert(network.chain_id, network).is_some() {
                return Err(BridgeError::ValidationError(
                    "duplicate chain id in network table".to_string(),
                ));
            }
        }
        if table.is_empty() {
            return Err(BridgeError::ValidationError(
                "network table must contain at least one chain".to_string(),
            ));
        }
        Ok(Self { networks: table })
    }

    pub fn with_defaults() -> Self {
        let networks = default_networks()
            .into_iter()
            .map(|network| (network.chain_id, network))
            .collect();
        Self { networks }
    }

    pub fn from_json(raw: &str) -> BridgeResult<Self> {
        let networks: Vec<NetworkInfo> = serde_json::from_str(raw)?;
        Self::new(networks)
    }

    pub fn load(path: impl AsRef<Path>) -> BridgeResult<Self> {
        let raw = std::fs::read_to_string(path)?;
        Self::from_json(&raw)
    }

    pub fn get(&self, chain_id: u64) -> Option<&NetworkInfo> {
        self.networks.get(&chain_id)
    }

    pub fn contains(&self, chain_id: u64) -> bool {
        self.networks.contains_key(&chain_id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &NetworkInfo> {
        self.networks.values()
    }
}

fn default_networks() -> Vec<NetworkInfo> {
    vec![
        NetworkInfo {
            chain_id: 1,
            ticker: "ETH".to_string(),
            decimals: 18,
            explorer_url: "https://etherscan.io".to_string(),
            rpc_url: "https://cloudflare-eth.com".to_string(),
            know_more_url: None,
            is_testnet: None,
        },
        NetworkInfo {
            chain_id: 5115,
            ticker: "cBTC".to_string(),
            decimals: 18,
            explorer_url: "https://explorer.testnet.citrea.xyz".to_string(),
            rpc_url: "https://rpc.testnet.citrea.xyz".to_string(),
            know_more_url: Some("https://citrea.xyz".to_string()),
            is_testnet: Some(true),
        },
        NetworkInfo {
            chain_id: 11_155_111,
            ticker: "SepoliaETH".to_string(),
            decimals: 18,
            explorer_url: "https://sepolia.etherscan.io".to_string(),
            rpc_url: "https://rpc.sepolia.org".to_string(),
            know_more_url: None,
            is_testnet: Some(true),
        },
    ]
}

/// Parse an EIP-695 style chain id (`"0x1"`) or a decimal string.
pub fn parse_chain_id(raw: &str) -> BridgeResult<u64> {
    let trimmed = raw.trim();
    let parsed = match trimmed.strip_prefix("0x") {
        Some(hex) => u64::from_str_radix(hex, 16),
        None => trimmed.parse(),
    };
    parsed.map_err(|_| BridgeError::InvalidParams(format!("invalid chain id '{}'", raw)))
}

pub fn format_chain_id(chain_id: u64) -> String {
    format!("0x{:x}", chain_id)
}
