use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::errors::BridgeError;

/// Ethereum-style RPC methods the wallet serves.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EvmRpcMethod {
    #[serde(rename = "wallet_switchEthereumChain")]
    WalletSwitchEthereumChain,
    #[serde(rename = "personal_sign")]
    PersonalSign,
    #[serde(rename = "eth_signTypedData_v4")]
    EthSignTypedDataV4,
    #[serde(rename = "wallet_requestPermissions")]
    WalletRequestPermissions,
    #[serde(rename = "eth_sendTransaction")]
    EthSendTransaction,
    #[serde(rename = "eth_requestAccounts")]
    EthRequestAccounts,
    #[serde(rename = "eth_accounts")]
    EthAccounts,
    #[serde(rename = "eth_chainId")]
    EthChainId,
}

impl EvmRpcMethod {
    pub const ALL: [EvmRpcMethod; 8] = [
        EvmRpcMethod::WalletSwitchEthereumChain,
        EvmRpcMethod::PersonalSign,
        EvmRpcMethod::EthSignTypedDataV4,
        EvmRpcMethod::WalletRequestPermissions,
        EvmRpcMethod::EthSendTransaction,
        EvmRpcMethod::EthRequestAccounts,
        EvmRpcMethod::EthAccounts,
        EvmRpcMethod::EthChainId,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            EvmRpcMethod::WalletSwitchEthereumChain => "wallet_switchEthereumChain",
            EvmRpcMethod::PersonalSign => "personal_sign",
            EvmRpcMethod::EthSignTypedDataV4 => "eth_signTypedData_v4",
            EvmRpcMethod::WalletRequestPermissions => "wallet_requestPermissions",
            EvmRpcMethod::EthSendTransaction => "eth_sendTransaction",
            EvmRpcMethod::EthRequestAccounts => "eth_requestAccounts",
            EvmRpcMethod::EthAccounts => "eth_accounts",
            EvmRpcMethod::EthChainId => "eth_chainId",
        }
    }

    /// Methods that need an explicit user decision before they run.
    pub fn requires_approval(&self) -> bool {
        matches!(
            self,
            EvmRpcMethod::WalletRequestPermissions
                | EvmRpcMethod::PersonalSign
                | EvmRpcMethod::EthSignTypedDataV4
                | EvmRpcMethod::EthSendTransaction
        )
    }
}

impl FromStr for EvmRpcMethod {
    type Err = BridgeError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        EvmRpcMethod::ALL
            .iter()
            .copied()
            .find(|method| method.as_str() == value)
            .ok_or_else(|| BridgeError::UnsupportedMethod(value.to_string()))
    }
}

impl fmt::Display for EvmRpcMethod {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
