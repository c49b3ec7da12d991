use thiserror::Error;

use crate::{
    address::AddressError, config::ConfigError, host::HostError, ledger::SettlementError,
    market::MarketError, rpc::RpcError, store::StoreError,
};

/// Top-level error for the binary and other embedders.
#[derive(Debug, Error)]
pub enum Error {
    /// Malformed account address.
    #[error(transparent)]
    Address(#[from] AddressError),

    /// Config file could not be read or parsed.
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// Transaction rejected by the host or the marketplace.
    #[error(transparent)]
    Host(#[from] HostError),

    /// Market operation rejected outside of a transaction.
    #[error(transparent)]
    Market(#[from] MarketError),

    /// Balance operation failed (faucet, freeze).
    #[error(transparent)]
    Settlement(#[from] SettlementError),

    /// State file could not be read or written.
    #[error(transparent)]
    Store(#[from] StoreError),

    /// Remote call failed or was rejected.
    #[error(transparent)]
    Rpc(#[from] RpcError),

    /// Bad key material or other invalid user input.
    #[error("{0}")]
    Input(String),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}
