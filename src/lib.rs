//! Marketplace ledger for digital goods.
//!
//! Sellers list priced items (AI models, datasets, any downloadable artefact
//! behind an encrypted URL) and buyers purchase them by paying exactly the
//! listed price; the payment is settled to the seller inside the same
//! transaction.
//!
//! * [`market`]: the catalog state machine (`list_model`, `buy_model`,
//!   `model_count`, `get_model`).
//! * [`ledger`]: native-value balances and the [`ledger::Settlement`]
//!   primitive the market pays through.
//! * [`host`]: signed transactions, nonces, fees and all-or-nothing commit.
//! * [`store`], [`rpc`], [`config`], [`telemetry`]: persistence, the JSON
//!   line protocol, settings and logging used by the `market` binary.

pub mod address;
pub mod config;
pub mod error;
pub mod host;
pub mod ledger;
pub mod market;
pub mod rpc;
pub mod store;
pub mod telemetry;

pub use address::Address;
pub use error::Error;
pub use host::{Host, HostConfig, SignedTransaction, Transaction};
pub use ledger::Amount;
pub use market::{MarketError, Marketplace, Model, ModelId};
