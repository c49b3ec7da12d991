//! Marketplace ledger: an append-only catalog of priced listings.
//!
//! The ledger is a plain state machine. It does no locking and never rolls
//! itself back: a failed [`Marketplace::buy_model`] may leave the listing
//! marked sold, and the caller is expected to discard the whole state (the
//! [`crate::host::Host`] does this by executing every call on a staged copy).

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::{
    address::Address,
    ledger::{Amount, Settlement, SettlementError},
};

pub type ModelId = u64;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum MarketError {
    #[error("invalid listing: {0}")]
    InvalidListing(&'static str),
    #[error("model {0} not found")]
    ModelNotFound(ModelId),
    #[error("model {0} already sold")]
    AlreadySold(ModelId),
    #[error("incorrect payment for model {id}: price {expected}, paid {actual}")]
    IncorrectPayment {
        id: ModelId,
        expected: Amount,
        actual: Amount,
    },
    #[error("settlement failed: {0}")]
    SettlementFailed(#[from] SettlementError),
}

impl MarketError {
    /// Stable name of the failure, used on the wire.
    pub fn kind(&self) -> &'static str {
        match self {
            MarketError::InvalidListing(_) => "InvalidListing",
            MarketError::ModelNotFound(_) => "ModelNotFound",
            MarketError::AlreadySold(_) => "AlreadySold",
            MarketError::IncorrectPayment { .. } => "IncorrectPayment",
            MarketError::SettlementFailed(_) => "SettlementFailed",
        }
    }
}

/// A listing. Everything except `sold` and `buyer` is fixed at listing time.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Model {
    pub id: ModelId,
    pub name: String,
    pub price: Amount,
    pub seller: Address,
    pub encrypted_download_url: String,
    pub sold: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub buyer: Option<Address>,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum MarketEvent {
    ModelListed {
        id: ModelId,
        seller: Address,
        price: Amount,
    },
    ModelPurchased {
        id: ModelId,
        buyer: Address,
        seller: Address,
        price: Amount,
    },
}

#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Marketplace {
    model_count: u64,
    models: BTreeMap<ModelId, Model>,
    #[serde(default)]
    events: Vec<MarketEvent>,
}

impl Marketplace {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn model_count(&self) -> u64 {
        self.model_count
    }

    pub fn get_model(&self, id: ModelId) -> Option<&Model> {
        self.models.get(&id)
    }

    /// Listings in id order.
    pub fn models(&self) -> impl Iterator<Item = &Model> {
        self.models.values()
    }

    pub fn events(&self) -> &[MarketEvent] {
        &self.events
    }

    /// Copy of the catalog with an empty event log.
    pub fn fork(&self) -> Self {
        Self {
            model_count: self.model_count,
            models: self.models.clone(),
            events: Vec::new(),
        }
    }

    /// Takes over the catalog of a fork and appends the events it recorded.
    pub fn absorb(&mut self, fork: Self) {
        self.model_count = fork.model_count;
        self.models = fork.models;
        self.events.extend(fork.events);
    }

    pub fn list_model(
        &mut self,
        caller: Address,
        name: &str,
        price: Amount,
        encrypted_download_url: &str,
    ) -> Result<ModelId, MarketError> {
        if name.trim().is_empty() {
            return Err(MarketError::InvalidListing("name must not be empty"));
        }
        if price == 0 {
            return Err(MarketError::InvalidListing("price must be greater than zero"));
        }
        let id = self
            .model_count
            .checked_add(1)
            .ok_or(MarketError::InvalidListing("model id space exhausted"))?;

        self.models.insert(
            id,
            Model {
                id,
                name: name.to_string(),
                price,
                seller: caller,
                encrypted_download_url: encrypted_download_url.to_string(),
                sold: false,
                buyer: None,
            },
        );
        self.model_count = id;
        self.events.push(MarketEvent::ModelListed {
            id,
            seller: caller,
            price,
        });
        info!(id, seller = %caller, price, name, "model listed");
        Ok(id)
    }

    /// Marks the listing sold, then settles `payment` from `caller` to the
    /// seller. On `SettlementFailed` the sold flag has already been written.
    pub fn buy_model<S: Settlement>(
        &mut self,
        settlement: &mut S,
        caller: Address,
        id: ModelId,
        payment: Amount,
    ) -> Result<(), MarketError> {
        let model = self
            .models
            .get_mut(&id)
            .ok_or(MarketError::ModelNotFound(id))?;
        if model.sold {
            return Err(MarketError::AlreadySold(id));
        }
        if payment != model.price {
            return Err(MarketError::IncorrectPayment {
                id,
                expected: model.price,
                actual: payment,
            });
        }

        model.sold = true;
        model.buyer = Some(caller);
        let seller = model.seller;
        let price = model.price;

        settlement.transfer_value(&caller, &seller, payment)?;

        self.events.push(MarketEvent::ModelPurchased {
            id,
            buyer: caller,
            seller,
            price,
        });
        info!(id, buyer = %caller, %seller, price, "model purchased");
        debug!(id, "listing transitioned to sold");
        Ok(())
    }
}
