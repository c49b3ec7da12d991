//! Single-node host that executes signed transactions against the market.
//!
//! Every transaction runs on a staged fork of [`ChainState`]: balances,
//! catalog and nonces are copied, the append-only logs start empty. The fork
//! is absorbed only when the whole call (market transition, settlement and
//! fee) succeeds; otherwise it is dropped and nothing changes, not even the
//! sender nonce.

use std::collections::BTreeMap;

use ed25519_dalek::{Signature, Signer, SigningKey, VerifyingKey};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};

use crate::{
    address::Address,
    ledger::{Amount, LedgerEvent, LedgerState, Settlement, SettlementError},
    market::{MarketError, MarketEvent, Marketplace, Model, ModelId},
};

const TX_DOMAIN: &[u8] = b"model-market/tx/v1";

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "method", rename_all = "camelCase")]
pub enum Call {
    #[serde(rename_all = "camelCase")]
    ListModel {
        name: String,
        price: Amount,
        encrypted_download_url: String,
    },
    BuyModel {
        id: ModelId,
    },
}

impl Call {
    fn encode_into(&self, buf: &mut Vec<u8>) {
        match self {
            Call::ListModel {
                name,
                price,
                encrypted_download_url,
            } => {
                buf.extend_from_slice(b"list");
                put_bytes(buf, name.as_bytes());
                buf.extend_from_slice(&price.to_le_bytes());
                put_bytes(buf, encrypted_download_url.as_bytes());
            }
            Call::BuyModel { id } => {
                buf.extend_from_slice(b"buy");
                buf.extend_from_slice(&id.to_le_bytes());
            }
        }
    }
}

fn put_bytes(buf: &mut Vec<u8>, bytes: &[u8]) {
    buf.extend_from_slice(&(bytes.len() as u64).to_le_bytes());
    buf.extend_from_slice(bytes);
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct Transaction {
    pub from: Address,
    pub nonce: u64,
    #[serde(default)]
    pub value: Amount,
    pub call: Call,
}

impl Transaction {
    pub fn digest(&self) -> [u8; 32] {
        let mut buf = Vec::with_capacity(128);
        buf.extend_from_slice(TX_DOMAIN);
        buf.extend_from_slice(self.from.as_bytes());
        buf.extend_from_slice(&self.nonce.to_le_bytes());
        buf.extend_from_slice(&self.value.to_le_bytes());
        self.call.encode_into(&mut buf);
        Sha256::digest(&buf).into()
    }

    pub fn sign(self, key: &SigningKey) -> SignedTransaction {
        let signature = key.sign(&self.digest());
        SignedTransaction {
            tx: self,
            signer: key.verifying_key().to_bytes().to_vec(),
            signature: signature.to_bytes().to_vec(),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct SignedTransaction {
    pub tx: Transaction,
    #[serde(with = "crate::host::serde_bytes")]
    pub signer: Vec<u8>,
    #[serde(with = "crate::host::serde_bytes")]
    pub signature: Vec<u8>,
}

impl SignedTransaction {
    pub fn hash(&self) -> String {
        hex::encode(self.tx.digest())
    }

    pub fn verify(&self) -> Result<(), HostError> {
        let key_bytes: [u8; 32] = self
            .signer
            .as_slice()
            .try_into()
            .map_err(|_| HostError::BadSignature("signer key must be 32 bytes".into()))?;
        let key = VerifyingKey::from_bytes(&key_bytes)
            .map_err(|_| HostError::BadSignature("malformed signer key".into()))?;
        if Address::from_verifying_key(&key) != self.tx.from {
            return Err(HostError::BadSignature(format!(
                "signer does not control {}",
                self.tx.from
            )));
        }
        let signature = Signature::from_slice(&self.signature)
            .map_err(|_| HostError::BadSignature("malformed signature".into()))?;
        key.verify_strict(&self.tx.digest(), &signature)
            .map_err(|_| HostError::BadSignature("invalid signature".into()))
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CallOutput {
    Listed { id: ModelId },
    Purchased { id: ModelId },
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct Receipt {
    pub tx_hash: String,
    pub block_number: u64,
    pub from: Address,
    pub fee_charged: Amount,
    pub output: CallOutput,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum HostError {
    #[error("bad signature: {0}")]
    BadSignature(String),
    #[error("nonce mismatch for {account}: expected {expected}, got {got}")]
    NonceMismatch {
        account: Address,
        expected: u64,
        got: u64,
    },
    #[error("call does not accept value, got {0}")]
    UnexpectedValue(Amount),
    #[error("fee payment failed: {0}")]
    Fee(SettlementError),
    #[error(transparent)]
    Market(#[from] MarketError),
}

impl HostError {
    pub fn kind(&self) -> &'static str {
        match self {
            HostError::BadSignature(_) => "BadSignature",
            HostError::NonceMismatch { .. } => "NonceMismatch",
            HostError::UnexpectedValue(_) => "UnexpectedValue",
            HostError::Fee(_) => "FeePaymentFailed",
            HostError::Market(err) => err.kind(),
        }
    }
}

#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct HostConfig {
    /// Burned from the sender of every committed transaction.
    pub tx_fee: Amount,
}

/// Everything that is persisted between runs.
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ChainState {
    pub height: u64,
    pub nonces: BTreeMap<Address, u64>,
    pub ledger: LedgerState,
    pub market: Marketplace,
    pub receipts: Vec<Receipt>,
}

impl ChainState {
    /// Copy of the mutable state; receipts and event logs start empty.
    fn fork(&self) -> Self {
        Self {
            height: self.height,
            nonces: self.nonces.clone(),
            ledger: self.ledger.fork(),
            market: self.market.fork(),
            receipts: Vec::new(),
        }
    }

    fn absorb(&mut self, fork: Self) {
        self.height = fork.height;
        self.nonces = fork.nonces;
        self.ledger.absorb(fork.ledger);
        self.market.absorb(fork.market);
        self.receipts.extend(fork.receipts);
    }
}

pub struct Host {
    config: HostConfig,
    state: ChainState,
}

impl Host {
    pub fn new(config: HostConfig) -> Self {
        Self::with_state(config, ChainState::default())
    }

    pub fn with_state(config: HostConfig, state: ChainState) -> Self {
        Self { config, state }
    }

    pub fn config(&self) -> &HostConfig {
        &self.config
    }

    pub fn state(&self) -> &ChainState {
        &self.state
    }

    pub fn into_state(self) -> ChainState {
        self.state
    }

    /// Puts back an earlier state, e.g. when a commit could not be persisted.
    pub fn restore(&mut self, state: ChainState) {
        warn!(from = self.state.height, to = state.height, "host state restored");
        self.state = state;
    }

    //==================== reads ====================//

    pub fn height(&self) -> u64 {
        self.state.height
    }

    pub fn model_count(&self) -> u64 {
        self.state.market.model_count()
    }

    pub fn get_model(&self, id: ModelId) -> Option<&Model> {
        self.state.market.get_model(id)
    }

    pub fn models(&self) -> impl Iterator<Item = &Model> {
        self.state.market.models()
    }

    pub fn balance_of(&self, account: &Address) -> Amount {
        self.state.ledger.balance_of(account)
    }

    pub fn nonce_of(&self, account: &Address) -> u64 {
        self.state.nonces.get(account).copied().unwrap_or(0)
    }

    pub fn receipts(&self) -> &[Receipt] {
        &self.state.receipts
    }

    pub fn market_events(&self) -> &[MarketEvent] {
        self.state.market.events()
    }

    pub fn ledger_events(&self) -> &[LedgerEvent] {
        self.state.ledger.events()
    }

    pub fn state_root(&self) -> String {
        self.state.ledger.snapshot().state_root
    }

    //==================== admin ====================//

    /// Faucet / genesis allocation. Not a transaction: no nonce, no fee.
    pub fn fund(&mut self, account: &Address, amount: Amount) -> Result<(), SettlementError> {
        self.state.ledger.mint(account, amount, "faucet")?;
        info!(%account, amount, "account funded");
        Ok(())
    }

    pub fn set_frozen(&mut self, account: &Address, frozen: bool) {
        self.state.ledger.set_frozen(account, frozen);
        info!(%account, frozen, "account freeze changed");
    }

    //==================== transactions ====================//

    pub fn execute(&mut self, signed: &SignedTransaction) -> Result<Receipt, HostError> {
        let tx_hash = signed.hash();
        match self.try_execute(signed, &tx_hash) {
            Ok(receipt) => {
                info!(
                    tx = %tx_hash,
                    block = receipt.block_number,
                    from = %receipt.from,
                    "transaction committed"
                );
                Ok(receipt)
            }
            Err(err) => {
                warn!(tx = %tx_hash, from = %signed.tx.from, kind = err.kind(), %err, "transaction discarded");
                Err(err)
            }
        }
    }

    fn try_execute(&mut self, signed: &SignedTransaction, tx_hash: &str) -> Result<Receipt, HostError> {
        signed.verify()?;
        let tx = &signed.tx;

        let expected = self.nonce_of(&tx.from);
        if tx.nonce != expected {
            return Err(HostError::NonceMismatch {
                account: tx.from,
                expected,
                got: tx.nonce,
            });
        }

        let mut staged = self.state.fork();
        let output = match &tx.call {
            Call::ListModel {
                name,
                price,
                encrypted_download_url,
            } => {
                if tx.value != 0 {
                    return Err(HostError::UnexpectedValue(tx.value));
                }
                let id = staged
                    .market
                    .list_model(tx.from, name, *price, encrypted_download_url)?;
                CallOutput::Listed { id }
            }
            Call::BuyModel { id } => {
                staged
                    .market
                    .buy_model(&mut staged.ledger, tx.from, *id, tx.value)?;
                CallOutput::Purchased { id: *id }
            }
        };

        staged
            .ledger
            .burn(&tx.from, self.config.tx_fee, "tx fee")
            .map_err(HostError::Fee)?;
        staged.nonces.insert(tx.from, expected + 1);
        staged.height += 1;

        let receipt = Receipt {
            tx_hash: tx_hash.to_string(),
            block_number: staged.height,
            from: tx.from,
            fee_charged: self.config.tx_fee,
            output,
        };
        staged.receipts.push(receipt.clone());

        debug!(height = staged.height, "absorbing staged state");
        self.state.absorb(staged);
        Ok(receipt)
    }
}

pub(crate) mod serde_bytes {
    use serde::{de::Error, Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(value: &Vec<u8>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&hex::encode(value))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Vec<u8>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let encoded = String::deserialize(deserializer)?;
        hex::decode(&encoded).map_err(D::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::ledger::UNITS_PER_COIN;

    const URL: &str = "http://example.com/encrypted-url";

    fn key(seed: u8) -> SigningKey {
        SigningKey::from_bytes(&[seed; 32])
    }

    fn address_of(key: &SigningKey) -> Address {
        Address::from_verifying_key(&key.verifying_key())
    }

    fn list_tx(host: &Host, key: &SigningKey, name: &str, price: Amount) -> SignedTransaction {
        let from = address_of(key);
        Transaction {
            from,
            nonce: host.nonce_of(&from),
            value: 0,
            call: Call::ListModel {
                name: name.into(),
                price,
                encrypted_download_url: URL.into(),
            },
        }
        .sign(key)
    }

    fn buy_tx(host: &Host, key: &SigningKey, id: ModelId, value: Amount) -> SignedTransaction {
        let from = address_of(key);
        Transaction {
            from,
            nonce: host.nonce_of(&from),
            value,
            call: Call::BuyModel { id },
        }
        .sign(key)
    }

    #[test]
    fn list_then_buy_end_to_end() {
        let (seller, buyer, other) = (key(1), key(2), key(3));
        let price = UNITS_PER_COIN;
        let mut host = Host::new(HostConfig::default());
        host.fund(&address_of(&buyer), 10 * UNITS_PER_COIN).unwrap();
        host.fund(&address_of(&other), 10 * UNITS_PER_COIN).unwrap();
        assert_eq!(host.model_count(), 0);

        let receipt = host
            .execute(&list_tx(&host, &seller, "Test Model", price))
            .unwrap();
        assert_eq!(receipt.output, CallOutput::Listed { id: 1 });
        assert_eq!(receipt.block_number, 1);
        assert_eq!(host.model_count(), 1);

        let model = host.get_model(1).unwrap().clone();
        assert_eq!(
            (model.id, model.name.as_str(), model.price, model.seller),
            (1, "Test Model", price, address_of(&seller))
        );
        assert_eq!(model.encrypted_download_url, URL);

        let before = host.balance_of(&address_of(&seller));
        host.execute(&buy_tx(&host, &buyer, 1, price)).unwrap();
        assert_eq!(host.balance_of(&address_of(&seller)), before + price);
        assert_eq!(host.balance_of(&address_of(&buyer)), 9 * UNITS_PER_COIN);
        assert!(host.get_model(1).unwrap().sold);

        let err = host.execute(&buy_tx(&host, &other, 1, price)).unwrap_err();
        assert_eq!(err, HostError::Market(MarketError::AlreadySold(1)));
        assert_eq!(host.balance_of(&address_of(&other)), 10 * UNITS_PER_COIN);
        assert_eq!(host.receipts().len(), 2);
        assert_eq!(host.height(), 2);
    }

    #[test]
    fn settlement_failure_discards_sold_flag_and_nonce() {
        let (seller, buyer) = (key(1), key(2));
        let mut host = Host::new(HostConfig::default());
        host.fund(&address_of(&buyer), 100).unwrap();
        host.execute(&list_tx(&host, &seller, "Model", 40)).unwrap();
        host.set_frozen(&address_of(&seller), true);
        let root_before = host.state_root();

        let err = host.execute(&buy_tx(&host, &buyer, 1, 40)).unwrap_err();
        assert_eq!(err.kind(), "SettlementFailed");

        let model = host.get_model(1).unwrap();
        assert!(!model.sold);
        assert_eq!(model.buyer, None);
        assert_eq!(host.balance_of(&address_of(&buyer)), 100);
        assert_eq!(host.nonce_of(&address_of(&buyer)), 0);
        assert_eq!(host.state_root(), root_before);
        assert_eq!(host.market_events().len(), 1);

        host.set_frozen(&address_of(&seller), false);
        host.execute(&buy_tx(&host, &buyer, 1, 40)).unwrap();
        assert_eq!(host.balance_of(&address_of(&seller)), 40);
    }

    #[test]
    fn rejected_calls_leave_state_unchanged() {
        let (seller, buyer) = (key(1), key(2));
        let mut host = Host::new(HostConfig::default());
        host.fund(&address_of(&buyer), 100).unwrap();
        host.execute(&list_tx(&host, &seller, "Model", 40)).unwrap();
        let snapshot = host.state().clone();

        let err = host.execute(&buy_tx(&host, &buyer, 9, 40)).unwrap_err();
        assert_eq!(err.kind(), "ModelNotFound");
        let err = host.execute(&buy_tx(&host, &buyer, 1, 39)).unwrap_err();
        assert_eq!(err.kind(), "IncorrectPayment");
        let err = host.execute(&list_tx(&host, &seller, "", 40)).unwrap_err();
        assert_eq!(err.kind(), "InvalidListing");

        assert_eq!(host.state(), &snapshot);
    }

    #[test]
    fn commits_append_to_history_and_failures_leave_it_alone() {
        let (seller, buyer) = (key(1), key(2));
        let mut host = Host::new(HostConfig::default());
        host.fund(&address_of(&buyer), 100).unwrap();
        host.execute(&list_tx(&host, &seller, "first", 10)).unwrap();
        host.execute(&list_tx(&host, &seller, "second", 20)).unwrap();
        host.execute(&buy_tx(&host, &buyer, 2, 20)).unwrap();
        host.execute(&buy_tx(&host, &buyer, 2, 20)).unwrap_err();

        let blocks: Vec<u64> = host.receipts().iter().map(|r| r.block_number).collect();
        assert_eq!(blocks, vec![1, 2, 3]);
        assert!(matches!(
            host.market_events(),
            [
                MarketEvent::ModelListed { id: 1, .. },
                MarketEvent::ModelListed { id: 2, .. },
                MarketEvent::ModelPurchased { id: 2, price: 20, .. },
            ]
        ));
        assert!(matches!(
            host.ledger_events(),
            [
                LedgerEvent::Minted { amount: 100, .. },
                LedgerEvent::Transfer { amount: 20, .. },
            ]
        ));
    }

    #[test]
    fn restore_rolls_back_a_commit() {
        let seller = key(1);
        let mut host = Host::new(HostConfig::default());
        let checkpoint = host.state().clone();
        host.execute(&list_tx(&host, &seller, "Model", 5)).unwrap();
        host.restore(checkpoint.clone());
        assert_eq!(host.state(), &checkpoint);
        assert_eq!(host.model_count(), 0);
        assert_eq!(host.nonce_of(&address_of(&seller)), 0);
    }

    #[test]
    fn fee_is_charged_only_on_commit() {
        let (seller, buyer) = (key(1), key(2));
        let mut host = Host::new(HostConfig { tx_fee: 3 });
        host.fund(&address_of(&seller), 10).unwrap();
        host.fund(&address_of(&buyer), 100).unwrap();

        let receipt = host.execute(&list_tx(&host, &seller, "Model", 40)).unwrap();
        assert_eq!(receipt.fee_charged, 3);
        assert_eq!(host.balance_of(&address_of(&seller)), 7);

        host.execute(&buy_tx(&host, &buyer, 1, 41)).unwrap_err();
        assert_eq!(host.balance_of(&address_of(&buyer)), 100);

        host.execute(&buy_tx(&host, &buyer, 1, 40)).unwrap();
        assert_eq!(host.balance_of(&address_of(&buyer)), 57);
        assert_eq!(host.balance_of(&address_of(&seller)), 47);
    }

    #[test]
    fn unfunded_sender_cannot_pay_fee() {
        let seller = key(1);
        let mut host = Host::new(HostConfig { tx_fee: 1 });
        let err = host.execute(&list_tx(&host, &seller, "Model", 5)).unwrap_err();
        assert_eq!(err.kind(), "FeePaymentFailed");
        assert_eq!(host.model_count(), 0);
    }

    #[test]
    fn signature_and_nonce_are_enforced() {
        let (seller, mallory) = (key(1), key(9));
        let mut host = Host::new(HostConfig::default());

        // signed by a key that does not own `from`
        let mut forged = list_tx(&host, &mallory, "Model", 5);
        forged.tx.from = address_of(&seller);
        assert_eq!(host.execute(&forged).unwrap_err().kind(), "BadSignature");

        // tampered payload
        let mut tampered = list_tx(&host, &seller, "Model", 5);
        if let Call::ListModel { price, .. } = &mut tampered.tx.call {
            *price = 1;
        }
        assert_eq!(host.execute(&tampered).unwrap_err().kind(), "BadSignature");

        let tx = list_tx(&host, &seller, "Model", 5);
        host.execute(&tx).unwrap();
        let err = host.execute(&tx).unwrap_err();
        assert_eq!(
            err,
            HostError::NonceMismatch {
                account: address_of(&seller),
                expected: 1,
                got: 0,
            }
        );
        assert_eq!(host.model_count(), 1);
    }

    #[test]
    fn listing_rejects_attached_value() {
        let seller = key(1);
        let mut host = Host::new(HostConfig::default());
        host.fund(&address_of(&seller), 100).unwrap();
        let from = address_of(&seller);
        let tx = Transaction {
            from,
            nonce: 0,
            value: 5,
            call: Call::ListModel {
                name: "Model".into(),
                price: 5,
                encrypted_download_url: URL.into(),
            },
        }
        .sign(&seller);
        assert_eq!(host.execute(&tx).unwrap_err(), HostError::UnexpectedValue(5));
        assert_eq!(host.balance_of(&from), 100);
    }

    #[test]
    fn signed_transaction_survives_json() {
        let seller = key(1);
        let host = Host::new(HostConfig::default());
        let tx = list_tx(&host, &seller, "Model", 5);
        let json = serde_json::to_string(&tx).unwrap();
        let decoded: SignedTransaction = serde_json::from_str(&json).unwrap();
        decoded.verify().unwrap();
        assert_eq!(decoded.hash(), tx.hash());
    }
}
