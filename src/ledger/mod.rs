use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::debug;

use crate::address::Address;

pub type Amount = u64;

pub const UNITS_PER_COIN: Amount = 1_000_000_000; // 1 coin = 1e9 minimal units

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SettlementError {
    #[error("insufficient funds in account {account}: required {required}, available {available}")]
    InsufficientFunds {
        account: Address,
        required: Amount,
        available: Amount,
    },
    #[error("unknown account {account}")]
    UnknownAccount { account: Address },
    #[error("account {account} is frozen")]
    AccountFrozen { account: Address },
    #[error("balance overflow in account {account}")]
    Overflow { account: Address },
}

/// Value transfer primitive consumed by the marketplace.
///
/// Implementations either move the full amount or fail without touching
/// either balance.
pub trait Settlement {
    fn transfer_value(
        &mut self,
        from: &Address,
        to: &Address,
        amount: Amount,
    ) -> Result<(), SettlementError>;

    fn balance_of(&self, account: &Address) -> Amount;
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct AccountBalance {
    pub available: Amount,
    #[serde(default)]
    pub frozen: bool,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct LedgerSnapshot {
    pub accounts: BTreeMap<Address, AccountBalance>,
    pub total_supply: Amount,
    pub state_root: String,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum LedgerEvent {
    Minted {
        to: Address,
        amount: Amount,
        reason: String,
    },
    Burned {
        from: Address,
        amount: Amount,
        reason: String,
    },
    Transfer {
        from: Address,
        to: Address,
        amount: Amount,
    },
    FreezeChanged {
        account: Address,
        frozen: bool,
    },
}

#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct LedgerState {
    accounts: BTreeMap<Address, AccountBalance>,
    events: Vec<LedgerEvent>,
}

impl LedgerState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn accounts(&self) -> &BTreeMap<Address, AccountBalance> {
        &self.accounts
    }

    pub fn events(&self) -> &[LedgerEvent] {
        &self.events
    }

    /// Copy of the balances with an empty event log.
    pub fn fork(&self) -> Self {
        Self {
            accounts: self.accounts.clone(),
            events: Vec::new(),
        }
    }

    /// Takes over the balances of a fork and appends the events it recorded.
    pub fn absorb(&mut self, fork: Self) {
        self.accounts = fork.accounts;
        self.events.extend(fork.events);
    }

    pub fn is_frozen(&self, account: &Address) -> bool {
        self.accounts.get(account).map(|b| b.frozen).unwrap_or(false)
    }

    pub fn total_supply(&self) -> Amount {
        self.accounts
            .values()
            .fold(0, |acc: Amount, b| acc.saturating_add(b.available))
    }

    pub fn mint(&mut self, to: &Address, amount: Amount, reason: &str) -> Result<(), SettlementError> {
        self.credit_account(to, amount)?;
        self.events.push(LedgerEvent::Minted {
            to: *to,
            amount,
            reason: reason.to_string(),
        });
        Ok(())
    }

    pub fn burn(&mut self, from: &Address, amount: Amount, reason: &str) -> Result<(), SettlementError> {
        if amount == 0 {
            return Ok(());
        }
        self.debit_account(from, amount)?;
        self.events.push(LedgerEvent::Burned {
            from: *from,
            amount,
            reason: reason.to_string(),
        });
        Ok(())
    }

    pub fn set_frozen(&mut self, account: &Address, frozen: bool) {
        let balance = self.accounts.entry(*account).or_default();
        if balance.frozen == frozen {
            return;
        }
        balance.frozen = frozen;
        self.events.push(LedgerEvent::FreezeChanged {
            account: *account,
            frozen,
        });
    }

    fn credit_account(&mut self, account: &Address, amount: Amount) -> Result<(), SettlementError> {
        let balance = self.accounts.entry(*account).or_default();
        if balance.frozen {
            return Err(SettlementError::AccountFrozen { account: *account });
        }
        balance.available = balance
            .available
            .checked_add(amount)
            .ok_or(SettlementError::Overflow { account: *account })?;
        Ok(())
    }

    fn debit_account(&mut self, account: &Address, amount: Amount) -> Result<(), SettlementError> {
        let balance = self
            .accounts
            .get_mut(account)
            .ok_or(SettlementError::UnknownAccount { account: *account })?;
        if balance.frozen {
            return Err(SettlementError::AccountFrozen { account: *account });
        }
        if balance.available < amount {
            return Err(SettlementError::InsufficientFunds {
                account: *account,
                required: amount,
                available: balance.available,
            });
        }
        balance.available -= amount;
        Ok(())
    }

    pub fn snapshot(&self) -> LedgerSnapshot {
        LedgerSnapshot {
            accounts: self.accounts.clone(),
            total_supply: self.total_supply(),
            state_root: hex::encode(compute_merkle_root(&self.accounts)),
        }
    }
}

impl Settlement for LedgerState {
    fn transfer_value(
        &mut self,
        from: &Address,
        to: &Address,
        amount: Amount,
    ) -> Result<(), SettlementError> {
        // validate both legs before mutating either one
        let sender = self
            .accounts
            .get(from)
            .ok_or(SettlementError::UnknownAccount { account: *from })?;
        if sender.frozen {
            return Err(SettlementError::AccountFrozen { account: *from });
        }
        if sender.available < amount {
            return Err(SettlementError::InsufficientFunds {
                account: *from,
                required: amount,
                available: sender.available,
            });
        }
        if self.is_frozen(to) {
            return Err(SettlementError::AccountFrozen { account: *to });
        }
        if from != to {
            let receiving = self.accounts.get(to).map(|b| b.available).unwrap_or(0);
            if receiving.checked_add(amount).is_none() {
                return Err(SettlementError::Overflow { account: *to });
            }
        }

        self.debit_account(from, amount)?;
        self.credit_account(to, amount)?;
        self.events.push(LedgerEvent::Transfer {
            from: *from,
            to: *to,
            amount,
        });
        debug!(%from, %to, amount, "value transferred");
        Ok(())
    }

    fn balance_of(&self, account: &Address) -> Amount {
        self.accounts.get(account).map(|b| b.available).unwrap_or(0)
    }
}

/// Renders an amount as decimal coins, e.g. `1500000000` -> `1.5`.
pub fn format_amount(amount: Amount) -> String {
    let whole = amount / UNITS_PER_COIN;
    let frac = amount % UNITS_PER_COIN;
    if frac == 0 {
        return whole.to_string();
    }
    let frac = format!("{frac:09}");
    format!("{whole}.{}", frac.trim_end_matches('0'))
}

fn compute_merkle_root(accounts: &BTreeMap<Address, AccountBalance>) -> [u8; 32] {
    let mut leaves: Vec<[u8; 32]> = Vec::with_capacity(accounts.len());
    for (account, balance) in accounts {
        let mut hasher = Sha256::new();
        hasher.update(b"acct");
        hasher.update(account.as_bytes());
        hasher.update(balance.available.to_le_bytes());
        hasher.update([balance.frozen as u8]);
        leaves.push(hasher.finalize().into());
    }
    build_merkle(leaves)
}

fn build_merkle(mut leaves: Vec<[u8; 32]>) -> [u8; 32] {
    if leaves.is_empty() {
        return Sha256::digest(b"model-market-empty").into();
    }
    while leaves.len() > 1 {
        let mut next = Vec::with_capacity(leaves.len().div_ceil(2));
        for chunk in leaves.chunks(2) {
            let mut hasher = Sha256::new();
            hasher.update(b"node");
            hasher.update(chunk[0]);
            if chunk.len() == 2 {
                hasher.update(chunk[1]);
            } else {
                hasher.update(chunk[0]);
            }
            next.push(hasher.finalize().into());
        }
        leaves = next;
    }
    leaves[0]
}
