//! In-memory base state with ETH transfer semantics.
//!
//! The account map sits behind an `Arc`: snapshots share it for free, and
//! merging clones it only while older snapshots are still alive.

use crate::state::{ExecutionSnapshot, MergedAccessTable, StateBackend};
use crate::types::{AccessSet, AccountState, Receipt, Transaction, TxnIndex, Watermark};
use alloy_primitives::{b256, Address, Bytes, Log, B256, U256};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

/// Intrinsic gas of a plain value transfer.
pub const TRANSFER_GAS: u64 = 21_000;

/// `keccak256("Transfer(address,address,uint256)")`
pub const TRANSFER_TOPIC: B256 =
    b256!("ddf252ad1be2c89b69c2b068fc378daa952ba7f163c4a11628f55a4df523b3ef");

/// Why a transaction could not be applied to a snapshot.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum ApplyError {
    #[error("invalid signature")]
    InvalidSignature,
    #[error("nonce mismatch: account at {expected}, transaction has {got}")]
    NonceMismatch { expected: u64, got: u64 },
    #[error("insufficient funds: balance {balance}, max cost {cost}")]
    InsufficientFunds { balance: U256, cost: U256 },
    #[error("gas limit {gas_limit} below intrinsic gas {}", TRANSFER_GAS)]
    IntrinsicGasTooLow { gas_limit: u64 },
    #[error("gas limit {gas_limit} exceeds {available} gas left in block")]
    GasLimitReached { gas_limit: u64, available: u64 },
}

/// What `finalize` recorded about the completed block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FinalizedBlock {
    pub block_len: usize,
    /// Every address a merged transaction touched, sorted.
    pub touched: Vec<Address>,
}

/// Shared base state backed by a hash map of accounts.
#[derive(Debug, Clone)]
pub struct MemoryState {
    accounts: Arc<HashMap<Address, AccountState>>,
    coinbase: Address,
    verify_signatures: bool,
    finalized: Option<FinalizedBlock>,
}

impl MemoryState {
    /// Creates an empty state paying fees to `coinbase`.
    pub fn new(coinbase: Address) -> Self {
        Self {
            accounts: Arc::new(HashMap::new()),
            coinbase,
            verify_signatures: false,
            finalized: None,
        }
    }

    /// Creates a state pre-populated with `accounts`.
    pub fn with_accounts(
        coinbase: Address,
        accounts: impl IntoIterator<Item = (Address, AccountState)>,
    ) -> Self {
        Self {
            accounts: Arc::new(accounts.into_iter().collect()),
            ..Self::new(coinbase)
        }
    }

    /// Enables signature recovery on every apply.
    pub fn verify_signatures(mut self, verify: bool) -> Self {
        self.verify_signatures = verify;
        self
    }

    pub fn insert_account(&mut self, address: Address, state: AccountState) {
        Arc::make_mut(&mut self.accounts).insert(address, state);
    }

    /// Current state of `address`; missing accounts are empty.
    pub fn account(&self, address: Address) -> AccountState {
        self.accounts.get(&address).copied().unwrap_or_default()
    }

    pub fn accounts(&self) -> impl Iterator<Item = (Address, AccountState)> + '_ {
        self.accounts.iter().map(|(&address, &state)| (address, state))
    }

    pub fn into_accounts(self) -> HashMap<Address, AccountState> {
        Arc::unwrap_or_clone(self.accounts)
    }

    pub fn coinbase(&self) -> Address {
        self.coinbase
    }

    /// Set once the block has been fully merged.
    pub fn finalized(&self) -> Option<&FinalizedBlock> {
        self.finalized.as_ref()
    }
}

impl StateBackend for MemoryState {
    type Transaction = Transaction;
    type Snapshot = MemorySnapshot;

    fn snapshot(&self, watermark: Watermark) -> MemorySnapshot {
        MemorySnapshot {
            base: watermark,
            accounts: Arc::clone(&self.accounts),
            writes: HashMap::new(),
            access: AccessSet::new(),
            fees: U256::ZERO,
            verify_signatures: self.verify_signatures,
        }
    }

    fn can_merge(&self, snapshot: &MemorySnapshot, merged: &MergedAccessTable) -> bool {
        // Fee credits never enter a footprint, so a snapshot that read the
        // coinbase is stale as soon as anything else merged.
        if snapshot.access.contains(&self.coinbase)
            && merged.merged_after(snapshot.base).next().is_some()
        {
            return false;
        }
        !merged.conflicts_with(&snapshot.access, snapshot.base)
    }

    fn merge(&mut self, snapshot: MemorySnapshot) {
        let accounts = Arc::make_mut(&mut self.accounts);
        accounts.extend(snapshot.writes);
        if !snapshot.fees.is_zero() {
            let coinbase = accounts.entry(self.coinbase).or_default();
            coinbase.balance = coinbase.balance.saturating_add(snapshot.fees);
        }
    }

    fn finalize(&mut self, merged: &MergedAccessTable, block_len: usize) {
        let mut touched: Vec<Address> = merged.touched().into_iter().collect();
        touched.sort_unstable();
        debug!(block_len, touched = touched.len(), "finalized base state");
        self.finalized = Some(FinalizedBlock { block_len, touched });
    }
}

/// Private overlay over a shared account map.
#[derive(Debug)]
pub struct MemorySnapshot {
    base: Watermark,
    accounts: Arc<HashMap<Address, AccountState>>,
    writes: HashMap<Address, AccountState>,
    access: AccessSet,
    /// Fees owed to the coinbase, credited at merge.
    fees: U256,
    verify_signatures: bool,
}

impl MemorySnapshot {
    fn read(&mut self, address: Address) -> AccountState {
        self.access.insert(address);
        self.writes
            .get(&address)
            .or_else(|| self.accounts.get(&address))
            .copied()
            .unwrap_or_default()
    }

    fn write(&mut self, address: Address, state: AccountState) {
        self.access.insert(address);
        self.writes.insert(address, state);
    }

    /// Pending writes of this snapshot.
    pub fn writes(&self) -> &HashMap<Address, AccountState> {
        &self.writes
    }
}

impl ExecutionSnapshot for MemorySnapshot {
    type Transaction = Transaction;
    type Error = ApplyError;

    fn base(&self) -> Watermark {
        self.base
    }

    fn apply(
        &mut self,
        tx: &Transaction,
        index: TxnIndex,
        gas_limit: u64,
    ) -> Result<Receipt, ApplyError> {
        if self.verify_signatures && !tx.verify_signature() {
            return Err(ApplyError::InvalidSignature);
        }
        if tx.gas_limit < TRANSFER_GAS {
            return Err(ApplyError::IntrinsicGasTooLow {
                gas_limit: tx.gas_limit,
            });
        }
        if tx.gas_limit > gas_limit {
            return Err(ApplyError::GasLimitReached {
                gas_limit: tx.gas_limit,
                available: gas_limit,
            });
        }

        let mut sender = self.read(tx.from);
        if sender.nonce != tx.nonce {
            return Err(ApplyError::NonceMismatch {
                expected: sender.nonce,
                got: tx.nonce,
            });
        }

        let gas_price = U256::from(tx.gas_price);
        let Some(max_cost) = U256::from(tx.gas_limit)
            .checked_mul(gas_price)
            .and_then(|gas_cost| gas_cost.checked_add(tx.value))
        else {
            return Err(ApplyError::InsufficientFunds {
                balance: sender.balance,
                cost: U256::MAX,
            });
        };
        if sender.balance < max_cost {
            return Err(ApplyError::InsufficientFunds {
                balance: sender.balance,
                cost: max_cost,
            });
        }

        // Bounded by max_cost, which fits in the balance.
        let gas_used = TRANSFER_GAS;
        let fee = U256::from(gas_used) * gas_price;
        sender.nonce += 1;
        sender.balance -= tx.value + fee;
        self.write(tx.from, sender);

        let to = tx.to.unwrap_or_else(|| tx.from.create(tx.nonce));
        let mut recipient = self.read(to);
        recipient.balance = recipient.balance.saturating_add(tx.value);
        self.write(to, recipient);

        self.fees += fee;

        Ok(Receipt::new(
            index,
            gas_used,
            vec![transfer_log(tx.from, to, tx.value)],
        ))
    }

    fn access_set(&self) -> &AccessSet {
        &self.access
    }
}

fn transfer_log(from: Address, to: Address, value: U256) -> Log {
    Log::new_unchecked(
        to,
        vec![TRANSFER_TOPIC, from.into_word(), to.into_word()],
        Bytes::copy_from_slice(&value.to_be_bytes::<32>()),
    )
}
