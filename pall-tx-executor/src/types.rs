//! Core types for grouped speculative execution.

use alloy_primitives::{keccak256, Address, Log, Signature, B256, U256};
use std::collections::HashSet;
use std::fmt;

/// Transaction index in the block (0-based).
pub type TxnIndex = usize;

/// Identifier of an address group.
pub type GroupId = usize;

/// Addresses read or written by one execution attempt.
pub type AccessSet = HashSet<Address>;

/// Index of the last transaction merged into the base state, in block order.
///
/// The initial watermark merges nothing and displays as `-1`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Watermark(Option<TxnIndex>);

impl Watermark {
    /// Nothing merged yet.
    pub const GENESIS: Self = Self(None);

    /// Watermark after merging `index`.
    pub fn at(index: TxnIndex) -> Self {
        Self(Some(index))
    }

    /// The last merged index, if any.
    pub fn last(self) -> Option<TxnIndex> {
        self.0
    }

    /// The index that must merge next.
    pub fn next_index(self) -> TxnIndex {
        self.0.map_or(0, |idx| idx + 1)
    }

    /// Returns true if `index` is already merged.
    pub fn covers(self, index: TxnIndex) -> bool {
        self.0.is_some_and(|last| index <= last)
    }

    /// Advances to `index`, which must be exactly the next index.
    pub fn advance_to(self, index: TxnIndex) -> Option<Self> {
        (index == self.next_index()).then_some(Self(Some(index)))
    }
}

impl fmt::Display for Watermark {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.0 {
            Some(idx) => write!(f, "{idx}"),
            None => f.write_str("-1"),
        }
    }
}

/// Account state tracked by the in-memory base state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AccountState {
    pub nonce: u64,
    pub balance: U256,
}

impl AccountState {
    pub fn new(nonce: u64, balance: U256) -> Self {
        Self { nonce, balance }
    }
}

/// The parts of a transaction the scheduler looks at.
pub trait BlockTransaction {
    fn sender(&self) -> Address;
    fn recipient(&self) -> Option<Address>;
    /// Gas the transaction reserves from the block gas pool.
    fn gas_limit(&self) -> u64;
}

/// Hash a transfer's signature commits to.
pub fn signing_hash(
    from: Address,
    to: Option<Address>,
    value: U256,
    nonce: u64,
    gas_limit: u64,
    gas_price: u128,
    chain_id: u64,
) -> B256 {
    let mut data = Vec::with_capacity(20 + 21 + 32 + 8 + 8 + 16 + 8);
    data.extend_from_slice(from.as_slice());
    match to {
        Some(to) => {
            data.push(1);
            data.extend_from_slice(to.as_slice());
        }
        None => data.push(0),
    }
    data.extend_from_slice(&value.to_be_bytes::<32>());
    data.extend_from_slice(&nonce.to_be_bytes());
    data.extend_from_slice(&gas_limit.to_be_bytes());
    data.extend_from_slice(&gas_price.to_be_bytes());
    data.extend_from_slice(&chain_id.to_be_bytes());
    keccak256(&data)
}

/// A value transfer as carried in a block.
#[derive(Debug, Clone)]
pub struct Transaction {
    pub from: Address,
    /// `None` creates an account at the address derived from `(from, nonce)`.
    pub to: Option<Address>,
    pub value: U256,
    pub nonce: u64,
    pub gas_limit: u64,
    pub gas_price: u128,
    pub chain_id: u64,
    /// The ECDSA signature over [`Transaction::signing_hash`].
    pub signature: Signature,
}

impl Transaction {
    /// Hash of the transaction fields, recomputed on every call.
    pub fn signing_hash(&self) -> B256 {
        signing_hash(
            self.from,
            self.to,
            self.value,
            self.nonce,
            self.gas_limit,
            self.gas_price,
            self.chain_id,
        )
    }

    /// Recovers the signer address from the signature over the current fields.
    pub fn recover_signer(&self) -> Option<Address> {
        self.signature
            .recover_address_from_prehash(&self.signing_hash())
            .ok()
    }

    /// Verifies the signature matches the claimed sender.
    pub fn verify_signature(&self) -> bool {
        self.recover_signer() == Some(self.from)
    }
}

impl BlockTransaction for Transaction {
    fn sender(&self) -> Address {
        self.from
    }

    fn recipient(&self) -> Option<Address> {
        self.to
    }

    fn gas_limit(&self) -> u64 {
        self.gas_limit
    }
}

/// An ordered block of transactions with its gas limit.
#[derive(Debug, Clone)]
pub struct Block<T> {
    pub gas_limit: u64,
    pub transactions: Vec<T>,
}

impl<T> Block<T> {
    pub fn new(gas_limit: u64, transactions: Vec<T>) -> Self {
        Self { gas_limit, transactions }
    }

    pub fn len(&self) -> usize {
        self.transactions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.transactions.is_empty()
    }
}

/// Receipt of one applied transaction.
///
/// `cumulative_gas_used` is zero until result extraction fills it in.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Receipt {
    pub tx_index: TxnIndex,
    pub success: bool,
    pub gas_used: u64,
    pub cumulative_gas_used: u64,
    pub logs: Vec<Log>,
}

impl Receipt {
    pub fn new(tx_index: TxnIndex, gas_used: u64, logs: Vec<Log>) -> Self {
        Self {
            tx_index,
            success: true,
            gas_used,
            cumulative_gas_used: 0,
            logs,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_watermark_progression() {
        let mut watermark = Watermark::GENESIS;
        assert_eq!(watermark.to_string(), "-1");
        assert_eq!(watermark.next_index(), 0);
        assert!(!watermark.covers(0));

        // Skipping an index is refused.
        assert_eq!(watermark.advance_to(1), None);

        watermark = watermark.advance_to(0).unwrap();
        watermark = watermark.advance_to(1).unwrap();
        assert_eq!(watermark.last(), Some(1));
        assert!(watermark.covers(0));
        assert!(watermark.covers(1));
        assert!(!watermark.covers(2));
        assert_eq!(watermark.to_string(), "1");

        // Re-merging an index is refused.
        assert_eq!(watermark.advance_to(1), None);
    }

    #[test]
    fn test_watermark_ordering() {
        assert!(Watermark::GENESIS < Watermark::at(0));
        assert!(Watermark::at(0) < Watermark::at(3));
    }
}
