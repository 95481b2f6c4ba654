//! Benchmarking framework for grouped speculative block execution.
//!
//! This crate generates ETH transfer workloads and runs them through
//! different executors: a revm-backed sequential baseline and the grouped
//! parallel executor from `pall-tx-executor`. Both operate on a revm
//! `CacheDB`, so their final states can be compared directly.
//!
//! # Architecture
//!
//! - **Workload**: A pre-generated set of signed transactions and accounts
//! - **Executor**: A strategy for executing a workload (sequential, grouped)
//! - **Database**: The revm `CacheDB` both strategies start from and return
//!
//! # Quick Start
//!
//! ```
//! use pall_test::{Executor, GroupedExecutor, Workload, WorkloadConfig};
//!
//! let config = WorkloadConfig {
//!     num_accounts: 100,
//!     num_transactions: 50,
//!     ..Default::default()
//! };
//!
//! // Generate workload (signs all transactions upfront)
//! let workload = Workload::generate(config).unwrap();
//! let db = workload.create_db();
//!
//! let executor = GroupedExecutor::new(4, true);
//! let (_final_db, result) = executor.execute(db, &workload).unwrap();
//!
//! assert_eq!(result.successful, 50);
//! ```

pub mod executor;

pub use executor::{ExecutionResult, Executor, GroupedExecutor, SequentialExecutor};

use alloy_primitives::{keccak256, uint, Address, Signature, B256, U256};
use eyre::eyre;
use k256::ecdsa::{SigningKey, VerifyingKey};
use pall_tx_executor::{
    signing_hash, AccountState, Block, MemoryState, Transaction, TRANSFER_GAS,
};
use rand::{rngs::StdRng, Rng, SeedableRng};
use revm::{
    database::{CacheDB, EmptyDB},
    state::AccountInfo,
};
use std::collections::HashMap;

/// Fee recipient of every generated block; revm's default beneficiary.
pub const COINBASE: Address = Address::ZERO;

/// Starting balance of every workload account (1000 ETH).
pub const INITIAL_BALANCE: U256 = uint!(1_000_000_000_000_000_000_000_U256);

/// Value moved by every generated transfer (0.001 ETH).
pub const TRANSFER_VALUE: u64 = 1_000_000_000_000_000;

// ============================================================================
// Account & Key Management
// ============================================================================

/// An account with its signing key for transaction signing.
#[derive(Clone)]
pub struct Account {
    /// The secp256k1 signing key.
    pub signing_key: SigningKey,
    /// The Ethereum address derived from the public key.
    pub address: Address,
}

impl Account {
    /// Creates a new account from a signing key.
    pub fn from_signing_key(signing_key: SigningKey) -> Self {
        let verifying_key = VerifyingKey::from(&signing_key);
        let address = public_key_to_address(&verifying_key);
        Self {
            signing_key,
            address,
        }
    }

    /// Generates a deterministic account from a seed.
    pub fn from_seed(seed: u64) -> Self {
        let mut rng = StdRng::seed_from_u64(seed);
        Self::from_signing_key(SigningKey::random(&mut rng))
    }
}

impl std::fmt::Debug for Account {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Account")
            .field("address", &self.address)
            .finish()
    }
}

/// Derives an Ethereum address from a secp256k1 public key.
fn public_key_to_address(verifying_key: &VerifyingKey) -> Address {
    let public_key_bytes = verifying_key.to_encoded_point(false);
    // Skip the 0x04 prefix byte, hash the rest.
    let hash = keccak256(&public_key_bytes.as_bytes()[1..]);
    Address::from_slice(&hash[12..])
}

// ============================================================================
// Signed Transaction
// ============================================================================

/// A signed ETH transfer ready for execution.
#[derive(Debug, Clone)]
pub struct SignedTransaction {
    pub from: Address,
    pub to: Address,
    /// The value to transfer in wei.
    pub value: U256,
    pub nonce: u64,
    pub gas_price: u128,
    pub chain_id: u64,
    pub signature: Signature,
}

impl SignedTransaction {
    /// Creates and signs a transfer.
    ///
    /// The signature covers a simplified hash of
    /// `(from, to, value, nonce, gas_limit, gas_price, chain_id)`.
    pub fn new(
        account: &Account,
        to: Address,
        value: U256,
        nonce: u64,
        gas_price: u128,
        chain_id: u64,
    ) -> eyre::Result<Self> {
        let tx_hash = signing_hash(
            account.address,
            Some(to),
            value,
            nonce,
            TRANSFER_GAS,
            gas_price,
            chain_id,
        );
        let signature = Self::sign(&account.signing_key, tx_hash)?;

        Ok(Self {
            from: account.address,
            to,
            value,
            nonce,
            gas_price,
            chain_id,
            signature,
        })
    }

    /// The hash the signature covers, computed from the current fields.
    pub fn tx_hash(&self) -> B256 {
        signing_hash(
            self.from,
            Some(self.to),
            self.value,
            self.nonce,
            TRANSFER_GAS,
            self.gas_price,
            self.chain_id,
        )
    }

    fn sign(signing_key: &SigningKey, tx_hash: B256) -> eyre::Result<Signature> {
        let (sig, recovery_id) = signing_key
            .sign_prehash_recoverable(tx_hash.as_slice())
            .map_err(|err| eyre!("signing {tx_hash} failed: {err}"))?;

        Ok(Signature::from_signature_and_parity(
            sig,
            recovery_id.is_y_odd(),
        ))
    }

    /// Recovers the sender's address from the signature.
    /// Returns None if signature verification fails.
    pub fn recover_signer(&self) -> Option<Address> {
        self.signature
            .recover_address_from_prehash(&self.tx_hash())
            .ok()
    }

    /// Verifies the signature and returns true if valid.
    pub fn verify(&self) -> bool {
        self.recover_signer() == Some(self.from)
    }

    /// Converts into the executor's transaction type.
    pub fn to_block_transaction(&self) -> Transaction {
        Transaction {
            from: self.from,
            to: Some(self.to),
            value: self.value,
            nonce: self.nonce,
            gas_limit: TRANSFER_GAS,
            gas_price: self.gas_price,
            chain_id: self.chain_id,
            signature: self.signature,
        }
    }
}

// ============================================================================
// Workload Configuration & Generation
// ============================================================================

/// Configuration for workload generation.
#[derive(Debug, Clone)]
pub struct WorkloadConfig {
    /// Total number of accounts in the system.
    pub num_accounts: usize,
    /// Number of transactions to generate.
    pub num_transactions: usize,
    /// Conflict factor: 0.0 = no conflicts, 1.0 = all transactions touch the same two accounts.
    pub conflict_factor: f64,
    /// Random seed for reproducibility.
    pub seed: u64,
    /// Chain ID for transaction signing.
    pub chain_id: u64,
    pub gas_price: u128,
    /// Gas limit of the generated block.
    pub block_gas_limit: u64,
}

impl Default for WorkloadConfig {
    fn default() -> Self {
        Self {
            num_accounts: 1000,
            num_transactions: 100,
            conflict_factor: 0.0,
            seed: 42,
            chain_id: 1,
            gas_price: 1,
            block_gas_limit: 30_000_000,
        }
    }
}

/// A complete benchmark workload with pre-generated accounts and signed transactions.
#[derive(Debug, Clone)]
pub struct Workload {
    /// The accounts (with signing keys) participating in this workload.
    pub accounts: Vec<Account>,
    /// The pre-signed transactions to execute, in block order.
    pub transactions: Vec<SignedTransaction>,
    /// The configuration used to generate this workload.
    pub config: WorkloadConfig,
}

impl Workload {
    /// Generates a new workload from the given configuration.
    /// All transactions are pre-signed during generation.
    pub fn generate(config: WorkloadConfig) -> eyre::Result<Self> {
        if config.num_accounts < 2 {
            return Err(eyre!(
                "workload needs at least 2 accounts, got {}",
                config.num_accounts
            ));
        }
        let mut rng = StdRng::seed_from_u64(config.seed);

        // Generate accounts with deterministic keys.
        let accounts: Vec<Account> = (0..config.num_accounts)
            .map(|i| Account::from_seed(config.seed.wrapping_add(i as u64)))
            .collect();

        // Track nonces per account for proper transaction sequencing.
        let mut nonces: HashMap<usize, u64> = HashMap::new();

        // Calculate "hot" account range for conflict simulation.
        let hot_account_count = if config.conflict_factor > 0.0 {
            (2.0 + (1.0 - config.conflict_factor) * (config.num_accounts as f64 - 2.0)).max(2.0)
                as usize
        } else {
            config.num_accounts
        };

        let mut transactions = Vec::with_capacity(config.num_transactions);
        for _ in 0..config.num_transactions {
            let use_hot = rng.gen::<f64>() < config.conflict_factor;
            let pool = if use_hot {
                hot_account_count
            } else {
                config.num_accounts
            };

            let from_idx = rng.gen_range(0..pool);
            let mut to_idx = rng.gen_range(0..pool);
            while to_idx == from_idx {
                to_idx = rng.gen_range(0..pool);
            }

            let nonce = nonces.entry(from_idx).or_insert(0);
            transactions.push(SignedTransaction::new(
                &accounts[from_idx],
                accounts[to_idx].address,
                U256::from(TRANSFER_VALUE),
                *nonce,
                config.gas_price,
                config.chain_id,
            )?);
            *nonce += 1;
        }

        Ok(Self {
            accounts,
            transactions,
            config,
        })
    }

    /// Creates a CacheDB pre-funded with all accounts in this workload.
    pub fn create_db(&self) -> CacheDB<EmptyDB> {
        let mut db = CacheDB::new(EmptyDB::default());
        for account in &self.accounts {
            let info = AccountInfo {
                balance: INITIAL_BALANCE,
                nonce: 0,
                code_hash: revm::primitives::KECCAK_EMPTY,
                code: None,
            };
            db.insert_account_info(account.address, info);
        }
        db
    }

    /// Creates an in-memory base state pre-funded with all accounts in this workload.
    pub fn create_state(&self) -> MemoryState {
        MemoryState::with_accounts(
            COINBASE,
            self.accounts
                .iter()
                .map(|account| (account.address, AccountState::new(0, INITIAL_BALANCE))),
        )
    }

    /// The workload as one block for the grouped executor.
    pub fn block(&self) -> Block<Transaction> {
        Block::new(
            self.config.block_gas_limit,
            self.transactions
                .iter()
                .map(SignedTransaction::to_block_transaction)
                .collect(),
        )
    }
}

// ============================================================================
// Tests
// ============================================================================
