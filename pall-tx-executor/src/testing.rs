//! Test helpers: addresses, signing accounts and unsigned transfers.

use crate::memory::TRANSFER_GAS;
use crate::types::Transaction;
use alloy_primitives::{keccak256, Address, Signature, U256};
use k256::ecdsa::{SigningKey, VerifyingKey};
use rand::{rngs::StdRng, Rng, SeedableRng};

pub fn addr(byte: u8) -> Address {
    Address::with_last_byte(byte)
}

/// A transfer with a placeholder signature; only valid with verification off.
pub fn transfer(from: Address, to: Address, value: u64, nonce: u64) -> Transaction {
    Transaction {
        from,
        to: Some(to),
        value: U256::from(value),
        nonce,
        gas_limit: TRANSFER_GAS,
        gas_price: 1,
        chain_id: 1,
        signature: Signature::new(U256::from(1), U256::from(1), false),
    }
}

/// A test account with signing key.
pub struct TestAccount {
    signing_key: SigningKey,
    pub address: Address,
}

impl TestAccount {
    pub fn from_seed(seed: u64) -> Self {
        let mut rng = StdRng::seed_from_u64(seed);
        let mut key_bytes = [0u8; 32];
        rng.fill(&mut key_bytes);
        let signing_key = SigningKey::from_bytes(&key_bytes.into()).expect("valid key bytes");
        let encoded = VerifyingKey::from(&signing_key).to_encoded_point(false);
        let hash = keccak256(&encoded.as_bytes()[1..]);
        Self {
            signing_key,
            address: Address::from_slice(&hash[12..]),
        }
    }

    pub fn sign_transfer(&self, to: Address, value: U256, nonce: u64) -> Transaction {
        let mut tx = Transaction {
            from: self.address,
            to: Some(to),
            value,
            nonce,
            gas_limit: TRANSFER_GAS,
            gas_price: 1,
            chain_id: 1,
            signature: Signature::new(U256::from(1), U256::from(1), false),
        };
        let (sig, recovery_id) = self
            .signing_key
            .sign_prehash_recoverable(tx.signing_hash().as_slice())
            .expect("signing should succeed");
        tx.signature = Signature::from_signature_and_parity(sig, recovery_id.is_y_odd());
        tx
    }
}
