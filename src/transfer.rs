//! Balance transfers over the `acc` and `bank` stores.
//!
//! `acc` maps an address to its nonce (8 bytes, big-endian). `bank` maps an address
//! to its balance (32 bytes, big-endian) and holds the fee collector's balance under
//! [`FEE_COLLECTOR_KEY`].

use crate::SignedTransaction;
use alloy_primitives::{Address, U256};
use block_stm_executor::{
    BlockStmError, KVStore, Key, MultiLocations, MultiMemDB, MultiStore, MultiView, StoreKey,
};
use std::collections::BTreeMap;

/// Base storage of the bank workload.
pub type BankState = MultiMemDB<Vec<u8>>;

pub const ACC_STORE: &str = "acc";
pub const BANK_STORE: &str = "bank";

/// Slots of the two stores in [`store_keys`] order.
pub const ACC_SLOT: usize = 0;
pub const BANK_SLOT: usize = 1;

pub const FEE_COLLECTOR_KEY: &[u8] = b"fee_collector";

/// Flat fee charged per transfer (21000 gas at 1 gwei).
pub const TRANSFER_FEE: u64 = 21_000_000_000_000;

/// Why a transfer was rejected. Rejected transfers write nothing.
#[derive(Debug, thiserror::Error)]
pub enum TransferError {
    #[error("malformed transaction payload")]
    Malformed,

    #[error("invalid signature for {0}")]
    InvalidSignature(Address),

    #[error("nonce mismatch for {address}: expected {expected}, got {got}")]
    NonceMismatch {
        address: Address,
        expected: u64,
        got: u64,
    },

    #[error("insufficient balance for {address}: have {balance}, need {needed}")]
    InsufficientBalance {
        address: Address,
        balance: U256,
        needed: U256,
    },

    #[error(transparent)]
    Store(#[from] BlockStmError),
}

pub fn store_keys() -> (StoreKey, StoreKey) {
    (StoreKey::new(ACC_STORE), StoreKey::new(BANK_STORE))
}

pub fn nonce_key(address: &Address) -> Key {
    address.to_vec()
}

pub fn balance_key(address: &Address) -> Key {
    address.to_vec()
}

fn decode_nonce(bytes: Option<Vec<u8>>) -> u64 {
    bytes
        .and_then(|bytes| <[u8; 8]>::try_from(bytes.as_slice()).ok())
        .map_or(0, u64::from_be_bytes)
}

fn decode_balance(bytes: Option<Vec<u8>>) -> U256 {
    bytes.map_or(U256::ZERO, |bytes| U256::from_be_slice(&bytes))
}

fn encode_balance(balance: U256) -> Vec<u8> {
    balance.to_be_bytes::<32>().to_vec()
}

/// Balance of `address` in a base state.
pub fn balance_of(state: &BankState, address: &Address) -> U256 {
    let (_, bank) = store_keys();
    decode_balance(
        state
            .get_kv_store(&bank)
            .and_then(|store| store.get(&balance_key(address))),
    )
}

/// Applies one encoded transfer to `view`.
///
/// Every check runs before the first write, so a rejected transfer leaves no trace
/// in the view.
pub fn apply_transfer<M: MultiView<Vec<u8>>>(
    view: &M,
    payload: &[u8],
    verify_signature: bool,
) -> Result<(), TransferError> {
    let tx = SignedTransaction::decode(payload).ok_or(TransferError::Malformed)?;
    if verify_signature && !tx.verify() {
        return Err(TransferError::InvalidSignature(tx.from));
    }

    let (acc_key, bank_key) = store_keys();
    let mut acc = view.store(&acc_key)?;
    let mut bank = view.store(&bank_key)?;

    let sender_nonce_key = nonce_key(&tx.from);
    let nonce = decode_nonce(acc.get(&sender_nonce_key));
    if nonce != tx.nonce {
        return Err(TransferError::NonceMismatch {
            address: tx.from,
            expected: nonce,
            got: tx.nonce,
        });
    }

    let fee = U256::from(TRANSFER_FEE);
    let needed = tx.value.saturating_add(fee);
    let sender_key = balance_key(&tx.from);
    let sender_balance = decode_balance(bank.get(&sender_key));
    if sender_balance < needed {
        return Err(TransferError::InsufficientBalance {
            address: tx.from,
            balance: sender_balance,
            needed,
        });
    }

    bank.set(&sender_key, encode_balance(sender_balance - needed));

    // Read the receiver after the debit: a self-transfer sees its own write.
    let receiver_key = balance_key(&tx.to);
    let receiver_balance = decode_balance(bank.get(&receiver_key));
    bank.set(&receiver_key, encode_balance(receiver_balance.saturating_add(tx.value)));

    let collected = decode_balance(bank.get(FEE_COLLECTOR_KEY));
    bank.set(FEE_COLLECTOR_KEY, encode_balance(collected.saturating_add(fee)));

    acc.set(&sender_nonce_key, (nonce + 1).to_be_bytes().to_vec());
    Ok(())
}

/// Locations a transfer payload is expected to write. Undecodable payloads yield
/// no estimate.
pub fn estimate_transfer(payload: &[u8]) -> MultiLocations {
    let Some(tx) = SignedTransaction::decode(payload) else {
        return MultiLocations::new();
    };
    BTreeMap::from([
        (ACC_SLOT, vec![nonce_key(&tx.from)]),
        (
            BANK_SLOT,
            vec![
                balance_key(&tx.from),
                balance_key(&tx.to),
                FEE_COLLECTOR_KEY.to_vec(),
            ],
        ),
    ])
}
