//! Deterministic accounts and pre-signed transfer blocks.

use crate::transfer::{balance_key, nonce_key, store_keys, BankState};
use alloy_primitives::{keccak256, Address, Signature, B256, U256};
use block_stm_executor::{KVStore, MultiMemDB, MultiStore};
use k256::ecdsa::{SigningKey, VerifyingKey};
use rand::{rngs::StdRng, Rng, SeedableRng};

/// Balance every account starts with (1000 ETH).
pub const INITIAL_BALANCE: u128 = 1_000_000_000_000_000_000_000;

/// Value moved by every generated transfer (0.001 ETH).
pub const TRANSFER_VALUE: u64 = 1_000_000_000_000_000;

/// Length of an encoded transfer: from, to, value, nonce, r, s, parity, hash.
pub const PAYLOAD_LEN: usize = 20 + 20 + 32 + 8 + 32 + 32 + 1 + 32;

// ============================================================================
// Accounts
// ============================================================================

/// A secp256k1 key pair and the address it controls.
#[derive(Clone)]
pub struct Account {
    pub signing_key: SigningKey,
    pub address: Address,
}

impl Account {
    pub fn new(signing_key: SigningKey) -> Self {
        // Uncompressed SEC1 point without its 0x04 tag.
        let point = VerifyingKey::from(&signing_key).to_encoded_point(false);
        let address = Address::from_slice(&keccak256(&point.as_bytes()[1..])[12..]);
        Self { signing_key, address }
    }

    /// Same seed, same account.
    pub fn from_seed(seed: u64) -> Self {
        let mut rng = StdRng::seed_from_u64(seed);
        loop {
            let secret: [u8; 32] = rng.gen();
            if let Ok(signing_key) = SigningKey::from_bytes(&secret.into()) {
                return Self::new(signing_key);
            }
        }
    }
}

impl std::fmt::Debug for Account {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Account({})", self.address)
    }
}

// ============================================================================
// Transfers
// ============================================================================

/// A transfer signed over `keccak(from | to | value | nonce | chain_id)`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignedTransaction {
    pub from: Address,
    pub to: Address,
    pub value: U256,
    pub nonce: u64,
    pub signature: Signature,
    pub tx_hash: B256,
}

impl SignedTransaction {
    pub fn new(account: &Account, to: Address, value: U256, nonce: u64, chain_id: u64) -> Self {
        let tx_hash = signing_hash(account.address, to, value, nonce, chain_id);
        let (sig, recovery_id) = account
            .signing_key
            .sign_prehash_recoverable(tx_hash.as_slice())
            .expect("32-byte prehash");

        Self {
            from: account.address,
            to,
            value,
            nonce,
            signature: Signature::from_signature_and_parity(sig, recovery_id.is_y_odd()),
            tx_hash,
        }
    }

    pub fn recover_signer(&self) -> Option<Address> {
        self.signature.recover_address_from_prehash(&self.tx_hash).ok()
    }

    /// True when the signature recovers to `from`.
    pub fn verify(&self) -> bool {
        self.recover_signer() == Some(self.from)
    }

    /// Opaque payload handed to the executors.
    pub fn encode(&self) -> Vec<u8> {
        let mut payload = Vec::with_capacity(PAYLOAD_LEN);
        payload.extend_from_slice(self.from.as_slice());
        payload.extend_from_slice(self.to.as_slice());
        payload.extend_from_slice(&self.value.to_be_bytes::<32>());
        payload.extend_from_slice(&self.nonce.to_be_bytes());
        payload.extend_from_slice(&self.signature.r().to_be_bytes::<32>());
        payload.extend_from_slice(&self.signature.s().to_be_bytes::<32>());
        payload.push(u8::from(self.signature.v()));
        payload.extend_from_slice(self.tx_hash.as_slice());
        payload
    }

    /// Inverse of [`SignedTransaction::encode`]. `None` on a wrong length or parity
    /// byte.
    pub fn decode(payload: &[u8]) -> Option<Self> {
        if payload.len() != PAYLOAD_LEN {
            return None;
        }
        let mut fields = Fields(payload);
        let from = Address::from_slice(fields.take(20));
        let to = Address::from_slice(fields.take(20));
        let value = U256::from_be_slice(fields.take(32));
        let nonce = u64::from_be_bytes(fields.take(8).try_into().ok()?);
        let r = U256::from_be_slice(fields.take(32));
        let s = U256::from_be_slice(fields.take(32));
        let parity = match fields.take(1) {
            [0] => false,
            [1] => true,
            _ => return None,
        };
        let tx_hash = B256::from_slice(fields.take(32));

        Some(Self {
            from,
            to,
            value,
            nonce,
            signature: Signature::new(r, s, parity),
            tx_hash,
        })
    }
}

fn signing_hash(from: Address, to: Address, value: U256, nonce: u64, chain_id: u64) -> B256 {
    let mut preimage = [0u8; 20 + 20 + 32 + 8 + 8];
    preimage[..20].copy_from_slice(from.as_slice());
    preimage[20..40].copy_from_slice(to.as_slice());
    preimage[40..72].copy_from_slice(&value.to_be_bytes::<32>());
    preimage[72..80].copy_from_slice(&nonce.to_be_bytes());
    preimage[80..].copy_from_slice(&chain_id.to_be_bytes());
    keccak256(preimage)
}

/// Cursor over a payload whose length was already checked.
struct Fields<'a>(&'a [u8]);

impl<'a> Fields<'a> {
    fn take(&mut self, n: usize) -> &'a [u8] {
        let (head, tail) = self.0.split_at(n);
        self.0 = tail;
        head
    }
}

// ============================================================================
// Workload
// ============================================================================

#[derive(Debug, Clone)]
pub struct WorkloadConfig {
    pub num_accounts: usize,
    pub num_transactions: usize,
    /// Probability that a transfer is drawn from the hot set instead of all
    /// accounts. The hot set shrinks towards two accounts as this approaches 1.0.
    pub conflict_factor: f64,
    pub seed: u64,
    pub chain_id: u64,
}

impl Default for WorkloadConfig {
    fn default() -> Self {
        Self {
            num_accounts: 1000,
            num_transactions: 100,
            conflict_factor: 0.0,
            seed: 42,
            chain_id: 1,
        }
    }
}

/// A block of transfers, signed and encoded ahead of execution.
#[derive(Debug, Clone)]
pub struct Workload {
    pub accounts: Vec<Account>,
    pub transactions: Vec<SignedTransaction>,
    pub payloads: Vec<Vec<u8>>,
    pub config: WorkloadConfig,
}

impl Workload {
    /// Panics with fewer than two accounts.
    pub fn generate(config: WorkloadConfig) -> Self {
        assert!(config.num_accounts >= 2, "a transfer needs two distinct accounts");

        let accounts: Vec<Account> = (0..config.num_accounts as u64)
            .map(|i| Account::from_seed(config.seed.wrapping_add(i)))
            .collect();
        let hot_set = hot_set_size(config.num_accounts, config.conflict_factor);

        let mut rng = StdRng::seed_from_u64(config.seed);
        let mut next_nonce = vec![0u64; config.num_accounts];
        let mut transactions = Vec::with_capacity(config.num_transactions);
        for _ in 0..config.num_transactions {
            let pool = if rng.gen_bool(config.conflict_factor.clamp(0.0, 1.0)) {
                hot_set
            } else {
                config.num_accounts
            };
            let from = rng.gen_range(0..pool);
            // Shift past `from` so the receiver is always distinct.
            let to = (from + rng.gen_range(1..pool)) % pool;

            transactions.push(SignedTransaction::new(
                &accounts[from],
                accounts[to].address,
                U256::from(TRANSFER_VALUE),
                next_nonce[from],
                config.chain_id,
            ));
            next_nonce[from] += 1;
        }

        let payloads = transactions.iter().map(SignedTransaction::encode).collect();
        Self {
            accounts,
            transactions,
            payloads,
            config,
        }
    }

    /// Initial state: every account at nonce 0 with [`INITIAL_BALANCE`].
    pub fn genesis(&self) -> BankState {
        let (acc, bank) = store_keys();
        let mut state = MultiMemDB::new([acc.clone(), bank.clone()]);
        let balance = U256::from(INITIAL_BALANCE).to_be_bytes::<32>().to_vec();

        if let Some(nonces) = state.get_kv_store_mut(&acc) {
            for account in &self.accounts {
                nonces.set(&nonce_key(&account.address), 0u64.to_be_bytes().to_vec());
            }
        }
        if let Some(balances) = state.get_kv_store_mut(&bank) {
            for account in &self.accounts {
                balances.set(&balance_key(&account.address), balance.clone());
            }
        }
        state
    }
}

fn hot_set_size(num_accounts: usize, conflict_factor: f64) -> usize {
    if conflict_factor <= 0.0 {
        return num_accounts;
    }
    let cold = (1.0 - conflict_factor.min(1.0)) * (num_accounts - 2) as f64;
    2 + cold as usize
}
