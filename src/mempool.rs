// Transaction Mempool
//
// Bounded, prioritized store of validated but not-yet-included
// transactions. Admission is single-flight per transaction hash; capacity
// pressure evicts by ascending fee-per-byte (oldest first on ties), and
// every entry carries a TTL enforced lazily on access plus via an explicit
// sweep. Per-sender nonces stay contiguous: evicting a transaction also
// evicts its higher-nonce descendants, which could never be included
// without it.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use crate::crypto::hash::Hash;
use crate::crypto::keys::Address;
use crate::primitives::account::AccountView;
use crate::primitives::transaction::{Transaction, TxError};

#[derive(Debug, Clone, Copy)]
pub struct MempoolConfig {
    pub max_count: usize,
    pub max_bytes: usize,
    pub ttl: Duration,
    pub max_per_sender: usize,
}

impl Default for MempoolConfig {
    fn default() -> Self {
        MempoolConfig {
            max_count: 5000,
            max_bytes: 4 * 1024 * 1024,
            ttl: Duration::from_secs(600),
            max_per_sender: 64,
        }
    }
}

#[derive(Debug, Clone)]
struct MempoolEntry {
    tx: Transaction,
    size: usize,
    /// fee * 10000 / size, integer-only so ordering is identical on every
    /// platform.
    fee_per_byte_scaled: u64,
    admitted_at: Instant,
    seq: u64,
}

#[derive(Default)]
struct Inner {
    entries: HashMap<Hash, MempoolEntry>,
    /// sender -> nonce -> tx hash; nonces in here are contiguous from the
    /// committed account nonce upward.
    by_sender: HashMap<Address, BTreeMap<u64, Hash>>,
    /// Hashes currently being validated; coalesces concurrent submissions.
    in_flight: HashSet<Hash>,
    bytes: usize,
    seq: u64,
}

pub struct Mempool {
    inner: Mutex<Inner>,
    config: MempoolConfig,
}

impl Mempool {
    pub fn new(config: MempoolConfig) -> Self {
        Mempool {
            inner: Mutex::new(Inner::default()),
            config,
        }
    }

    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn bytes(&self) -> usize {
        self.lock().bytes
    }

    pub fn contains(&self, hash: &Hash) -> bool {
        self.lock().entries.contains_key(hash)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        // A poisoned pool cannot be recovered meaningfully; the panic that
        // poisoned it is the real failure.
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Admits a transaction. Exactly one validation runs per hash even
    /// under concurrent submission: the hash is parked in `in_flight`
    /// while the (CPU-heavy) signature check runs outside the lock.
    pub fn insert(&self, tx: Transaction, accounts: &dyn AccountView) -> Result<Hash, TxError> {
        let hash = tx.hash();
        let now = Instant::now();

        {
            let mut inner = self.lock();
            Self::drop_expired(&mut inner, now, self.config.ttl);
            if inner.entries.contains_key(&hash) || !inner.in_flight.insert(hash) {
                return Err(TxError::Duplicate(hex::encode(hash)));
            }
        }

        // Validation outside the lock; always release the in-flight mark.
        let verdict = self.validate_for_admission(&tx);
        let mut inner = self.lock();
        inner.in_flight.remove(&hash);
        verdict?;

        let sender = tx.sender_address();
        let pending = inner.by_sender.get(&sender);
        let pending_count = pending.map(|p| p.len()).unwrap_or(0);
        if pending_count >= self.config.max_per_sender {
            return Err(TxError::SenderQueueFull);
        }

        let committed = accounts.account(&sender);
        let expected_nonce = committed.nonce + pending_count as u64;
        if tx.nonce != expected_nonce {
            return Err(TxError::BadNonce {
                expected: expected_nonce,
                got: tx.nonce,
            });
        }

        let pending_spend: i64 = pending
            .map(|p| {
                p.values()
                    .filter_map(|h| inner.entries.get(h))
                    .map(|e| e.tx.total_spend())
                    .sum()
            })
            .unwrap_or(0);
        let required = pending_spend.saturating_add(tx.total_spend());
        if committed.balance < required {
            return Err(TxError::InsufficientBalance {
                balance: committed.balance,
                required,
            });
        }

        let size = tx.encoded_len();
        let fee_per_byte_scaled = (tx.fee as u64).saturating_mul(10_000) / size.max(1) as u64;

        // Capacity pressure: evict ascending fee/byte, but never evict a
        // better-paying entry in favor of a worse-paying newcomer.
        while inner.entries.len() >= self.config.max_count
            || inner.bytes + size > self.config.max_bytes
        {
            let worst = inner
                .entries
                .iter()
                .min_by_key(|(_, e)| (e.fee_per_byte_scaled, e.seq))
                .map(|(h, e)| (*h, e.fee_per_byte_scaled));
            let Some((worst_hash, worst_rate)) = worst else {
                return Err(TxError::MempoolFull);
            };
            if worst_rate >= fee_per_byte_scaled {
                return Err(TxError::MempoolFull);
            }
            Self::remove_with_descendants(&mut inner, &worst_hash);
        }

        let seq = inner.seq;
        inner.seq += 1;
        inner.bytes += size;
        inner
            .by_sender
            .entry(sender)
            .or_default()
            .insert(tx.nonce, hash);
        inner.entries.insert(
            hash,
            MempoolEntry {
                tx,
                size,
                fee_per_byte_scaled,
                admitted_at: now,
                seq,
            },
        );
        Ok(hash)
    }

    fn validate_for_admission(&self, tx: &Transaction) -> Result<(), TxError> {
        tx.check_stateless()
    }

    /// Transactions for a block template: descending fee-per-byte with
    /// per-sender ascending nonce, bounded by count and total bytes.
    pub fn select(&self, max_txs: usize, max_bytes: usize) -> Vec<Transaction> {
        let mut inner = self.lock();
        Self::drop_expired(&mut inner, Instant::now(), self.config.ttl);

        // Only the lowest pending nonce of each sender is eligible at any
        // step; picking it may unlock the next one.
        let mut cursors: HashMap<Address, Vec<Hash>> = inner
            .by_sender
            .iter()
            .map(|(sender, nonces)| (*sender, nonces.values().rev().copied().collect()))
            .collect();

        let mut selected = Vec::new();
        let mut used_bytes = 0usize;
        while selected.len() < max_txs {
            let mut best: Option<(u64, u64, u64, Address)> = None;
            for (sender, stack) in &cursors {
                let Some(hash) = stack.last() else { continue };
                let Some(entry) = inner.entries.get(hash) else {
                    continue;
                };
                if used_bytes + entry.size > max_bytes {
                    continue;
                }
                let key = (entry.fee_per_byte_scaled, entry.tx.nonce, entry.seq);
                let better = match &best {
                    None => true,
                    Some((rate, nonce, seq, _)) => {
                        key.0 > *rate
                            || (key.0 == *rate
                                && (key.1 < *nonce || (key.1 == *nonce && key.2 < *seq)))
                    }
                };
                if better {
                    best = Some((key.0, key.1, key.2, *sender));
                }
            }

            let Some((_, _, _, sender)) = best else { break };
            let Some(hash) = cursors.get_mut(&sender).and_then(|stack| stack.pop()) else {
                break;
            };
            if let Some(entry) = inner.entries.get(&hash) {
                used_bytes += entry.size;
                selected.push(entry.tx.clone());
            }
        }
        selected
    }

    /// Removes transactions included in an accepted block.
    pub fn remove_included(&self, hashes: &[Hash]) {
        let mut inner = self.lock();
        for hash in hashes {
            Self::remove_entry(&mut inner, hash);
        }
    }

    /// Proactive TTL sweep; returns how many entries were dropped.
    pub fn sweep_expired(&self) -> usize {
        let mut inner = self.lock();
        Self::drop_expired(&mut inner, Instant::now(), self.config.ttl)
    }

    /// Fetch by hash, enforcing TTL on access. Unknown hashes report the
    /// same way as lapsed ones: the entry is gone.
    pub fn get(&self, hash: &Hash) -> Result<Transaction, TxError> {
        let mut inner = self.lock();
        let Some(entry) = inner.entries.get(hash).cloned() else {
            return Err(TxError::Expired);
        };
        if entry.admitted_at.elapsed() > self.config.ttl {
            Self::remove_with_descendants(&mut inner, hash);
            return Err(TxError::Expired);
        }
        Ok(entry.tx)
    }

    fn drop_expired(inner: &mut Inner, now: Instant, ttl: Duration) -> usize {
        let expired: Vec<Hash> = inner
            .entries
            .iter()
            .filter(|(_, e)| now.duration_since(e.admitted_at) > ttl)
            .map(|(h, _)| *h)
            .collect();
        for hash in &expired {
            Self::remove_with_descendants(inner, hash);
        }
        expired.len()
    }

    fn remove_entry(inner: &mut Inner, hash: &Hash) -> Option<MempoolEntry> {
        let entry = inner.entries.remove(hash)?;
        inner.bytes -= entry.size;
        let sender = entry.tx.sender_address();
        if let Some(nonces) = inner.by_sender.get_mut(&sender) {
            nonces.remove(&entry.tx.nonce);
            if nonces.is_empty() {
                inner.by_sender.remove(&sender);
            }
        }
        Some(entry)
    }

    /// Removes an entry and every higher-nonce entry of the same sender;
    /// those can no longer satisfy the strict nonce sequence.
    fn remove_with_descendants(inner: &mut Inner, hash: &Hash) {
        let Some(entry) = Self::remove_entry(inner, hash) else {
            return;
        };
        let sender = entry.tx.sender_address();
        let descendants: Vec<Hash> = inner
            .by_sender
            .get(&sender)
            .map(|nonces| {
                nonces
                    .range(entry.tx.nonce..)
                    .map(|(_, h)| *h)
                    .collect()
            })
            .unwrap_or_default();
        for hash in descendants {
            Self::remove_entry(inner, &hash);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::keys::Secp256k1Signer;
    use crate::primitives::account::AccountState;

    struct RichAccounts;

    impl AccountView for RichAccounts {
        fn account(&self, _address: &[u8]) -> AccountState {
            AccountState {
                balance: 1_000_000,
                nonce: 0,
            }
        }
    }

    fn signer(id: u8) -> Secp256k1Signer {
        Secp256k1Signer::from_secret_bytes(&[id; 32]).unwrap()
    }

    fn tx_from(id: u8, nonce: u64, fee: i64) -> Transaction {
        Transaction::signed(&signer(id), vec![0xEE; 32], 100, fee, nonce).unwrap()
    }

    fn pool(max_count: usize) -> Mempool {
        Mempool::new(MempoolConfig {
            max_count,
            ..Default::default()
        })
    }

    #[test]
    fn test_admit_and_select() {
        let pool = pool(100);
        let hash = pool.insert(tx_from(1, 0, 10), &RichAccounts).unwrap();
        assert!(pool.contains(&hash));
        assert_eq!(pool.select(10, usize::MAX).len(), 1);
    }

    #[test]
    fn test_duplicate_rejected() {
        let pool = pool(100);
        let tx = tx_from(1, 0, 10);
        pool.insert(tx.clone(), &RichAccounts).unwrap();
        assert!(matches!(
            pool.insert(tx, &RichAccounts),
            Err(TxError::Duplicate(_))
        ));
    }

    #[test]
    fn test_nonce_must_be_contiguous() {
        let pool = pool(100);
        pool.insert(tx_from(1, 0, 10), &RichAccounts).unwrap();
        // Gap: nonce 2 while 1 is expected.
        assert_eq!(
            pool.insert(tx_from(1, 2, 10), &RichAccounts),
            Err(TxError::BadNonce {
                expected: 1,
                got: 2
            })
        );
        pool.insert(tx_from(1, 1, 10), &RichAccounts).unwrap();
    }

    #[test]
    fn test_balance_covers_pending_aggregate() {
        struct Poor;
        impl AccountView for Poor {
            fn account(&self, _a: &[u8]) -> AccountState {
                AccountState {
                    balance: 250,
                    nonce: 0,
                }
            }
        }
        let pool = pool(100);
        // Each tx spends 100 + 10; the third pushes past 250.
        pool.insert(tx_from(1, 0, 10), &Poor).unwrap();
        pool.insert(tx_from(1, 1, 10), &Poor).unwrap();
        assert!(matches!(
            pool.insert(tx_from(1, 2, 10), &Poor),
            Err(TxError::InsufficientBalance { .. })
        ));
    }

    #[test]
    fn test_eviction_scenario() {
        // Capacity 3: admit fee 5, 10, 1; submitting fee 7 evicts fee 1,
        // and a 2-tx template takes fees 10 then 7.
        let pool = pool(3);
        pool.insert(tx_from(1, 0, 5), &RichAccounts).unwrap();
        pool.insert(tx_from(2, 0, 10), &RichAccounts).unwrap();
        let tx3 = pool.insert(tx_from(3, 0, 1), &RichAccounts).unwrap();
        pool.insert(tx_from(4, 0, 7), &RichAccounts).unwrap();

        assert_eq!(pool.len(), 3);
        assert!(!pool.contains(&tx3));

        let selected = pool.select(2, usize::MAX);
        assert_eq!(selected.len(), 2);
        assert_eq!(selected[0].fee, 10);
        assert_eq!(selected[1].fee, 7);
    }

    #[test]
    fn test_full_pool_rejects_worse_paying() {
        let pool = pool(2);
        pool.insert(tx_from(1, 0, 50), &RichAccounts).unwrap();
        pool.insert(tx_from(2, 0, 60), &RichAccounts).unwrap();
        assert!(matches!(
            pool.insert(tx_from(3, 0, 10), &RichAccounts),
            Err(TxError::MempoolFull)
        ));
        assert_eq!(pool.len(), 2);
    }

    #[test]
    fn test_selection_preserves_sender_nonce_order() {
        let pool = pool(100);
        // Later nonce pays more; selection must still emit 0 before 1.
        pool.insert(tx_from(1, 0, 5), &RichAccounts).unwrap();
        pool.insert(tx_from(1, 1, 500), &RichAccounts).unwrap();
        pool.insert(tx_from(2, 0, 50), &RichAccounts).unwrap();

        let selected = pool.select(3, usize::MAX);
        let sender1 = signer(1).address();
        let nonces: Vec<u64> = selected
            .iter()
            .filter(|t| t.sender_address() == sender1)
            .map(|t| t.nonce)
            .collect();
        assert_eq!(nonces, vec![0, 1]);
        // The cross-sender leader is still the best unblocked rate.
        assert_eq!(selected[0].fee, 50);
    }

    #[test]
    fn test_sender_queue_cap() {
        let pool = Mempool::new(MempoolConfig {
            max_per_sender: 2,
            ..Default::default()
        });
        pool.insert(tx_from(1, 0, 10), &RichAccounts).unwrap();
        pool.insert(tx_from(1, 1, 10), &RichAccounts).unwrap();
        assert!(matches!(
            pool.insert(tx_from(1, 2, 10), &RichAccounts),
            Err(TxError::SenderQueueFull)
        ));
    }

    #[test]
    fn test_ttl_sweep() {
        let pool = Mempool::new(MempoolConfig {
            ttl: Duration::ZERO,
            ..Default::default()
        });
        let hash = pool.insert(tx_from(1, 0, 10), &RichAccounts).unwrap();
        std::thread::sleep(Duration::from_millis(5));
        assert_eq!(pool.sweep_expired(), 1);
        assert!(!pool.contains(&hash));
    }

    #[test]
    fn test_eviction_takes_descendants() {
        // Evicting a sender's nonce-0 entry must also drop its nonce-1
        // entry, even though the descendant pays well.
        let pool = pool(2);
        pool.insert(tx_from(1, 0, 1), &RichAccounts).unwrap();
        pool.insert(tx_from(1, 1, 100), &RichAccounts).unwrap();
        pool.insert(tx_from(2, 0, 50), &RichAccounts).unwrap();

        assert_eq!(pool.len(), 1);
        let remaining = pool.select(10, usize::MAX);
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].sender_address(), signer(2).address());
    }

    #[test]
    fn test_remove_included_clears_entries() {
        let pool = pool(100);
        let h = pool.insert(tx_from(1, 0, 10), &RichAccounts).unwrap();
        pool.remove_included(&[h]);
        assert!(pool.is_empty());
        assert_eq!(pool.bytes(), 0);
    }
}
