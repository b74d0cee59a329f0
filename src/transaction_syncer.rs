//! Mempool transaction intake and the outgoing broadcast retry policy

use crate::address_manager::AddressManager;
use crate::bloom::BloomFilterManager;
use crate::constants::*;
use crate::error::SpvError;
use crate::listener::DataProvider;
use crate::storage::Storage;
use crate::transaction_processor::{ProcessOutcome, TransactionProcessor};
use crate::types::*;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, info};

type Result<T> = std::result::Result<T, SpvError>;

/// When a pending outgoing transaction is announced again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub interval_secs: u64,
    pub window_secs: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy {
            max_retries: DEFAULT_MAX_RETRIES,
            interval_secs: DEFAULT_RETRY_INTERVAL_SECS,
            window_secs: DEFAULT_RETRY_WINDOW_SECS,
        }
    }
}

impl RetryPolicy {
    /// Never sent, or sent fewer than `max_retries` times in total, not within the
    /// last interval, and first sent inside the window.
    pub fn allows(&self, sent: Option<&SentTransaction>, now: u64) -> bool {
        match sent {
            None => true,
            Some(sent) => {
                Self::attempts(sent) < self.max_retries
                    && sent.last_send_time + self.interval_secs < now
                    && sent.first_send_time + self.window_secs > now
            }
        }
    }

    /// Broadcasts made so far; the first send is not a retry.
    fn attempts(sent: &SentTransaction) -> u32 {
        sent.retries_count.saturating_add(1)
    }
}

pub struct TransactionSyncer {
    storage: Arc<Storage>,
    processor: Arc<TransactionProcessor>,
    address_manager: Arc<AddressManager>,
    bloom_filter_manager: Arc<BloomFilterManager>,
    data_provider: Arc<DataProvider>,
    retry_policy: RetryPolicy,
}

impl TransactionSyncer {
    pub fn new(
        storage: Arc<Storage>,
        processor: Arc<TransactionProcessor>,
        address_manager: Arc<AddressManager>,
        bloom_filter_manager: Arc<BloomFilterManager>,
        data_provider: Arc<DataProvider>,
        retry_policy: RetryPolicy,
    ) -> Self {
        TransactionSyncer {
            storage,
            processor,
            address_manager,
            bloom_filter_manager,
            data_provider,
            retry_policy,
        }
    }

    /// HandleTransactions: unconfirmed transactions from a peer → ProcessOutcome
    ///
    /// Processing and gap filling commit together; the filter is rebuilt afterwards
    /// when a new output used a key from the last distributed gap.
    pub fn handle_transactions(&self, transactions: Vec<Transaction>) -> Result<ProcessOutcome> {
        if transactions.is_empty() {
            return Ok(ProcessOutcome::default());
        }
        let outcome = self.storage.with_transaction(|records| {
            let outcome = self.processor.process_incoming(records, transactions, None, false)?;
            if outcome.bloom_filter_expired {
                self.address_manager.fill_gap(records)?;
            }
            Ok::<_, SpvError>(outcome)
        })?;

        if outcome.bloom_filter_expired {
            self.storage.read(|records| self.bloom_filter_manager.regenerate(records));
        }
        if !outcome.is_empty() {
            debug!(inserted = outcome.inserted.len(), updated = outcome.updated.len(), "mempool transactions processed");
            self.data_provider.on_transactions_changed(&outcome);
        }
        Ok(outcome)
    }

    /// Record one broadcast of a pending outgoing transaction.
    pub fn handle_sent_transaction(&self, transaction: &Transaction) -> Result<()> {
        self.handle_sent_transaction_at(transaction, unix_time())
    }

    pub fn handle_sent_transaction_at(&self, transaction: &Transaction, now: u64) -> Result<()> {
        self.storage.with_transaction(|records| {
            let pending = records
                .transaction(&transaction.hash)
                .is_some_and(|tx| tx.status == TransactionStatus::New);
            if !pending {
                return Ok(());
            }
            let sent = match records.sent_transaction(&transaction.hash) {
                None => SentTransaction::new(transaction.hash, now),
                Some(existing) => {
                    let mut sent = existing.clone();
                    sent.retries_count += 1;
                    sent.last_send_time = now;
                    sent
                }
            };
            if RetryPolicy::attempts(&sent) >= self.retry_policy.max_retries {
                info!(hash = %hash_to_hex(&transaction.hash), "broadcast retries exhausted");
            }
            records.save_sent_transaction(sent);
            Ok::<_, SpvError>(())
        })
    }

    /// Outgoing transactions due for (re)broadcast.
    pub fn pending_transactions(&self) -> Vec<Transaction> {
        self.pending_transactions_at(unix_time())
    }

    pub fn pending_transactions_at(&self, now: u64) -> Vec<Transaction> {
        self.storage.read(|records| {
            records
                .pending_outgoing_transactions()
                .into_iter()
                .filter(|tx| tx.status == TransactionStatus::New)
                .filter(|tx| self.retry_policy.allows(records.sent_transaction(&tx.hash), now))
                .cloned()
                .collect()
        })
    }

    /// Announced transactions are fetched only when not already stored.
    pub fn should_request_transaction(&self, hash: &Hash) -> bool {
        !self.storage.read(|records| records.transaction_exists(hash))
    }
}
