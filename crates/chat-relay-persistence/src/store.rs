use crate::db::{CF_BY_SEQ, CF_ITEMS, CF_META, CF_PENDING, CF_PENDING_BY_CHAT, CF_PROCESSING};
use crate::keys::{
    decode_chat_seq, decode_i64, decode_pending, decode_u64, encode_chat_seq, encode_i64, encode_pending,
    encode_u64,
};
use crate::{PersistenceError, Result};
use chat_relay_core::{ChatId, ItemId, Lease, SourceSeq, WorkItem, WorkStatus};
use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;
use rocksdb::{ColumnFamily, Direction, IteratorMode, WriteBatch, DB};
use serde::Serialize;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, warn};

const NEXT_ID_KEY: &[u8] = b"next_id";
const PROCESSED_COUNT_KEY: &[u8] = b"count_processed";
const ERROR_COUNT_KEY: &[u8] = b"count_error";

/// Number of lock stripes guarding per-chat state transitions
const CHAT_LOCK_STRIPES: usize = 64;

/// Item counts per status plus the resume cursor
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct QueueStats {
    pub pending: usize,
    pub processing: usize,
    pub processed: usize,
    pub error: usize,
    pub max_source_seq: SourceSeq,
}

impl QueueStats {
    pub fn count(&self, status: WorkStatus) -> usize {
        match status {
            WorkStatus::Pending => self.pending,
            WorkStatus::Processing => self.processing,
            WorkStatus::Processed => self.processed,
            WorkStatus::Error => self.error,
        }
    }

    pub fn total(&self) -> usize {
        self.pending + self.processing + self.processed + self.error
    }
}

/// Running totals of terminal items, persisted in `meta`
#[derive(Debug, Clone, Copy, Default)]
struct TerminalCounts {
    processed: u64,
    error: u64,
}

/// Durable work queue with per-chat claim affinity.
///
/// Layout:
/// - `items`: id -> bincode `WorkItem` (never deleted)
/// - `by_seq`: source seq -> id (duplicate detection, resume cursor)
/// - `pending`: source seq -> (id, chat), scanned in claim order
/// - `pending_by_chat`: (chat, source seq) -> id, same entries grouped by chat
/// - `processing`: chat -> id, at most one entry per chat
/// - `meta`: id counter and terminal item counts
///
/// Every state change touching a chat runs under that chat's lock stripe and
/// commits in a single write batch. `claim_next` only ever `try_lock`s, so a
/// claimer never waits behind a row another caller is working on.
pub struct WorkQueueStore {
    db: Arc<DB>,
    /// Next id to assign; the guard also serializes enqueues
    next_id: Mutex<ItemId>,
    chat_locks: Vec<Mutex<()>>,
    /// Held across the write batch of every terminal transition
    terminal: Mutex<TerminalCounts>,
}

impl WorkQueueStore {
    pub(crate) fn new(db: Arc<DB>) -> Result<Self> {
        let meta = db
            .cf_handle(CF_META)
            .ok_or_else(|| PersistenceError::Corrupt("Meta CF not found".to_string()))?;

        let read_counter = |key: &[u8], default: u64| -> Result<u64> {
            match db.get_cf(meta, key)? {
                Some(value) => decode_u64(&value),
                None => Ok(default),
            }
        };

        let next_id = read_counter(NEXT_ID_KEY, 1)?;
        let terminal = TerminalCounts {
            processed: read_counter(PROCESSED_COUNT_KEY, 0)?,
            error: read_counter(ERROR_COUNT_KEY, 0)?,
        };

        Ok(WorkQueueStore {
            db,
            next_id: Mutex::new(next_id),
            chat_locks: (0..CHAT_LOCK_STRIPES).map(|_| Mutex::new(())).collect(),
            terminal: Mutex::new(terminal),
        })
    }

    /// Insert a new pending item for `source_seq`.
    ///
    /// Fails with `DuplicateSourceSeq` if the sequence was already enqueued;
    /// the stored item is left untouched.
    pub fn enqueue(&self, source_seq: SourceSeq, chat_id: ChatId, payload: Vec<u8>) -> Result<ItemId> {
        let mut next_id = self.next_id.lock();

        let by_seq = self.cf(CF_BY_SEQ)?;
        let seq_key = encode_i64(source_seq);
        if self.db.get_cf(by_seq, seq_key)?.is_some() {
            return Err(PersistenceError::DuplicateSourceSeq(source_seq));
        }

        let id = *next_id;
        let item = WorkItem::new(id, source_seq, chat_id, payload)?;

        let mut batch = WriteBatch::default();
        batch.put_cf(self.cf(CF_ITEMS)?, encode_u64(id), item.to_bytes()?);
        batch.put_cf(by_seq, seq_key, encode_u64(id));
        batch.put_cf(self.cf(CF_PENDING)?, seq_key, encode_pending(id, chat_id));
        batch.put_cf(self.cf(CF_PENDING_BY_CHAT)?, encode_chat_seq(chat_id, source_seq), encode_u64(id));
        batch.put_cf(self.cf(CF_META)?, NEXT_ID_KEY, encode_u64(id + 1));
        self.db.write(batch)?;

        *next_id = id + 1;

        debug!(item_id = id, source_seq, chat_id, "Enqueued work item");
        Ok(id)
    }

    /// Get an item by id
    pub fn get(&self, id: ItemId) -> Result<Option<WorkItem>> {
        match self.db.get_cf(self.cf(CF_ITEMS)?, encode_u64(id))? {
            Some(value) => Ok(Some(WorkItem::from_bytes(&value)?)),
            None => Ok(None),
        }
    }

    /// Claim the lowest-sequence pending item whose chat has nothing in flight.
    ///
    /// Chats that are busy, or whose lock stripe is held by a concurrent
    /// caller, are passed over for the rest of the scan so that a later item
    /// of the same chat is never claimed ahead of an earlier one.
    pub fn claim_next(&self) -> Result<Option<WorkItem>> {
        let items = self.cf(CF_ITEMS)?;
        let pending = self.cf(CF_PENDING)?;
        let pending_by_chat = self.cf(CF_PENDING_BY_CHAT)?;
        let processing = self.cf(CF_PROCESSING)?;

        let mut passed_over: HashSet<ChatId> = HashSet::new();

        for entry in self.db.iterator_cf(pending, IteratorMode::Start) {
            let (seq_key, value) = entry?;
            let (id, chat_id) = decode_pending(&value)?;

            if passed_over.contains(&chat_id) {
                continue;
            }

            let chat_key = encode_i64(chat_id);
            if self.db.get_cf(processing, chat_key)?.is_some() {
                passed_over.insert(chat_id);
                continue;
            }

            let Some(_guard) = self.chat_lock(chat_id).try_lock() else {
                passed_over.insert(chat_id);
                continue;
            };

            // Re-check under the lock; another claimer may have won this chat
            if self.db.get_cf(processing, chat_key)?.is_some() {
                passed_over.insert(chat_id);
                continue;
            }

            // The scan reads a snapshot, and a sweep may since have returned an
            // earlier item of this chat to pending
            let source_seq = decode_i64(&seq_key)?;
            if self.lowest_pending_seq(chat_id)? != Some(source_seq) {
                passed_over.insert(chat_id);
                continue;
            }

            let Some(mut item) = self.get(id)? else {
                return Err(PersistenceError::Corrupt(format!(
                    "pending entry points at missing item {}",
                    id
                )));
            };

            // Our iterator can lag behind a claim that has since completed
            if item.status != WorkStatus::Pending {
                continue;
            }

            let lease = item.claim(Utc::now())?;

            let mut batch = WriteBatch::default();
            batch.delete_cf(pending, &seq_key);
            batch.delete_cf(pending_by_chat, encode_chat_seq(chat_id, source_seq));
            batch.put_cf(processing, chat_key, encode_u64(id));
            batch.put_cf(items, encode_u64(id), item.to_bytes()?);
            self.db.write(batch)?;

            debug!(
                item_id = id,
                chat_id,
                source_seq = item.source_seq,
                epoch = lease.epoch,
                "Claimed work item"
            );
            return Ok(Some(item));
        }

        Ok(None)
    }

    /// Terminal transition for an item, regardless of who holds it
    pub fn set_status(&self, id: ItemId, status: WorkStatus) -> Result<()> {
        self.transition(id, None, status).map(|_| ())
    }

    /// Terminal transition fenced by the claim epoch.
    ///
    /// Fails with `StaleLease` if the sweeper has reclaimed the item since
    /// `lease` was issued.
    pub fn finish(&self, lease: Lease, status: WorkStatus) -> Result<WorkItem> {
        self.transition(lease.id, Some(lease.epoch), status)
    }

    fn transition(&self, id: ItemId, epoch: Option<u64>, status: WorkStatus) -> Result<WorkItem> {
        let chat_id = self.get(id)?.ok_or(PersistenceError::ItemNotFound(id))?.chat_id;
        let _guard = self.chat_lock(chat_id).lock();

        let mut item = self.get(id)?.ok_or(PersistenceError::ItemNotFound(id))?;
        if let Some(epoch) = epoch {
            if item.status != WorkStatus::Processing || item.claim_epoch != epoch {
                return Err(PersistenceError::StaleLease { id, epoch });
            }
        }

        item.finish(status)?;

        let mut terminal = self.terminal.lock();
        let mut counts = *terminal;
        let (count_key, count) = match status {
            WorkStatus::Error => (ERROR_COUNT_KEY, &mut counts.error),
            _ => (PROCESSED_COUNT_KEY, &mut counts.processed),
        };
        *count += 1;

        let mut batch = WriteBatch::default();
        batch.put_cf(self.cf(CF_ITEMS)?, encode_u64(id), item.to_bytes()?);
        batch.put_cf(self.cf(CF_META)?, count_key, encode_u64(*count));
        self.release_chat(&mut batch, &item)?;
        self.db.write(batch)?;
        *terminal = counts;
        drop(terminal);

        debug!(item_id = id, chat_id, status = %status, "Work item finished");
        Ok(item)
    }

    /// Move every processing item whose lease is older than `lease_timeout`
    /// back to pending. Returns the number of items reclaimed.
    pub fn reset_stuck(&self, lease_timeout: std::time::Duration) -> Result<usize> {
        match Duration::from_std(lease_timeout) {
            Ok(timeout) => self.reset_stuck_at(timeout, Utc::now()),
            // Nothing can have been leased for longer than chrono can represent
            Err(_) => Ok(0),
        }
    }

    /// `reset_stuck` against an explicit clock
    pub fn reset_stuck_at(&self, lease_timeout: Duration, now: DateTime<Utc>) -> Result<usize> {
        let processing = self.cf(CF_PROCESSING)?;

        let mut expired = Vec::new();
        for entry in self.db.iterator_cf(processing, IteratorMode::Start) {
            let (_chat_key, value) = entry?;
            if let Some(item) = self.get(decode_u64(&value)?)? {
                if item.is_lease_expired(lease_timeout, now) {
                    expired.push((item.lease(), item.chat_id));
                }
            }
        }

        let mut reclaimed = 0;
        for (lease, chat_id) in expired {
            let _guard = self.chat_lock(chat_id).lock();

            let Some(mut item) = self.get(lease.id)? else {
                continue;
            };

            // The worker may have finished in the meantime
            if item.lease() != lease || !item.is_lease_expired(lease_timeout, now) {
                continue;
            }

            item.release()?;

            let mut batch = WriteBatch::default();
            batch.put_cf(self.cf(CF_ITEMS)?, encode_u64(item.id), item.to_bytes()?);
            self.release_chat(&mut batch, &item)?;
            batch.put_cf(
                self.cf(CF_PENDING)?,
                encode_i64(item.source_seq),
                encode_pending(item.id, chat_id),
            );
            batch.put_cf(
                self.cf(CF_PENDING_BY_CHAT)?,
                encode_chat_seq(chat_id, item.source_seq),
                encode_u64(item.id),
            );
            self.db.write(batch)?;

            warn!(
                item_id = item.id,
                chat_id,
                source_seq = item.source_seq,
                epoch = lease.epoch,
                "Reclaimed work item with expired lease"
            );
            reclaimed += 1;
        }

        Ok(reclaimed)
    }

    /// Highest source sequence ever enqueued, 0 if the queue is empty
    pub fn max_source_seq(&self) -> Result<SourceSeq> {
        let mut iter = self.db.iterator_cf(self.cf(CF_BY_SEQ)?, IteratorMode::End);
        match iter.next() {
            Some(entry) => {
                let (key, _) = entry?;
                decode_i64(&key)
            }
            None => Ok(0),
        }
    }

    /// Items in id order, optionally filtered by status
    pub fn list(&self, status: Option<WorkStatus>, limit: usize) -> Result<Vec<WorkItem>> {
        let mut items = Vec::new();

        for entry in self.db.iterator_cf(self.cf(CF_ITEMS)?, IteratorMode::Start) {
            if items.len() >= limit {
                break;
            }

            let (_key, value) = entry?;
            let item = WorkItem::from_bytes(&value)?;
            if status.map_or(true, |s| item.status == s) {
                items.push(item);
            }
        }

        Ok(items)
    }

    /// Counts per status. Live states are counted from their index CFs and
    /// terminal states come from the persisted totals, so the cost follows
    /// the backlog rather than the full history.
    pub fn stats(&self) -> Result<QueueStats> {
        let terminal = *self.terminal.lock();

        Ok(QueueStats {
            pending: self.count_keys(CF_PENDING)?,
            processing: self.count_keys(CF_PROCESSING)?,
            processed: terminal.processed as usize,
            error: terminal.error as usize,
            max_source_seq: self.max_source_seq()?,
        })
    }

    pub fn count_by_status(&self, status: WorkStatus) -> Result<usize> {
        match status {
            WorkStatus::Pending => self.count_keys(CF_PENDING),
            WorkStatus::Processing => self.count_keys(CF_PROCESSING),
            WorkStatus::Processed => Ok(self.terminal.lock().processed as usize),
            WorkStatus::Error => Ok(self.terminal.lock().error as usize),
        }
    }

    fn count_keys(&self, cf: &str) -> Result<usize> {
        let mut count = 0;
        for entry in self.db.iterator_cf(self.cf(cf)?, IteratorMode::Start) {
            entry?;
            count += 1;
        }
        Ok(count)
    }

    /// Lowest source sequence of the chat's pending items, read from live state
    fn lowest_pending_seq(&self, chat_id: ChatId) -> Result<Option<SourceSeq>> {
        let chat_key = encode_i64(chat_id);
        let mut iter = self.db.iterator_cf(
            self.cf(CF_PENDING_BY_CHAT)?,
            IteratorMode::From(&chat_key, Direction::Forward),
        );

        match iter.next() {
            Some(entry) => {
                let (key, _) = entry?;
                let (found_chat, source_seq) = decode_chat_seq(&key)?;
                Ok((found_chat == chat_id).then_some(source_seq))
            }
            None => Ok(None),
        }
    }

    /// Drop the chat's in-flight marker if it still points at `item`
    fn release_chat(&self, batch: &mut WriteBatch, item: &WorkItem) -> Result<()> {
        let processing = self.cf(CF_PROCESSING)?;
        let chat_key = encode_i64(item.chat_id);

        if let Some(value) = self.db.get_cf(processing, chat_key)? {
            if decode_u64(&value)? == item.id {
                batch.delete_cf(processing, chat_key);
            }
        }
        Ok(())
    }

    fn chat_lock(&self, chat_id: ChatId) -> &Mutex<()> {
        &self.chat_locks[chat_id.rem_euclid(CHAT_LOCK_STRIPES as i64) as usize]
    }

    fn cf(&self, name: &str) -> Result<&ColumnFamily> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| PersistenceError::Corrupt(format!("CF {} not found", name)))
    }
}
