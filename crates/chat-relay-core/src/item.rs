use crate::{RelayError, Result, MAX_PAYLOAD_SIZE};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Store-assigned identifier, monotonically increasing
pub type ItemId = u64;

/// Chat identifier from the message source (negative for group chats)
pub type ChatId = i64;

/// Position of an update in the message source's cursor space
pub type SourceSeq = i64;

/// Work item status in the queue
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum WorkStatus {
    /// Waiting to be claimed
    Pending,
    /// Claimed by a worker; at most one per chat
    Processing,
    /// Handler finished successfully
    Processed,
    /// Handler failed; never re-queued automatically
    Error,
}

impl WorkStatus {
    pub const ALL: [WorkStatus; 4] = [
        WorkStatus::Pending,
        WorkStatus::Processing,
        WorkStatus::Processed,
        WorkStatus::Error,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            WorkStatus::Pending => "pending",
            WorkStatus::Processing => "processing",
            WorkStatus::Processed => "processed",
            WorkStatus::Error => "error",
        }
    }

    pub fn is_terminal(&self) -> bool {
        match self {
            WorkStatus::Pending | WorkStatus::Processing => false,
            WorkStatus::Processed | WorkStatus::Error => true,
        }
    }
}

impl fmt::Display for WorkStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for WorkStatus {
    type Err = RelayError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "pending" => Ok(WorkStatus::Pending),
            "processing" => Ok(WorkStatus::Processing),
            "processed" => Ok(WorkStatus::Processed),
            "error" => Ok(WorkStatus::Error),
            other => Err(RelayError::UnknownStatus(other.to_string())),
        }
    }
}

/// Proof of a particular claim on an item.
///
/// The epoch is bumped on every claim, so a worker whose lease was reclaimed
/// by the sweeper can no longer finish the item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Lease {
    pub id: ItemId,
    pub epoch: u64,
}

/// One durable unit of queued inbound work
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkItem {
    pub id: ItemId,

    /// Cursor position of the originating update (unique across the queue)
    pub source_seq: SourceSeq,

    pub chat_id: ChatId,

    /// Serialized update, opaque to the queue
    pub payload: Vec<u8>,

    pub status: WorkStatus,

    pub created_at: DateTime<Utc>,

    pub updated_at: DateTime<Utc>,

    /// Start of the current lease (set while processing)
    pub claimed_at: Option<DateTime<Utc>>,

    /// Number of times this item has been claimed
    pub claim_epoch: u64,

    pub completed_at: Option<DateTime<Utc>>,
}

impl WorkItem {
    /// Create a new pending item
    pub fn new(id: ItemId, source_seq: SourceSeq, chat_id: ChatId, payload: Vec<u8>) -> Result<Self> {
        if payload.len() > MAX_PAYLOAD_SIZE {
            return Err(RelayError::PayloadTooLarge {
                max: MAX_PAYLOAD_SIZE,
                actual: payload.len(),
            });
        }

        let now = Utc::now();
        Ok(WorkItem {
            id,
            source_seq,
            chat_id,
            payload,
            status: WorkStatus::Pending,
            created_at: now,
            updated_at: now,
            claimed_at: None,
            claim_epoch: 0,
            completed_at: None,
        })
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        bincode::serialize(self).map_err(RelayError::from)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        bincode::deserialize(bytes).map_err(RelayError::from)
    }

    pub fn lease(&self) -> Lease {
        Lease {
            id: self.id,
            epoch: self.claim_epoch,
        }
    }

    /// Pending -> Processing, starting a new lease
    pub fn claim(&mut self, now: DateTime<Utc>) -> Result<Lease> {
        if self.status != WorkStatus::Pending {
            return Err(self.invalid(WorkStatus::Processing));
        }

        self.status = WorkStatus::Processing;
        self.claim_epoch += 1;
        self.claimed_at = Some(now);
        self.updated_at = now;
        Ok(self.lease())
    }

    /// Processing -> Processed | Error
    pub fn finish(&mut self, status: WorkStatus) -> Result<()> {
        if self.status != WorkStatus::Processing || !status.is_terminal() {
            return Err(self.invalid(status));
        }

        let now = Utc::now();
        self.status = status;
        self.completed_at = Some(now);
        self.updated_at = now;
        Ok(())
    }

    /// Processing -> Pending after lease expiry
    pub fn release(&mut self) -> Result<()> {
        if self.status != WorkStatus::Processing {
            return Err(self.invalid(WorkStatus::Pending));
        }

        self.status = WorkStatus::Pending;
        self.claimed_at = None;
        self.updated_at = Utc::now();
        Ok(())
    }

    /// Age of the current lease, measured from the claim (or creation for
    /// items written without a claim stamp)
    pub fn lease_age(&self, now: DateTime<Utc>) -> Duration {
        now - self.claimed_at.unwrap_or(self.created_at)
    }

    /// Check if the lease has run longer than `lease_timeout`
    pub fn is_lease_expired(&self, lease_timeout: Duration, now: DateTime<Utc>) -> bool {
        self.status == WorkStatus::Processing && self.lease_age(now) > lease_timeout
    }

    fn invalid(&self, to: WorkStatus) -> RelayError {
        RelayError::InvalidTransition {
            id: self.id,
            from: self.status,
            to,
        }
    }
}
