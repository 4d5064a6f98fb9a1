//! Append-only journal backing the ledger store
//!
//! Every committed unit of work is written as one JSON line before the
//! in-memory state changes. On startup the file is read back and replayed,
//! which rebuilds balances as the prefix sum of the recorded entries.
//!
//! # Format
//!
//! One `JournalRecord` per line, internally tagged by `record`:
//!
//! ```text
//! {"record":"account_opened","user_id":1,"created_at":"2026-01-01T00:00:00Z"}
//! {"record":"entry_committed","entry":{"id":1,"user_id":1,"kind":"external_credit",...}}
//! ```
//!
//! A final line without its newline is a torn write from a crash mid-append.
//! It never reached a caller as committed, so it is dropped on open.

use crate::types::{ExternalAddress, LedgerEntry, Order, OrderId, UserId, WalletError};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fs::{File, OpenOptions};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use tracing::{info, warn};

/// One durable state change
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "record", rename_all = "snake_case")]
pub enum JournalRecord {
    AccountOpened {
        user_id: UserId,
        created_at: DateTime<Utc>,
    },
    AddressBound {
        user_id: UserId,
        address: ExternalAddress,
        /// Absent in records written before the start ledger was kept
        #[serde(default)]
        from_ledger: Option<u64>,
    },
    AccountDeactivated {
        user_id: UserId,
    },
    OrderCreated {
        order: Order,
    },
    OrderFailed {
        order_id: OrderId,
    },
    /// A balance mutation; if the entry names an order, that order became `paid`
    EntryCommitted {
        entry: LedgerEntry,
    },
}

/// Line-oriented write-ahead file
#[derive(Debug)]
pub struct Journal {
    path: PathBuf,
    /// Unbuffered: a failed append must not leave bytes behind for the next one
    file: Mutex<File>,
    /// fsync after every record
    sync: bool,
}

impl Journal {
    /// Open (or create) a journal and return the records already in it
    ///
    /// # Errors
    ///
    /// * `StorageUnavailable` - the file cannot be opened, or a complete line
    ///   does not parse (the ledger must not start from a partial history)
    pub fn open(path: &Path, sync: bool) -> Result<(Self, Vec<JournalRecord>), WalletError> {
        let mut file = OpenOptions::new()
            .create(true)
            .read(true)
            .append(true)
            .open(path)?;

        let mut contents = String::new();
        file.read_to_string(&mut contents)?;

        let (complete, torn) = match contents.rfind('\n') {
            Some(idx) => contents.split_at(idx + 1),
            None => ("", contents.as_str()),
        };

        if !torn.trim().is_empty() {
            warn!(
                path = %path.display(),
                bytes = torn.len(),
                "Dropping torn journal tail"
            );
            file.set_len(complete.len() as u64)?;
        }

        let records = parse_records(path, complete)?;
        info!(path = %path.display(), records = records.len(), "Journal opened");

        Ok((
            Journal {
                path: path.to_path_buf(),
                file: Mutex::new(file),
                sync,
            },
            records,
        ))
    }

    /// Read the committed records without opening the journal for writing
    ///
    /// A torn tail is ignored but left in place, so this is safe to run
    /// against the journal of a live service.
    pub fn read(path: &Path) -> Result<Vec<JournalRecord>, WalletError> {
        let contents = std::fs::read_to_string(path)?;
        let complete = match contents.rfind('\n') {
            Some(idx) => &contents[..=idx],
            None => "",
        };
        parse_records(path, complete)
    }

    /// Durably append one record
    ///
    /// Returns only after the line is written (and synced when configured).
    /// On error the file is cut back to its previous length and the caller
    /// must treat the unit of work as not committed.
    pub fn append(&self, record: &JournalRecord) -> Result<(), WalletError> {
        let mut line = serde_json::to_string(record)
            .map_err(|e| WalletError::storage_unavailable(format!("encode journal record: {}", e)))?;
        line.push('\n');

        let mut file = self.file.lock();
        let committed_len = file.metadata()?.len();

        let written = file.write_all(line.as_bytes()).and_then(|()| {
            if self.sync {
                file.sync_data()
            } else {
                Ok(())
            }
        });

        if let Err(e) = written {
            if let Err(rollback) = file.set_len(committed_len) {
                warn!(
                    path = %self.path.display(),
                    length = committed_len,
                    error = %rollback,
                    "Failed to roll back partial journal append"
                );
            }
            return Err(e.into());
        }
        Ok(())
    }
}

fn parse_records(path: &Path, complete: &str) -> Result<Vec<JournalRecord>, WalletError> {
    let mut records = Vec::new();
    for (index, line) in complete.lines().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        let record = serde_json::from_str(line).map_err(|e| {
            WalletError::storage_unavailable(format!(
                "journal {} line {}: {}",
                path.display(),
                index + 1,
                e
            ))
        })?;
        records.push(record);
    }
    Ok(records)
}
