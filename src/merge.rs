//! Idempotent merge of change events into daily aggregates.
//!
//! Each event carries one transaction for one business key. The
//! [`MergeHandler`] folds it into the [`Aggregate`] for
//! `(business_key, bucket_date)`, where `bucket_date` is the event date
//! truncated to the UTC calendar day:
//!
//! 1. an existing entry with the same transaction ID is **replaced**
//! 2. otherwise the transaction is **appended**
//! 3. the display name is set only if the aggregate has none yet
//! 4. `last_modified` moves to the merge time
//! 5. a missing aggregate is created holding just this transaction
//!
//! Applying the same event any number of times leaves the transactions and
//! the name exactly as one application would, which is what makes
//! checkpoint-driven redelivery safe. Stores must run steps 1-5 as one
//! atomic conditional update.

use crate::event::{parse_date, BusinessKey, ChangeEvent};
use crate::store::StorageError;
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, NaiveTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, error, info};

/// Errors returned by [`MergeHandler::handle`].
#[derive(Debug, Error)]
pub enum MergeError {
    /// The payload lacks a required field or holds the wrong type; nothing was written
    #[error("invalid document at {position}: {reason}")]
    InvalidDocument { position: String, reason: String },

    /// The aggregate store failed
    #[error(transparent)]
    Storage(#[from] StorageError),
}

/// Payload field names the merge reads.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PayloadFields {
    #[serde(default = "default_key_field")]
    pub key: String,

    #[serde(default = "default_transaction_field")]
    pub transaction_id: String,

    #[serde(default = "default_value_field")]
    pub value: String,

    #[serde(default = "default_date_field")]
    pub date: String,

    #[serde(default = "default_name_field")]
    pub name: String,
}

impl Default for PayloadFields {
    fn default() -> Self {
        Self {
            key: default_key_field(),
            transaction_id: default_transaction_field(),
            value: default_value_field(),
            date: default_date_field(),
            name: default_name_field(),
        }
    }
}

impl PayloadFields {
    /// All configured names, for validation.
    pub fn all(&self) -> [(&'static str, &str); 5] {
        [
            ("key", self.key.as_str()),
            ("transaction_id", self.transaction_id.as_str()),
            ("value", self.value.as_str()),
            ("date", self.date.as_str()),
            ("name", self.name.as_str()),
        ]
    }
}

fn default_key_field() -> String {
    "playerID".to_string()
}

fn default_transaction_field() -> String {
    "transactionID".to_string()
}

fn default_value_field() -> String {
    "value".to_string()
}

fn default_date_field() -> String {
    "date".to_string()
}

fn default_name_field() -> String {
    "name".to_string()
}

/// One transaction inside an aggregate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransactionEntry {
    #[serde(rename = "transactionID")]
    pub transaction_id: i64,
    pub value: f64,
    pub date: DateTime<Utc>,
}

/// Daily per-key aggregate.
///
/// `transactions` is stored as an array but behaves as a map keyed by
/// transaction ID: no ID ever appears twice.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Aggregate {
    pub business_key: BusinessKey,
    pub bucket_date: NaiveDate,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default)]
    pub transactions: Vec<TransactionEntry>,
    pub last_modified: DateTime<Utc>,
}

/// What a merge did to its aggregate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeOutcome {
    /// No aggregate existed; one was created with this transaction
    Created,
    /// The transaction was new to an existing aggregate
    Appended,
    /// An entry with the same transaction ID was overwritten
    Replaced,
}

impl Aggregate {
    /// Create the aggregate a first merge produces.
    pub fn create(cmd: &MergeCommand, now: DateTime<Utc>) -> Self {
        Self {
            business_key: cmd.business_key.clone(),
            bucket_date: cmd.bucket_date,
            name: Some(cmd.name.clone()),
            transactions: vec![cmd.transaction.clone()],
            last_modified: now,
        }
    }

    /// Fold `cmd` into this aggregate.
    pub fn apply(&mut self, cmd: &MergeCommand, now: DateTime<Utc>) -> MergeOutcome {
        let outcome = match self
            .transactions
            .iter_mut()
            .find(|t| t.transaction_id == cmd.transaction.transaction_id)
        {
            Some(existing) => {
                *existing = cmd.transaction.clone();
                MergeOutcome::Replaced
            }
            None => {
                self.transactions.push(cmd.transaction.clone());
                MergeOutcome::Appended
            }
        };

        if self.name.is_none() {
            self.name = Some(cmd.name.clone());
        }
        self.last_modified = now;
        outcome
    }

    /// Look up a transaction by ID.
    pub fn transaction(&self, transaction_id: i64) -> Option<&TransactionEntry> {
        self.transactions
            .iter()
            .find(|t| t.transaction_id == transaction_id)
    }

    /// Start of the bucket's day, UTC.
    pub fn bucket_start(&self) -> DateTime<Utc> {
        Utc.from_utc_datetime(&self.bucket_date.and_time(NaiveTime::MIN))
    }
}

/// Validated merge input extracted from one event.
#[derive(Debug, Clone, PartialEq)]
pub struct MergeCommand {
    pub business_key: BusinessKey,
    pub bucket_date: NaiveDate,
    pub transaction: TransactionEntry,
    pub name: String,
}

impl MergeCommand {
    /// Validate `event` and extract the merge input.
    ///
    /// Every required field must be present and well-typed; the first
    /// problem found is reported as [`MergeError::InvalidDocument`].
    pub fn from_event(event: &ChangeEvent, fields: &PayloadFields) -> Result<Self, MergeError> {
        let invalid = |reason: String| MergeError::InvalidDocument {
            position: event.commit_position.clone(),
            reason,
        };
        let require = |name: &str| {
            event
                .field(name)
                .ok_or_else(|| invalid(format!("missing field '{name}'")))
        };

        let business_key = BusinessKey::from_value(require(fields.key.as_str())?)
            .ok_or_else(|| invalid(format!("field '{}' is not a usable key", fields.key)))?;
        let transaction_id = require(fields.transaction_id.as_str())?
            .as_i64()
            .ok_or_else(|| invalid(format!("field '{}' is not an integer", fields.transaction_id)))?;
        let value = require(fields.value.as_str())?
            .as_f64()
            .ok_or_else(|| invalid(format!("field '{}' is not a number", fields.value)))?;
        let date = parse_date(require(fields.date.as_str())?)
            .ok_or_else(|| invalid(format!("field '{}' is not a date", fields.date)))?;
        let name = require(fields.name.as_str())?
            .as_str()
            .ok_or_else(|| invalid(format!("field '{}' is not a string", fields.name)))?
            .to_string();

        Ok(Self {
            business_key,
            bucket_date: date.date_naive(),
            transaction: TransactionEntry {
                transaction_id,
                value,
                date,
            },
            name,
        })
    }
}

/// Storage for aggregates.
#[async_trait]
pub trait AggregateStore: Send + Sync {
    /// Atomically create-or-merge the aggregate for the command's bucket.
    async fn merge(&self, cmd: &MergeCommand, now: DateTime<Utc>) -> Result<MergeOutcome, StorageError>;

    /// Read the aggregate for `(key, bucket_date)`.
    async fn get(
        &self,
        key: &BusinessKey,
        bucket_date: NaiveDate,
    ) -> Result<Option<Aggregate>, StorageError>;
}

/// Applies change events to the aggregate store.
#[derive(Clone)]
pub struct MergeHandler {
    store: Arc<dyn AggregateStore>,
    fields: PayloadFields,
}

impl MergeHandler {
    pub fn new(store: Arc<dyn AggregateStore>, fields: PayloadFields) -> Self {
        Self { store, fields }
    }

    pub fn fields(&self) -> &PayloadFields {
        &self.fields
    }

    /// Validate and merge one event.
    pub async fn handle(&self, event: &ChangeEvent) -> Result<MergeOutcome, MergeError> {
        let cmd = match MergeCommand::from_event(event, &self.fields) {
            Ok(cmd) => cmd,
            Err(e) => {
                error!(
                    error = %e,
                    payload = ?event.payload,
                    "Invalid document: missing or malformed required fields"
                );
                return Err(e);
            }
        };

        debug!(
            key = %cmd.business_key,
            bucket_date = %cmd.bucket_date,
            transaction_id = cmd.transaction.transaction_id,
            "Merging transaction"
        );

        let outcome = self.store.merge(&cmd, Utc::now()).await?;
        info!(
            key = %cmd.business_key,
            bucket_date = %cmd.bucket_date,
            transaction_id = cmd.transaction.transaction_id,
            outcome = ?outcome,
            "Processed merge"
        );
        Ok(outcome)
    }
}
