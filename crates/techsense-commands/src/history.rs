//! Append-only history of resolved commands.
//!
//! Every resolved command becomes one [`HistoryRecord`]. The ledger keeps
//! records in resolution order and offers no way to change or remove them.
//! When opened on a file, records are also written through to redb and
//! reloaded in sequence order on the next open.

use std::borrow::Cow;
use std::fmt;
use std::path::Path;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use parking_lot::RwLock;
use redb::{Database, ReadableTable, TableDefinition};
use serde::{Deserialize, Serialize};
use techsense_core::Error;

use crate::command::{ActionType, Command, CommandResult, Outcome};

// History table: key = sequence, value = HistoryRecord (JSON)
const HISTORY_TABLE: TableDefinition<u64, &str> = TableDefinition::new("command_history");

/// Reason recorded for schedule firings skipped because the device was busy.
pub const DEVICE_BUSY_REASON: &str = "device busy";

/// Immutable snapshot of a command and its result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryRecord {
    /// Position in the ledger, starting at 0.
    pub sequence: u64,
    pub command: Command,
    pub result: CommandResult,
}

/// Filter for ledger queries. Empty fields match everything.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryFilter {
    pub outcome: Option<Outcome>,
    pub action: Option<ActionType>,
}

impl HistoryFilter {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn with_outcome(mut self, outcome: Outcome) -> Self {
        self.outcome = Some(outcome);
        self
    }

    pub fn with_action(mut self, action: ActionType) -> Self {
        self.action = Some(action);
        self
    }

    pub fn matches(&self, record: &HistoryRecord) -> bool {
        self.outcome.is_none_or(|o| o == record.result.outcome)
            && self.action.is_none_or(|a| a == record.command.action)
    }
}

/// Lazy, finite view over a ledger snapshot.
///
/// Cloning or calling [`HistoryQuery::restart`] replays the same records.
#[derive(Debug, Clone)]
pub struct HistoryQuery {
    records: Arc<[Arc<HistoryRecord>]>,
    filter: HistoryFilter,
    pos: usize,
}

impl HistoryQuery {
    pub fn restart(&mut self) {
        self.pos = 0;
    }
}

impl Iterator for HistoryQuery {
    type Item = Arc<HistoryRecord>;

    fn next(&mut self) -> Option<Self::Item> {
        while let Some(record) = self.records.get(self.pos) {
            self.pos += 1;
            if self.filter.matches(record) {
                return Some(record.clone());
            }
        }
        None
    }
}

/// One row of the history export.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExportRow {
    pub date: String,
    pub time: String,
    #[serde(rename = "type")]
    pub action: ActionType,
    pub duration: String,
    pub water_used: f64,
    pub energy_used: f64,
    pub result: Outcome,
    pub reason: String,
}

impl ExportRow {
    pub const HEADER: &'static str =
        "date,time,type,duration,water_used,energy_used,result,reason";

    fn from_record(record: &HistoryRecord, tz: Tz) -> Self {
        let local = record.command.submitted_at.with_timezone(&tz);
        Self {
            date: local.format("%Y-%m-%d").to_string(),
            time: local.format("%H:%M").to_string(),
            action: record.command.action,
            duration: format!("{} min", (record.result.duration_secs + 30) / 60),
            water_used: record.result.water_used_l,
            energy_used: record.result.energy_used_kwh,
            result: record.result.outcome,
            reason: record.result.reason.clone().unwrap_or_default(),
        }
    }
}

impl fmt::Display for ExportRow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{},{},{},{},{},{},{},{}",
            self.date,
            self.time,
            self.action,
            self.duration,
            self.water_used,
            self.energy_used,
            self.result,
            csv_field(&self.reason)
        )
    }
}

/// Quote a free-text CSV field when it holds a separator, quote or newline.
fn csv_field(value: &str) -> Cow<'_, str> {
    if value.contains([',', '"', '\n', '\r']) {
        Cow::Owned(format!("\"{}\"", value.replace('"', "\"\"")))
    } else {
        Cow::Borrowed(value)
    }
}

/// The command history ledger.
pub struct HistoryLedger {
    records: RwLock<Vec<Arc<HistoryRecord>>>,
    db: Option<Database>,
}

impl HistoryLedger {
    /// An in-memory ledger.
    pub fn new() -> Self {
        Self {
            records: RwLock::new(Vec::new()),
            db: None,
        }
    }

    /// Open a redb-backed ledger, loading any existing records.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, Error> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let db = if path.exists() {
            Database::open(path).map_err(storage_err)?
        } else {
            Database::create(path).map_err(storage_err)?
        };

        // Ensure the table exists so read transactions can open it.
        let write_txn = db.begin_write().map_err(storage_err)?;
        {
            let _table = write_txn.open_table(HISTORY_TABLE).map_err(storage_err)?;
        }
        write_txn.commit().map_err(storage_err)?;

        let mut records = Vec::new();
        {
            let read_txn = db.begin_read().map_err(storage_err)?;
            let table = read_txn.open_table(HISTORY_TABLE).map_err(storage_err)?;
            for entry in table.iter().map_err(storage_err)? {
                let (_seq, json) = entry.map_err(storage_err)?;
                let record: HistoryRecord = serde_json::from_str(json.value())?;
                records.push(Arc::new(record));
            }
        }

        tracing::info!(
            path = %path.display(),
            records = records.len(),
            "History ledger opened"
        );

        Ok(Self {
            records: RwLock::new(records),
            db: Some(db),
        })
    }

    /// Append the record for a resolved command.
    ///
    /// Never fails: a storage error is logged and the in-memory record is
    /// kept.
    pub fn append(&self, command: Command, result: CommandResult) -> Arc<HistoryRecord> {
        let record = {
            let mut records = self.records.write();
            let record = Arc::new(HistoryRecord {
                sequence: records.len() as u64,
                command,
                result,
            });
            records.push(record.clone());
            record
        };

        if let Some(db) = &self.db {
            if let Err(e) = persist(db, &record) {
                tracing::error!(
                    sequence = record.sequence,
                    command_id = %record.command.id,
                    error = %e,
                    "Failed to persist history record"
                );
            }
        }

        tracing::debug!(
            sequence = record.sequence,
            command_id = %record.command.id,
            action = %record.command.action,
            outcome = %record.result.outcome,
            "History record appended"
        );
        record
    }

    /// Record a firing that was skipped because the device was busy.
    pub fn append_skipped(&self, command: Command, at: DateTime<Utc>) -> Arc<HistoryRecord> {
        let result = CommandResult::failed(command.id, DEVICE_BUSY_REASON, at);
        self.append(command, result)
    }

    pub fn len(&self) -> usize {
        self.records.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.read().is_empty()
    }

    /// Records matching `filter`, in resolution order.
    pub fn query(&self, filter: HistoryFilter) -> HistoryQuery {
        let records: Arc<[Arc<HistoryRecord>]> = self.records.read().as_slice().into();
        HistoryQuery {
            records,
            filter,
            pos: 0,
        }
    }

    /// Export rows for `filter` with times in `tz`.
    pub fn export_rows(&self, filter: HistoryFilter, tz: Tz) -> Vec<ExportRow> {
        self.query(filter)
            .map(|record| ExportRow::from_record(&record, tz))
            .collect()
    }

    /// Completion time of the latest successful or partial cleaning.
    pub fn last_clean(&self) -> Option<DateTime<Utc>> {
        self.records
            .read()
            .iter()
            .rev()
            .find(|r| r.command.action.is_cleaning() && r.result.outcome.is_completed())
            .map(|r| r.result.completed_at)
    }
}

impl Default for HistoryLedger {
    fn default() -> Self {
        Self::new()
    }
}

fn persist(db: &Database, record: &HistoryRecord) -> Result<(), Error> {
    let json = serde_json::to_string(record)?;
    let write_txn = db.begin_write().map_err(storage_err)?;
    {
        let mut table = write_txn.open_table(HISTORY_TABLE).map_err(storage_err)?;
        table
            .insert(record.sequence, json.as_str())
            .map_err(storage_err)?;
    }
    write_txn.commit().map_err(storage_err)?;
    Ok(())
}

fn storage_err<E: fmt::Display>(e: E) -> Error {
    Error::Storage(e.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::{CommandOrigin, CommandRequest};
    use techsense_core::telemetry::GridDims;

    fn make_record(action: ActionType, outcome: Outcome) -> (Command, CommandResult) {
        let command = Command::new(
            &CommandRequest::new(action),
            CommandOrigin::manual(),
            GridDims::new(6, 8),
        )
        .unwrap();
        let result = CommandResult::new(command.id, outcome, Utc::now());
        (command, result)
    }

    #[test]
    fn test_export_row_format() {
        let (command, mut result) = make_record(ActionType::FullSweep, Outcome::Success);
        let command = command.with_submitted_at("2024-01-15T06:30:00Z".parse().unwrap());
        result.duration_secs = 45 * 60;
        result.water_used_l = 12.5;
        result.energy_used_kwh = 2.3;

        let ledger = HistoryLedger::new();
        ledger.append(command, result);

        let rows = ledger.export_rows(HistoryFilter::all(), chrono_tz::UTC);
        assert_eq!(
            rows[0].to_string(),
            "2024-01-15,06:30,full_sweep,45 min,12.5,2.3,success,"
        );
    }

    #[test]
    fn test_export_uses_time_zone() {
        let (command, result) = make_record(ActionType::RowClean, Outcome::Failed);
        let command = command.with_submitted_at("2024-01-12T23:20:00Z".parse().unwrap());
        let result = result.with_reason("Communication error");

        let ledger = HistoryLedger::new();
        ledger.append(command, result);

        let row = &ledger.export_rows(HistoryFilter::all(), chrono_tz::Europe::Berlin)[0];
        assert_eq!(row.date, "2024-01-13");
        assert_eq!(row.time, "00:20");
        assert!(row.to_string().ends_with(",failed,Communication error"));
    }

    #[test]
    fn test_export_quotes_reason_with_separators() {
        let (command, result) = make_record(ActionType::SpotClean, Outcome::Partial);
        let command = command.with_submitted_at("2024-01-15T10:00:00Z".parse().unwrap());
        let result = result.with_reason("water exhausted, row 3 \"left\" dirty");

        let ledger = HistoryLedger::new();
        ledger.append(command, result);

        let row = ledger.export_rows(HistoryFilter::all(), chrono_tz::UTC)[0].to_string();
        assert!(row.ends_with(",partial,\"water exhausted, row 3 \"\"left\"\" dirty\""));
        assert!(row.starts_with("2024-01-15,10:00,spot_clean,"));
    }

    #[test]
    fn test_last_clean_ignores_failures_and_moves() {
        let ledger = HistoryLedger::new();
        assert!(ledger.last_clean().is_none());

        let (c, r) = make_record(ActionType::SpotClean, Outcome::Partial);
        let partial_at = r.completed_at;
        ledger.append(c, r);
        let (c, r) = make_record(ActionType::FullSweep, Outcome::Failed);
        ledger.append(c, r);
        let (c, r) = make_record(ActionType::Pause, Outcome::Success);
        ledger.append(c, r);

        assert_eq!(ledger.last_clean(), Some(partial_at));
    }
}
