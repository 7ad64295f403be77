pub mod mapper;
pub mod matcher;
pub mod syncer;

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

use crate::date_util::DateStyle;
use crate::error::{Error, Result};
pub use mapper::ExaminationDefaults;

/// How rows of the target date are removed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeletePolicy {
    /// Diff against the feed; only unmatched rows are deleted.
    #[default]
    Selective,
    /// Delete every row of the date, then insert all active appointments.
    Reset,
}

impl DeletePolicy {
    pub fn parse(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "selective" => Ok(DeletePolicy::Selective),
            "reset" | "reset-and-repopulate" => Ok(DeletePolicy::Reset),
            other => Err(Error::Config(format!("unknown delete policy: {other}"))),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            DeletePolicy::Selective => "selective",
            DeletePolicy::Reset => "reset",
        }
    }
}

/// Options controlling a sync run.
#[derive(Debug, Clone)]
pub struct SyncOptions {
    pub policy: DeletePolicy,
    /// Include lab, imaging, team and material cost in the diff.
    pub compare_billing_fields: bool,
    /// Match rows without `ExterneID` on (patient, type, date).
    pub composite_fallback: bool,
    /// Resolve patient, type and lab references through the lookup tables.
    pub resolve_references: bool,
    pub date_style: DateStyle,
    /// Logical database every statement is addressed to.
    pub database: String,
    pub defaults: ExaminationDefaults,
    pub dry_run: bool,
}

impl Default for SyncOptions {
    fn default() -> Self {
        Self {
            policy: DeletePolicy::Selective,
            compare_billing_fields: false,
            composite_fallback: true,
            resolve_references: true,
            date_style: DateStyle::German,
            database: "SQLHK".to_string(),
            defaults: ExaminationDefaults::default(),
            dry_run: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Operation {
    Map,
    Insert,
    Update,
    Delete,
    Reset,
}

impl Operation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Operation::Map => "map",
            Operation::Insert => "insert",
            Operation::Update => "update",
            Operation::Delete => "delete",
            Operation::Reset => "reset",
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

/// One item that could not be reconciled, with the key an operator needs to
/// follow it up.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailedItem {
    pub key: String,
    pub operation: Operation,
    pub message: String,
}

/// Report returned after a sync run completes.
///
/// Every appointment counted in `total_source` ends in exactly one of
/// `inserted`, `updated`, `unchanged`, `failed` or `skipped`.
#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub sync_date: NaiveDate,
    pub policy: DeletePolicy,
    pub dry_run: bool,
    pub total_source: usize,
    pub total_target: usize,
    pub inserted: usize,
    pub updated: usize,
    pub unchanged: usize,
    pub deleted: usize,
    pub failed: usize,
    pub skipped: usize,
    /// Number of entries in `failures`.
    pub errors: usize,
    pub cancelled_in_feed: usize,
    pub ambiguities: usize,
    pub failures: Vec<FailedItem>,
    /// Set when a fatal error stopped the run before it could start.
    pub aborted: Option<String>,
}

impl RunSummary {
    pub fn new(sync_date: NaiveDate, options: &SyncOptions) -> Self {
        Self {
            sync_date,
            policy: options.policy,
            dry_run: options.dry_run,
            total_source: 0,
            total_target: 0,
            inserted: 0,
            updated: 0,
            unchanged: 0,
            deleted: 0,
            failed: 0,
            skipped: 0,
            errors: 0,
            cancelled_in_feed: 0,
            ambiguities: 0,
            failures: Vec::new(),
            aborted: None,
        }
    }

    /// Summary of a run that never got to issue a statement.
    pub fn aborted(sync_date: NaiveDate, options: &SyncOptions, error: &Error) -> Self {
        let mut summary = Self::new(sync_date, options);
        summary.aborted = Some(error.to_string());
        summary
    }

    /// Record a failed appointment.
    pub fn fail_item(&mut self, key: &str, operation: Operation, message: impl Into<String>) {
        self.failed += 1;
        self.record_error(key, operation, message);
    }

    /// Record a failed statement that does not correspond to an appointment
    /// (deleting an orphaned row, the reset delete).
    pub fn record_error(&mut self, key: &str, operation: Operation, message: impl Into<String>) {
        let message = message.into();
        log::warn!("{operation} {key} failed: {message}");
        self.errors += 1;
        self.failures.push(FailedItem {
            key: key.to_string(),
            operation,
            message,
        });
    }

    pub fn is_consistent(&self) -> bool {
        self.inserted + self.updated + self.unchanged + self.failed + self.skipped
            == self.total_source
    }

    pub fn status(&self) -> SyncStatus {
        if self.aborted.is_some() {
            SyncStatus::Failed
        } else if self.errors == 0 {
            SyncStatus::Success
        } else if self.inserted + self.updated + self.unchanged + self.deleted > 0 {
            SyncStatus::PartialFailure
        } else {
            SyncStatus::Failed
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncStatus {
    Success,
    PartialFailure,
    Failed,
}

impl SyncStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncStatus::Success => "success",
            SyncStatus::PartialFailure => "partial_failure",
            SyncStatus::Failed => "failed",
        }
    }
}

/// Callbacks for reporting sync progress.
pub trait SyncProgress: Send + Sync {
    fn on_run_start(&self, _date: NaiveDate) {}
    fn on_fetched(&self, _date: NaiveDate, _source: usize, _target: usize) {}
    fn on_plan(&self, _inserts: usize, _updates: usize, _deletes: usize) {}
    fn on_run_complete(&self, _summary: &RunSummary) {}
}

pub struct NoopProgress;

impl SyncProgress for NoopProgress {}

/// Shared flag checked before every mutating statement.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn summary() -> RunSummary {
        RunSummary::new(
            NaiveDate::from_ymd_opt(2025, 7, 31).unwrap(),
            &SyncOptions::default(),
        )
    }

    #[test]
    fn test_status_from_counts() {
        let mut s = summary();
        assert_eq!(s.status(), SyncStatus::Success);

        s.fail_item("A-1", Operation::Insert, "timeout");
        assert_eq!(s.status(), SyncStatus::Failed);
        assert_eq!(s.errors, 1);
        assert_eq!(s.failed, 1);

        s.inserted = 2;
        assert_eq!(s.status(), SyncStatus::PartialFailure);

        s.record_error("UntersuchungID 7", Operation::Delete, "locked");
        assert_eq!(s.errors, 2);
        assert_eq!(s.failed, 1);
        assert_eq!(s.failures[1].operation, Operation::Delete);
    }

    #[test]
    fn test_aborted_summary_is_failed() {
        let err = Error::SourceUnavailable("connection refused".into());
        let s = RunSummary::aborted(
            NaiveDate::from_ymd_opt(2025, 7, 31).unwrap(),
            &SyncOptions::default(),
            &err,
        );
        assert_eq!(s.status(), SyncStatus::Failed);
        assert!(s.aborted.as_deref().unwrap().contains("connection refused"));
    }

    #[test]
    fn test_delete_policy_parse() {
        assert_eq!(DeletePolicy::parse("Reset").unwrap(), DeletePolicy::Reset);
        assert_eq!(DeletePolicy::parse("selective").unwrap(), DeletePolicy::Selective);
        assert!(DeletePolicy::parse("all").is_err());
        assert_eq!(DeletePolicy::default(), DeletePolicy::Selective);
    }

    #[test]
    fn test_cancel_token_shared() {
        let token = CancelToken::new();
        let clone = token.clone();
        assert!(!clone.is_cancelled());
        token.cancel();
        assert!(clone.is_cancelled());
    }
}
