pub mod config;
pub mod date_util;
pub mod error;
pub mod feed;
pub mod gateway;
pub mod storage;
pub mod sync;

use chrono::NaiveDate;
use serde::Serialize;

pub use config::Settings;
pub use date_util::DateStyle;
pub use error::{Error, Result};
pub use feed::{Appointment, AppointmentStatus, CallDocClient, SourceFeed};
pub use gateway::{DataGateway, HttpGateway};
pub use storage::gateway::SqliteGateway;
pub use storage::Database;
pub use sync::{
    CancelToken, DeletePolicy, FailedItem, NoopProgress, Operation, RunSummary, SyncOptions,
    SyncProgress, SyncStatus,
};

// Re-export repository types needed by the binary crate, but not the module itself
pub use storage::repository::SyncRunRecord;

use storage::repository;
use sync::syncer;

/// Prefix of `gateway_url` selecting a local SQLite store instead of the
/// SQL tool server.
pub const SQLITE_GATEWAY_PREFIX: &str = "sqlite:";

/// A finished run together with its journal id.
#[derive(Debug, Clone, Serialize)]
pub struct RecordedRun {
    pub run_id: i64,
    pub summary: RunSummary,
}

impl RecordedRun {
    pub fn status(&self) -> SyncStatus {
        self.summary.status()
    }
}

/// Build the gateway selected by `gateway_url`.
pub async fn open_gateway(settings: &Settings) -> Result<Box<dyn DataGateway>> {
    if let Some(path) = settings.gateway_url.strip_prefix(SQLITE_GATEWAY_PREFIX) {
        let gw = SqliteGateway::open(path, &settings.gateway_database).await?;
        return Ok(Box::new(gw));
    }
    Ok(Box::new(HttpGateway::new(
        &settings.gateway_url,
        settings.timeout(),
    )?))
}

pub fn open_feed(settings: &Settings) -> Result<CallDocClient> {
    CallDocClient::new(
        &settings.feed_url,
        settings.appointment_type_id,
        settings.smart_status_filter,
        settings.timeout(),
    )
}

/// Main entry point: runs reconciliations and keeps their journal.
pub struct CallDocSync {
    db: Database,
}

impl CallDocSync {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Access the database (for direct queries in the CLI).
    pub fn db(&self) -> &Database {
        &self.db
    }

    /// Effective settings: defaults, then stored config, then environment.
    pub async fn settings(&self) -> Result<Settings> {
        let stored = self.config_list().await?;
        let mut settings = Settings::default();
        settings.apply_stored(&stored)?;
        settings.apply_env()?;
        Ok(settings)
    }

    // ── Sync ───────────────────────────────────────────────────────

    /// Reconcile one day and record the run. A fatal error is kept in the
    /// journal and in `summary.aborted`; only journal failures are returned
    /// as `Err`.
    pub async fn sync_date(
        &self,
        feed: &dyn SourceFeed,
        gateway: &dyn DataGateway,
        date: NaiveDate,
        options: &SyncOptions,
        progress: &dyn SyncProgress,
        cancel: &CancelToken,
    ) -> Result<RecordedRun> {
        let run_id = self
            .db
            .writer()
            .call({
                let day = date.to_string();
                let policy = options.policy.as_str();
                let dry_run = options.dry_run;
                move |conn| repository::insert_sync_run(conn, &day, policy, dry_run)
            })
            .await?;

        let summary = match syncer::synchronize(feed, gateway, date, options, progress, cancel).await
        {
            Ok(summary) => summary,
            Err(e) => {
                log::error!("Sync of {date} aborted: {e}");
                let summary = RunSummary::aborted(date, options, &e);
                progress.on_run_complete(&summary);
                summary
            }
        };

        self.db
            .writer()
            .call({
                let summary = summary.clone();
                move |conn| repository::finish_sync_run(conn, run_id, &summary)
            })
            .await?;

        Ok(RecordedRun { run_id, summary })
    }

    /// Reconcile every day in `[from, to]`, oldest first. Stops between days
    /// once cancelled.
    #[allow(clippy::too_many_arguments)]
    pub async fn sync_range(
        &self,
        feed: &dyn SourceFeed,
        gateway: &dyn DataGateway,
        from: NaiveDate,
        to: NaiveDate,
        options: &SyncOptions,
        progress: &dyn SyncProgress,
        cancel: &CancelToken,
    ) -> Result<Vec<RecordedRun>> {
        if to < from {
            return Err(Error::Config(format!("range end {to} lies before start {from}")));
        }
        let mut runs = Vec::new();
        for date in date_util::days_between(from, to) {
            if cancel.is_cancelled() {
                log::warn!("Cancelled before {date}");
                break;
            }
            runs.push(self.sync_date(feed, gateway, date, options, progress, cancel).await?);
        }
        Ok(runs)
    }

    // ── Journal ────────────────────────────────────────────────────

    pub async fn history(&self, limit: u32) -> Result<Vec<SyncRunRecord>> {
        let runs = self
            .db
            .reader()
            .call(move |conn| repository::list_sync_runs(conn, limit))
            .await?;
        Ok(runs)
    }

    pub async fn run(&self, run_id: i64) -> Result<Option<SyncRunRecord>> {
        let run = self
            .db
            .reader()
            .call(move |conn| repository::get_sync_run(conn, run_id))
            .await?;
        Ok(run)
    }

    pub async fn last_run_for(&self, date: NaiveDate) -> Result<Option<SyncRunRecord>> {
        let run = self
            .db
            .reader()
            .call(move |conn| repository::last_run_for_date(conn, &date.to_string()))
            .await?;
        Ok(run)
    }

    pub async fn failures(&self, run_id: i64) -> Result<Vec<FailedItem>> {
        let items = self
            .db
            .reader()
            .call(move |conn| repository::list_sync_failures(conn, run_id))
            .await?;
        Ok(items)
    }

    // ── Config commands ────────────────────────────────────────────

    pub async fn config_get(&self, key: &str) -> Result<Option<String>> {
        let value = self
            .db
            .reader()
            .call({
                let key = key.to_string();
                move |conn| repository::get_config(conn, &key)
            })
            .await?;
        Ok(value)
    }

    /// Store a setting after checking that it parses.
    pub async fn config_set(&self, key: &str, value: &str) -> Result<()> {
        Settings::default().apply(key, value)?;
        self.db
            .writer()
            .call({
                let key = key.to_string();
                let value = value.to_string();
                move |conn| repository::set_config(conn, &key, &value)
            })
            .await?;
        Ok(())
    }

    pub async fn config_unset(&self, key: &str) -> Result<bool> {
        let removed = self
            .db
            .writer()
            .call({
                let key = key.to_string();
                move |conn| repository::unset_config(conn, &key)
            })
            .await?;
        Ok(removed)
    }

    pub async fn config_list(&self) -> Result<Vec<(String, String)>> {
        let pairs = self
            .db
            .reader()
            .call(|conn| repository::list_config(conn))
            .await?;
        Ok(pairs)
    }
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;

    use super::*;
    use crate::gateway::{Predicate, Statement};

    struct StaticFeed(Option<Vec<Appointment>>);

    #[async_trait]
    impl SourceFeed for StaticFeed {
        async fn appointments(&self, date: NaiveDate) -> Result<Vec<Appointment>> {
            let Some(appointments) = &self.0 else {
                return Err(Error::SourceUnavailable("connection refused".into()));
            };
            // One appointment per day, keyed by the day
            Ok(appointments
                .iter()
                .cloned()
                .map(|mut a| {
                    a.id = a.id.map(|id| format!("{id}-{date}"));
                    a.date = Some(date.to_string());
                    a
                })
                .collect())
        }
    }

    fn appointment() -> Appointment {
        Appointment {
            id: Some("9001".to_string()),
            piz: Some("501".to_string()),
            time: Some("08:00".to_string()),
            status: AppointmentStatus::Scheduled,
            ..Default::default()
        }
    }

    fn options() -> SyncOptions {
        SyncOptions {
            resolve_references: false,
            ..Default::default()
        }
    }

    fn d(day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2025, 7, day).unwrap()
    }

    #[tokio::test]
    async fn test_sync_date_is_journaled() {
        let db = Database::open_memory().await.unwrap();
        let app = CallDocSync::new(db.clone());
        let gw = SqliteGateway::new(db, "SQLHK");
        let feed = StaticFeed(Some(vec![appointment()]));

        let run = app
            .sync_date(&feed, &gw, d(31), &options(), &NoopProgress, &CancelToken::new())
            .await
            .unwrap();
        assert_eq!(run.status(), SyncStatus::Success);
        assert_eq!(run.summary.inserted, 1);

        let record = app.run(run.run_id).await.unwrap().unwrap();
        assert_eq!(record.status, "success");
        assert_eq!(record.sync_date, "2025-07-31");
        assert_eq!(record.inserted, 1);
        assert_eq!(app.last_run_for(d(31)).await.unwrap().unwrap().id, run.run_id);
        assert!(app.failures(run.run_id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_aborted_run_is_journaled_as_failed() {
        let db = Database::open_memory().await.unwrap();
        let app = CallDocSync::new(db.clone());
        let gw = SqliteGateway::new(db, "SQLHK");

        let run = app
            .sync_date(&StaticFeed(None), &gw, d(31), &options(), &NoopProgress, &CancelToken::new())
            .await
            .unwrap();
        assert_eq!(run.status(), SyncStatus::Failed);

        let record = app.run(run.run_id).await.unwrap().unwrap();
        assert_eq!(record.status, "failed");
        assert!(record.error_message.unwrap().contains("connection refused"));
    }

    #[tokio::test]
    async fn test_sync_range_covers_every_day() {
        let db = Database::open_memory().await.unwrap();
        let app = CallDocSync::new(db.clone());
        let gw = SqliteGateway::new(db, "SQLHK");
        let feed = StaticFeed(Some(vec![appointment()]));

        let runs = app
            .sync_range(&feed, &gw, d(29), d(31), &options(), &NoopProgress, &CancelToken::new())
            .await
            .unwrap();
        assert_eq!(runs.len(), 3);
        assert!(runs.iter().all(|r| r.summary.inserted == 1));
        assert_eq!(app.history(10).await.unwrap().len(), 3);

        let day = gw
            .execute(&Statement::select("SQLHK", "Untersuchung").filter(Predicate::eq("Datum", "30.07.2025")))
            .await
            .unwrap();
        assert_eq!(day.rows.len(), 1);

        assert!(app
            .sync_range(&feed, &gw, d(31), d(29), &options(), &NoopProgress, &CancelToken::new())
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_cancelled_range_runs_nothing() {
        let db = Database::open_memory().await.unwrap();
        let app = CallDocSync::new(db.clone());
        let gw = SqliteGateway::new(db, "SQLHK");
        let token = CancelToken::new();
        token.cancel();

        let runs = app
            .sync_range(&StaticFeed(Some(vec![])), &gw, d(29), d(31), &options(), &NoopProgress, &token)
            .await
            .unwrap();
        assert!(runs.is_empty());
    }

    #[tokio::test]
    async fn test_config_set_validates_and_layers() {
        let app = CallDocSync::new(Database::open_memory().await.unwrap());

        assert!(app.config_set("delete_policy", "everything").await.is_err());
        assert!(app.config_set("workspace_gid", "1").await.is_err());

        app.config_set("delete_policy", "reset").await.unwrap();
        app.config_set("compare_billing_fields", "true").await.unwrap();
        assert_eq!(app.config_get("delete_policy").await.unwrap().as_deref(), Some("reset"));

        let settings = app.settings().await.unwrap();
        assert_eq!(settings.delete_policy, DeletePolicy::Reset);
        assert!(settings.compare_billing_fields);

        assert!(app.config_unset("delete_policy").await.unwrap());
        assert_eq!(app.config_list().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_open_gateway_selects_backend() {
        let dir = tempfile::tempdir().unwrap();
        let settings = Settings {
            gateway_url: format!("sqlite:{}", dir.path().join("store.db").display()),
            ..Default::default()
        };
        let gw = open_gateway(&settings).await.unwrap();
        let resp = gw.execute(&Statement::select("SQLHK", "Untersuchung")).await.unwrap();
        assert!(resp.rows.is_empty());

        assert!(open_gateway(&Settings::default()).await.is_ok());
        let bad = Settings {
            gateway_url: "not a url".to_string(),
            ..Default::default()
        };
        assert!(open_gateway(&bad).await.is_err());
    }
}
