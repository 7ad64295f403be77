use std::collections::HashSet;

use chrono::NaiveDate;

use crate::error::{Error, Result};
use crate::feed::{Appointment, SourceFeed};
use crate::gateway::{DataGateway, GatewayResponse, Predicate, Statement};
use crate::sync::mapper::{
    self, Examination, Field, MappedAppointment, ReferenceMaps, COL_DATE, COL_ID, TABLE,
};
use crate::sync::matcher::{self, MatchOptions, MatchPlan};
use crate::sync::{
    CancelToken, DeletePolicy, Operation, RunSummary, SyncOptions, SyncProgress,
};

/// Reconcile the examinations of `date` with the appointments of the feed.
///
/// Fetch and lookup failures abort before any mutating statement is issued.
/// After that every statement is independent: a failed one is recorded in the
/// summary and the run carries on.
pub async fn synchronize(
    feed: &dyn SourceFeed,
    gateway: &dyn DataGateway,
    date: NaiveDate,
    options: &SyncOptions,
    progress: &dyn SyncProgress,
    cancel: &CancelToken,
) -> Result<RunSummary> {
    let mut summary = RunSummary::new(date, options);
    progress.on_run_start(date);
    log::info!(
        "Synchronizing {date} ({} policy{})",
        options.policy.as_str(),
        if options.dry_run { ", dry run" } else { "" }
    );

    let appointments = feed.appointments(date).await.map_err(|e| match e {
        Error::SourceUnavailable(_) => e,
        other => Error::SourceUnavailable(other.to_string()),
    })?;
    let pending = select_pending(&appointments, date, &mut summary);

    let rows = fetch_examinations(gateway, date, options).await?;
    summary.total_target = rows.len();
    progress.on_fetched(date, summary.total_source, summary.total_target);
    log::info!(
        "{date}: {} active appointments ({} cancelled), {} stored examinations",
        summary.total_source,
        summary.cancelled_in_feed,
        summary.total_target
    );

    let refs = if options.resolve_references {
        let keys: Vec<String> = pending
            .iter()
            .filter_map(|(appt, _)| appt.patient_key().map(str::to_string))
            .collect();
        load_reference_maps(gateway, &options.database, &keys).await?
    } else {
        ReferenceMaps::passthrough()
    };

    let mut mapped = Vec::with_capacity(pending.len());
    for (appt, key) in pending {
        let Some(piz) = appt.patient_key() else {
            summary.fail_item(&key, Operation::Map, "appointment has no patient reference");
            continue;
        };
        let Some(patient_id) = refs.resolve_patient(piz) else {
            summary.fail_item(&key, Operation::Map, format!("no patient with PIZ {piz}"));
            continue;
        };
        mapped.push(MappedAppointment {
            key,
            fields: mapper::map_appointment(appt, date, patient_id, &refs, &options.defaults),
        });
    }

    match options.policy {
        DeletePolicy::Selective => {
            apply_selective(gateway, &mapped, &rows, options, progress, cancel, &mut summary).await
        }
        DeletePolicy::Reset => {
            apply_reset(gateway, &mapped, date, options, progress, cancel, &mut summary).await
        }
    }

    debug_assert!(summary.is_consistent());
    log::info!(
        "{date}: {} inserted, {} updated, {} unchanged, {} deleted, {} failed, {} skipped",
        summary.inserted,
        summary.updated,
        summary.unchanged,
        summary.deleted,
        summary.failed,
        summary.skipped
    );
    progress.on_run_complete(&summary);
    Ok(summary)
}

/// Keep the active appointments of `date`, keyed by external id. Appointments
/// that cannot be keyed or dated are recorded as failed.
fn select_pending<'a>(
    appointments: &'a [Appointment],
    date: NaiveDate,
    summary: &mut RunSummary,
) -> Vec<(&'a Appointment, String)> {
    let mut seen = HashSet::new();
    let mut pending = Vec::new();

    for appt in appointments {
        let scheduled = appt.scheduled_date();
        if let Ok(d) = scheduled {
            if d != date {
                log::debug!("Skipping appointment {:?} scheduled for {d}", appt.external_id());
                continue;
            }
        }
        if appt.is_cancelled() {
            summary.cancelled_in_feed += 1;
            continue;
        }

        summary.total_source += 1;
        let key = appt.external_id().unwrap_or("<no id>").to_string();
        if let Err(e) = scheduled {
            summary.fail_item(&key, Operation::Map, e.to_string());
            continue;
        }
        if appt.external_id().is_none() {
            summary.fail_item(&key, Operation::Map, "appointment has no identifier");
            continue;
        }
        if !seen.insert(key.clone()) {
            summary.fail_item(&key, Operation::Map, "duplicate appointment identifier in feed");
            continue;
        }
        pending.push((appt, key));
    }
    pending
}

/// Stored examinations of `date`, whatever format `Datum` is stored in.
pub async fn fetch_examinations(
    gateway: &dyn DataGateway,
    date: NaiveDate,
    options: &SyncOptions,
) -> Result<Vec<Examination>> {
    let stmt = Statement::select(&options.database, TABLE)
        .filter(Predicate::on_date(COL_DATE, date))
        .order_by(COL_ID);
    let resp = gateway.execute(&stmt).await?;

    let mut rows = Vec::with_capacity(resp.rows.len());
    for row in &resp.rows {
        match Examination::from_row(row, &options.defaults) {
            Ok(exam) if exam.fields.date == date => rows.push(exam),
            Ok(exam) => log::debug!("{COL_ID} {} belongs to {}", exam.row_id, exam.fields.date),
            Err(e) => log::warn!("Ignoring unreadable examination row: {e}"),
        }
    }
    Ok(rows)
}

/// Load patient, examination type and lab lookups.
pub async fn load_reference_maps(
    gateway: &dyn DataGateway,
    database: &str,
    patient_keys: &[String],
) -> Result<ReferenceMaps> {
    let mut refs = ReferenceMaps {
        resolved: true,
        ..Default::default()
    };

    if !patient_keys.is_empty() {
        let stmt = Statement::select(database, "Patient")
            .columns(&["PatientID", "M1Ziffer"])
            .filter(Predicate::is_in("M1Ziffer", patient_keys.iter().map(String::as_str)));
        for row in gateway.execute(&stmt).await?.rows {
            let id = row.get("PatientID").and_then(mapper::json_i64);
            let piz = row.get("M1Ziffer").and_then(mapper::json_string);
            if let (Some(id), Some(piz)) = (id, piz) {
                refs.patients.entry(piz).or_insert(id);
            }
        }
    }

    let stmt = Statement::select(database, "Untersuchungart")
        .columns(&["UntersuchungartID", "ExterneID"])
        .filter(Predicate::is_not_null("ExterneID"));
    for row in gateway.execute(&stmt).await?.rows {
        let id = row.get("UntersuchungartID").and_then(mapper::json_i64);
        let ext = row.get("ExterneID").and_then(mapper::json_i64);
        if let (Some(id), Some(ext)) = (id, ext) {
            refs.exam_types.entry(ext).or_insert(id);
        }
    }

    let stmt = Statement::select(database, "Herzkatheter")
        .columns(&["HerzkatheterID", "room_id"])
        .filter(Predicate::is_not_null("room_id"));
    for row in gateway.execute(&stmt).await?.rows {
        let id = row.get("HerzkatheterID").and_then(mapper::json_i64);
        let room = row.get("room_id").and_then(mapper::json_i64);
        if let (Some(id), Some(room)) = (id, room) {
            refs.labs.entry(room).or_insert(id);
        }
    }

    log::debug!(
        "Loaded {} patients, {} examination types, {} labs",
        refs.patients.len(),
        refs.exam_types.len(),
        refs.labs.len()
    );
    Ok(refs)
}

// ── Apply ──────────────────────────────────────────────────────────

/// Rows touched by a statement addressed to one row id. A reported count of
/// zero means the row is gone. Gateways that report no count are trusted.
fn touched_rows(resp: &GatewayResponse, row_id: i64) -> Result<usize> {
    match resp.rows_affected {
        Some(0) => Err(Error::GatewayStatement(format!("no row with {COL_ID} {row_id}"))),
        Some(n) => Ok(n as usize),
        None => Ok(1),
    }
}

async fn apply_selective(
    gateway: &dyn DataGateway,
    mapped: &[MappedAppointment],
    rows: &[Examination],
    options: &SyncOptions,
    progress: &dyn SyncProgress,
    cancel: &CancelToken,
    summary: &mut RunSummary,
) {
    let plan = matcher::match_records(
        mapped,
        rows,
        &MatchOptions {
            compare_billing_fields: options.compare_billing_fields,
            composite_fallback: options.composite_fallback,
        },
    );
    for amb in &plan.ambiguities {
        log::warn!(
            "Duplicate examinations for {}: keeping {COL_ID} {}, deleting {:?}",
            amb.key,
            amb.kept,
            amb.deleted
        );
    }
    summary.ambiguities = plan.ambiguities.len();
    summary.unchanged = plan.unchanged.len();
    progress.on_plan(plan.to_insert.len(), plan.to_update.len(), plan.to_delete.len());

    if options.dry_run {
        summary.inserted = plan.to_insert.len();
        summary.updated = plan.to_update.len();
        summary.deleted = plan.to_delete.len();
        return;
    }

    let MatchPlan {
        to_insert,
        to_update,
        to_delete,
        ..
    } = plan;

    for del in &to_delete {
        if cancel.is_cancelled() {
            break;
        }
        let stmt = Statement::delete(&options.database, TABLE)
            .filter(Predicate::eq(COL_ID, del.row_id));
        match gateway
            .execute(&stmt)
            .await
            .and_then(|resp| touched_rows(&resp, del.row_id))
        {
            Ok(n) => summary.deleted += n,
            Err(e) => summary.record_error(
                &format!("{COL_ID} {}", del.row_id),
                Operation::Delete,
                e.to_string(),
            ),
        }
    }

    for upd in &to_update {
        if cancel.is_cancelled() {
            summary.skipped += 1;
            continue;
        }
        let stmt = Statement::update(
            &options.database,
            TABLE,
            upd.fields.assignments(&upd.changed, options.date_style),
        )
        .filter(Predicate::eq(COL_ID, upd.row_id));
        match gateway
            .execute(&stmt)
            .await
            .and_then(|resp| touched_rows(&resp, upd.row_id))
        {
            Ok(_) => summary.updated += 1,
            Err(e) => summary.fail_item(&upd.key, Operation::Update, e.to_string()),
        }
    }

    insert_all(gateway, &to_insert, options, cancel, summary).await;
}

async fn apply_reset(
    gateway: &dyn DataGateway,
    mapped: &[MappedAppointment],
    date: NaiveDate,
    options: &SyncOptions,
    progress: &dyn SyncProgress,
    cancel: &CancelToken,
    summary: &mut RunSummary,
) {
    progress.on_plan(mapped.len(), 0, summary.total_target);

    if options.dry_run {
        summary.deleted = summary.total_target;
        summary.inserted = mapped.len();
        return;
    }
    if cancel.is_cancelled() {
        summary.skipped += mapped.len();
        return;
    }

    let stmt = Statement::delete(&options.database, TABLE)
        .filter(Predicate::on_date(COL_DATE, date));
    match gateway.execute(&stmt).await {
        Ok(resp) => match resp.rows_affected {
            Some(n) => summary.deleted = n as usize,
            None => {
                log::warn!(
                    "{date}: gateway reported no row count for the reset delete, \
                     counting the {} fetched rows",
                    summary.total_target
                );
                summary.deleted = summary.total_target;
            }
        },
        Err(e) => {
            summary.record_error(&date.to_string(), Operation::Reset, e.to_string());
            for m in mapped {
                summary.fail_item(&m.key, Operation::Insert, "not inserted: reset delete failed");
            }
            return;
        }
    }

    insert_all(gateway, mapped, options, cancel, summary).await;
}

async fn insert_all(
    gateway: &dyn DataGateway,
    to_insert: &[MappedAppointment],
    options: &SyncOptions,
    cancel: &CancelToken,
    summary: &mut RunSummary,
) {
    for item in to_insert {
        if cancel.is_cancelled() {
            summary.skipped += 1;
            continue;
        }
        let stmt = Statement::insert(
            &options.database,
            TABLE,
            item.fields.assignments(&Field::ALL, options.date_style),
        );
        match gateway.execute(&stmt).await {
            Ok(GatewayResponse {
                rows_affected: Some(0),
                ..
            }) => summary.fail_item(&item.key, Operation::Insert, "gateway inserted no row"),
            Ok(_) => summary.inserted += 1,
            Err(e) => summary.fail_item(&item.key, Operation::Insert, e.to_string()),
        }
    }
}
