use std::collections::{BTreeMap, HashMap, HashSet};

use chrono::NaiveDate;
use serde::Serialize;

use crate::sync::mapper::{Examination, ExaminationFields, Field, MappedAppointment};

#[derive(Debug, Clone, Copy, Default)]
pub struct MatchOptions {
    pub compare_billing_fields: bool,
    pub composite_fallback: bool,
}

/// A matched row whose content differs from its appointment.
#[derive(Debug, Clone, PartialEq)]
pub struct PlannedUpdate {
    pub row_id: i64,
    pub key: String,
    pub fields: ExaminationFields,
    /// Only these columns are written.
    pub changed: Vec<Field>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DeleteReason {
    /// No active appointment claims the row.
    Unmatched,
    /// Another row with the same key was kept.
    Duplicate,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PlannedDelete {
    pub row_id: i64,
    pub external_id: Option<String>,
    pub reason: DeleteReason,
}

/// Several rows found under one matching key. The lowest row id is kept.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DuplicateKeyAmbiguity {
    pub key: String,
    pub kept: i64,
    pub deleted: Vec<i64>,
}

#[derive(Debug, Clone, Default)]
pub struct MatchPlan {
    pub to_insert: Vec<MappedAppointment>,
    pub to_update: Vec<PlannedUpdate>,
    /// `(key, row_id)` pairs that already match.
    pub unchanged: Vec<(String, i64)>,
    pub to_delete: Vec<PlannedDelete>,
    pub ambiguities: Vec<DuplicateKeyAmbiguity>,
}

type CompositeKey = (i64, i64, NaiveDate);

fn composite_key(fields: &ExaminationFields) -> CompositeKey {
    (fields.patient_id, fields.exam_type_id, fields.date)
}

fn has_external_id(exam: &Examination) -> bool {
    exam.fields
        .external_id
        .as_deref()
        .is_some_and(|k| !k.trim().is_empty())
}

/// Classify appointments and stored rows of one date.
///
/// Appointment keys must be unique. Appointments with a cancelled status are
/// ignored here as well, so their rows end up deleted.
pub fn match_records(
    appointments: &[MappedAppointment],
    rows: &[Examination],
    options: &MatchOptions,
) -> MatchPlan {
    let mut plan = MatchPlan::default();
    let compared: Vec<Field> = if options.compare_billing_fields {
        Field::COMPARED.iter().chain(Field::BILLING.iter()).copied().collect()
    } else {
        Field::COMPARED.to_vec()
    };

    // Rows by external id, lowest id first
    let mut by_key: BTreeMap<&str, Vec<&Examination>> = BTreeMap::new();
    let mut legacy: BTreeMap<CompositeKey, Vec<&Examination>> = BTreeMap::new();
    for row in rows {
        match row.fields.external_id.as_deref() {
            Some(k) if has_external_id(row) => by_key.entry(k.trim()).or_default().push(row),
            _ => legacy.entry(composite_key(&row.fields)).or_default().push(row),
        }
    }
    for group in by_key.values_mut().chain(legacy.values_mut()) {
        group.sort_by_key(|r| r.row_id);
    }

    let mut claimed: HashSet<i64> = HashSet::new();
    let mut matched: Vec<(&MappedAppointment, &Examination)> = Vec::new();
    let mut unmatched: Vec<&MappedAppointment> = Vec::new();

    for appt in appointments.iter().filter(|a| !a.fields.is_cancelled()) {
        match by_key.get(appt.key.as_str()) {
            Some(group) => {
                let canonical = group[0];
                claimed.insert(canonical.row_id);
                matched.push((appt, canonical));
                if group.len() > 1 {
                    let extra: Vec<i64> = group[1..].iter().map(|r| r.row_id).collect();
                    for row in &group[1..] {
                        claimed.insert(row.row_id);
                        plan.to_delete.push(PlannedDelete {
                            row_id: row.row_id,
                            external_id: row.fields.external_id.clone(),
                            reason: DeleteReason::Duplicate,
                        });
                    }
                    plan.ambiguities.push(DuplicateKeyAmbiguity {
                        key: appt.key.clone(),
                        kept: canonical.row_id,
                        deleted: extra,
                    });
                }
            }
            None => unmatched.push(appt),
        }
    }

    // Legacy rows without ExterneID: claim on (patient, type, date)
    if options.composite_fallback {
        let mut demand: HashMap<CompositeKey, usize> = HashMap::new();
        for appt in &unmatched {
            *demand.entry(composite_key(&appt.fields)).or_default() += 1;
        }

        let mut still_unmatched = Vec::new();
        for appt in unmatched {
            let key = composite_key(&appt.fields);
            let row = legacy
                .get(&key)
                .and_then(|group| group.iter().find(|r| !claimed.contains(&r.row_id)).copied());
            match row {
                Some(row) => {
                    claimed.insert(row.row_id);
                    matched.push((appt, row));
                }
                None => still_unmatched.push(appt),
            }
        }
        unmatched = still_unmatched;

        for (key, group) in &legacy {
            let wanted = demand.get(key).copied().unwrap_or(0);
            if wanted > 0 && group.len() > wanted {
                plan.ambiguities.push(DuplicateKeyAmbiguity {
                    key: format!("patient {} / type {} / {}", key.0, key.1, key.2),
                    kept: group[0].row_id,
                    deleted: group[wanted..].iter().map(|r| r.row_id).collect(),
                });
            }
        }
    }

    for (appt, row) in matched {
        let changed: Vec<Field> = compared
            .iter()
            .copied()
            .filter(|f| appt.fields.differs(&row.fields, *f))
            .collect();
        if changed.is_empty() {
            plan.unchanged.push((appt.key.clone(), row.row_id));
        } else {
            plan.to_update.push(PlannedUpdate {
                row_id: row.row_id,
                key: appt.key.clone(),
                fields: appt.fields.clone(),
                changed,
            });
        }
    }

    plan.to_insert = unmatched.into_iter().cloned().collect();

    let mut leftovers: Vec<&Examination> =
        rows.iter().filter(|r| !claimed.contains(&r.row_id)).collect();
    leftovers.sort_by_key(|r| r.row_id);
    for row in leftovers {
        plan.to_delete.push(PlannedDelete {
            row_id: row.row_id,
            external_id: row.fields.external_id.clone(),
            reason: DeleteReason::Unmatched,
        });
    }

    plan
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sync::mapper::{ExaminationDefaults, STATUS_CANCELLED};
    use chrono::NaiveTime;

    fn date() -> NaiveDate {
        NaiveDate::from_ymd_opt(2025, 7, 31).unwrap()
    }

    fn fields(key: Option<&str>, patient: i64) -> ExaminationFields {
        let d = ExaminationDefaults::default();
        ExaminationFields {
            external_id: key.map(str::to_string),
            patient_id: patient,
            exam_type_id: 1,
            date: date(),
            time: NaiveTime::from_hms_opt(8, 0, 0),
            remark: String::new(),
            status: "Geplant".to_string(),
            lab_id: d.lab_id,
            billing_physician_id: d.billing_physician_id,
            referring_physician_id: d.referring_physician_id,
            imaging: d.imaging,
            team: d.team,
            material_cost: d.material_cost,
            drg_id: d.drg_id,
        }
    }

    fn appt(key: &str, patient: i64) -> MappedAppointment {
        MappedAppointment {
            key: key.to_string(),
            fields: fields(Some(key), patient),
        }
    }

    fn row(id: i64, key: Option<&str>, patient: i64) -> Examination {
        Examination {
            row_id: id,
            fields: fields(key, patient),
        }
    }

    #[test]
    fn test_insert_update_unchanged_delete() {
        let mut moved = appt("B", 2);
        moved.fields.time = NaiveTime::from_hms_opt(10, 0, 0);

        let appointments = vec![appt("A", 1), moved, appt("C", 3)];
        let rows = vec![row(10, Some("A"), 1), row(11, Some("B"), 2), row(12, Some("Z"), 9)];

        let plan = match_records(&appointments, &rows, &MatchOptions::default());

        assert_eq!(plan.unchanged, vec![("A".to_string(), 10)]);
        assert_eq!(plan.to_update.len(), 1);
        assert_eq!(plan.to_update[0].row_id, 11);
        assert_eq!(plan.to_update[0].changed, vec![Field::Time]);
        assert_eq!(plan.to_insert.len(), 1);
        assert_eq!(plan.to_insert[0].key, "C");
        assert_eq!(plan.to_delete.len(), 1);
        assert_eq!(plan.to_delete[0].row_id, 12);
        assert_eq!(plan.to_delete[0].reason, DeleteReason::Unmatched);
        assert!(plan.ambiguities.is_empty());
    }

    #[test]
    fn test_duplicate_rows_keep_lowest_id() {
        let appointments = vec![appt("A", 1)];
        let rows = vec![row(30, Some("A"), 1), row(20, Some("A"), 1), row(25, Some("A"), 1)];

        let plan = match_records(&appointments, &rows, &MatchOptions::default());

        assert_eq!(plan.unchanged, vec![("A".to_string(), 20)]);
        let deleted: Vec<i64> = plan.to_delete.iter().map(|d| d.row_id).collect();
        assert_eq!(deleted, vec![25, 30]);
        assert!(plan.to_delete.iter().all(|d| d.reason == DeleteReason::Duplicate));
        assert_eq!(
            plan.ambiguities,
            vec![DuplicateKeyAmbiguity {
                key: "A".to_string(),
                kept: 20,
                deleted: vec![25, 30],
            }]
        );
    }

    #[test]
    fn test_cancelled_appointments_release_their_rows() {
        let mut cancelled = appt("A", 1);
        cancelled.fields.status = STATUS_CANCELLED.to_string();

        let plan = match_records(&[cancelled], &[row(10, Some("A"), 1)], &MatchOptions::default());
        assert!(plan.to_insert.is_empty());
        assert!(plan.to_update.is_empty());
        assert_eq!(plan.to_delete.len(), 1);
    }

    #[test]
    fn test_no_appointments_deletes_everything() {
        let rows = vec![row(1, Some("A"), 1), row(2, None, 2)];
        let options = MatchOptions {
            composite_fallback: true,
            ..Default::default()
        };
        let plan = match_records(&[], &rows, &options);
        assert_eq!(plan.to_delete.len(), 2);
        assert!(plan.to_insert.is_empty() && plan.to_update.is_empty());
    }

    #[test]
    fn test_composite_fallback_claims_legacy_rows() {
        let appointments = vec![appt("A", 1), appt("B", 2)];
        let rows = vec![row(5, None, 1), row(6, None, 1), row(7, None, 4)];

        let off = match_records(&appointments, &rows, &MatchOptions::default());
        assert_eq!(off.to_insert.len(), 2);
        assert_eq!(off.to_delete.len(), 3);

        let on = match_records(
            &appointments,
            &rows,
            &MatchOptions {
                composite_fallback: true,
                ..Default::default()
            },
        );
        // A claims legacy row 5 and gets its ExterneID written
        assert_eq!(on.to_update.len(), 1);
        assert_eq!(on.to_update[0].row_id, 5);
        assert_eq!(on.to_update[0].changed, vec![Field::ExternalId]);
        assert_eq!(on.to_insert.len(), 1);
        assert_eq!(on.to_insert[0].key, "B");
        let deleted: Vec<i64> = on.to_delete.iter().map(|d| d.row_id).collect();
        assert_eq!(deleted, vec![6, 7]);
        assert_eq!(on.ambiguities.len(), 1);
        assert_eq!(on.ambiguities[0].kept, 5);
    }

    #[test]
    fn test_billing_fields_only_compared_when_enabled() {
        let mut a = appt("A", 1);
        a.fields.imaging = false;
        a.fields.lab_id = 3;
        let rows = vec![row(10, Some("A"), 1)];

        let plan = match_records(&[a.clone()], &rows, &MatchOptions::default());
        assert_eq!(plan.unchanged.len(), 1);

        let plan = match_records(
            &[a],
            &rows,
            &MatchOptions {
                compare_billing_fields: true,
                ..Default::default()
            },
        );
        assert_eq!(plan.to_update[0].changed, vec![Field::LabId, Field::Imaging]);
    }

    #[test]
    fn test_write_once_fields_never_diffed() {
        let mut a = appt("A", 1);
        a.fields.drg_id = 99;
        a.fields.referring_physician_id = 99;
        let plan = match_records(
            &[a],
            &[row(10, Some("A"), 1)],
            &MatchOptions {
                compare_billing_fields: true,
                composite_fallback: true,
            },
        );
        assert_eq!(plan.unchanged.len(), 1);
    }
}
