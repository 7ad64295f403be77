use std::collections::HashMap;

use chrono::{NaiveDate, NaiveTime};
use serde_json::Value;

use crate::date_util::{self, DateStyle};
use crate::error::{Error, Result};
use crate::feed::{Appointment, AppointmentStatus};
use crate::gateway::{Row, SqlValue};

pub const TABLE: &str = "Untersuchung";
pub const COL_ID: &str = "UntersuchungID";
pub const COL_DATE: &str = "Datum";

/// Status written for appointments that were cancelled in CallDoc.
pub const STATUS_CANCELLED: &str = "Storniert";

const MATERIAL_COST_EPSILON: f64 = 0.005;

/// Values written for attributes CallDoc does not provide.
#[derive(Debug, Clone, PartialEq)]
pub struct ExaminationDefaults {
    pub exam_type_id: i64,
    pub lab_id: i64,
    pub billing_physician_id: i64,
    pub referring_physician_id: i64,
    pub imaging: bool,
    pub team: bool,
    pub material_cost: f64,
    pub drg_id: i64,
}

impl Default for ExaminationDefaults {
    fn default() -> Self {
        Self {
            exam_type_id: 1,
            lab_id: 1,
            billing_physician_id: 1,
            referring_physician_id: 2,
            imaging: true,
            team: true,
            material_cost: 0.0,
            drg_id: 1,
        }
    }
}

/// Columns of the examination table the engine reads or writes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Field {
    ExternalId,
    PatientId,
    ExamTypeId,
    Date,
    Time,
    Remark,
    Status,
    LabId,
    BillingPhysicianId,
    ReferringPhysicianId,
    Imaging,
    Team,
    MaterialCost,
    DrgId,
}

impl Field {
    pub const ALL: [Field; 14] = [
        Field::ExternalId,
        Field::PatientId,
        Field::ExamTypeId,
        Field::Date,
        Field::Time,
        Field::Remark,
        Field::Status,
        Field::LabId,
        Field::BillingPhysicianId,
        Field::ReferringPhysicianId,
        Field::Imaging,
        Field::Team,
        Field::MaterialCost,
        Field::DrgId,
    ];

    /// Always part of the diff.
    pub const COMPARED: [Field; 7] = [
        Field::ExternalId,
        Field::PatientId,
        Field::ExamTypeId,
        Field::Date,
        Field::Time,
        Field::Remark,
        Field::Status,
    ];

    /// Part of the diff only when billing comparison is switched on.
    pub const BILLING: [Field; 4] = [
        Field::LabId,
        Field::Imaging,
        Field::Team,
        Field::MaterialCost,
    ];

    pub fn column_name(&self) -> &'static str {
        match self {
            Field::ExternalId => "ExterneID",
            Field::PatientId => "PatientID",
            Field::ExamTypeId => "UntersuchungartID",
            Field::Date => COL_DATE,
            Field::Time => "Zeit",
            Field::Remark => "Bemerkung",
            Field::Status => "Status",
            Field::LabId => "HerzkatheterID",
            Field::BillingPhysicianId => "UntersucherAbrechnungID",
            Field::ReferringPhysicianId => "ZuweiserID",
            Field::Imaging => "Roentgen",
            Field::Team => "Herzteam",
            Field::MaterialCost => "Materialpreis",
            Field::DrgId => "DRGID",
        }
    }
}

/// Content of one examination row, without its row identifier.
#[derive(Debug, Clone, PartialEq)]
pub struct ExaminationFields {
    pub external_id: Option<String>,
    pub patient_id: i64,
    pub exam_type_id: i64,
    pub date: NaiveDate,
    pub time: Option<NaiveTime>,
    pub remark: String,
    pub status: String,
    pub lab_id: i64,
    pub billing_physician_id: i64,
    pub referring_physician_id: i64,
    pub imaging: bool,
    pub team: bool,
    pub material_cost: f64,
    pub drg_id: i64,
}

impl ExaminationFields {
    pub fn value(&self, field: Field, style: DateStyle) -> SqlValue {
        match field {
            Field::ExternalId => SqlValue::from(self.external_id.clone()),
            Field::PatientId => SqlValue::Int(self.patient_id),
            Field::ExamTypeId => SqlValue::Int(self.exam_type_id),
            Field::Date => SqlValue::Text(date_util::format_date(self.date, style)),
            Field::Time => SqlValue::from(self.time.map(date_util::format_time)),
            Field::Remark => SqlValue::Text(self.remark.clone()),
            Field::Status => SqlValue::Text(self.status.clone()),
            Field::LabId => SqlValue::Int(self.lab_id),
            Field::BillingPhysicianId => SqlValue::Int(self.billing_physician_id),
            Field::ReferringPhysicianId => SqlValue::Int(self.referring_physician_id),
            Field::Imaging => SqlValue::Bool(self.imaging),
            Field::Team => SqlValue::Bool(self.team),
            Field::MaterialCost => SqlValue::Real(self.material_cost),
            Field::DrgId => SqlValue::Int(self.drg_id),
        }
    }

    /// Column assignments for the given fields.
    pub fn assignments(&self, fields: &[Field], style: DateStyle) -> Vec<(String, SqlValue)> {
        fields
            .iter()
            .map(|f| (f.column_name().to_string(), self.value(*f, style)))
            .collect()
    }

    pub fn differs(&self, other: &ExaminationFields, field: Field) -> bool {
        match field {
            Field::ExternalId => self.external_id != other.external_id,
            Field::PatientId => self.patient_id != other.patient_id,
            Field::ExamTypeId => self.exam_type_id != other.exam_type_id,
            Field::Date => self.date != other.date,
            Field::Time => self.time != other.time,
            Field::Remark => self.remark.trim() != other.remark.trim(),
            Field::Status => self.status != other.status,
            Field::LabId => self.lab_id != other.lab_id,
            Field::BillingPhysicianId => self.billing_physician_id != other.billing_physician_id,
            Field::ReferringPhysicianId => {
                self.referring_physician_id != other.referring_physician_id
            }
            Field::Imaging => self.imaging != other.imaging,
            Field::Team => self.team != other.team,
            Field::MaterialCost => {
                (self.material_cost - other.material_cost).abs() > MATERIAL_COST_EPSILON
            }
            Field::DrgId => self.drg_id != other.drg_id,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.status == STATUS_CANCELLED
    }
}

/// A stored examination row.
#[derive(Debug, Clone, PartialEq)]
pub struct Examination {
    pub row_id: i64,
    pub fields: ExaminationFields,
}

impl Examination {
    /// Decode a gateway row. `UntersuchungID` and `Datum` are required;
    /// other missing columns take the insert defaults.
    pub fn from_row(row: &Row, defaults: &ExaminationDefaults) -> Result<Self> {
        let row_id = row
            .get(COL_ID)
            .and_then(json_i64)
            .ok_or_else(|| Error::GatewayProtocol(format!("row without {COL_ID}")))?;
        let date = match row.get(COL_DATE).and_then(json_string) {
            Some(s) => date_util::parse_stored_date(&s)?,
            None => {
                return Err(Error::InvalidDateFormat(format!(
                    "{COL_ID} {row_id} has no {COL_DATE}"
                )))
            }
        };

        let col = |f: Field| row.get(f.column_name());
        let fields = ExaminationFields {
            external_id: col(Field::ExternalId).and_then(json_string),
            patient_id: col(Field::PatientId).and_then(json_i64).unwrap_or_default(),
            exam_type_id: col(Field::ExamTypeId)
                .and_then(json_i64)
                .unwrap_or(defaults.exam_type_id),
            date,
            time: col(Field::Time)
                .and_then(json_string)
                .and_then(|s| date_util::parse_time(&s)),
            remark: col(Field::Remark).and_then(json_string).unwrap_or_default(),
            status: col(Field::Status)
                .and_then(json_string)
                .unwrap_or_else(|| map_status(&AppointmentStatus::Unspecified).to_string()),
            lab_id: col(Field::LabId).and_then(json_i64).unwrap_or(defaults.lab_id),
            billing_physician_id: col(Field::BillingPhysicianId)
                .and_then(json_i64)
                .unwrap_or(defaults.billing_physician_id),
            referring_physician_id: col(Field::ReferringPhysicianId)
                .and_then(json_i64)
                .unwrap_or(defaults.referring_physician_id),
            imaging: col(Field::Imaging).and_then(json_bool).unwrap_or(defaults.imaging),
            team: col(Field::Team).and_then(json_bool).unwrap_or(defaults.team),
            material_cost: col(Field::MaterialCost)
                .and_then(json_f64)
                .unwrap_or(defaults.material_cost),
            drg_id: col(Field::DrgId).and_then(json_i64).unwrap_or(defaults.drg_id),
        };
        Ok(Self { row_id, fields })
    }
}

// ── Reference lookups ──────────────────────────────────────────────

/// Lookup tables translating CallDoc references into store keys.
#[derive(Debug, Clone, Default)]
pub struct ReferenceMaps {
    /// When false every reference passes through unchanged.
    pub resolved: bool,
    /// PIZ (`Patient.M1Ziffer`) → `PatientID`
    pub patients: HashMap<String, i64>,
    /// CallDoc appointment type → `UntersuchungartID`
    pub exam_types: HashMap<i64, i64>,
    /// CallDoc room → `HerzkatheterID`
    pub labs: HashMap<i64, i64>,
}

impl ReferenceMaps {
    pub fn passthrough() -> Self {
        Self::default()
    }

    pub fn resolve_patient(&self, piz: &str) -> Option<i64> {
        let piz = piz.trim();
        if self.resolved {
            self.patients.get(piz).copied()
        } else {
            piz.parse().ok()
        }
    }

    fn exam_type(&self, calldoc_type: Option<i64>, default: i64) -> i64 {
        match calldoc_type {
            Some(t) if self.resolved => self.exam_types.get(&t).copied().unwrap_or(default),
            Some(t) => t,
            None => default,
        }
    }

    fn lab(&self, room: Option<i64>, default: i64) -> i64 {
        match room {
            Some(r) if self.resolved => self.labs.get(&r).copied().unwrap_or(default),
            Some(r) => r,
            None => default,
        }
    }
}

// ── Mapping ────────────────────────────────────────────────────────

/// An active appointment translated into examination fields.
#[derive(Debug, Clone, PartialEq)]
pub struct MappedAppointment {
    /// External identifier, also stored as `ExterneID`.
    pub key: String,
    pub fields: ExaminationFields,
}

pub fn map_status(status: &AppointmentStatus) -> &'static str {
    match status {
        AppointmentStatus::Scheduled => "Geplant",
        AppointmentStatus::Confirmed => "Bestätigt",
        AppointmentStatus::Completed => "Abgeschlossen",
        AppointmentStatus::Cancelled => STATUS_CANCELLED,
        AppointmentStatus::NoShow => "Nicht erschienen",
        _ => "Offen",
    }
}

/// Translate one appointment scheduled on `date` into examination fields.
/// The patient has already been resolved by the caller.
pub fn map_appointment(
    appointment: &Appointment,
    date: NaiveDate,
    patient_id: i64,
    refs: &ReferenceMaps,
    defaults: &ExaminationDefaults,
) -> ExaminationFields {
    ExaminationFields {
        external_id: appointment.external_id().map(str::to_string),
        patient_id,
        exam_type_id: refs.exam_type(appointment.appointment_type_id, defaults.exam_type_id),
        date,
        time: appointment.scheduled_time(),
        remark: appointment.notes.clone().unwrap_or_default(),
        status: map_status(&appointment.status).to_string(),
        lab_id: refs.lab(appointment.room_id, defaults.lab_id),
        billing_physician_id: defaults.billing_physician_id,
        referring_physician_id: defaults.referring_physician_id,
        imaging: appointment.imaging.unwrap_or(defaults.imaging),
        team: appointment.team.unwrap_or(defaults.team),
        material_cost: appointment.material_cost.unwrap_or(defaults.material_cost),
        drg_id: defaults.drg_id,
    }
}

// ── JSON helpers ───────────────────────────────────────────────────

pub(crate) fn json_i64(v: &Value) -> Option<i64> {
    match v {
        Value::Number(n) => n.as_i64().or_else(|| n.as_f64().map(|f| f as i64)),
        Value::String(s) => s.trim().parse().ok(),
        Value::Bool(b) => Some(i64::from(*b)),
        _ => None,
    }
}

pub(crate) fn json_string(v: &Value) -> Option<String> {
    match v {
        Value::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn json_bool(v: &Value) -> Option<bool> {
    match v {
        Value::Bool(b) => Some(*b),
        Value::Number(n) => n.as_i64().map(|i| i != 0),
        Value::String(s) => match s.trim().to_lowercase().as_str() {
            "1" | "true" => Some(true),
            "0" | "false" => Some(false),
            _ => None,
        },
        _ => None,
    }
}

fn json_f64(v: &Value) -> Option<f64> {
    match v {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().replace(',', ".").parse().ok(),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn date() -> NaiveDate {
        NaiveDate::from_ymd_opt(2025, 7, 31).unwrap()
    }

    fn appointment() -> Appointment {
        Appointment {
            id: Some("9001".to_string()),
            piz: Some("1695672".to_string()),
            appointment_type_id: Some(24),
            scheduled_for_datetime: Some("2025-07-31T08:30:00Z".to_string()),
            status: AppointmentStatus::Confirmed,
            room_id: Some(3),
            ..Default::default()
        }
    }

    #[test]
    fn test_map_appointment_with_references() {
        let refs = ReferenceMaps {
            resolved: true,
            exam_types: HashMap::from([(24, 11)]),
            labs: HashMap::from([(3, 2)]),
            ..Default::default()
        };
        let fields = map_appointment(&appointment(), date(), 501, &refs, &Default::default());

        assert_eq!(fields.external_id.as_deref(), Some("9001"));
        assert_eq!(fields.patient_id, 501);
        assert_eq!(fields.exam_type_id, 11);
        assert_eq!(fields.lab_id, 2);
        assert_eq!(fields.date, date());
        assert_eq!(fields.time, NaiveTime::from_hms_opt(8, 30, 0));
        assert_eq!(fields.remark, "");
        assert_eq!(fields.status, "Bestätigt");
        assert_eq!(fields.referring_physician_id, 2);
        assert!(fields.imaging && fields.team);
    }

    #[test]
    fn test_unknown_references_fall_back_to_defaults() {
        let refs = ReferenceMaps {
            resolved: true,
            ..Default::default()
        };
        let fields = map_appointment(&appointment(), date(), 501, &refs, &Default::default());
        assert_eq!(fields.exam_type_id, 1);
        assert_eq!(fields.lab_id, 1);

        let passthrough = ReferenceMaps::passthrough();
        let fields =
            map_appointment(&appointment(), date(), 501, &passthrough, &Default::default());
        assert_eq!(fields.exam_type_id, 24);
        assert_eq!(fields.lab_id, 3);
        assert_eq!(passthrough.resolve_patient("1695672"), Some(1695672));
        assert_eq!(passthrough.resolve_patient("P-17"), None);
    }

    #[test]
    fn test_status_table() {
        assert_eq!(map_status(&AppointmentStatus::Scheduled), "Geplant");
        assert_eq!(map_status(&AppointmentStatus::Completed), "Abgeschlossen");
        assert_eq!(map_status(&AppointmentStatus::Cancelled), "Storniert");
        assert_eq!(map_status(&AppointmentStatus::NoShow), "Nicht erschienen");
        assert_eq!(map_status(&AppointmentStatus::Created), "Offen");
        assert_eq!(map_status(&AppointmentStatus::Unspecified), "Offen");
        assert_eq!(map_status(&AppointmentStatus::Other("x".into())), "Offen");
    }

    #[test]
    fn test_examination_from_row() {
        let row = json!({
            "UntersuchungID": 42,
            "Datum": "2025-07-31T00:00:00",
            "Zeit": "08:30:00",
            "PatientID": "501",
            "UntersuchungartID": 11,
            "ExterneID": 9001,
            "Roentgen": false,
            "Herzteam": 1,
            "Materialpreis": "12,50",
            "Bemerkung": null
        });
        let exam = Examination::from_row(row.as_object().unwrap(), &Default::default()).unwrap();
        assert_eq!(exam.row_id, 42);
        assert_eq!(exam.fields.date, date());
        assert_eq!(exam.fields.time, NaiveTime::from_hms_opt(8, 30, 0));
        assert_eq!(exam.fields.patient_id, 501);
        assert_eq!(exam.fields.external_id.as_deref(), Some("9001"));
        assert!(!exam.fields.imaging);
        assert!(exam.fields.team);
        assert!((exam.fields.material_cost - 12.5).abs() < f64::EPSILON);
        assert_eq!(exam.fields.remark, "");
        assert_eq!(exam.fields.status, "Offen");
        assert_eq!(exam.fields.drg_id, 1);
    }

    #[test]
    fn test_examination_from_row_requires_id_and_date() {
        let row = json!({ "Datum": "31.07.2025" });
        assert!(Examination::from_row(row.as_object().unwrap(), &Default::default()).is_err());

        let row = json!({ "UntersuchungID": 1, "Datum": "July 31" });
        assert!(matches!(
            Examination::from_row(row.as_object().unwrap(), &Default::default()),
            Err(Error::InvalidDateFormat(_))
        ));
    }

    #[test]
    fn test_date_written_in_configured_style() {
        let fields = map_appointment(
            &appointment(),
            date(),
            1,
            &ReferenceMaps::passthrough(),
            &Default::default(),
        );
        assert_eq!(
            fields.value(Field::Date, DateStyle::German),
            SqlValue::Text("31.07.2025".into())
        );
        assert_eq!(
            fields.value(Field::Date, DateStyle::Iso),
            SqlValue::Text("2025-07-31".into())
        );
        assert_eq!(fields.value(Field::Time, DateStyle::German), SqlValue::Text("08:30".into()));
    }

    #[test]
    fn test_material_cost_tolerance() {
        let a = map_appointment(
            &appointment(),
            date(),
            1,
            &ReferenceMaps::passthrough(),
            &Default::default(),
        );
        let mut b = a.clone();
        b.material_cost = 0.001;
        assert!(!a.differs(&b, Field::MaterialCost));
        b.material_cost = 0.5;
        assert!(a.differs(&b, Field::MaterialCost));
    }
}
