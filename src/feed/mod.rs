use std::time::Duration;

use async_trait::async_trait;
use chrono::{NaiveDate, NaiveTime};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use url::Url;

use crate::date_util;
use crate::error::{Error, Result};

/// CallDoc appointment type "Herzkatheteruntersuchung".
pub const DEFAULT_APPOINTMENT_TYPE_ID: i64 = 24;

/// Lifecycle status of an appointment as reported by CallDoc.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(from = "Option<String>", into = "Option<String>")]
pub enum AppointmentStatus {
    #[default]
    Unspecified,
    Created,
    Scheduled,
    Confirmed,
    Completed,
    NoShow,
    Cancelled,
    Other(String),
}

impl AppointmentStatus {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, AppointmentStatus::Cancelled)
    }
}

impl From<Option<String>> for AppointmentStatus {
    fn from(s: Option<String>) -> Self {
        let Some(s) = s else {
            return AppointmentStatus::Unspecified;
        };
        match s.trim().to_lowercase().as_str() {
            "" => AppointmentStatus::Unspecified,
            "created" => AppointmentStatus::Created,
            "scheduled" => AppointmentStatus::Scheduled,
            "confirmed" => AppointmentStatus::Confirmed,
            "completed" => AppointmentStatus::Completed,
            "no_show" => AppointmentStatus::NoShow,
            "canceled" | "cancelled" => AppointmentStatus::Cancelled,
            _ => AppointmentStatus::Other(s),
        }
    }
}

impl From<AppointmentStatus> for Option<String> {
    fn from(s: AppointmentStatus) -> Self {
        let text = match s {
            AppointmentStatus::Unspecified => return None,
            AppointmentStatus::Created => "created",
            AppointmentStatus::Scheduled => "scheduled",
            AppointmentStatus::Confirmed => "confirmed",
            AppointmentStatus::Completed => "completed",
            AppointmentStatus::NoShow => "no_show",
            AppointmentStatus::Cancelled => "canceled",
            AppointmentStatus::Other(other) => return Some(other),
        };
        Some(text.to_string())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PatientRef {
    #[serde(default, deserialize_with = "de_opt_id")]
    pub piz: Option<String>,
}

/// One appointment from the `appointment_search` endpoint. Only the fields
/// the examination table cares about are kept.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Appointment {
    #[serde(default, deserialize_with = "de_opt_id")]
    pub appointment_id: Option<String>,
    #[serde(default, deserialize_with = "de_opt_id")]
    pub id: Option<String>,
    #[serde(default, deserialize_with = "de_opt_id")]
    pub piz: Option<String>,
    #[serde(default)]
    pub patient: Option<PatientRef>,
    #[serde(default, deserialize_with = "de_opt_i64")]
    pub appointment_type_id: Option<i64>,
    #[serde(default)]
    pub scheduled_for_datetime: Option<String>,
    #[serde(default)]
    pub date: Option<String>,
    #[serde(default)]
    pub time: Option<String>,
    #[serde(default)]
    pub notes: Option<String>,
    #[serde(default)]
    pub status: AppointmentStatus,
    #[serde(default, deserialize_with = "de_opt_i64")]
    pub room_id: Option<i64>,
    #[serde(default, deserialize_with = "de_opt_i64")]
    pub employee_id: Option<i64>,
    #[serde(default)]
    pub imaging: Option<bool>,
    #[serde(default)]
    pub team: Option<bool>,
    #[serde(default)]
    pub material_cost: Option<f64>,
}

impl Appointment {
    /// Stable identifier used as the examination's `ExterneID`.
    pub fn external_id(&self) -> Option<&str> {
        self.appointment_id.as_deref().or(self.id.as_deref())
    }

    /// Patient key (PIZ), either top-level or nested under `patient`.
    pub fn patient_key(&self) -> Option<&str> {
        self.piz
            .as_deref()
            .or_else(|| self.patient.as_ref().and_then(|p| p.piz.as_deref()))
    }

    /// Scheduled calendar date. An explicit `date` wins over the date part of
    /// `scheduled_for_datetime`.
    pub fn scheduled_date(&self) -> Result<NaiveDate> {
        if let Some(date) = self.date.as_deref().filter(|d| !d.trim().is_empty()) {
            return date_util::parse_stored_date(date);
        }
        match self.scheduled_for_datetime.as_deref() {
            Some(ts) => match date_util::parse_timestamp(ts) {
                Some(dt) => Ok(dt.date()),
                None => date_util::parse_stored_date(ts),
            },
            None => Err(Error::InvalidDateFormat(format!(
                "appointment {} has no date",
                self.external_id().unwrap_or("?")
            ))),
        }
    }

    pub fn scheduled_time(&self) -> Option<NaiveTime> {
        self.time
            .as_deref()
            .and_then(date_util::parse_time)
            .or_else(|| self.scheduled_for_datetime.as_deref().and_then(date_util::parse_time))
    }

    pub fn is_cancelled(&self) -> bool {
        self.status.is_cancelled()
    }
}

fn de_opt_id<'de, D: Deserializer<'de>>(d: D) -> std::result::Result<Option<String>, D::Error> {
    Ok(match Option::<Value>::deserialize(d)? {
        Some(Value::String(s)) if !s.trim().is_empty() => Some(s.trim().to_string()),
        Some(Value::Number(n)) => Some(n.to_string()),
        _ => None,
    })
}

fn de_opt_i64<'de, D: Deserializer<'de>>(d: D) -> std::result::Result<Option<i64>, D::Error> {
    Ok(match Option::<Value>::deserialize(d)? {
        Some(Value::Number(n)) => n.as_i64(),
        Some(Value::String(s)) => s.trim().parse().ok(),
        _ => None,
    })
}

/// Source of truth for appointments.
#[async_trait]
pub trait SourceFeed: Send + Sync {
    /// All appointments scheduled for `date`, cancelled ones included.
    async fn appointments(&self, date: NaiveDate) -> Result<Vec<Appointment>>;
}

// ── CallDoc HTTP client ────────────────────────────────────────────

pub struct CallDocClient {
    client: reqwest::Client,
    search_url: Url,
    appointment_type_id: i64,
    smart_status_filter: bool,
}

#[derive(Debug, Deserialize)]
struct SearchResponse {
    data: Vec<Appointment>,
}

impl CallDocClient {
    /// `search_url` is the full `appointment_search/` endpoint.
    pub fn new(
        search_url: &str,
        appointment_type_id: i64,
        smart_status_filter: bool,
        timeout: Duration,
    ) -> Result<Self> {
        let search_url = Url::parse(search_url)?;
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            search_url,
            appointment_type_id,
            smart_status_filter,
        })
    }

    /// Query string for one day. Future days only ask for `created`
    /// appointments when the smart status filter is on.
    pub fn query_params(&self, date: NaiveDate, today: NaiveDate) -> Vec<(&'static str, String)> {
        let day = date_util::format_date(date, date_util::DateStyle::Iso);
        let mut params = vec![
            ("from_date", day.clone()),
            ("to_date", day),
            ("appointment_type_id", self.appointment_type_id.to_string()),
        ];
        if self.smart_status_filter && date > today {
            params.push(("status", "created".to_string()));
        }
        params
    }

    pub fn parse_response(body: &str) -> Result<Vec<Appointment>> {
        let resp: SearchResponse = serde_json::from_str(body)
            .map_err(|e| Error::SourceUnavailable(format!("unexpected response: {e}")))?;
        Ok(resp.data)
    }
}

#[async_trait]
impl SourceFeed for CallDocClient {
    async fn appointments(&self, date: NaiveDate) -> Result<Vec<Appointment>> {
        let params = self.query_params(date, date_util::today());
        log::debug!("GET {} {:?}", self.search_url, params);

        let resp = self
            .client
            .get(self.search_url.clone())
            .query(&params)
            .send()
            .await
            .map_err(|e| Error::SourceUnavailable(format!("request failed: {e}")))?;

        let status = resp.status();
        if !status.is_success() {
            return Err(Error::SourceUnavailable(format!(
                "http status {status} from {}",
                self.search_url
            )));
        }

        let body = resp
            .text()
            .await
            .map_err(|e| Error::SourceUnavailable(format!("reading body: {e}")))?;
        let appointments = Self::parse_response(&body)?;
        log::info!("Fetched {} appointments for {date}", appointments.len());
        Ok(appointments)
    }
}
