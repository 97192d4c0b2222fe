//! Recurrence definitions.
//!
//! A [`Cadence`] is either a fixed interval anchored at the schedule's
//! `next_run_at` or a calendar spec (minute, hour, day-of-month, month,
//! day-of-week, evaluated in UTC). Advancing past `now` is a pure function:
//! missed occurrences collapse into the single next future one, so a
//! schedule never double-fires after downtime.

use chrono::{DateTime, Datelike, Days, Duration, NaiveDateTime, NaiveTime, Timelike, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{FromRow, SqliteExecutor};
use typed_builder::TypedBuilder;

use crate::error::PulseError;

/// Search horizon for calendar specs; a spec with no occurrence inside it
/// resolves to the horizon itself.
const CALENDAR_HORIZON_DAYS: u64 = 1462;

/// One field of a calendar spec.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Field {
    Any,
    /// `*/n`
    Step(u32),
    /// `a,b,c` or a single value
    Values(Vec<u32>),
}

impl Field {
    fn matches(&self, v: u32) -> bool {
        match self {
            Field::Any => true,
            Field::Step(n) => *n != 0 && v % n == 0,
            Field::Values(vs) => vs.contains(&v),
        }
    }

    fn parse(s: &str, min: u32, max: u32) -> Result<Self, String> {
        if s == "*" {
            return Ok(Field::Any);
        }
        if let Some(step) = s.strip_prefix("*/") {
            let n: u32 = step.parse().map_err(|_| format!("bad step: {s}"))?;
            if n == 0 {
                return Err(format!("zero step: {s}"));
            }
            return Ok(Field::Step(n));
        }
        let mut values = Vec::new();
        for part in s.split(',') {
            let v: u32 = part.parse().map_err(|_| format!("bad value: {part}"))?;
            if v < min || v > max {
                return Err(format!("value {v} out of range {min}..={max}"));
            }
            values.push(v);
        }
        if values.is_empty() {
            return Err(format!("empty field: {s}"));
        }
        Ok(Field::Values(values))
    }
}

impl std::fmt::Display for Field {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Field::Any => f.write_str("*"),
            Field::Step(n) => write!(f, "*/{n}"),
            Field::Values(vs) => {
                let parts: Vec<String> = vs.iter().map(u32::to_string).collect();
                f.write_str(&parts.join(","))
            }
        }
    }
}

/// Cron-style five-field spec: minute, hour, day-of-month, month,
/// day-of-week (0 = Sunday). All restricted fields must match.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CalendarSpec {
    pub minute: Field,
    pub hour: Field,
    pub dom: Field,
    pub month: Field,
    pub dow: Field,
}

impl CalendarSpec {
    fn matches_date(&self, date: chrono::NaiveDate) -> bool {
        self.month.matches(date.month())
            && self.dom.matches(date.day())
            && self.dow.matches(date.weekday().num_days_from_sunday())
    }

    fn next_after(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        let start = now + Duration::minutes(1);
        let start_date = start.date_naive();

        for offset in 0..CALENDAR_HORIZON_DAYS {
            let Some(date) = start_date.checked_add_days(Days::new(offset)) else {
                break;
            };
            if !self.matches_date(date) {
                continue;
            }
            let first_minute_of_day = if offset == 0 {
                start.hour() * 60 + start.minute()
            } else {
                0
            };
            for hour in 0..24u32 {
                if !self.hour.matches(hour) {
                    continue;
                }
                for minute in 0..60u32 {
                    if hour * 60 + minute < first_minute_of_day || !self.minute.matches(minute) {
                        continue;
                    }
                    if let Some(time) = NaiveTime::from_hms_opt(hour, minute, 0) {
                        let candidate = NaiveDateTime::new(date, time).and_utc();
                        if candidate > now {
                            return candidate;
                        }
                    }
                }
            }
        }

        now + Duration::days(CALENDAR_HORIZON_DAYS as i64)
    }
}

/// How often a schedule fires.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Cadence {
    /// Fixed interval anchored at the schedule's `next_run_at`.
    Every(Duration),
    Calendar(CalendarSpec),
}

impl Cadence {
    /// The smallest occurrence strictly after `now`.
    ///
    /// For fixed intervals the occurrence grid is anchored at `anchor` (the
    /// schedule's current `next_run_at`), so catching up after downtime
    /// lands on the grid instead of drifting.
    pub fn next_after(&self, anchor: DateTime<Utc>, now: DateTime<Utc>) -> DateTime<Utc> {
        match self {
            Cadence::Every(interval) => {
                if anchor > now {
                    return anchor;
                }
                let step = interval.num_milliseconds().max(1);
                let elapsed = (now - anchor).num_milliseconds();
                let periods = elapsed / step + 1;
                anchor + Duration::milliseconds(periods * step)
            }
            Cadence::Calendar(spec) => spec.next_after(now),
        }
    }
}

impl std::str::FromStr for Cadence {
    type Err = PulseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || PulseError::InvalidCadence(s.to_string());

        if let Some(spec) = s.strip_prefix("every:") {
            let spec = spec.trim();
            if !spec.is_ascii() {
                return Err(invalid());
            }
            let (value, unit) = spec.split_at(spec.len().saturating_sub(1));
            let n: i64 = value.parse().map_err(|_| invalid())?;
            if n <= 0 {
                return Err(invalid());
            }
            let duration = match unit {
                "s" => Duration::seconds(n),
                "m" => Duration::minutes(n),
                "h" => Duration::hours(n),
                "d" => Duration::days(n),
                _ => return Err(invalid()),
            };
            return Ok(Cadence::Every(duration));
        }

        let fields: Vec<&str> = s.split_whitespace().collect();
        if fields.len() != 5 {
            return Err(invalid());
        }
        let spec = CalendarSpec {
            minute: Field::parse(fields[0], 0, 59).map_err(|_| invalid())?,
            hour: Field::parse(fields[1], 0, 23).map_err(|_| invalid())?,
            dom: Field::parse(fields[2], 1, 31).map_err(|_| invalid())?,
            month: Field::parse(fields[3], 1, 12).map_err(|_| invalid())?,
            dow: Field::parse(fields[4], 0, 6).map_err(|_| invalid())?,
        };
        Ok(Cadence::Calendar(spec))
    }
}

impl std::fmt::Display for Cadence {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Cadence::Every(d) => write!(f, "every:{}s", d.num_seconds()),
            Cadence::Calendar(spec) => write!(
                f,
                "{} {} {} {} {}",
                spec.minute, spec.hour, spec.dom, spec.month, spec.dow
            ),
        }
    }
}

impl TryFrom<String> for Cadence {
    type Error = String;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse().map_err(|e: PulseError| e.to_string())
    }
}

impl Serialize for Cadence {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for Cadence {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

const SCHEDULE_COLUMNS: &str =
    "id, handler_name, payload_template, cadence, next_run_at, last_run_at, enabled, actor";

/// A recurrence definition, materialized into jobs by the scheduler.
///
/// Owned by its creator until the scheduler picks it up; during a tick the
/// scheduler exclusively owns the row. `next_run_at` only ever advances.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize, TypedBuilder)]
#[builder(field_defaults(setter(into)))]
pub struct Schedule {
    /// ASID with the `JD` prefix.
    pub id: String,

    pub handler_name: String,

    /// Payload copied onto every job this schedule enqueues.
    #[builder(default)]
    pub payload_template: Vec<u8>,

    #[sqlx(try_from = "String")]
    pub cadence: Cadence,

    pub next_run_at: DateTime<Utc>,
    #[builder(default)]
    pub last_run_at: Option<DateTime<Utc>>,

    #[builder(default = true)]
    pub enabled: bool,

    #[builder(default)]
    pub actor: String,
}

impl Schedule {
    pub async fn create<'e, E>(&self, executor: E) -> Result<(), PulseError>
    where
        E: SqliteExecutor<'e>,
    {
        sqlx::query(
            r#"
            INSERT INTO schedules (id, handler_name, payload_template, cadence, next_run_at,
                                   last_run_at, enabled, actor)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&self.id)
        .bind(&self.handler_name)
        .bind(&self.payload_template)
        .bind(self.cadence.to_string())
        .bind(self.next_run_at)
        .bind(self.last_run_at)
        .bind(self.enabled)
        .bind(&self.actor)
        .execute(executor)
        .await?;
        Ok(())
    }

    pub async fn get<'e, E>(executor: E, id: &str) -> Result<Self, PulseError>
    where
        E: SqliteExecutor<'e>,
    {
        sqlx::query_as::<_, Self>(&format!(
            "SELECT {SCHEDULE_COLUMNS} FROM schedules WHERE id = ?"
        ))
        .bind(id)
        .fetch_optional(executor)
        .await?
        .ok_or_else(|| PulseError::NotFound(format!("schedule {id}")))
    }

    pub async fn list<'e, E>(executor: E) -> Result<Vec<Self>, PulseError>
    where
        E: SqliteExecutor<'e>,
    {
        let schedules = sqlx::query_as::<_, Self>(&format!(
            "SELECT {SCHEDULE_COLUMNS} FROM schedules ORDER BY next_run_at ASC"
        ))
        .fetch_all(executor)
        .await?;
        Ok(schedules)
    }

    pub async fn set_enabled<'e, E>(executor: E, id: &str, enabled: bool) -> Result<(), PulseError>
    where
        E: SqliteExecutor<'e>,
    {
        let result = sqlx::query("UPDATE schedules SET enabled = ? WHERE id = ?")
            .bind(enabled)
            .bind(id)
            .execute(executor)
            .await?;
        if result.rows_affected() == 0 {
            return Err(PulseError::NotFound(format!("schedule {id}")));
        }
        Ok(())
    }

    /// Enabled schedules whose `next_run_at` has passed, oldest first.
    pub(crate) async fn due<'e, E>(
        executor: E,
        now: DateTime<Utc>,
    ) -> Result<Vec<Self>, PulseError>
    where
        E: SqliteExecutor<'e>,
    {
        let schedules = sqlx::query_as::<_, Self>(&format!(
            "SELECT {SCHEDULE_COLUMNS} FROM schedules \
             WHERE enabled = 1 AND next_run_at <= ? ORDER BY next_run_at ASC"
        ))
        .bind(now)
        .fetch_all(executor)
        .await?;
        Ok(schedules)
    }
}
