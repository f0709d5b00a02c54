//! Calendar capabilities exposed to scripts: `datetime` and `timedelta`.
//!
//! Datetimes are naive (no time zone). Durations are kept as signed
//! microseconds.

use std::fmt::Write;

use chrono::format::{Item, StrftimeItems};
use chrono::{Datelike, Local, NaiveDate, NaiveDateTime, NaiveTime, TimeDelta, Timelike};

use crate::sandbox::builtins::bind;
use crate::sandbox::error::Fault;
use crate::sandbox::value::Value;

const MICROS_PER_SECOND: i64 = 1_000_000;
const MICROS_PER_DAY: i64 = 86_400 * MICROS_PER_SECOND;
const MAX_DAYS: i64 = 999_999_999;

const ISO_FORMATS: [&str; 4] = [
    "%Y-%m-%dT%H:%M:%S%.f",
    "%Y-%m-%d %H:%M:%S%.f",
    "%Y-%m-%dT%H:%M",
    "%Y-%m-%d %H:%M",
];

pub fn datetime_str(dt: &NaiveDateTime) -> String {
    let micros = dt.nanosecond() / 1_000;
    let base = format!(
        "{:04}-{:02}-{:02} {:02}:{:02}:{:02}",
        dt.year(),
        dt.month(),
        dt.day(),
        dt.hour(),
        dt.minute(),
        dt.second()
    );
    if micros > 0 {
        format!("{base}.{micros:06}")
    } else {
        base
    }
}

pub fn datetime_repr(dt: &NaiveDateTime) -> String {
    let mut fields = vec![
        dt.year().to_string(),
        dt.month().to_string(),
        dt.day().to_string(),
        dt.hour().to_string(),
        dt.minute().to_string(),
    ];
    let micros = dt.nanosecond() / 1_000;
    if dt.second() > 0 || micros > 0 {
        fields.push(dt.second().to_string());
    }
    if micros > 0 {
        fields.push(micros.to_string());
    }
    format!("datetime.datetime({})", fields.join(", "))
}

/// `[D day[s], ]H:MM:SS[.ffffff]`, with days floored so the clock part is
/// never negative.
pub fn timedelta_str(micros: i64) -> String {
    let days = micros.div_euclid(MICROS_PER_DAY);
    let rest = micros.rem_euclid(MICROS_PER_DAY);
    let seconds = rest / MICROS_PER_SECOND;
    let fraction = rest % MICROS_PER_SECOND;
    let mut out = String::new();
    if days != 0 {
        let plural = if days.abs() == 1 { "" } else { "s" };
        let _ = write!(out, "{days} day{plural}, ");
    }
    let _ = write!(
        out,
        "{}:{:02}:{:02}",
        seconds / 3600,
        (seconds % 3600) / 60,
        seconds % 60
    );
    if fraction != 0 {
        let _ = write!(out, ".{fraction:06}");
    }
    out
}

pub fn timedelta_repr(micros: i64) -> String {
    let days = micros.div_euclid(MICROS_PER_DAY);
    let rest = micros.rem_euclid(MICROS_PER_DAY);
    let parts: Vec<String> = [
        ("days", days),
        ("seconds", rest / MICROS_PER_SECOND),
        ("microseconds", rest % MICROS_PER_SECOND),
    ]
    .into_iter()
    .filter(|(_, v)| *v != 0)
    .map(|(name, v)| format!("{name}={v}"))
    .collect();
    if parts.is_empty() {
        "datetime.timedelta(0)".to_string()
    } else {
        format!("datetime.timedelta({})", parts.join(", "))
    }
}

/// `datetime(year, month, day, hour=0, minute=0, second=0, microsecond=0)`.
pub fn make_datetime(args: Vec<Value>, kwargs: Vec<(String, Value)>) -> Result<Value, Fault> {
    let params = [
        "year",
        "month",
        "day",
        "hour",
        "minute",
        "second",
        "microsecond",
    ];
    let slots = bind("datetime", &params, 3, args, kwargs)?;
    let mut fields = [0i64; 7];
    for (i, slot) in slots.iter().enumerate() {
        if let Some(value) = slot {
            fields[i] = value.as_int().ok_or_else(|| {
                Fault::Type(format!(
                    "'{}' must be an integer, not {}",
                    params[i],
                    value.type_name()
                ))
            })?;
        }
    }
    build_datetime(fields)
}

fn build_datetime(fields: [i64; 7]) -> Result<Value, Fault> {
    let [year, month, day, hour, minute, second, micro] = fields;
    let small = |v: i64, name: &str| {
        u32::try_from(v).map_err(|_| Fault::Value(format!("{name} is out of range")))
    };
    let year = i32::try_from(year)
        .ok()
        .filter(|y| (1..=9999).contains(y))
        .ok_or_else(|| Fault::Value(format!("year {year} is out of range")))?;
    let date = NaiveDate::from_ymd_opt(year, small(month, "month")?, small(day, "day")?)
        .ok_or_else(|| Fault::Value("day is out of range for month".to_string()))?;
    let dt = date
        .and_hms_micro_opt(
            small(hour, "hour")?,
            small(minute, "minute")?,
            small(second, "second")?,
            small(micro, "microsecond")?,
        )
        .ok_or_else(|| Fault::Value("time component is out of range".to_string()))?;
    Ok(Value::DateTime(dt))
}

/// `timedelta(days=0, seconds=0, microseconds=0, milliseconds=0, minutes=0,
/// hours=0, weeks=0)`; components may be fractional.
pub fn make_timedelta(args: Vec<Value>, kwargs: Vec<(String, Value)>) -> Result<Value, Fault> {
    let params = [
        ("days", MICROS_PER_DAY),
        ("seconds", MICROS_PER_SECOND),
        ("microseconds", 1),
        ("milliseconds", 1_000),
        ("minutes", 60 * MICROS_PER_SECOND),
        ("hours", 3_600 * MICROS_PER_SECOND),
        ("weeks", 7 * MICROS_PER_DAY),
    ];
    let names: Vec<&str> = params.iter().map(|(name, _)| *name).collect();
    let slots = bind("timedelta", &names, 0, args, kwargs)?;

    let mut whole: i64 = 0;
    let mut fractional = 0.0f64;
    for (slot, (name, scale)) in slots.iter().zip(params) {
        match slot {
            None => {}
            Some(Value::Float(v)) => fractional += v * scale as f64,
            Some(value) => {
                let v = value.as_int().ok_or_else(|| {
                    Fault::Type(format!(
                        "unsupported type for timedelta {name} component: {}",
                        value.type_name()
                    ))
                })?;
                whole = v
                    .checked_mul(scale)
                    .and_then(|scaled| whole.checked_add(scaled))
                    .ok_or(Fault::Overflow)?;
            }
        }
    }
    if !fractional.is_finite() || fractional.abs() > i64::MAX as f64 {
        return Err(Fault::Overflow);
    }
    let total = whole
        .checked_add(fractional.round_ties_even() as i64)
        .ok_or(Fault::Overflow)?;
    timedelta(total)
}

/// Wrap microseconds, enforcing the day range.
pub fn timedelta(micros: i64) -> Result<Value, Fault> {
    if micros.div_euclid(MICROS_PER_DAY).abs() > MAX_DAYS {
        return Err(Fault::Value(format!(
            "timedelta exceeds {MAX_DAYS} days"
        )));
    }
    Ok(Value::TimeDelta(micros))
}

/// Shift a datetime by a signed duration.
pub fn shift(dt: &NaiveDateTime, micros: i64) -> Result<Value, Fault> {
    dt.checked_add_signed(TimeDelta::microseconds(micros))
        .filter(|shifted| (1..=9999).contains(&shifted.year()))
        .map(Value::DateTime)
        .ok_or_else(|| Fault::Value("date value out of range".to_string()))
}

/// Difference of two datetimes in microseconds.
pub fn difference(a: &NaiveDateTime, b: &NaiveDateTime) -> Result<Value, Fault> {
    let micros = (*a - *b).num_microseconds().ok_or(Fault::Overflow)?;
    timedelta(micros)
}

fn checked_items(format: &str) -> Result<Vec<Item<'_>>, Fault> {
    let items: Vec<Item<'_>> = StrftimeItems::new(format).collect();
    if items.iter().any(|item| matches!(item, Item::Error)) {
        return Err(Fault::Value(format!("invalid format string '{format}'")));
    }
    Ok(items)
}

pub fn strftime(dt: &NaiveDateTime, format: &str) -> Result<String, Fault> {
    let items = checked_items(format)?;
    let mut out = String::new();
    write!(out, "{}", dt.format_with_items(items.iter()))
        .map_err(|_| Fault::Value(format!("format '{format}' cannot be applied to a datetime")))?;
    Ok(out)
}

/// Parse `text` with a strftime-style format. Date-only formats yield
/// midnight; time-only formats yield 1900-01-01.
pub fn strptime(text: &str, format: &str) -> Result<Value, Fault> {
    checked_items(format)?;
    if let Ok(dt) = NaiveDateTime::parse_from_str(text, format) {
        return Ok(Value::DateTime(dt));
    }
    if let Ok(date) = NaiveDate::parse_from_str(text, format)
        && let Some(midnight) = date.and_hms_opt(0, 0, 0)
    {
        return Ok(Value::DateTime(midnight));
    }
    if let Ok(time) = NaiveTime::parse_from_str(text, format)
        && let Some(date) = NaiveDate::from_ymd_opt(1900, 1, 1)
    {
        return Ok(Value::DateTime(date.and_time(time)));
    }
    Err(Fault::Value(format!(
        "time data '{text}' does not match format '{format}'"
    )))
}

pub fn fromisoformat(text: &str) -> Result<Value, Fault> {
    for format in ISO_FORMATS {
        if let Ok(dt) = NaiveDateTime::parse_from_str(text, format) {
            return Ok(Value::DateTime(dt));
        }
    }
    NaiveDate::parse_from_str(text, "%Y-%m-%d")
        .ok()
        .and_then(|date| date.and_hms_opt(0, 0, 0))
        .map(Value::DateTime)
        .ok_or_else(|| Fault::Value(format!("invalid isoformat string: '{text}'")))
}

pub fn now() -> Value {
    Value::DateTime(Local::now().naive_local())
}

pub fn datetime_attribute(dt: &NaiveDateTime, name: &str) -> Option<Value> {
    let value = match name {
        "year" => i64::from(dt.year()),
        "month" => i64::from(dt.month()),
        "day" => i64::from(dt.day()),
        "hour" => i64::from(dt.hour()),
        "minute" => i64::from(dt.minute()),
        "second" => i64::from(dt.second()),
        "microsecond" => i64::from(dt.nanosecond() / 1_000),
        _ => return None,
    };
    Some(Value::Int(value))
}

pub fn datetime_method(
    dt: &NaiveDateTime,
    name: &str,
    args: Vec<Value>,
    kwargs: Vec<(String, Value)>,
) -> Result<Value, Fault> {
    match name {
        "strftime" => {
            let slots = bind("strftime", &["format"], 1, args, kwargs)?;
            match &slots[0] {
                Some(Value::Str(format)) => Ok(Value::Str(strftime(dt, format)?)),
                _ => Err(Fault::Type("strftime() argument must be str".to_string())),
            }
        }
        "weekday" => {
            bind("weekday", &[], 0, args, kwargs)?;
            Ok(Value::Int(i64::from(dt.weekday().num_days_from_monday())))
        }
        "isoweekday" => {
            bind("isoweekday", &[], 0, args, kwargs)?;
            Ok(Value::Int(i64::from(dt.weekday().number_from_monday())))
        }
        "isoformat" => {
            bind("isoformat", &[], 0, args, kwargs)?;
            Ok(Value::Str(datetime_str(dt).replacen(' ', "T", 1)))
        }
        "replace" => {
            let params = [
                "year",
                "month",
                "day",
                "hour",
                "minute",
                "second",
                "microsecond",
            ];
            let slots = bind("replace", &params, 0, args, kwargs)?;
            let mut fields = [
                i64::from(dt.year()),
                i64::from(dt.month()),
                i64::from(dt.day()),
                i64::from(dt.hour()),
                i64::from(dt.minute()),
                i64::from(dt.second()),
                i64::from(dt.nanosecond() / 1_000),
            ];
            for (i, slot) in slots.iter().enumerate() {
                if let Some(value) = slot {
                    fields[i] = value.as_int().ok_or_else(|| {
                        Fault::Type(format!("'{}' must be an integer", params[i]))
                    })?;
                }
            }
            build_datetime(fields)
        }
        _ => Err(Fault::Attribute(format!(
            "'datetime' object has no attribute '{name}'"
        ))),
    }
}

pub fn timedelta_attribute(micros: i64, name: &str) -> Option<Value> {
    let rest = micros.rem_euclid(MICROS_PER_DAY);
    let value = match name {
        "days" => micros.div_euclid(MICROS_PER_DAY),
        "seconds" => rest / MICROS_PER_SECOND,
        "microseconds" => rest % MICROS_PER_SECOND,
        _ => return None,
    };
    Some(Value::Int(value))
}

pub fn timedelta_method(
    micros: i64,
    name: &str,
    args: Vec<Value>,
    kwargs: Vec<(String, Value)>,
) -> Result<Value, Fault> {
    match name {
        "total_seconds" => {
            bind("total_seconds", &[], 0, args, kwargs)?;
            Ok(Value::Float(micros as f64 / MICROS_PER_SECOND as f64))
        }
        _ => Err(Fault::Attribute(format!(
            "'timedelta' object has no attribute '{name}'"
        ))),
    }
}

/// Class-level calls on `datetime` (`datetime.strptime(...)` and friends).
pub fn class_method(
    name: &str,
    args: Vec<Value>,
    kwargs: Vec<(String, Value)>,
) -> Result<Value, Fault> {
    match name {
        "strptime" => {
            let slots = bind("strptime", &["date_string", "format"], 2, args, kwargs)?;
            match (&slots[0], &slots[1]) {
                (Some(Value::Str(text)), Some(Value::Str(format))) => strptime(text, format),
                _ => Err(Fault::Type(
                    "strptime() arguments must be str".to_string(),
                )),
            }
        }
        "fromisoformat" => {
            let slots = bind("fromisoformat", &["date_string"], 1, args, kwargs)?;
            match &slots[0] {
                Some(Value::Str(text)) => fromisoformat(text),
                _ => Err(Fault::Type("fromisoformat: argument must be str".to_string())),
            }
        }
        "now" | "today" => {
            bind(name, &[], 0, args, kwargs)?;
            Ok(now())
        }
        _ => Err(Fault::Attribute(format!(
            "type object 'datetime' has no attribute '{name}'"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dt(text: &str) -> NaiveDateTime {
        match strptime(text, "%Y-%m-%d %H:%M").expect("parse") {
            Value::DateTime(dt) => dt,
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn timedelta_display_floors_days() {
        assert_eq!(timedelta_str(90 * 60 * MICROS_PER_SECOND), "1:30:00");
        assert_eq!(timedelta_str(MICROS_PER_DAY + 5 * MICROS_PER_SECOND), "1 day, 0:00:05");
        assert_eq!(timedelta_str(-3_600 * MICROS_PER_SECOND), "-1 day, 23:00:00");
        assert_eq!(timedelta_str(2 * MICROS_PER_DAY + 1), "2 days, 0:00:00.000001");
    }

    #[test]
    fn keyword_constructor_accepts_fractions() {
        let value = make_timedelta(
            Vec::new(),
            vec![
                ("hours".to_string(), Value::Float(1.5)),
                ("minutes".to_string(), Value::Int(15)),
            ],
        )
        .expect("timedelta");
        assert_eq!(value, Value::TimeDelta(105 * 60 * MICROS_PER_SECOND));
    }

    #[test]
    fn difference_and_attributes() {
        let start = dt("2024-03-01 09:15");
        let end = dt("2024-03-02 11:45");
        let Value::TimeDelta(micros) = difference(&end, &start).expect("diff") else {
            panic!("expected timedelta");
        };
        assert_eq!(timedelta_attribute(micros, "days"), Some(Value::Int(1)));
        assert_eq!(timedelta_attribute(micros, "seconds"), Some(Value::Int(9_000)));
    }

    #[test]
    fn strptime_handles_date_only_and_time_only() {
        assert_eq!(
            strptime("2024-02-29", "%Y-%m-%d").expect("date").to_string(),
            "2024-02-29 00:00:00"
        );
        assert_eq!(
            strptime("14:30", "%H:%M").expect("time").to_string(),
            "1900-01-01 14:30:00"
        );
        let err = strptime("yesterday", "%Y-%m-%d").expect_err("mismatch");
        assert!(err.to_string().contains("does not match format"));
    }

    #[test]
    fn strftime_rejects_invalid_specifiers() {
        let value = dt("2024-01-05 08:00");
        assert_eq!(strftime(&value, "%A %d %B").expect("format"), "Friday 05 January");
        assert!(strftime(&value, "%Q").is_err());
    }

    #[test]
    fn invalid_calendar_dates_are_value_errors() {
        let err = make_datetime(
            vec![Value::Int(2023), Value::Int(2), Value::Int(29)],
            Vec::new(),
        )
        .expect_err("not a leap year");
        assert!(err.to_string().contains("out of range"));
    }

    #[test]
    fn shifting_past_the_calendar_fails() {
        let value = dt("9999-12-31 23:00");
        assert!(shift(&value, 2 * 3_600 * MICROS_PER_SECOND).is_err());
    }
}
