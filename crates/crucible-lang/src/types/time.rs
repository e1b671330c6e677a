//! Timestamp and duration host types.
//!
//! Timestamps parse RFC3339 first, then a fixed fallback list; layout
//! arguments use the original service's reference-time tokens (`2006`, `01`,
//! `02`, `15`, `04`, `05`, ...) and are translated to strftime specifiers, so
//! `t:format("2006-01-02")` behaves the way stored scripts expect. Durations
//! are signed nanosecond quantities with `1h30m`-style string forms.

use std::collections::HashMap;

use chrono::{DateTime, FixedOffset, NaiveDateTime, SecondsFormat, TimeDelta, TimeZone, Utc};

use crate::registry::{HostBinOp, HostCmpOp, HostType};
use crate::value::{HostValue, NativeFunction, Table, TableKey, UserData, Value};

pub const TIME_TAG: &str = "time";
pub const DURATION_TAG: &str = "duration";

type Timestamp = DateTime<FixedOffset>;

fn wrap_time(t: Timestamp) -> Value {
    Value::UserData(UserData::new(TIME_TAG, t))
}

fn wrap_duration(ns: i64) -> Value {
    Value::UserData(UserData::new(DURATION_TAG, ns))
}

fn now() -> Timestamp {
    DateTime::<FixedOffset>::from(Utc::now())
}

/// Fallback layouts tried after RFC3339 and RFC2822 (RFC1123/RFC822 family);
/// a trailing upper-case zone name is treated as UTC.
const FALLBACK_LAYOUTS: &[&str] = &[
    "%Y-%m-%d %H:%M:%S",        // datetime
    "%a %b %e %H:%M:%S UTC %Y", // unix date
    "%a %b %e %H:%M:%S %Y",     // unix date without a zone
    "%A, %d-%b-%y %H:%M:%S",    // rfc850
];

fn parse_time(input: &str) -> Result<Timestamp, String> {
    if let Ok(t) = DateTime::parse_from_rfc3339(input) {
        return Ok(t);
    }
    if let Ok(t) = DateTime::parse_from_rfc2822(input) {
        return Ok(t);
    }
    let stripped = strip_zone_name(input);
    for layout in FALLBACK_LAYOUTS {
        if let Ok(naive) = NaiveDateTime::parse_from_str(stripped, layout) {
            return Ok(DateTime::<FixedOffset>::from(naive.and_utc()));
        }
    }
    Err(format!("cannot parse {input:?} as a timestamp"))
}

/// Drops one trailing all-caps zone token ("... 15:04:05 UTC 2006" keeps the
/// year; "... 15:04:05 GMT" drops GMT).
fn strip_zone_name(input: &str) -> &str {
    let trimmed = input.trim_end();
    if let Some(idx) = trimmed.rfind(' ') {
        let tail = &trimmed[idx + 1..];
        if tail.len() >= 2 && tail.chars().all(|c| c.is_ascii_uppercase()) {
            return trimmed[..idx].trim_end();
        }
    }
    trimmed
}

fn millis_to_time(ms: i64) -> Result<Timestamp, String> {
    Utc.timestamp_millis_opt(ms)
        .single()
        .map(DateTime::<FixedOffset>::from)
        .ok_or_else(|| format!("millisecond timestamp {ms} out of range"))
}

/// Numbers are unix milliseconds, strings are parsed, time user-data passes
/// through.
fn coerce_time(value: &Value) -> Result<Timestamp, String> {
    match value {
        Value::Int(ms) => millis_to_time(*ms),
        Value::Str(s) => parse_time(s),
        Value::Nil => millis_to_time(0),
        Value::UserData(ud) if ud.tag == TIME_TAG => ud
            .downcast_ref::<Timestamp>()
            .copied()
            .ok_or_else(|| "corrupt time userdata".to_string()),
        other => Err(format!(
            "unsupported timestamp operand of type {}",
            other.kind()
        )),
    }
}

/// Numbers are nanoseconds, strings use the `1h30m` duration syntax.
fn coerce_duration(value: &Value) -> Result<i64, String> {
    match value {
        Value::Int(ns) => Ok(*ns),
        Value::Str(s) => parse_duration(s),
        Value::Nil => Ok(0),
        Value::UserData(ud) if ud.tag == DURATION_TAG => ud
            .downcast_ref::<i64>()
            .copied()
            .ok_or_else(|| "corrupt duration userdata".to_string()),
        other => Err(format!(
            "unsupported duration operand of type {}",
            other.kind()
        )),
    }
}

fn self_time(recv: &Value) -> Result<Timestamp, String> {
    match recv {
        Value::UserData(ud) if ud.tag == TIME_TAG => coerce_time(recv),
        other => Err(format!("time expected, got {}", other.kind())),
    }
}

fn self_duration(recv: &Value) -> Result<i64, String> {
    match recv {
        Value::UserData(ud) if ud.tag == DURATION_TAG => coerce_duration(recv),
        other => Err(format!("duration expected, got {}", other.kind())),
    }
}

fn is_time_ud(value: &Value) -> bool {
    matches!(value, Value::UserData(ud) if ud.tag == TIME_TAG)
}

fn is_duration_like(value: &Value) -> bool {
    match value {
        Value::Str(s) => parse_duration(s).is_ok(),
        Value::UserData(ud) => ud.tag == DURATION_TAG,
        _ => false,
    }
}

fn add_time_and_duration(time: Timestamp, ns: i64) -> Value {
    wrap_time(time + TimeDelta::nanoseconds(ns))
}

fn format_time(t: &Timestamp) -> String {
    t.to_rfc3339_opts(SecondsFormat::Secs, true)
}

// ---------------------------------------------------------------------------
// Reference-time layout translation.

const LAYOUT_TOKENS: &[(&str, &str)] = &[
    ("2006", "%Y"),
    ("January", "%B"),
    ("Monday", "%A"),
    (".000000000", "%.9f"),
    (".000000", "%.6f"),
    (".000", "%.3f"),
    ("Jan", "%b"),
    ("Mon", "%a"),
    ("MST", "%Z"),
    ("Z07:00", "%:z"),
    ("-07:00", "%:z"),
    ("-0700", "%z"),
    ("15", "%H"),
    ("01", "%m"),
    ("02", "%d"),
    ("03", "%I"),
    ("04", "%M"),
    ("05", "%S"),
    ("06", "%y"),
    ("_2", "%e"),
    ("PM", "%p"),
    ("pm", "%P"),
    ("1", "%-m"),
    ("2", "%-d"),
    ("3", "%-I"),
];

/// Translates a reference-time layout into a strftime format string.
pub fn translate_layout(layout: &str) -> String {
    let mut out = String::with_capacity(layout.len() + 8);
    let mut rest = layout;
    'outer: while !rest.is_empty() {
        for (token, replacement) in LAYOUT_TOKENS {
            if let Some(tail) = rest.strip_prefix(token) {
                out.push_str(replacement);
                rest = tail;
                continue 'outer;
            }
        }
        let ch = rest.chars().next().expect("rest is non-empty");
        if ch == '%' {
            out.push_str("%%");
        } else {
            out.push(ch);
        }
        rest = &rest[ch.len_utf8()..];
    }
    out
}

// ---------------------------------------------------------------------------
// Duration string forms.

const NS_PER_US: i64 = 1_000;
const NS_PER_MS: i64 = 1_000_000;
const NS_PER_SEC: i64 = 1_000_000_000;
const NS_PER_MIN: i64 = 60 * NS_PER_SEC;
const NS_PER_HOUR: i64 = 60 * NS_PER_MIN;

pub fn parse_duration(input: &str) -> Result<i64, String> {
    let mut rest = input.trim();
    if rest.is_empty() {
        return Err("empty duration string".to_string());
    }
    let negative = if let Some(tail) = rest.strip_prefix('-') {
        rest = tail;
        true
    } else {
        rest = rest.strip_prefix('+').unwrap_or(rest);
        false
    };
    if rest == "0" {
        return Ok(0);
    }
    let mut total = 0f64;
    let mut matched = false;
    while !rest.is_empty() {
        let digits_end = rest
            .find(|c: char| !(c.is_ascii_digit() || c == '.'))
            .unwrap_or(rest.len());
        if digits_end == 0 {
            return Err(format!("invalid duration {input:?}"));
        }
        let number: f64 = rest[..digits_end]
            .parse()
            .map_err(|_| format!("invalid duration {input:?}"))?;
        rest = &rest[digits_end..];
        let (scale, tail) = if let Some(t) = rest.strip_prefix("ns") {
            (1.0, t)
        } else if let Some(t) = rest.strip_prefix("us") {
            (NS_PER_US as f64, t)
        } else if let Some(t) = rest.strip_prefix("µs") {
            (NS_PER_US as f64, t)
        } else if let Some(t) = rest.strip_prefix("ms") {
            (NS_PER_MS as f64, t)
        } else if let Some(t) = rest.strip_prefix('s') {
            (NS_PER_SEC as f64, t)
        } else if let Some(t) = rest.strip_prefix('m') {
            (NS_PER_MIN as f64, t)
        } else if let Some(t) = rest.strip_prefix('h') {
            (NS_PER_HOUR as f64, t)
        } else {
            return Err(format!("unknown unit in duration {input:?}"));
        };
        total += number * scale;
        matched = true;
        rest = tail;
    }
    if !matched {
        return Err(format!("invalid duration {input:?}"));
    }
    let ns = total as i64;
    Ok(if negative { -ns } else { ns })
}

pub fn format_duration(ns: i64) -> String {
    if ns == 0 {
        return "0s".to_string();
    }
    let negative = ns < 0;
    let mut abs = ns.unsigned_abs();
    let mut out = String::new();
    if negative {
        out.push('-');
    }
    if abs < NS_PER_SEC as u64 {
        // Sub-second durations use a single scaled unit.
        let (value, unit) = if abs < NS_PER_US as u64 {
            (abs as f64, "ns")
        } else if abs < NS_PER_MS as u64 {
            (abs as f64 / NS_PER_US as f64, "µs")
        } else {
            (abs as f64 / NS_PER_MS as f64, "ms")
        };
        out.push_str(&trim_float(value));
        out.push_str(unit);
        return out;
    }
    let hours = abs / NS_PER_HOUR as u64;
    abs %= NS_PER_HOUR as u64;
    let minutes = abs / NS_PER_MIN as u64;
    abs %= NS_PER_MIN as u64;
    let seconds = abs as f64 / NS_PER_SEC as f64;
    if hours > 0 {
        out.push_str(&format!("{hours}h"));
    }
    if minutes > 0 || hours > 0 {
        out.push_str(&format!("{minutes}m"));
    }
    out.push_str(&trim_float(seconds));
    out.push('s');
    out
}

fn trim_float(value: f64) -> String {
    let mut s = format!("{value:.9}");
    while s.ends_with('0') {
        s.pop();
    }
    if s.ends_with('.') {
        s.pop();
    }
    s
}

// ---------------------------------------------------------------------------

pub struct TimeType;

impl HostType for TimeType {
    fn name(&self) -> &'static str {
        TIME_TAG
    }

    fn install(&self, globals: &mut HashMap<String, Value>) {
        let mut table = Table::new();
        table.set(
            TableKey::Str("now".into()),
            Value::Native(NativeFunction::new("time.now", |_ctx, _args| {
                Ok(vec![wrap_time(now())])
            })),
        );
        table.set(
            TableKey::Str("new".into()),
            Value::Native(NativeFunction::new("time.new", |_ctx, args| {
                let t = match args.len() {
                    0 => now(),
                    1 => coerce_time(&args[0])?,
                    _ => {
                        let (Value::Str(layout), Value::Str(value)) = (&args[0], &args[1]) else {
                            return Err("time.new(layout, value) expects two strings".to_string());
                        };
                        let format = translate_layout(layout);
                        match DateTime::parse_from_str(value, &format) {
                            Ok(t) => t,
                            Err(_) => NaiveDateTime::parse_from_str(value, &format)
                                .map(|n| DateTime::<FixedOffset>::from(n.and_utc()))
                                .map_err(|e| format!("cannot parse {value:?}: {e}"))?,
                        }
                    }
                };
                Ok(vec![wrap_time(t)])
            })),
        );
        globals.insert(TIME_TAG.to_string(), Value::table(table));
    }

    fn to_host(&self, ud: &UserData) -> Option<HostValue> {
        ud.downcast_ref::<Timestamp>()
            .map(|t| HostValue::Str(format_time(t)))
    }

    fn binary(&self, op: HostBinOp, lhs: &Value, rhs: &Value) -> Result<Value, String> {
        match op {
            HostBinOp::Add => {
                // time + duration in either operand order; bare numbers are
                // rejected as ambiguous.
                if matches!(lhs, Value::Int(_) | Value::Float(_))
                    || matches!(rhs, Value::Int(_) | Value::Float(_))
                {
                    return Err("ambiguous time addition: wrap the number in duration.new".into());
                }
                let (time_side, dur_side) = if is_time_ud(lhs) && is_duration_like(rhs) {
                    (lhs, rhs)
                } else if is_time_ud(rhs) && is_duration_like(lhs) {
                    (rhs, lhs)
                } else {
                    return Err("time addition expects a time and a duration".into());
                };
                Ok(add_time_and_duration(
                    coerce_time(time_side)?,
                    coerce_duration(dur_side)?,
                ))
            }
            HostBinOp::Sub => {
                let (a, b) = (coerce_time(lhs)?, coerce_time(rhs)?);
                let delta = a.signed_duration_since(b);
                let ns = delta
                    .num_nanoseconds()
                    .ok_or_else(|| "timestamp difference out of range".to_string())?;
                Ok(wrap_duration(ns))
            }
            other => Err(format!("time does not support {other:?}")),
        }
    }

    fn compare(&self, op: HostCmpOp, lhs: &Value, rhs: &Value) -> Result<bool, String> {
        let (a, b) = (coerce_time(lhs)?, coerce_time(rhs)?);
        Ok(match op {
            HostCmpOp::Eq => a == b,
            HostCmpOp::Lt => a < b,
            HostCmpOp::Le => a <= b,
        })
    }

    fn len(&self, value: &Value) -> Result<Value, String> {
        Ok(Value::Int(self_time(value)?.timestamp_millis()))
    }

    fn to_display(&self, ud: &UserData) -> String {
        ud.downcast_ref::<Timestamp>()
            .map(format_time)
            .unwrap_or_else(|| format!("<{TIME_TAG}>"))
    }

    fn call_method(&self, name: &str, recv: &Value, args: &[Value]) -> Result<Vec<Value>, String> {
        let t = self_time(recv)?;
        let result = match name {
            "format" => {
                let Some(Value::Str(layout)) = args.first() else {
                    return Err("format expects a layout string".to_string());
                };
                Value::string(t.format(&translate_layout(layout)).to_string())
            }
            "year" => Value::Int(chrono::Datelike::year(&t) as i64),
            "month" => Value::Int(chrono::Datelike::month(&t) as i64),
            "day" => Value::Int(chrono::Datelike::day(&t) as i64),
            "hour" => Value::Int(chrono::Timelike::hour(&t) as i64),
            "minute" => Value::Int(chrono::Timelike::minute(&t) as i64),
            "second" => Value::Int(chrono::Timelike::second(&t) as i64),
            "ns" => Value::Int(chrono::Timelike::nanosecond(&t) as i64),
            "weekday" => Value::Int(chrono::Datelike::weekday(&t).num_days_from_sunday() as i64),
            other => return Err(format!("unknown method '{other}' on time")),
        };
        Ok(vec![result])
    }
}

pub struct DurationType;

impl HostType for DurationType {
    fn name(&self) -> &'static str {
        DURATION_TAG
    }

    fn install(&self, globals: &mut HashMap<String, Value>) {
        let mut table = Table::new();
        table.set(
            TableKey::Str("new".into()),
            Value::Native(NativeFunction::new("duration.new", |_ctx, args| {
                let ns = match args.first() {
                    Some(arg) => coerce_duration(arg)?,
                    None => 0,
                };
                Ok(vec![wrap_duration(ns)])
            })),
        );
        globals.insert(DURATION_TAG.to_string(), Value::table(table));
    }

    fn to_host(&self, ud: &UserData) -> Option<HostValue> {
        ud.downcast_ref::<i64>()
            .map(|ns| HostValue::Str(format_duration(*ns)))
    }

    fn binary(&self, op: HostBinOp, lhs: &Value, rhs: &Value) -> Result<Value, String> {
        // duration + time delegates to the timestamp rules.
        if matches!(op, HostBinOp::Add) && (is_time_ud(lhs) || is_time_ud(rhs)) {
            return TimeType.binary(op, lhs, rhs);
        }
        let (a, b) = (coerce_duration(lhs)?, coerce_duration(rhs)?);
        let ns = match op {
            HostBinOp::Add => a.checked_add(b),
            HostBinOp::Sub => a.checked_sub(b),
            HostBinOp::Mul => a.checked_mul(b),
            HostBinOp::Div => a.checked_div(b),
            HostBinOp::Mod => a.checked_rem(b),
            HostBinOp::Pow => return Err("duration does not support ^".to_string()),
        }
        .ok_or_else(|| "duration arithmetic out of range".to_string())?;
        Ok(wrap_duration(ns))
    }

    fn compare(&self, op: HostCmpOp, lhs: &Value, rhs: &Value) -> Result<bool, String> {
        let (a, b) = (coerce_duration(lhs)?, coerce_duration(rhs)?);
        Ok(match op {
            HostCmpOp::Eq => a == b,
            HostCmpOp::Lt => a < b,
            HostCmpOp::Le => a <= b,
        })
    }

    fn len(&self, value: &Value) -> Result<Value, String> {
        Ok(Value::Int(self_duration(value)?))
    }

    fn to_display(&self, ud: &UserData) -> String {
        ud.downcast_ref::<i64>()
            .map(|ns| format_duration(*ns))
            .unwrap_or_else(|| format!("<{DURATION_TAG}>"))
    }

    fn call_method(&self, name: &str, recv: &Value, args: &[Value]) -> Result<Vec<Value>, String> {
        let _ = args;
        let ns = self_duration(recv)?;
        let result = match name {
            "hours" => Value::Float(ns as f64 / NS_PER_HOUR as f64),
            "minutes" => Value::Float(ns as f64 / NS_PER_MIN as f64),
            "seconds" => Value::Float(ns as f64 / NS_PER_SEC as f64),
            "ms" => Value::Int(ns / NS_PER_MS),
            "us" => Value::Int(ns / NS_PER_US),
            other => return Err(format!("unknown method '{other}' on duration")),
        };
        Ok(vec![result])
    }
}
