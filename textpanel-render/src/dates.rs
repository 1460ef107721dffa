//! dayjs-style date patterns (`YYYY-MM-DD HH:mm`), as used by dashboard
//! variables and the `date` template helper.

use chrono::{DateTime, SecondsFormat, TimeZone, Utc};
use serde_json::Value;

/// Tokens longest-first so `YYYY` wins over `YY` and `SSS` over `ss`.
const TOKENS: &[(&str, &str)] = &[
    ("YYYY", "%Y"),
    ("YY", "%y"),
    ("MMMM", "%B"),
    ("MMM", "%b"),
    ("MM", "%m"),
    ("M", "%-m"),
    ("DD", "%d"),
    ("D", "%-d"),
    ("dddd", "%A"),
    ("ddd", "%a"),
    ("HH", "%H"),
    ("H", "%-H"),
    ("hh", "%I"),
    ("h", "%-I"),
    ("mm", "%M"),
    ("m", "%-M"),
    ("ss", "%S"),
    ("s", "%-S"),
    ("SSS", "%3f"),
    ("A", "%p"),
    ("a", "%P"),
    ("ZZ", "%z"),
    ("Z", "%:z"),
];

/// Translates a dayjs pattern into a chrono format string. Text inside
/// `[...]` is copied literally.
pub fn to_chrono_format(pattern: &str) -> String {
    let mut out = String::with_capacity(pattern.len() * 2);
    let mut rest = pattern;
    'outer: while let Some(c) = rest.chars().next() {
        if c == '[' {
            if let Some(end) = rest.find(']') {
                out.push_str(&rest[1..end].replace('%', "%%"));
                rest = &rest[end + 1..];
                continue;
            }
        }
        for (token, format) in TOKENS {
            if rest.starts_with(token) {
                out.push_str(format);
                rest = &rest[token.len()..];
                continue 'outer;
            }
        }
        if c == '%' {
            out.push_str("%%");
        } else {
            out.push(c);
        }
        rest = &rest[c.len_utf8()..];
    }
    out
}

pub fn format_pattern(date: &DateTime<Utc>, pattern: &str) -> String {
    date.format(&to_chrono_format(pattern)).to_string()
}

pub fn to_iso(date: &DateTime<Utc>) -> String {
    date.to_rfc3339_opts(SecondsFormat::Millis, true)
}

pub fn from_millis(millis: i64) -> Option<DateTime<Utc>> {
    Utc.timestamp_millis_opt(millis).single()
}

/// Reads epoch milliseconds, RFC 3339 strings, or `"now"`.
pub fn parse_date(value: &Value) -> Option<DateTime<Utc>> {
    match value {
        Value::Number(n) => n
            .as_i64()
            .or_else(|| n.as_f64().map(|f| f as i64))
            .and_then(from_millis),
        Value::String(s) if s == "now" => Some(Utc::now()),
        Value::String(s) => DateTime::parse_from_rfc3339(s)
            .map(|d| d.with_timezone(&Utc))
            .ok()
            .or_else(|| s.parse::<i64>().ok().and_then(from_millis)),
        Value::Null => Some(Utc::now()),
        _ => None,
    }
}

/// Applies a variable date format suffix (`date`, `date:iso`,
/// `date:seconds`, `date:<pattern>`) to an epoch-millisecond value.
/// Returns `None` when the suffix is not a date format or the value does
/// not parse.
pub fn format_variable_date(format: &str, raw: &str) -> Option<String> {
    let spec = format.strip_prefix("date")?;
    let millis: i64 = raw.trim().parse().ok()?;
    match spec {
        "" | ":iso" => from_millis(millis).map(|d| to_iso(&d)),
        ":seconds" => Some(((millis as f64 / 1000.0).round() as i64).to_string()),
        other => {
            let pattern = other.strip_prefix(':')?;
            from_millis(millis).map(|d| format_pattern(&d, pattern))
        }
    }
}
