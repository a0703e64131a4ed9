use chrono::{Local, NaiveDate, NaiveDateTime, TimeZone};
use tracing::warn;

use crate::geo::GeoDb;
use crate::record::{Record, Value};
use crate::schema::{Action, FieldKind, Schema};

/// Splits a line into schema-aware tokens.
///
/// Tokens are whitespace-separated. A token starting with `"` runs to the
/// closing unescaped quote (quotes stripped, `\"` unescaped). The token at
/// the schema's time position may be bracketed `[...]`; brackets are
/// stripped and the inner text -- spaces included -- is one token. Returns
/// `None` on unterminated quotes/brackets or, when `field_number` > 0, on a
/// token-count mismatch.
pub fn tokenize(line: &str, field_number: usize, time_index: usize) -> Option<Vec<String>> {
    let mut tokens = Vec::with_capacity(if field_number > 0 { field_number } else { 8 });
    let bytes = line.as_bytes();
    let mut pos = 0;

    while pos < bytes.len() {
        while pos < bytes.len() && bytes[pos].is_ascii_whitespace() {
            pos += 1;
        }
        if pos >= bytes.len() {
            break;
        }

        let at_time = time_index > 0 && tokens.len() + 1 == time_index;
        match bytes[pos] {
            b'"' => {
                pos += 1;
                let mut token = Vec::new();
                loop {
                    match bytes.get(pos) {
                        Some(b'"') => {
                            pos += 1;
                            break;
                        }
                        Some(b'\\') if bytes.get(pos + 1) == Some(&b'"') => {
                            token.push(b'"');
                            pos += 2;
                        }
                        Some(&c) => {
                            token.push(c);
                            pos += 1;
                        }
                        None => return None, // unterminated quote
                    }
                }
                tokens.push(String::from_utf8_lossy(&token).into_owned());
            }
            b'[' if at_time => {
                pos += 1;
                let end = line[pos..].find(']').map(|i| pos + i)?;
                tokens.push(line[pos..end].to_string());
                pos = end + 1;
            }
            _ => {
                let start = pos;
                while pos < bytes.len() && !bytes[pos].is_ascii_whitespace() {
                    pos += 1;
                }
                tokens.push(line[start..pos].to_string());
            }
        }
    }

    if field_number > 0 && tokens.len() != field_number {
        return None;
    }

    Some(tokens)
}

/// One-entry cache over the (year, month, day) -> midnight-epoch part of
/// timestamp conversion. Log lines cluster by day, so this hits nearly
/// always.
#[derive(Default)]
struct DayCache {
    key: Option<(i32, u32, u32)>,
    midnight: i64,
}

impl DayCache {
    fn midnight_utc(&mut self, year: i32, month: u32, day: u32) -> Option<i64> {
        if self.key == Some((year, month, day)) {
            return Some(self.midnight);
        }

        let date = NaiveDate::from_ymd_opt(year, month, day)?;
        let midnight = date.and_hms_opt(0, 0, 0)?.and_utc().timestamp();
        self.key = Some((year, month, day));
        self.midnight = midnight;
        Some(midnight)
    }
}

/// Applies a schema to a token list, producing one keyed [`Record`].
///
/// Holds the per-cycle scratch state (the day cache); the geo resolver is
/// borrowed per call so the worker keeps single ownership of it.
#[derive(Default)]
pub struct Transformer {
    days: DayCache,
}

impl Transformer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Transforms tokens into a record, or `None` when the token count
    /// does not match the schema or a STORE handler hits a hard parse
    /// error. Emission order is schema order, `type` first.
    pub fn transform(
        &mut self,
        tokens: &[String],
        schema: &Schema,
        geo: &mut GeoDb,
    ) -> Option<Record> {
        if schema.field_number > 0 && tokens.len() != schema.field_number {
            warn!(
                got = tokens.len(),
                expected = schema.field_number,
                "token count mismatch"
            );
            return None;
        }

        let mut record = Record::new();
        record.set("type", Value::Str(schema.name.clone()));

        let mut cursor = 0usize;
        for attr in &schema.attributes {
            match attr.action {
                Action::Ignore => cursor += 1,
                Action::Store => {
                    if cursor >= tokens.len() {
                        continue;
                    }
                    let spans_two = schema.time_span > 0
                        && schema.time_index > 0
                        && cursor == schema.time_index - 1;
                    let value = if spans_two {
                        let second = tokens.get(cursor + 1)?;
                        let joined = format!("{} {}", tokens[cursor], second);
                        cursor += 2;
                        joined
                    } else {
                        let v = tokens[cursor].clone();
                        cursor += 1;
                        v
                    };
                    if !self.apply(&mut record, attr.kind, &attr.name, &value, geo) {
                        return None;
                    }
                }
                Action::Add => {
                    let constant = attr.constant.clone().unwrap_or_default();
                    if !self.apply(&mut record, attr.kind, &attr.name, &constant, geo) {
                        return None;
                    }
                }
            }
        }

        Some(record)
    }

    /// Runs one kind handler. Returns false on a hard parse error, which
    /// drops the whole record.
    fn apply(
        &mut self,
        record: &mut Record,
        kind: FieldKind,
        name: &str,
        value: &str,
        geo: &mut GeoDb,
    ) -> bool {
        match kind {
            FieldKind::Str => {
                record.set(name, Value::Str(value.to_string()));
                true
            }
            FieldKind::Int => match value.parse::<i32>() {
                Ok(n) => {
                    record.set(name, Value::Int(n));
                    true
                }
                Err(_) => {
                    warn!(field = name, value, "int parse error");
                    false
                }
            },
            FieldKind::Int64 => match value.parse::<i64>() {
                Ok(n) => {
                    record.set(name, Value::Int64(n));
                    true
                }
                Err(_) => {
                    warn!(field = name, value, "int64 parse error");
                    false
                }
            },
            FieldKind::Int64Sum => {
                let n = value.parse::<i64>().unwrap_or(0);
                match record.get_mut(name) {
                    Some(Value::Int64(existing)) => *existing += n,
                    _ => record.set(name, Value::Int64(n)),
                }
                true
            }
            FieldKind::Double => match value.parse::<f64>() {
                Ok(n) => {
                    record.set(name, Value::Double(n));
                    true
                }
                Err(_) => {
                    warn!(field = name, value, "double parse error");
                    false
                }
            },
            FieldKind::Ip => {
                record.set(name, Value::Str(value.to_string()));
                if let Some(fields) = geo.resolve(value) {
                    let [country, province, city, _, isp] = fields;
                    record.set(format!("{name}@country"), Value::Str(country));
                    record.set(format!("{name}@province"), Value::Str(province));
                    record.set(format!("{name}@city"), Value::Str(city));
                    record.set(format!("{name}@isp"), Value::Str(isp));
                }
                true
            }
            FieldKind::TimeLocal => match self.parse_time_local(value) {
                Some(ts) => {
                    record.set(name, Value::Int64(ts));
                    true
                }
                None => {
                    warn!(field = name, value, "time_local parse error");
                    false
                }
            },
            FieldKind::TimeDate => match parse_time_date(value) {
                Some(ts) => {
                    record.set(name, Value::Int64(ts));
                    true
                }
                None => {
                    warn!(field = name, value, "time_date parse error");
                    false
                }
            },
            FieldKind::Request => match parse_request(value) {
                Some((method, scheme, domain)) => {
                    record.set("method", Value::Str(method));
                    record.set("scheme", Value::Str(scheme));
                    record.set("domain", Value::Str(domain));
                    true
                }
                None => {
                    warn!(field = name, value, "request parse error");
                    false
                }
            },
            FieldKind::Status => {
                let n = value.parse::<i32>().unwrap_or(0);
                record.set(name, Value::Int(n));
                true
            }
            FieldKind::MiscLiveFilter => {
                let is_stop = matches!(
                    record.get("method"),
                    Some(Value::Str(m)) if m.eq_ignore_ascii_case("stop")
                );
                if !is_stop {
                    record.set("body_bytes_sent", Value::Int64(0));
                }
                true
            }
        }
    }

    /// Apache common format: `DD/Mon/YYYY:HH:MM:SS ±HHMM` (an optional
    /// stray colon after the seconds is tolerated). The calendar part is
    /// taken as UTC, then the offset is applied: added for '+', subtracted
    /// for '-'.
    fn parse_time_local(&mut self, s: &str) -> Option<i64> {
        let (calendar, zone) = {
            let mut parts = s.split_whitespace();
            (parts.next()?, parts.next()?)
        };

        let mut it = calendar.split('/');
        let day: u32 = it.next()?.parse().ok()?;
        let mon = month_number(it.next()?)?;
        let rest = it.next()?;
        if it.next().is_some() {
            return None;
        }

        let mut clock = rest.split(':');
        let year: i32 = clock.next()?.parse().ok()?;
        let hour: i64 = clock.next()?.parse().ok()?;
        let min: i64 = clock.next()?.parse().ok()?;
        let sec: i64 = clock.next()?.parse().ok()?;
        match clock.next() {
            None | Some("") => {}
            Some(_) => return None,
        }

        let midnight = self.days.midnight_utc(year, mon, day)?;
        let ts = midnight + hour * 3600 + min * 60 + sec;

        let (sign, digits) = if let Some(rest) = zone.strip_prefix('+') {
            (1, rest)
        } else if let Some(rest) = zone.strip_prefix('-') {
            (-1, rest)
        } else {
            return None;
        };
        if digits.len() != 4 || !digits.bytes().all(|b| b.is_ascii_digit()) {
            return None;
        }
        let tz_hour: i64 = digits[..2].parse().ok()?;
        let tz_min: i64 = digits[2..].parse().ok()?;

        Some(ts + sign * (tz_hour * 3600 + tz_min * 60))
    }
}

fn month_number(mon: &str) -> Option<u32> {
    let n = match mon {
        "Jan" => 1,
        "Feb" => 2,
        "Mar" => 3,
        "Apr" => 4,
        "May" => 5,
        "Jun" => 6,
        "Jul" => 7,
        "Aug" => 8,
        "Sep" => 9,
        "Oct" => 10,
        "Nov" => 11,
        "Dec" => 12,
        _ => return None,
    };
    Some(n)
}

/// `YYYY-MM-DD HH:MM:SS`, interpreted as local time.
fn parse_time_date(s: &str) -> Option<i64> {
    let naive = NaiveDateTime::parse_from_str(s.trim(), "%Y-%m-%d %H:%M:%S").ok()?;
    Local
        .from_local_datetime(&naive)
        .earliest()
        .map(|dt| dt.timestamp())
}

/// `METHOD (scheme://)?authority(/path)?` -- method is uppercase letters,
/// scheme defaults to "http", authority to "unknown".
fn parse_request(s: &str) -> Option<(String, String, String)> {
    let method_end = s.find(|c: char| !c.is_ascii_uppercase())?;
    if method_end == 0 {
        return None;
    }
    let method = &s[..method_end];

    let rest = &s[method_end..];
    let trimmed = rest.trim_start();
    if trimmed.len() == rest.len() {
        return None; // method must be followed by whitespace
    }

    let (scheme, after) = match trimmed.find("://") {
        Some(at) if !trimmed[..at].is_empty()
            && trimmed[..at].bytes().all(|b| b.is_ascii_lowercase()) =>
        {
            (&trimmed[..at], &trimmed[at + 3..])
        }
        _ => ("http", trimmed),
    };

    let domain_end = after
        .find(|c: char| c == ' ' || c == '/')
        .unwrap_or(after.len());
    let domain = if domain_end == 0 {
        "unknown"
    } else {
        &after[..domain_end]
    };

    Some((method.to_string(), scheme.to_string(), domain.to_string()))
}
