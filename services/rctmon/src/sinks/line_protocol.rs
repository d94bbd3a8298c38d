//! InfluxDB line protocol rendering

use std::fmt::Write as _;

use crate::catalog;
use crate::protocol::Value;
use crate::store::Reading;

pub const MEASUREMENT: &str = "raw_data";

/// Render one reading as a line, without trailing newline
///
/// Returns `None` for non-finite floats, which InfluxDB rejects.
pub fn line(reading: &Reading) -> Option<String> {
    let field = match &reading.value {
        Value::Float(v) if !v.is_finite() => return None,
        Value::Float(v) => format!("value_float={}", v),
        Value::Int(v) => format!("value_int={}i", v),
        Value::Bool(v) => format!("value_bool={}", v),
        Value::Str(s) => format!("value_string=\"{}\"", escape_string(s)),
    };

    let oid = format!("0x{:X}", reading.oid);
    let name = catalog::object(reading.oid).map_or(reading.metric, |info| info.name);

    let mut tags: Vec<(&str, &str)> = reading.labels.iter().collect();
    tags.push(("oid", oid.as_str()));
    tags.push(("name", name));
    tags.sort_unstable_by(|a, b| a.0.cmp(b.0));
    tags.dedup_by(|a, b| a.0 == b.0);

    let mut out = String::from(MEASUREMENT);
    for (key, value) in tags {
        if value.is_empty() {
            continue;
        }
        let _ = write!(out, ",{}={}", escape_tag(key), escape_tag(value));
    }
    let _ = write!(out, " {} {}", field, reading.observed_at.timestamp());
    Some(out)
}

/// Render a batch, one line per reading
pub fn lines<'a, I>(readings: I) -> String
where
    I: IntoIterator<Item = &'a Reading>,
{
    let mut body = String::new();
    for line in readings.into_iter().filter_map(line) {
        body.push_str(&line);
        body.push('\n');
    }
    body
}

fn escape_tag(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for c in raw.chars() {
        match c {
            ',' | '=' | ' ' => {
                out.push('\\');
                out.push(c);
            },
            '\n' => out.push_str("\\n"),
            _ => out.push(c),
        }
    }
    out
}

fn escape_string(raw: &str) -> String {
    raw.replace('\\', "\\\\").replace('"', "\\\"")
}
