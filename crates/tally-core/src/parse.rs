//! Stream message → [`RawEvent`] normalization.
//!
//! Parsing never fails. Fields that are missing or cannot be interpreted are
//! replaced with defaults and reported back so the caller can log and count
//! them; the message itself is never dropped.

use chrono::{DateTime, Utc};
use serde_json::Value as JsonValue;

use crate::error::Error;
use crate::models::{RawEvent, StreamMessage};

/// Why a field was replaced with its default.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldDefect {
    Missing,
    Unparsable,
}

/// A field the parser had to default.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DefaultedField {
    pub field: &'static str,
    pub defect: FieldDefect,
}

/// Parsed event plus the fields that were defaulted on the way.
#[derive(Debug, Clone, PartialEq)]
pub struct ParsedEvent {
    pub event: RawEvent,
    pub defaulted: Vec<DefaultedField>,
}

impl ParsedEvent {
    /// Fields that were present but unusable.
    pub fn malformed(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.defaulted
            .iter()
            .filter(|d| d.defect == FieldDefect::Unparsable)
            .map(|d| d.field)
    }

    /// The unparsable fields of `message_id` as one [`Error::MalformedMessage`],
    /// or `None` when every present field was usable.
    pub fn malformation(&self, message_id: &str) -> Option<Error> {
        let fields: Vec<&str> = self.malformed().collect();
        if fields.is_empty() {
            return None;
        }
        Some(Error::MalformedMessage(format!(
            "message {message_id}: defaulted {}",
            fields.join(", ")
        )))
    }
}

/// Parse a stream message.
///
/// `parsed_at` stands in for a missing or unparsable timestamp. Taking it as
/// an argument keeps this function deterministic for a fixed batch.
pub fn parse_message(message: &StreamMessage, parsed_at: DateTime<Utc>) -> ParsedEvent {
    let mut defaulted = Vec::new();
    let fields = &message.fields;

    let user_id = string_field(fields.get("user_id"), "user_id", &mut defaulted);
    let action = string_field(fields.get("action"), "action", &mut defaulted);
    let element = string_field(fields.get("element"), "element", &mut defaulted);

    let duration = match fields.get("duration") {
        None | Some(JsonValue::Null) => {
            defaulted.push(missing("duration"));
            0.0
        }
        Some(value) => match parse_duration(value) {
            Some(d) => d,
            None => {
                defaulted.push(unparsable("duration"));
                0.0
            }
        },
    };

    let timestamp = match fields.get("timestamp") {
        None | Some(JsonValue::Null) => {
            defaulted.push(missing("timestamp"));
            parsed_at
        }
        Some(value) => match parse_timestamp(value) {
            Some(ts) => ts,
            None => {
                defaulted.push(unparsable("timestamp"));
                parsed_at
            }
        },
    };

    // `id` is optional on the wire, so absence is not a defect.
    let id = match fields.get("id") {
        None | Some(JsonValue::Null) => None,
        Some(value) => {
            let id = parse_id(value);
            if id.is_none() {
                defaulted.push(unparsable("id"));
            }
            id
        }
    };

    ParsedEvent {
        event: RawEvent {
            id,
            user_id,
            action,
            element,
            duration,
            timestamp,
        },
        defaulted,
    }
}

fn missing(field: &'static str) -> DefaultedField {
    DefaultedField {
        field,
        defect: FieldDefect::Missing,
    }
}

fn unparsable(field: &'static str) -> DefaultedField {
    DefaultedField {
        field,
        defect: FieldDefect::Unparsable,
    }
}

fn string_field(
    value: Option<&JsonValue>,
    field: &'static str,
    defaulted: &mut Vec<DefaultedField>,
) -> String {
    match value {
        Some(JsonValue::String(s)) => s.clone(),
        None | Some(JsonValue::Null) => {
            defaulted.push(missing(field));
            String::new()
        }
        Some(_) => {
            defaulted.push(unparsable(field));
            String::new()
        }
    }
}

fn parse_duration(value: &JsonValue) -> Option<f64> {
    let d = match value {
        JsonValue::String(s) => s.trim().parse::<f64>().ok()?,
        JsonValue::Number(n) => n.as_f64()?,
        _ => return None,
    };
    d.is_finite().then_some(d)
}

fn parse_timestamp(value: &JsonValue) -> Option<DateTime<Utc>> {
    let JsonValue::String(s) = value else {
        return None;
    };
    DateTime::parse_from_rfc3339(s.trim())
        .ok()
        .map(|ts| ts.with_timezone(&Utc))
}

fn parse_id(value: &JsonValue) -> Option<i64> {
    let id = match value {
        JsonValue::String(s) => s.trim().parse::<i64>().ok()?,
        JsonValue::Number(n) => n.as_i64()?,
        _ => return None,
    };
    (id >= 0).then_some(id)
}
