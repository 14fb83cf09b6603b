//! Wire format of a published sample
//!
//! One line of pipe-delimited UTF-8, fields in fixed order:
//!
//! ```text
//! studentId|speedKmH|timestampMs|latitude|longitude
//! 816034662|36.00|1700000000000|10.641812|-61.399521
//! ```
//!
//! Speed carries 2 decimals, coordinates 6.

use std::str::FromStr;

use crate::location::LocationSample;

pub const DEFAULT_TOPIC: &str = "assignment/location";
pub const FIELD_SEPARATOR: char = '|';
const FIELD_COUNT: usize = 5;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PayloadError {
    #[error("Expected 5 fields, found {0}")]
    FieldCount(usize),

    #[error("Invalid {field}: {value:?}")]
    InvalidField { field: &'static str, value: String },
}

pub fn encode(student_id: &str, sample: &LocationSample) -> String {
    format!(
        "{}|{:.2}|{}|{:.6}|{:.6}",
        student_id,
        sample.speed_kmh(),
        sample.timestamp_ms(),
        sample.latitude(),
        sample.longitude()
    )
}

/// Parsed form of a payload line, for consumers of the topic
#[derive(Debug, Clone, PartialEq)]
pub struct LocationPayload {
    pub student_id: String,
    pub speed_kmh: f64,
    pub timestamp_ms: i64,
    pub latitude: f64,
    pub longitude: f64,
}

impl FromStr for LocationPayload {
    type Err = PayloadError;

    fn from_str(line: &str) -> Result<Self, Self::Err> {
        let fields: Vec<&str> = line.trim_end_matches(['\r', '\n']).split(FIELD_SEPARATOR).collect();
        if fields.len() != FIELD_COUNT {
            return Err(PayloadError::FieldCount(fields.len()));
        }

        Ok(Self {
            student_id: fields[0].to_string(),
            speed_kmh: parse_field("speed", fields[1])?,
            timestamp_ms: parse_field("timestamp", fields[2])?,
            latitude: parse_field("latitude", fields[3])?,
            longitude: parse_field("longitude", fields[4])?,
        })
    }
}

fn parse_field<T: FromStr>(field: &'static str, value: &str) -> Result<T, PayloadError> {
    value.parse().map_err(|_| PayloadError::InvalidField {
        field,
        value: value.to_string(),
    })
}
