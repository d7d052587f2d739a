//! Burp Suite history export model and normalization into Caido-ready rows.
//!
//! [`ItemReader`] streams `<item>` elements out of a Burp XML export, and
//! [`normalize_item`] turns each [`Item`] into a [`HistoryEntry`] whose fields
//! map one-to-one onto the Caido history tables.

use std::collections::BTreeMap;
use std::fmt::{Display, Formatter};

use base64::alphabet;
use base64::engine::{GeneralPurpose, GeneralPurposeConfig};
use base64::Engine as _;
use serde::{Deserialize, Serialize};
use time::macros::format_description;
use time::{OffsetDateTime, PrimitiveDateTime, UtcOffset};

mod xml;

pub use xml::ItemReader;

/// Protocol label Burp writes for TLS captures.
pub const TLS_PROTOCOL: &str = "https";

const WEEKDAYS: [&str; 7] = ["Mon", "Tue", "Wed", "Thu", "Fri", "Sat", "Sun"];

// Burp writes canonical padding but does not guarantee zeroed trailing bits.
const PAYLOAD_ENGINE: GeneralPurpose = GeneralPurpose::new(
    &alphabet::STANDARD,
    GeneralPurposeConfig::new().with_decode_allow_trailing_bits(true),
);

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum ImportError {
    #[error("malformed input: {0}")]
    MalformedInput(String),
    #[error("io error: {0}")]
    Io(String),
    #[error("item {index}: invalid {field} value {value:?}")]
    InvalidField {
        index: usize,
        field: &'static str,
        value: String,
    },
    #[error("invalid base64 in {field} payload: {reason}")]
    PayloadDecode { field: PayloadField, reason: String },
    #[error("invalid timestamp {value:?}: {reason}")]
    TimestampParse { value: String, reason: String },
    #[error("configuration error: {0}")]
    Configuration(String),
}

impl ImportError {
    /// Errors that make the rest of the document unusable.
    #[must_use]
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::MalformedInput(_) | Self::Io(_) | Self::Configuration(_)
        )
    }

    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::MalformedInput(_) => "malformed_input",
            Self::Io(_) => "io",
            Self::InvalidField { .. } => "invalid_field",
            Self::PayloadDecode { .. } => "payload_decode",
            Self::TimestampParse { .. } => "timestamp_parse",
            Self::Configuration(_) => "configuration",
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum PayloadField {
    Request,
    Response,
}

impl PayloadField {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Request => "request",
            Self::Response => "response",
        }
    }
}

impl Display for PayloadField {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum PayloadEncoding {
    #[default]
    Base64,
    Literal,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, Eq, PartialEq)]
pub struct Payload {
    pub text: String,
    pub encoding: PayloadEncoding,
}

impl Payload {
    #[must_use]
    pub fn base64(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            encoding: PayloadEncoding::Base64,
        }
    }
}

/// One `<item>` of a Burp history export, as written by Burp.
#[derive(Debug, Clone, Default, Serialize, Deserialize, Eq, PartialEq)]
pub struct Item {
    pub time: String,
    pub url: String,
    pub host: String,
    pub port: i64,
    pub protocol: String,
    pub method: String,
    pub path: String,
    pub extension: String,
    pub request: Payload,
    pub status: i64,
    pub response_length: i64,
    pub mime_type: String,
    pub response: Payload,
    pub comment: String,
}

/// An [`Item`] with decoded payloads and derived columns, ready for insertion.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct HistoryEntry {
    pub url: String,
    pub created_at_ms: i64,
    pub host: String,
    pub method: String,
    pub path: String,
    pub query: String,
    pub port: i64,
    pub is_tls: bool,
    pub request_bytes: Vec<u8>,
    pub status_code: i64,
    pub response_bytes: Vec<u8>,
    pub response_length: i64,
}

impl HistoryEntry {
    #[must_use]
    pub fn request_length(&self) -> usize {
        self.request_bytes.len()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NormalizeOptions {
    /// Split `path` at the first `?` and store the remainder as the query.
    pub split_query: bool,
    /// Offsets for zone abbreviations other than `UTC`/`GMT`. Unlisted
    /// abbreviations resolve to UTC.
    pub zone_offsets: BTreeMap<String, UtcOffset>,
}

/// Decodes payloads, parses the capture time and derives storage columns.
///
/// # Errors
/// Returns [`ImportError::PayloadDecode`] when a payload is not valid base64
/// and [`ImportError::TimestampParse`] when `time` does not follow Burp's
/// fixed layout.
pub fn normalize_item(item: &Item, options: &NormalizeOptions) -> Result<HistoryEntry, ImportError> {
    let request_bytes = decode_payload(PayloadField::Request, &item.request)?;
    let response_bytes = decode_payload(PayloadField::Response, &item.response)?;
    let captured_at = parse_burp_timestamp(&item.time, &options.zone_offsets)?;
    let created_at_ms = unix_millis(&item.time, captured_at)?;

    let (path, query) = match item.path.split_once('?') {
        Some((path, query)) if options.split_query => (path.to_string(), query.to_string()),
        _ => (item.path.clone(), String::new()),
    };

    Ok(HistoryEntry {
        url: item.url.clone(),
        created_at_ms,
        host: item.host.clone(),
        method: item.method.clone(),
        path,
        query,
        port: item.port,
        is_tls: item.protocol == TLS_PROTOCOL,
        request_bytes,
        status_code: item.status,
        response_bytes,
        response_length: item.response_length,
    })
}

/// Decodes one payload element into raw bytes.
///
/// Line breaks inside base64 text are ignored; any other non-alphabet byte or
/// bad padding is an error.
///
/// # Errors
/// Returns [`ImportError::PayloadDecode`] naming `field` on invalid base64.
pub fn decode_payload(field: PayloadField, payload: &Payload) -> Result<Vec<u8>, ImportError> {
    match payload.encoding {
        PayloadEncoding::Literal => Ok(payload.text.as_bytes().to_vec()),
        PayloadEncoding::Base64 => {
            let compact: Vec<u8> = payload
                .text
                .bytes()
                .filter(|byte| !matches!(byte, b'\r' | b'\n'))
                .collect();
            PAYLOAD_ENGINE
                .decode(compact)
                .map_err(|err| ImportError::PayloadDecode {
                    field,
                    reason: err.to_string(),
                })
        }
    }
}

#[must_use]
pub fn encode_payload(bytes: &[u8]) -> String {
    PAYLOAD_ENGINE.encode(bytes)
}

/// Parses a Burp capture time such as `Tue Mar 05 14:22:01 UTC 2024`.
///
/// The weekday is checked for spelling only. `UTC`, `GMT` and `GMT±N` carry
/// their own offset; other abbreviations are looked up in `zone_offsets` and
/// fall back to UTC.
///
/// # Errors
/// Returns [`ImportError::TimestampParse`] on any deviation from the layout.
pub fn parse_burp_timestamp(
    value: &str,
    zone_offsets: &BTreeMap<String, UtcOffset>,
) -> Result<OffsetDateTime, ImportError> {
    let fail = |reason: &str| ImportError::TimestampParse {
        value: value.to_string(),
        reason: reason.to_string(),
    };

    let fields: Vec<&str> = value.split(' ').collect();
    let [weekday, month, day, clock, zone, year] = fields.as_slice() else {
        return Err(fail(
            "expected `<weekday> <month> <day> <HH:MM:SS> <zone> <year>`",
        ));
    };

    if !WEEKDAYS
        .iter()
        .any(|candidate| candidate.eq_ignore_ascii_case(weekday))
    {
        return Err(fail("unknown weekday"));
    }

    let local = PrimitiveDateTime::parse(
        &format!("{month} {day} {clock} {year}"),
        format_description!(
            "[month repr:short case_sensitive:false] [day] [hour padding:none]:[minute]:[second] [year]"
        ),
    )
    .map_err(|err| fail(&err.to_string()))?;

    let offset = zone_offset(zone, zone_offsets).ok_or_else(|| fail("invalid zone"))?;
    Ok(local.assume_offset(offset))
}

/// Parses a `--zone-offset` mapping such as `PST=-08:00`.
///
/// # Errors
/// Returns [`ImportError::Configuration`] when the abbreviation or offset is
/// malformed.
pub fn parse_zone_offset(spec: &str) -> Result<(String, UtcOffset), ImportError> {
    let (abbreviation, offset) = spec.split_once('=').ok_or_else(|| {
        ImportError::Configuration(format!("zone offset must be ABBR=+HH:MM, got {spec:?}"))
    })?;

    if !is_zone_abbreviation(abbreviation) {
        return Err(ImportError::Configuration(format!(
            "{abbreviation:?} is not a zone abbreviation"
        )));
    }

    let offset = UtcOffset::parse(
        offset,
        format_description!("[offset_hour sign:mandatory]:[offset_minute]"),
    )
    .map_err(|err| ImportError::Configuration(format!("invalid offset {offset:?}: {err}")))?;

    Ok((abbreviation.to_string(), offset))
}

fn zone_offset(zone: &str, zone_offsets: &BTreeMap<String, UtcOffset>) -> Option<UtcOffset> {
    if zone == "UTC" || zone == "GMT" {
        return Some(UtcOffset::UTC);
    }

    if let Some(hours) = zone.strip_prefix("GMT") {
        let (sign, digits) = match hours.as_bytes().first().copied()? {
            b'+' => (1, &hours[1..]),
            b'-' => (-1, &hours[1..]),
            _ => return None,
        };
        if digits.is_empty() || digits.len() > 2 || !digits.bytes().all(|b| b.is_ascii_digit()) {
            return None;
        }
        let hours: i8 = digits.parse().ok()?;
        if hours > 23 {
            return None;
        }
        return UtcOffset::from_hms(sign * hours, 0, 0).ok();
    }

    if !is_zone_abbreviation(zone) {
        return None;
    }

    Some(zone_offsets.get(zone).copied().unwrap_or(UtcOffset::UTC))
}

fn is_zone_abbreviation(zone: &str) -> bool {
    if zone == "ChST" || zone == "MeST" {
        return true;
    }
    if !zone.bytes().all(|byte| byte.is_ascii_uppercase()) {
        return false;
    }

    match zone.len() {
        3 => true,
        4 => zone.ends_with('T') || zone.starts_with("WIT"),
        5 => zone.ends_with('T'),
        _ => false,
    }
}

fn unix_millis(value: &str, instant: OffsetDateTime) -> Result<i64, ImportError> {
    i64::try_from(instant.unix_timestamp_nanos() / 1_000_000).map_err(|_| {
        ImportError::TimestampParse {
            value: value.to_string(),
            reason: "timestamp out of range".to_string(),
        }
    })
}
