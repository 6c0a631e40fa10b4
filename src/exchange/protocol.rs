//! Wire format of the attribute exchange protocol.
//!
//! Line based, UTF-8, `\n` terminated. A request is one line:
//!
//! ```text
//! torr_main,TB,slit_number      <- named attributes
//!                               <- (empty line) every attribute
//! @START | @END | @ABORT | @STATUS | @PING
//! ```
//!
//! A reply is zero or more lines followed by the terminator line `END`:
//!
//! ```text
//! torr_main=1.5e-10;torr;1718000000123;1
//! nope=NOTFOUND
//! END
//! ```
//!
//! Control replies are `OK <text>`; failures are `ERR <Kind> <message>`. Inside a
//! record, `\`, `;`, newline and carriage return in the value or unit are escaped
//! with a backslash.

use crate::core::{Attribute, AttributeValue};
use crate::error::{AppResult, DaqError};
use chrono::DateTime;

/// Last line of every reply.
pub const TERMINATOR: &str = "END";

/// Value marker for names the store has never seen.
pub const NOT_FOUND: &str = "NOTFOUND";

/// One request line.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Request {
    /// Fetch the named attributes; empty means all
    Attributes(Vec<String>),
    /// Begin a scan
    Start,
    /// End-of-scan: complete the running scan and return its snapshot
    End,
    /// Abort the running scan
    Abort,
    /// Scan phase
    Status,
    /// Liveness check
    Ping,
}

impl Request {
    /// Parse one request line (terminator already stripped).
    pub fn parse(line: &str) -> AppResult<Self> {
        let line = line.trim();
        if let Some(control) = line.strip_prefix('@') {
            return match control.trim().to_ascii_uppercase().as_str() {
                "START" => Ok(Request::Start),
                "END" => Ok(Request::End),
                "ABORT" => Ok(Request::Abort),
                "STATUS" => Ok(Request::Status),
                "PING" => Ok(Request::Ping),
                other => Err(DaqError::ProtocolError(format!(
                    "unknown control command '@{other}'"
                ))),
            };
        }
        let names = line
            .split(',')
            .map(str::trim)
            .filter(|n| !n.is_empty())
            .map(str::to_string)
            .collect();
        Ok(Request::Attributes(names))
    }

    /// The request as it goes on the wire, without the newline.
    pub fn encode(&self) -> String {
        match self {
            Request::Attributes(names) => names.join(","),
            Request::Start => "@START".to_string(),
            Request::End => "@END".to_string(),
            Request::Abort => "@ABORT".to_string(),
            Request::Status => "@STATUS".to_string(),
            Request::Ping => "@PING".to_string(),
        }
    }
}

/// One attribute line of a reply.
#[derive(Clone, Debug, PartialEq)]
pub enum Record {
    /// Known attribute with its reading
    Found(Attribute),
    /// Name the server does not know
    NotFound(String),
}

/// Backslash-escape a record field.
pub fn escape(field: &str) -> String {
    let mut out = String::with_capacity(field.len());
    for c in field.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            ';' => out.push_str("\\;"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            c => out.push(c),
        }
    }
    out
}

/// Split on unescaped `;` and undo [`escape`] in each field.
fn split_fields(raw: &str) -> AppResult<Vec<String>> {
    let mut fields = vec![String::new()];
    let mut chars = raw.chars();
    while let Some(c) = chars.next() {
        match c {
            '\\' => {
                let unescaped = match chars.next() {
                    Some('\\') => '\\',
                    Some(';') => ';',
                    Some('n') => '\n',
                    Some('r') => '\r',
                    Some(other) => {
                        return Err(DaqError::ProtocolError(format!(
                            "bad escape '\\{other}' in record"
                        )))
                    }
                    None => {
                        return Err(DaqError::ProtocolError(
                            "dangling escape at end of record".to_string(),
                        ))
                    }
                };
                if let Some(last) = fields.last_mut() {
                    last.push(unescaped);
                }
            }
            ';' => fields.push(String::new()),
            c => {
                if let Some(last) = fields.last_mut() {
                    last.push(c);
                }
            }
        }
    }
    Ok(fields)
}

/// `name=value;unit;epoch_ms;valid`
pub fn encode_attribute(attr: &Attribute) -> String {
    format!(
        "{}={};{};{};{}",
        attr.name,
        escape(&attr.value.to_string()),
        escape(&attr.unit),
        attr.epoch_ms(),
        u8::from(attr.valid)
    )
}

/// `name=NOTFOUND`
pub fn encode_not_found(name: &str) -> String {
    format!("{name}={NOT_FOUND}")
}

/// Decode one record line.
pub fn decode_record(line: &str) -> AppResult<Record> {
    let (name, rest) = line
        .split_once('=')
        .ok_or_else(|| DaqError::ProtocolError(format!("record without '=': '{line}'")))?;
    if rest == NOT_FOUND {
        return Ok(Record::NotFound(name.to_string()));
    }

    let fields = split_fields(rest)?;
    let [value, unit, epoch_ms, valid] = fields.as_slice() else {
        return Err(DaqError::ProtocolError(format!(
            "record '{name}' has {} fields, expected 4",
            fields.len()
        )));
    };
    let timestamp = epoch_ms
        .parse::<i64>()
        .ok()
        .and_then(DateTime::from_timestamp_millis)
        .ok_or_else(|| DaqError::ProtocolError(format!("bad timestamp '{epoch_ms}'")))?;
    let valid = match valid.as_str() {
        "1" => true,
        "0" => false,
        other => {
            return Err(DaqError::ProtocolError(format!(
                "bad validity flag '{other}'"
            )))
        }
    };
    Ok(Record::Found(Attribute {
        name: name.to_string(),
        value: AttributeValue::parse(value),
        unit: unit.clone(),
        timestamp,
        valid,
    }))
}

/// `OK <text>`
pub fn encode_ok(text: &str) -> String {
    format!("OK {text}")
}

/// `ERR <Kind> <message>`, message kept on one line.
pub fn encode_error(err: &DaqError) -> String {
    format!("ERR {} {}", err.kind(), escape(&err.to_string()))
}

/// Map an `ERR` line back into an error.
///
/// Kinds without a structured counterpart come back as `ProtocolError` carrying
/// the remote message.
pub fn decode_error(line: &str) -> DaqError {
    let rest = line.strip_prefix("ERR").unwrap_or(line).trim_start();
    let (kind, message) = rest.split_once(' ').unwrap_or((rest, ""));
    let message = split_fields(message)
        .map(|fields| fields.join(";"))
        .unwrap_or_else(|_| message.to_string());
    match kind {
        "AttributeNotFound" => DaqError::AttributeNotFound(message),
        "StaleAttribute" => DaqError::StaleAttribute(message),
        "ScanAlreadyRunning" => DaqError::ScanAlreadyRunning(message),
        "ScanNotRunning" => DaqError::ScanNotRunning,
        "ScanAborted" => DaqError::ScanAborted(message),
        "SnapshotCaptureFailed" => DaqError::SnapshotCaptureFailed {
            attempts: 0,
            reason: message,
        },
        "LinkTimeout" => DaqError::LinkTimeout(message),
        "LinkDisconnected" => DaqError::LinkDisconnected(message),
        "MotionRejected" => DaqError::MotionRejected(message),
        _ => DaqError::ProtocolError(format!("remote {kind}: {message}")),
    }
}

/// A decoded reply.
#[derive(Clone, Debug, PartialEq)]
pub enum Reply {
    /// Attribute records, in server order
    Records(Vec<Record>),
    /// `OK` reply text
    Ok(String),
}

/// Decode the lines of one reply (terminator excluded).
pub fn decode_reply(lines: &[String]) -> AppResult<Reply> {
    match lines.first() {
        Some(first) if first.starts_with("ERR") => Err(decode_error(first)),
        Some(first) if first == "OK" || first.starts_with("OK ") => {
            Ok(Reply::Ok(first.get(3..).unwrap_or_default().to_string()))
        }
        _ => lines
            .iter()
            .map(|line| decode_record(line))
            .collect::<AppResult<Vec<_>>>()
            .map(Reply::Records),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    #[test]
    fn test_parse_requests() {
        assert_eq!(Request::parse("").unwrap(), Request::Attributes(vec![]));
        assert_eq!(
            Request::parse(" TA, torr_main ,,").unwrap(),
            Request::Attributes(vec!["TA".into(), "torr_main".into()])
        );
        assert_eq!(Request::parse("@end").unwrap(), Request::End);
        assert!(Request::parse("@REBOOT").is_err());
        assert_eq!(Request::Status.encode(), "@STATUS");
    }

    #[test]
    fn test_record_encoding() {
        let ts = DateTime::from_timestamp_millis(1_718_000_000_123).unwrap();
        let attr = Attribute::new("torr_main", 1.5e-10, "torr").with_timestamp(ts);
        assert_eq!(encode_attribute(&attr), "torr_main=1.5e-10;torr;1718000000123;1");
        assert_eq!(encode_not_found("nope"), "nope=NOTFOUND");
        assert_eq!(decode_record("nope=NOTFOUND").unwrap(), Record::NotFound("nope".into()));
    }

    #[test]
    fn test_escaped_text_survives() {
        let attr = Attribute::new("note", "a;b\\c\nd", "").with_timestamp(
            DateTime::from_timestamp_millis(Utc::now().timestamp_millis()).unwrap(),
        );
        let line = encode_attribute(&attr.clone().invalid());
        assert!(!line.contains('\n'));
        let Record::Found(decoded) = decode_record(&line).unwrap() else {
            panic!("expected record");
        };
        assert_eq!(decoded.value, attr.value);
        assert!(!decoded.valid);
        assert_eq!(decoded.timestamp, attr.timestamp);
    }

    #[test]
    fn test_malformed_records() {
        assert!(decode_record("no-equals").is_err());
        assert!(decode_record("x=1;K;abc;1").is_err());
        assert!(decode_record("x=1;K;0;yes").is_err());
        assert!(decode_record("x=1;K").is_err());
    }

    #[test]
    fn test_error_roundtrip() {
        let line = encode_error(&DaqError::ScanAlreadyRunning("1234".into()));
        assert!(line.starts_with("ERR ScanAlreadyRunning "));
        assert!(matches!(decode_error(&line), DaqError::ScanAlreadyRunning(_)));
        assert!(matches!(
            decode_reply(&[line]),
            Err(DaqError::ScanAlreadyRunning(_))
        ));
        assert!(matches!(
            decode_error("ERR ScanNotRunning No scan is running"),
            DaqError::ScanNotRunning
        ));
    }

    #[test]
    fn test_decode_ok_reply() {
        assert_eq!(
            decode_reply(&["OK PONG".to_string()]).unwrap(),
            Reply::Ok("PONG".into())
        );
        assert_eq!(decode_reply(&[]).unwrap(), Reply::Records(vec![]));
    }
}
