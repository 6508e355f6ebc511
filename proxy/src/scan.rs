//! Byte-level line-protocol scanning for the write hot path.
//!
//! The proxy never fully parses line protocol - it only needs the
//! measurement token for routing, a normalized trailing timestamp, and a
//! fast structural sanity check of the remainder. Everything here works on
//! byte slices; nothing is decoded or allocated per token.

use serde::{Deserialize, Deserializer};
use std::{fmt, str::FromStr};
use thiserror::Error;

/// Errors scanning a single line-protocol record.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ScanError {
    /// The record starts with a delimiter - there is no measurement token.
    #[error("missing measurement")]
    MissingMeasurement,

    /// The record ended before the measurement was delimited - there is no
    /// tag or field section.
    #[error("missing fields")]
    MissingFields,
}

/// The timestamp precision declared by a write request.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Precision {
    /// Nanoseconds - the wire unit; no conversion.
    #[default]
    Nanoseconds,
    /// Microseconds.
    Microseconds,
    /// Milliseconds.
    Milliseconds,
    /// Seconds.
    Seconds,
}

impl Precision {
    /// Decimal zeros appended to a timestamp of this precision to normalize
    /// it to nanoseconds.
    fn zero_pad(&self) -> usize {
        match self {
            Self::Nanoseconds => 0,
            Self::Microseconds => 3,
            Self::Milliseconds => 6,
            Self::Seconds => 9,
        }
    }
}

impl FromStr for Precision {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "" | "ns" => Ok(Self::Nanoseconds),
            "us" => Ok(Self::Microseconds),
            "ms" => Ok(Self::Milliseconds),
            "s" => Ok(Self::Seconds),
            other => Err(format!("invalid precision {other:?} (use ns, us, ms and s)")),
        }
    }
}

impl fmt::Display for Precision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Nanoseconds => "ns",
            Self::Microseconds => "us",
            Self::Milliseconds => "ms",
            Self::Seconds => "s",
        })
    }
}

impl<'de> Deserialize<'de> for Precision {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// Extract the measurement token: the bytes up to the first unescaped comma
/// (start of tags) or space (start of fields). Escaped delimiters (`\,`,
/// `\ `) are part of the token.
pub fn scan_measurement(line: &[u8]) -> Result<&[u8], ScanError> {
    let mut i = 0;
    while i < line.len() {
        match line[i] {
            b'\\' if i + 1 < line.len() => i += 2,
            b',' | b' ' => {
                if i == 0 {
                    return Err(ScanError::MissingMeasurement);
                }
                return Ok(&line[..i]);
            }
            _ => i += 1,
        }
    }
    Err(ScanError::MissingFields)
}

/// Normalize the record's timestamp to nanoseconds.
///
/// A record carrying a timestamp in the declared precision gets it padded to
/// nanoseconds in place; a record without one gets `now_nanos` appended.
pub fn append_timestamp(line: &[u8], precision: Precision, now_nanos: i64) -> Vec<u8> {
    let mut out = Vec::with_capacity(line.len() + 20);
    out.extend_from_slice(line);

    if trailing_timestamp(line) {
        out.resize(out.len() + precision.zero_pad(), b'0');
    } else {
        out.push(b' ');
        out.extend_from_slice(now_nanos.to_string().as_bytes());
    }
    out
}

/// Does the record end in a bare integer timestamp?
fn trailing_timestamp(line: &[u8]) -> bool {
    let at = match line.iter().rposition(|&b| b == b' ') {
        Some(at) => at,
        None => return false,
    };
    // An escaped space belongs to a field, not the timestamp delimiter.
    if at > 0 && line[at - 1] == b'\\' {
        return false;
    }

    let token = &line[at + 1..];
    let digits = match token.first() {
        Some(b'-') => &token[1..],
        _ => token,
    };
    !digits.is_empty() && digits.iter().all(u8::is_ascii_digit)
}

/// Structurally validate everything after the measurement: optional tag
/// pairs, at least one field pair, an optional trailing integer timestamp.
///
/// This is a cheap gate against garbage reaching the upstream in a batch it
/// would reject wholesale; full validation stays the upstream's job.
pub fn rapid_check(rest: &[u8]) -> bool {
    let n = rest.len();
    if n == 0 {
        return false;
    }

    let mut i = 0;

    // Tag set: `,key=value` repeated, terminated by the field separator.
    while i < n && rest[i] == b',' {
        i += 1;
        if !scan_escaped_token(rest, &mut i, b'=') {
            return false;
        }
        i += 1;
        match scan_tag_value(rest, &mut i) {
            Some(b' ') => break,
            Some(b',') => continue,
            _ => return false,
        }
    }

    if i >= n || rest[i] != b' ' {
        return false;
    }
    i += 1;

    // Field set: at least one `key=value`.
    loop {
        if !scan_escaped_token(rest, &mut i, b'=') {
            return false;
        }
        i += 1;
        if !scan_field_value(rest, &mut i) {
            return false;
        }

        if i >= n {
            // Fields run to end of record; the timestamp is optional.
            return true;
        }
        match rest[i] {
            b',' => i += 1,
            b' ' => {
                i += 1;
                break;
            }
            _ => return false,
        }
    }

    // Timestamp: an optional sign and digits to end of record.
    let mut digits = &rest[i..];
    if let [b'-', tail @ ..] = digits {
        digits = tail;
    }
    !digits.is_empty() && digits.iter().all(u8::is_ascii_digit)
}

/// Advance `i` over one non-empty escaped token, stopping at the unescaped
/// `delim`. Unescaped structural bytes or end-of-input fail the scan.
fn scan_escaped_token(rest: &[u8], i: &mut usize, delim: u8) -> bool {
    let start = *i;
    while *i < rest.len() {
        match rest[*i] {
            b'\\' if *i + 1 < rest.len() => *i += 2,
            b if b == delim => return *i > start,
            b',' | b' ' | b'=' => return false,
            _ => *i += 1,
        }
    }
    false
}

/// Advance `i` over one non-empty tag value, returning the unescaped
/// delimiter (`,` next tag, ` ` start of fields) it stopped at.
fn scan_tag_value(rest: &[u8], i: &mut usize) -> Option<u8> {
    let start = *i;
    while *i < rest.len() {
        match rest[*i] {
            b'\\' if *i + 1 < rest.len() => *i += 2,
            b @ (b',' | b' ') => {
                if *i == start {
                    return None;
                }
                return Some(b);
            }
            b'=' => return None,
            _ => *i += 1,
        }
    }
    // A record cannot end inside the tag set: fields are mandatory.
    None
}

/// Advance `i` over one non-empty field value: a double-quoted string with
/// backslash escapes, or a bare token (number, bool).
fn scan_field_value(rest: &[u8], i: &mut usize) -> bool {
    if *i < rest.len() && rest[*i] == b'"' {
        *i += 1;
        while *i < rest.len() {
            match rest[*i] {
                b'\\' if *i + 1 < rest.len() => *i += 2,
                b'"' => {
                    *i += 1;
                    return true;
                }
                _ => *i += 1,
            }
        }
        return false;
    }

    let start = *i;
    while *i < rest.len() && !matches!(rest[*i], b',' | b' ') {
        if rest[*i] == b'"' {
            return false;
        }
        *i += 1;
    }
    *i > start
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn measurement_plain() {
        assert_eq!(scan_measurement(b"cpu,host=a value=1").unwrap(), b"cpu");
        assert_eq!(scan_measurement(b"cpu value=1").unwrap(), b"cpu");
    }

    #[test]
    fn measurement_with_escapes() {
        assert_eq!(
            scan_measurement(b"c\\,pu,host=a value=1").unwrap(),
            b"c\\,pu"
        );
        assert_eq!(scan_measurement(b"c\\ pu value=1").unwrap(), b"c\\ pu");
    }

    #[test]
    fn measurement_errors() {
        assert_eq!(
            scan_measurement(b",host=a value=1"),
            Err(ScanError::MissingMeasurement)
        );
        assert_eq!(scan_measurement(b"lonely"), Err(ScanError::MissingFields));
        assert_eq!(scan_measurement(b""), Err(ScanError::MissingFields));
    }

    #[test]
    fn timestamp_appended_when_missing() {
        let got = append_timestamp(b"cpu value=1", Precision::Nanoseconds, 1_500_000_000_000_000_007);
        assert_eq!(got, b"cpu value=1 1500000000000000007".to_vec());
    }

    #[test]
    fn timestamp_padded_per_precision() {
        let got = append_timestamp(b"cpu value=1 1647622847", Precision::Seconds, 0);
        assert_eq!(got, b"cpu value=1 1647622847000000000".to_vec());

        let got = append_timestamp(b"cpu value=1 1647622847000", Precision::Milliseconds, 0);
        assert_eq!(got, b"cpu value=1 1647622847000000000".to_vec());

        let got = append_timestamp(b"cpu value=1 1647622847000000", Precision::Microseconds, 0);
        assert_eq!(got, b"cpu value=1 1647622847000000000".to_vec());

        let got = append_timestamp(b"cpu value=1 -1", Precision::Nanoseconds, 0);
        assert_eq!(got, b"cpu value=1 -1".to_vec());
    }

    #[test]
    fn quoted_field_tail_is_not_a_timestamp() {
        let got = append_timestamp(b"cpu note=\"a 123\"", Precision::Nanoseconds, 9);
        assert_eq!(got, b"cpu note=\"a 123\" 9".to_vec());
    }

    #[test]
    fn rapid_check_accepts_well_formed_records() {
        assert!(rapid_check(b",host=a value=1 123"));
        assert!(rapid_check(b",host=a,region=eu value=1"));
        assert!(rapid_check(b" value=1"));
        assert!(rapid_check(b" value=1,other=2u -5"));
        assert!(rapid_check(b" note=\"spaces, commas and = are fine\" 1"));
        assert!(rapid_check(b",ta\\,g=va\\ lue field=true"));
    }

    #[test]
    fn rapid_check_rejects_malformed_records() {
        assert!(!rapid_check(b""));
        assert!(!rapid_check(b",host value=1"));
        assert!(!rapid_check(b",host=a"));
        assert!(!rapid_check(b",host= value=1"));
        assert!(!rapid_check(b" value="));
        assert!(!rapid_check(b" =1"));
        assert!(!rapid_check(b" value=\"unterminated"));
        assert!(!rapid_check(b" value=1 12a"));
        assert!(!rapid_check(b" value=1 1 2"));
        assert!(!rapid_check(b"value=1"));
    }

    #[test]
    fn precision_parsing() {
        assert_eq!("".parse::<Precision>().unwrap(), Precision::Nanoseconds);
        assert_eq!("ns".parse::<Precision>().unwrap(), Precision::Nanoseconds);
        assert_eq!("s".parse::<Precision>().unwrap(), Precision::Seconds);
        assert!("h".parse::<Precision>().is_err());
    }
}
