//! Dataset identifier parsing (§3.1).
//!
//! The serial is the only user-visible primary key: a 26-character string
//! `<PREFIX>-YYYY-MM-DD-HH-MM-SS-<NNNN>`. Its timestamp is authoritative over
//! any timestamp embedded in source files.

use regex::Regex;
use std::sync::OnceLock;

use crate::error::IngestError;

fn serial_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(
            r"^(?P<prefix>[A-Z0-9]{2,4})-(?P<year>\d{4})-(?P<month>\d{2})-(?P<day>\d{2})-(?P<hour>\d{2})-(?P<minute>\d{2})-(?P<second>\d{2})-(?P<nnnn>\d{4})$",
        )
        .expect("static regex is valid")
    })
}

/// UTC wall-clock timestamp embedded in a serial, kept as plain fields
/// rather than pulling in a datetime crate the rest of the kernel has no
/// other use for.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SerialTimestamp {
    pub year: u16,
    pub month: u8,
    pub day: u8,
    pub hour: u8,
    pub minute: u8,
    pub second: u8,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ParsedSerial {
    pub prefix: String,
    pub timestamp: SerialTimestamp,
    pub sequence: String,
}

/// Parse and validate a dataset serial against §3.1's grammar.
///
/// This also rejects calendar-invalid dates/times (e.g. month 13, hour 25)
/// even though they'd match the regex, since `parse_serial` is the single
/// point of truth the coordinator and catalog both rely on for validity.
pub fn parse_serial(serial: &str) -> Result<ParsedSerial, IngestError> {
    let caps = serial_re().captures(serial).ok_or_else(|| IngestError::InvalidId(serial.to_string()))?;

    let year: u16 = caps["year"].parse().unwrap();
    let month: u8 = caps["month"].parse().unwrap();
    let day: u8 = caps["day"].parse().unwrap();
    let hour: u8 = caps["hour"].parse().unwrap();
    let minute: u8 = caps["minute"].parse().unwrap();
    let second: u8 = caps["second"].parse().unwrap();

    if !(1..=12).contains(&month)
        || !(1..=31).contains(&day)
        || hour > 23
        || minute > 59
        || second > 59
    {
        return Err(IngestError::InvalidId(serial.to_string()));
    }

    Ok(ParsedSerial {
        prefix: caps["prefix"].to_string(),
        timestamp: SerialTimestamp { year, month, day, hour, minute, second },
        sequence: caps["nnnn"].to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_well_formed_serial() {
        let parsed = parse_serial("ML-2021-03-11-10-32-05-0001").unwrap();
        assert_eq!(parsed.prefix, "ML");
        assert_eq!(parsed.timestamp.year, 2021);
        assert_eq!(parsed.sequence, "0001");
    }

    #[test]
    fn rejects_malformed_prefix() {
        assert!(parse_serial("m-2021-03-11-10-32-05-0001").is_err());
        assert!(parse_serial("MLONG5-2021-03-11-10-32-05-0001").is_err());
    }

    #[test]
    fn rejects_out_of_range_calendar_fields() {
        assert!(parse_serial("ML-2021-13-11-10-32-05-0001").is_err());
        assert!(parse_serial("ML-2021-03-11-25-32-05-0001").is_err());
    }

    #[test]
    fn rejects_wrong_sequence_width() {
        assert!(parse_serial("ML-2021-03-11-10-32-05-001").is_err());
        assert!(parse_serial("ML-2021-03-11-10-32-05-00001").is_err());
    }
}
