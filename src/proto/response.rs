use std::{io, str};

use once_cell::sync::Lazy;
use regex::Regex;

use crate::measurement::Validity;

/// A single decoded line. Echoes of the command just sent are flagged by the
/// codec so callers never mistake them for data.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Response {
    Echo(String),
    Line(String),
}

static STRICT_NUMBER: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"^([+-]?(?:\d+(?:\.\d*)?|\.\d+)(?:[eE][+-]?\d+)?)\s*(?i:VDC|VAC|ADC|AAC|OHMS|OHM|V|A|Ω|HZ|S|C|F|K)?$",
    )
    .expect("valid regex")
});

static ANY_NUMBER: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"[-+]?(?:\d+(?:\.\d*)?|\.\d+)(?:[eE][-+]?\d+)?").expect("valid regex")
});

static IDENT_MODEL: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)2831\s*E").expect("valid regex"));

fn normalize(s: &str) -> String {
    s.chars()
        .filter(|c| !c.is_whitespace())
        .flat_map(char::to_uppercase)
        .collect()
}

/// True if `line` is the echo of `sent`, or a fragment of it.
///
/// The 2831E echoes commands when `SYST:RET` is on and sometimes only
/// emits the leading part of the command token (`FETC` for `FETCH?`).
/// Recognised forms, compared case and whitespace insensitive:
///  * the full command,
///  * any prefix of the command token,
///  * any line starting with the token without its `?`.
pub fn is_echo(line: &str, sent: &str) -> bool {
    let line = normalize(line);
    if line.is_empty() {
        return true;
    }
    if line == normalize(sent) {
        return true;
    }
    let token = sent
        .split_whitespace()
        .next()
        .unwrap_or_default()
        .to_uppercase();
    let stem = token.trim_end_matches('?');
    token.starts_with(&line) || (!stem.is_empty() && line.starts_with(stem))
}

/// Strict numeric grammar: the trimmed line is a number, optionally followed
/// by a unit the meter is known to append.
pub fn parse_strict(line: &str) -> Option<f64> {
    STRICT_NUMBER
        .captures(line.trim())
        .and_then(|caps| caps.get(1))
        .and_then(|m| m.as_str().parse::<f64>().ok())
        .filter(|v| v.is_finite())
}

/// Fallback extraction: accept the line only if it contains exactly one number.
/// Values overflowing `f64` count as garbage, like in [`parse_strict`].
pub fn extract_number(line: &str) -> Option<f64> {
    let mut matches = ANY_NUMBER.find_iter(line);
    match (matches.next(), matches.next()) {
        (Some(m), None) => m.as_str().parse::<f64>().ok().filter(|v| v.is_finite()),
        _ => None,
    }
}

/// Strict parse first, fallback extraction second.
pub fn parse_value(line: &str) -> Option<(f64, Validity)> {
    parse_strict(line)
        .map(|v| (v, Validity::Clean))
        .or_else(|| extract_number(line).map(|v| (v, Validity::Recovered)))
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Ident {
    pub raw: String,
    pub model: String,
    pub fields: Vec<String>,
}

impl Ident {
    /// True if the identity belongs to a 2831E.
    pub fn is_2831e(&self) -> bool {
        matches_identity(&self.raw)
    }
}

pub fn matches_identity(line: &str) -> bool {
    IDENT_MODEL.is_match(line)
}

impl TryFrom<&str> for Ident {
    type Error = io::Error;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        let raw = value.trim().to_string();
        if raw.is_empty() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "Empty data for ID response",
            ));
        }
        let fields: Vec<String> = raw.split(',').map(|f| f.trim().to_string()).collect();
        let model = IDENT_MODEL
            .find(&raw)
            .map(|m| m.as_str().to_string())
            .unwrap_or_else(|| fields[0].clone());
        Ok(Self { raw, model, fields })
    }
}

impl TryFrom<&[u8]> for Ident {
    type Error = io::Error;

    fn try_from(value: &[u8]) -> Result<Self, Self::Error> {
        let value = str::from_utf8(value).map_err(|e| io::Error::new(io::ErrorKind::Other, e))?;
        Ident::try_from(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_echo_variants_rejected() {
        for line in ["FETCH?", "fetch?", "  FETCH? ", "FET CH?", "FETC", "FETCH", "F"] {
            assert!(is_echo(line, "FETCH?"), "{:?} should be an echo", line);
        }
        assert!(is_echo("volt:dc:ref 1.5", "VOLT:DC:REF 1.5"));
        assert!(is_echo("*IDN", "*IDN?"));
    }

    #[test]
    fn test_data_is_not_echo() {
        assert!(!is_echo("+1.23450E-01", "FETCH?"));
        assert!(!is_echo("OL", "FETCH?"));
        assert!(!is_echo("2831E Multimeter,Ver1.4,0001", "*IDN?"));
    }

    #[test]
    fn test_strict_parse() {
        assert_eq!(parse_strict("+1.23450E-01"), Some(0.12345));
        assert_eq!(parse_strict("  -4.2E+00 V"), Some(-4.2));
        assert_eq!(parse_strict("12.5mV"), None);
        assert_eq!(parse_strict("1000 ohm"), Some(1000.0));
        assert_eq!(parse_strict("50Hz"), Some(50.0));
        assert_eq!(parse_strict(".5"), Some(0.5));
        assert_eq!(parse_strict("7."), Some(7.0));
        assert_eq!(parse_strict("inf"), None);
        assert_eq!(parse_strict("NaN"), None);
        assert_eq!(parse_strict("OL"), None);
    }

    #[test]
    fn test_fallback_extraction() {
        assert_eq!(extract_number("\u{1}\u{7f}#-3.5e-3$$"), Some(-0.0035));
        assert_eq!(extract_number("VAL=12.75;"), Some(12.75));
        assert_eq!(extract_number("OL"), None);
        assert_eq!(extract_number("1.0,2.0"), None);
    }

    #[test]
    fn test_parse_value_validity() {
        assert_eq!(parse_value("1.5"), Some((1.5, Validity::Clean)));
        assert_eq!(parse_value("x1.5y"), Some((1.5, Validity::Recovered)));
        assert_eq!(parse_value("---"), None);
        assert_eq!(parse_value("+9.9E+999"), None);
        assert_eq!(parse_value("ovl -1e400"), None);
    }

    #[test]
    fn test_ident() {
        let id = Ident::try_from("2831E  Multimeter,Ver1.4.140311,0001").unwrap();
        assert_eq!(id.model, "2831E");
        assert_eq!(id.fields.len(), 3);
        assert!(id.is_2831e());

        let other = Ident::try_from("FLUKE,289,0").unwrap();
        assert!(!other.is_2831e());
        assert!(Ident::try_from("  ").is_err());
    }
}
