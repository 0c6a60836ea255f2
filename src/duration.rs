use std::time::Duration;

use thiserror::Error;

const NANOSECOND: u64 = 1;
const MICROSECOND: u64 = 1000 * NANOSECOND;
const MILLISECOND: u64 = 1000 * MICROSECOND;
const SECOND: u64 = 1000 * MILLISECOND;
const MINUTE: u64 = 60 * SECOND;
const HOUR: u64 = 60 * MINUTE;
const DAY: u64 = 24 * HOUR;
const WEEK: u64 = 7 * DAY;

#[derive(Debug, Error, Eq, PartialEq, Copy, Clone)]
pub enum ParseDurationError {
    #[error("bad integer")]
    BadInteger,
    #[error("invalid duration")]
    InvalidDuration,
    #[error("missing unit")]
    MissingUnit,
    #[error("unknown unit")]
    UnknownUnit,
}

/// Consumes the leading [0-9]* from s
fn leading_int(s: &[u8]) -> Result<(u64, &[u8]), ParseDurationError> {
    let mut consumed = 0;
    let o = s
        .iter()
        .take_while(|c| c.is_ascii_digit())
        .try_fold(0u64, |x, &c| {
            consumed += 1;

            x.checked_mul(10)
                .and_then(|x| x.checked_add((c - b'0') as u64))
        });

    match o {
        Some(v) => Ok((v, &s[consumed..])),
        None => Err(ParseDurationError::BadInteger),
    }
}

/// Consumes the leading [0-9]* from s. It is used only for fractions, so it
/// does not return an error on overflow, it just stops accumulating precision.
fn leading_fraction(s: &[u8]) -> (u64, f64, &[u8]) {
    let mut consumed = 0;
    let mut scale = 1.0;
    let mut overflow = false;

    let o = s
        .iter()
        .take_while(|c| c.is_ascii_digit())
        .fold(0u64, |x, &c| {
            consumed += 1;

            if overflow {
                return x;
            }

            match x.checked_mul(10).and_then(|x| x.checked_add((c - b'0') as u64)) {
                Some(y) => {
                    scale *= 10.0;
                    y
                }
                None => {
                    overflow = true;
                    x
                }
            }
        });

    (o, scale, &s[consumed..])
}

/// Parses a duration string: a sequence of decimal numbers, each with an
/// optional fraction and a unit suffix, such as "300ms", "1.5h" or "2h45m".
/// Valid time units are "ns", "us", "ms", "s", "m", "h", "d" and "w".
///
/// Unlike the Go original, negative durations are rejected since every
/// duration in a scrape config is a non-negative interval or timeout.
pub fn parse_duration(text: &str) -> Result<Duration, ParseDurationError> {
    let mut total = 0u64;
    let mut s = text.as_bytes();

    // Special case: plain "0" carries no unit
    if s == b"0" {
        return Ok(Duration::ZERO);
    }

    if s.is_empty() {
        return Err(ParseDurationError::InvalidDuration);
    }

    while !s.is_empty() {
        // The next character must be [0-9.]
        let c = s[0];
        if !(c == b'.' || c.is_ascii_digit()) {
            return Err(ParseDurationError::InvalidDuration);
        }

        // Consume [0-9]*
        let pl = s.len();
        let (mut v, remain) = leading_int(s)?;
        s = remain;
        let pre = pl != s.len();

        // Consume (\.[0-9]*)?
        let mut f = 0;
        let mut scale = 1.0;
        let mut post = false;
        if !s.is_empty() && s[0] == b'.' {
            s = &s[1..];
            let pl = s.len();
            let (lf, ls, remain) = leading_fraction(s);
            f = lf;
            scale = ls;
            s = remain;
            post = pl != s.len();
        }
        if !pre && !post {
            // no digits (e.g. ".s")
            return Err(ParseDurationError::InvalidDuration);
        }

        // Consume unit
        let mut i = 0;
        while i < s.len() {
            let c = s[i];
            if c == b'.' || c.is_ascii_digit() {
                break;
            }
            i += 1;
        }
        if i == 0 {
            return Err(ParseDurationError::MissingUnit);
        }
        let unit = match &s[..i] {
            b"ns" => NANOSECOND,
            b"us" => MICROSECOND,
            b"ms" => MILLISECOND,
            b"s" => SECOND,
            b"m" => MINUTE,
            b"h" => HOUR,
            b"d" => DAY,
            b"w" => WEEK,
            _ => return Err(ParseDurationError::UnknownUnit),
        };
        s = &s[i..];

        if v > u64::MAX / unit {
            return Err(ParseDurationError::InvalidDuration);
        }
        v *= unit;
        if f > 0 {
            // f64 is needed to stay nanosecond accurate for fractions of hours
            v = v
                .checked_add((f as f64 * (unit as f64 / scale)) as u64)
                .ok_or(ParseDurationError::InvalidDuration)?;
        }

        total = total
            .checked_add(v)
            .ok_or(ParseDurationError::InvalidDuration)?;
    }

    Ok(Duration::from_nanos(total))
}

/// Formats a duration the way [`parse_duration`] reads it, largest unit first.
pub fn format_duration(d: Duration) -> String {
    let mut nanos = d.as_nanos() as u64;
    if nanos == 0 {
        return "0".into();
    }

    let mut out = String::new();
    for (unit, suffix) in [
        (WEEK, "w"),
        (DAY, "d"),
        (HOUR, "h"),
        (MINUTE, "m"),
        (SECOND, "s"),
        (MILLISECOND, "ms"),
        (MICROSECOND, "us"),
        (NANOSECOND, "ns"),
    ] {
        let n = nanos / unit;
        if n > 0 {
            out.push_str(&format!("{}{}", n, suffix));
            nanos -= n * unit;
        }
    }

    out
}

/// serde adapter for `Duration` config fields ("15s", "1m30s", ...)
pub mod serde {
    use std::time::Duration;

    use serde::{de, Deserialize, Deserializer, Serializer};

    use super::{format_duration, parse_duration};

    pub fn deserialize<'de, D>(d: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let text = String::deserialize(d)?;
        parse_duration(&text).map_err(de::Error::custom)
    }

    pub fn serialize<S>(value: &Duration, s: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        s.serialize_str(&format_duration(*value))
    }
}

/// serde adapter for `Option<Duration>` config fields
pub mod serde_option {
    use std::time::Duration;

    use serde::{de, Deserialize, Deserializer, Serializer};

    use super::{format_duration, parse_duration};

    pub fn deserialize<'de, D>(d: D) -> Result<Option<Duration>, D::Error>
    where
        D: Deserializer<'de>,
    {
        match Option::<String>::deserialize(d)? {
            Some(text) => parse_duration(&text)
                .map(Some)
                .map_err(de::Error::custom),
            None => Ok(None),
        }
    }

    pub fn serialize<S>(value: &Option<Duration>, s: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match value {
            Some(d) => s.serialize_some(&format_duration(*d)),
            None => s.serialize_none(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct ParseDurationTest {
        input: &'static str,
        want: u64,
    }

    #[test]
    fn test_parse_duration() {
        let tests = [
            // simple
            ParseDurationTest { input: "0", want: 0 },
            ParseDurationTest { input: "5s", want: 5 * SECOND },
            ParseDurationTest { input: "30s", want: 30 * SECOND },
            ParseDurationTest { input: "1478s", want: 1478 * SECOND },
            // decimal
            ParseDurationTest { input: "5.0s", want: 5 * SECOND },
            ParseDurationTest { input: "5.6s", want: 5 * SECOND + 600 * MILLISECOND },
            ParseDurationTest { input: "5.s", want: 5 * SECOND },
            ParseDurationTest { input: ".5s", want: 500 * MILLISECOND },
            ParseDurationTest { input: "1.004s", want: SECOND + 4 * MILLISECOND },
            ParseDurationTest { input: "100.00100s", want: 100 * SECOND + MILLISECOND },
            // different units
            ParseDurationTest { input: "10ns", want: 10 * NANOSECOND },
            ParseDurationTest { input: "11us", want: 11 * MICROSECOND },
            ParseDurationTest { input: "13ms", want: 13 * MILLISECOND },
            ParseDurationTest { input: "14s", want: 14 * SECOND },
            ParseDurationTest { input: "15m", want: 15 * MINUTE },
            ParseDurationTest { input: "16h", want: 16 * HOUR },
            ParseDurationTest { input: "2d", want: 2 * DAY },
            ParseDurationTest { input: "1w", want: WEEK },
            // composite durations
            ParseDurationTest { input: "3h30m", want: 3 * HOUR + 30 * MINUTE },
            ParseDurationTest { input: "10.5s4m", want: 4 * MINUTE + 10 * SECOND + 500 * MILLISECOND },
            ParseDurationTest {
                input: "1h2m3s4ms5us6ns",
                want: HOUR + 2 * MINUTE + 3 * SECOND + 4 * MILLISECOND + 5 * MICROSECOND + 6 * NANOSECOND,
            },
            ParseDurationTest {
                input: "39h9m14.425s",
                want: 39 * HOUR + 9 * MINUTE + 14 * SECOND + 425 * MILLISECOND,
            },
            // large value
            ParseDurationTest { input: "52763797000ns", want: 52763797000 },
            // more than 9 digits after decimal point
            ParseDurationTest { input: "0.3333333333333333333h", want: 20 * MINUTE },
        ];

        for test in tests {
            let d = parse_duration(test.input).unwrap();
            assert_eq!(d, Duration::from_nanos(test.want), "input: {}", test.input);
        }
    }

    #[test]
    fn test_parse_duration_errors() {
        assert_eq!(parse_duration(""), Err(ParseDurationError::InvalidDuration));
        assert_eq!(parse_duration("-5s"), Err(ParseDurationError::InvalidDuration));
        assert_eq!(parse_duration(".s"), Err(ParseDurationError::InvalidDuration));
        assert_eq!(parse_duration("3"), Err(ParseDurationError::MissingUnit));
        assert_eq!(parse_duration("3y"), Err(ParseDurationError::UnknownUnit));
        assert_eq!(
            parse_duration("999999999999999999999s"),
            Err(ParseDurationError::BadInteger)
        );
    }

    #[test]
    fn test_format_duration() {
        assert_eq!(format_duration(Duration::ZERO), "0");
        assert_eq!(format_duration(Duration::from_secs(90)), "1m30s");
        assert_eq!(format_duration(Duration::from_millis(1500)), "1s500ms");
        assert_eq!(format_duration(Duration::from_secs(3 * 3600 + 60)), "3h1m");
    }

    #[test]
    fn test_roundtrip() {
        for input in ["30s", "1m30s", "2h45m", "150ms"] {
            let d = parse_duration(input).unwrap();
            assert_eq!(format_duration(d), input);
        }
    }

    #[test]
    fn test_serde() {
        #[derive(::serde::Deserialize)]
        struct Wrapper {
            #[serde(with = "super::serde")]
            interval: Duration,
            #[serde(default, with = "super::serde_option")]
            timeout: Option<Duration>,
        }

        let w: Wrapper = serde_yaml::from_str("interval: 15s\ntimeout: 1m\n").unwrap();
        assert_eq!(w.interval, Duration::from_secs(15));
        assert_eq!(w.timeout, Some(Duration::from_secs(60)));

        let w: Wrapper = serde_yaml::from_str("interval: 500ms\n").unwrap();
        assert_eq!(w.interval, Duration::from_millis(500));
        assert_eq!(w.timeout, None);

        assert!(serde_yaml::from_str::<Wrapper>("interval: quick\n").is_err());
    }
}
