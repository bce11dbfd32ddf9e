use serde::{de, Deserialize, Deserializer, Serialize, Serializer};
use std::{fmt, str::FromStr, time::Duration};

/// A duration written in Go's `time.ParseDuration` syntax (e.g. `1m30s`).
///
/// Registry configuration blocks are authored for Go tooling, so intervals
/// such as an upstream's `poll_interval` use this format. Values are bounded
/// the way Go's `time.Duration` is: a signed 64-bit count of nanoseconds.
#[derive(Copy, Clone, PartialEq, Eq)]
pub struct GoDuration {
    duration: Duration,
    is_negative: bool,
}

#[derive(Debug, thiserror::Error, Eq, PartialEq)]
#[non_exhaustive]
pub enum ParseError {
    #[error("invalid unit: {}", EXPECTED_UNITS)]
    InvalidUnit,

    #[error("missing a unit: {}", EXPECTED_UNITS)]
    NoUnit,

    #[error("empty duration")]
    Empty,

    #[error("a sign may only lead the duration")]
    MisplacedSign,

    #[error("invalid floating-point number: {}", .0)]
    NotANumber(#[from] std::num::ParseFloatError),

    #[error("invalid duration: out of range")]
    Overflow,
}

const EXPECTED_UNITS: &str = "expected one of 'ns', 'us', '\u{00b5}s', 'ms', 's', 'm', or 'h'";

/// `i64::MAX` nanoseconds, the longest positive duration Go can represent.
const MAX: Duration = Duration::new(9_223_372_036, 854_775_807);

/// `i64::MIN` nanoseconds, one nanosecond further than [`MAX`].
const MAX_NEGATIVE: Duration = Duration::new(9_223_372_036, 854_775_808);

impl From<Duration> for GoDuration {
    fn from(duration: Duration) -> Self {
        Self {
            duration,
            is_negative: false,
        }
    }
}

impl From<GoDuration> for Duration {
    fn from(GoDuration { duration, .. }: GoDuration) -> Self {
        duration
    }
}

impl GoDuration {
    /// Never true for a zero duration, so `-0s` is the same value as `0s`.
    #[inline]
    #[must_use]
    pub fn is_negative(&self) -> bool {
        self.is_negative
    }

    #[inline]
    #[must_use]
    pub fn is_zero(&self) -> bool {
        self.duration.is_zero()
    }
}

impl fmt::Debug for GoDuration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

impl fmt::Display for GoDuration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        use std::fmt::Write;
        if self.is_negative {
            f.write_char('-')?;
        }
        fmt::Debug::fmt(&self.duration, f)
    }
}

impl FromStr for GoDuration {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (is_negative, mut s) = match s.strip_prefix('-') {
            Some(rest) => (true, rest),
            None => (false, s.strip_prefix('+').unwrap_or(s)),
        };
        if s.is_empty() {
            return Err(ParseError::Empty);
        }
        // A bare zero is the only value that may omit its unit.
        if s == "0" {
            return Ok(Duration::ZERO.into());
        }

        let mut total = Duration::ZERO;
        while !s.is_empty() {
            let Some(unit_start) = s.find(|c: char| c.is_alphabetic()) else {
                return Err(ParseError::NoUnit);
            };

            let (val, rest) = s.split_at(unit_start);
            let unit_end = rest.find(|c: char| !c.is_alphabetic()).unwrap_or(rest.len());
            let (unit, rest) = rest.split_at(unit_end);
            s = rest;

            let term = component(val, unit)?;
            total = total.checked_add(term).ok_or(ParseError::Overflow)?;
        }

        let max = if is_negative { MAX_NEGATIVE } else { MAX };
        if total > max {
            return Err(ParseError::Overflow);
        }
        Ok(GoDuration {
            duration: total,
            is_negative: is_negative && !total.is_zero(),
        })
    }
}

/// Parses one `<number><unit>` term of a duration.
fn component(val: &str, unit: &str) -> Result<Duration, ParseError> {
    const MINUTE: Duration = Duration::from_secs(60);
    let base = match unit {
        "ns" => Duration::from_nanos(1),
        // U+00B5 is the "micro sign" while U+03BC is "Greek letter mu"
        "us" | "\u{00b5}s" | "\u{03bc}s" => Duration::from_micros(1),
        "ms" => Duration::from_millis(1),
        "s" => Duration::from_secs(1),
        "m" => MINUTE,
        "h" => MINUTE * 60,
        _ => return Err(ParseError::InvalidUnit),
    };

    // `f64` parsing accepts signs that Go only allows at the very start.
    if val.starts_with(['+', '-']) {
        return Err(ParseError::MisplacedSign);
    }
    let val = val.parse::<f64>()?;
    if !val.is_finite() {
        return Err(ParseError::Overflow);
    }
    Duration::try_from_secs_f64(val * base.as_secs_f64()).map_err(|_| ParseError::Overflow)
}

impl Serialize for GoDuration {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for GoDuration {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        struct Visitor;
        impl de::Visitor<'_> for Visitor {
            type Value = GoDuration;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("a string in Go `time.Duration.String()` format")
            }

            fn visit_str<E>(self, value: &str) -> Result<Self::Value, E>
            where
                E: de::Error,
            {
                value.parse::<GoDuration>().map_err(de::Error::custom)
            }
        }
        deserializer.deserialize_str(Visitor)
    }
}

/// Deserializes a non-negative [`Duration`] from Go duration syntax, for use
/// with `#[serde(deserialize_with = ...)]`.
pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
where
    D: Deserializer<'de>,
{
    let d = GoDuration::deserialize(deserializer)?;
    if d.is_negative() {
        return Err(de::Error::custom(format!("negative duration: {d}")));
    }
    Ok(d.into())
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINUTE: Duration = Duration::from_secs(60);
    const HOUR: Duration = Duration::from_secs(60 * 60);

    fn negative(duration: Duration) -> GoDuration {
        GoDuration {
            duration,
            is_negative: true,
        }
    }

    #[test]
    fn parses_the_same_as_go() {
        let cases: &[(&str, GoDuration)] = &[
            ("0", Duration::ZERO.into()),
            ("5s", Duration::from_secs(5).into()),
            ("1478s", Duration::from_secs(1478).into()),
            ("-5s", negative(Duration::from_secs(5))),
            ("+5s", Duration::from_secs(5).into()),
            (
                "5.6s",
                (Duration::from_secs(5) + Duration::from_millis(600)).into(),
            ),
            ("5.s", Duration::from_secs(5).into()),
            (".5s", Duration::from_millis(500).into()),
            ("10ns", Duration::from_nanos(10).into()),
            ("11us", Duration::from_micros(11).into()),
            ("12µs", Duration::from_micros(12).into()),
            ("12μs", Duration::from_micros(12).into()),
            ("13ms", Duration::from_millis(13).into()),
            ("15m", (15 * MINUTE).into()),
            ("3h30m", (3 * HOUR + 30 * MINUTE).into()),
            (
                "1h2m3s4ms5us6ns",
                (HOUR
                    + 2 * MINUTE
                    + Duration::from_secs(3)
                    + Duration::from_millis(4)
                    + Duration::from_micros(5)
                    + Duration::from_nanos(6))
                .into(),
            ),
        ];

        for (input, expected) in cases {
            let parsed = dbg!(input).parse::<GoDuration>().unwrap();
            assert_eq!(&dbg!(parsed), expected);
        }
    }

    #[test]
    fn rejects_what_go_rejects() {
        assert_eq!("".parse::<GoDuration>(), Err(ParseError::Empty));
        assert_eq!("-".parse::<GoDuration>(), Err(ParseError::Empty));
        assert_eq!("30".parse::<GoDuration>(), Err(ParseError::NoUnit));
        assert_eq!("3d".parse::<GoDuration>(), Err(ParseError::InvalidUnit));
        assert!(matches!(
            "s".parse::<GoDuration>(),
            Err(ParseError::NotANumber(_))
        ));
        assert!(matches!(
            "1..5s".parse::<GoDuration>(),
            Err(ParseError::NotANumber(_))
        ));
    }

    #[test]
    fn zero_only_omits_its_unit_alone() {
        assert_eq!("5s0".parse::<GoDuration>(), Err(ParseError::NoUnit));
        assert_eq!("0s".parse::<GoDuration>(), Ok(Duration::ZERO.into()));
    }

    #[test]
    fn negative_zero_is_zero() {
        for input in ["-0", "-0s", "-0.0h"] {
            let d = input.parse::<GoDuration>().unwrap();
            assert!(!d.is_negative(), "{input} must not be negative");
            assert!(d.is_zero());
            assert_eq!(d.to_string(), "0ns");
        }
    }

    #[test]
    fn sign_only_leads() {
        for input in ["--5s", "+-5s", "-+5s", "5s+3s", "5s-3s"] {
            assert_eq!(
                input.parse::<GoDuration>(),
                Err(ParseError::MisplacedSign),
                "{input}"
            );
        }
    }

    #[test]
    fn bounded_like_go() {
        let max = "2562047h47m16s".parse::<GoDuration>().unwrap();
        assert_eq!(Duration::from(max), Duration::from_secs(9_223_372_036));

        let min = "-2562047h47m16.854775808s".parse::<GoDuration>().unwrap();
        assert!(min.is_negative());

        for input in ["2562047h48m", "99999999999999999999h", "2562047h2562047h"] {
            assert_eq!(
                input.parse::<GoDuration>(),
                Err(ParseError::Overflow),
                "{input}"
            );
        }
    }

    #[test]
    fn rejects_non_finite_values() {
        // Too many digits for an `f64`, which parses them as infinity.
        let input = format!("1{}s", "0".repeat(400));
        assert_eq!(input.parse::<GoDuration>(), Err(ParseError::Overflow));
    }

    #[test]
    fn deserializes_non_negative_durations() {
        #[derive(Deserialize)]
        struct Interval {
            #[serde(deserialize_with = "super::deserialize")]
            every: Duration,
        }

        let Interval { every } = serde_json::from_str(r#"{"every": "1m30s"}"#).unwrap();
        assert_eq!(every, MINUTE + Duration::from_secs(30));

        let Interval { every } = serde_json::from_str(r#"{"every": "-0s"}"#).unwrap();
        assert_eq!(every, Duration::ZERO);

        assert!(serde_json::from_str::<Interval>(r#"{"every": "-1s"}"#).is_err());
        assert!(serde_json::from_str::<Interval>(r#"{"every": "soon"}"#).is_err());
        assert!(serde_json::from_str::<Interval>(r#"{"every": "9999999999h"}"#).is_err());
    }
}
