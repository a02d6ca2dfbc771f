use serde::{de, Deserialize, Deserializer, Serialize, Serializer};
use std::{fmt, str::FromStr, time::Duration};

/// A non-negative duration written as a sequence of decimal numbers with unit
/// suffixes, e.g. `1m30s` or `250ms`.
#[derive(Copy, Clone, PartialEq, Eq)]
pub struct K8sDuration(Duration);

/// A response timeout: a duration, or `infinity` to wait forever.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Timeout {
    After(K8sDuration),
    Disabled,
}

#[derive(Debug, thiserror::Error, Eq, PartialEq)]
#[non_exhaustive]
pub enum ParseError {
    #[error("invalid unit {0:?}: {EXPECTED_UNITS}")]
    InvalidUnit(String),

    #[error("missing a unit: {EXPECTED_UNITS}")]
    NoUnit,

    #[error("durations must not be negative")]
    Negative,

    #[error("empty duration")]
    Empty,

    #[error("invalid number: {0}")]
    NotANumber(#[from] std::num::ParseFloatError),
}

const EXPECTED_UNITS: &str = "expected one of 'ns', 'us', 'ms', 's', 'm', or 'h'";

fn unit(unit: &str) -> Result<Duration, ParseError> {
    Ok(match unit {
        "ns" => Duration::from_nanos(1),
        "us" | "\u{00b5}s" | "\u{03bc}s" => Duration::from_micros(1),
        "ms" => Duration::from_millis(1),
        "s" => Duration::from_secs(1),
        "m" => Duration::from_secs(60),
        "h" => Duration::from_secs(60 * 60),
        u => return Err(ParseError::InvalidUnit(u.to_string())),
    })
}

// === impl K8sDuration ===

impl From<Duration> for K8sDuration {
    fn from(duration: Duration) -> Self {
        Self(duration)
    }
}

impl From<K8sDuration> for Duration {
    fn from(K8sDuration(duration): K8sDuration) -> Self {
        duration
    }
}

impl fmt::Debug for K8sDuration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&self.0, f)
    }
}

impl fmt::Display for K8sDuration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let secs = self.0.as_secs();
        let millis = self.0.subsec_millis();
        if secs == 0 && millis == 0 {
            return f.write_str("0s");
        }
        let parts = [(secs / 3600, "h"), (secs % 3600 / 60, "m"), (secs % 60, "s")];
        for (n, suffix) in parts {
            if n > 0 {
                write!(f, "{n}{suffix}")?;
            }
        }
        if millis > 0 {
            write!(f, "{millis}ms")?;
        }
        Ok(())
    }
}

impl FromStr for K8sDuration {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.starts_with('-') {
            return Err(ParseError::Negative);
        }
        let s = s.strip_prefix('+').unwrap_or(s);
        match s {
            "" => return Err(ParseError::Empty),
            "0" => return Ok(Self(Duration::ZERO)),
            _ => {}
        }

        let mut total = Duration::ZERO;
        let mut rest = s;
        while !rest.is_empty() {
            let digits = rest
                .find(|c: char| !(c.is_ascii_digit() || c == '.'))
                .ok_or(ParseError::NoUnit)?;
            let (value, tail) = rest.split_at(digits);
            let units = tail
                .find(|c: char| c.is_ascii_digit() || c == '.')
                .unwrap_or(tail.len());
            let (suffix, tail) = tail.split_at(units);
            total += unit(suffix)?.mul_f64(value.parse::<f64>()?);
            rest = tail;
        }
        Ok(Self(total))
    }
}

impl Serialize for K8sDuration {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for K8sDuration {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        String::deserialize(deserializer)?
            .parse()
            .map_err(de::Error::custom)
    }
}

impl schemars::JsonSchema for K8sDuration {
    fn schema_name() -> String {
        "K8sDuration".to_owned()
    }

    fn is_referenceable() -> bool {
        false
    }

    fn json_schema(_: &mut schemars::gen::SchemaGenerator) -> schemars::schema::Schema {
        schemars::schema::SchemaObject {
            instance_type: Some(schemars::schema::InstanceType::String.into()),
            // Not "duration", which would mean ISO 8601.
            format: None,
            ..Default::default()
        }
        .into()
    }
}

// === impl Timeout ===

impl Timeout {
    pub fn duration(self) -> Option<Duration> {
        match self {
            Self::After(d) => Some(d.into()),
            Self::Disabled => None,
        }
    }
}

impl FromStr for Timeout {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "infinity" | "infinite" => Ok(Self::Disabled),
            d => d.parse().map(Self::After),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_durations() {
        let cases: &[(&str, Duration)] = &[
            ("0", Duration::ZERO),
            ("+0", Duration::ZERO),
            ("5s", Duration::from_secs(5)),
            ("1.5s", Duration::from_millis(1500)),
            (".5s", Duration::from_millis(500)),
            ("250ms", Duration::from_millis(250)),
            ("1m30s", Duration::from_secs(90)),
            ("1h", Duration::from_secs(3600)),
            ("10us", Duration::from_micros(10)),
        ];
        for (s, expected) in cases {
            assert_eq!(
                s.parse::<K8sDuration>(),
                Ok(K8sDuration(*expected)),
                "{s}"
            );
        }
    }

    #[test]
    fn rejects_invalid() {
        assert_eq!("-5s".parse::<K8sDuration>(), Err(ParseError::Negative));
        assert_eq!("5".parse::<K8sDuration>(), Err(ParseError::NoUnit));
        assert_eq!(
            "5d".parse::<K8sDuration>(),
            Err(ParseError::InvalidUnit("d".to_string()))
        );
        assert_eq!("".parse::<K8sDuration>(), Err(ParseError::Empty));
        assert!("s".parse::<K8sDuration>().is_err());
    }

    #[test]
    fn displays() {
        for s in ["0s", "5s", "1m30s", "1h", "250ms", "1h1m1s"] {
            assert_eq!(s.parse::<K8sDuration>().unwrap().to_string(), s);
        }
    }

    #[test]
    fn timeouts() {
        assert_eq!("infinity".parse::<Timeout>(), Ok(Timeout::Disabled));
        assert_eq!("infinite".parse::<Timeout>().unwrap().duration(), None);
        assert_eq!(
            "200ms".parse::<Timeout>().unwrap().duration(),
            Some(Duration::from_millis(200))
        );
        assert!("never".parse::<Timeout>().is_err());
    }
}
