//! Serde adapter reading durations as human strings (`"30s"`) or whole
//! seconds (`30`).

use std::time::Duration;

use serde::de::Error;
use serde::{Deserialize, Deserializer};

use super::parser::parse_duration;

#[derive(Deserialize)]
#[serde(untagged)]
enum RawDuration {
    Text(String),
    Secs(u64),
}

impl RawDuration {
    fn into_duration<E: Error>(self) -> Result<Duration, E> {
        match self {
            RawDuration::Text(text) => parse_duration(&text)
                .ok_or_else(|| E::custom(format!("invalid duration '{}'", text))),
            RawDuration::Secs(secs) => Ok(Duration::from_secs(secs)),
        }
    }
}

pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
where
    D: Deserializer<'de>,
{
    RawDuration::deserialize(deserializer)?.into_duration()
}

/// Same as the parent module, for optional fields (`null` means unset).
pub mod option {
    use super::*;

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
    where
        D: Deserializer<'de>,
    {
        Option::<RawDuration>::deserialize(deserializer)?
            .map(RawDuration::into_duration)
            .transpose()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Deserialize)]
    struct Probe {
        #[serde(with = "super")]
        ttl: Duration,
        #[serde(default, with = "super::option")]
        idle: Option<Duration>,
    }

    #[test]
    fn test_text_and_seconds() {
        let probe: Probe = serde_json::from_str(r#"{"ttl": "2m", "idle": 15}"#).unwrap();
        assert_eq!(probe.ttl, Duration::from_secs(120));
        assert_eq!(probe.idle, Some(Duration::from_secs(15)));

        let probe: Probe = serde_json::from_str(r#"{"ttl": 5}"#).unwrap();
        assert_eq!(probe.ttl, Duration::from_secs(5));
        assert_eq!(probe.idle, None);
    }

    #[test]
    fn test_invalid_text_is_rejected() {
        let result = serde_json::from_str::<Probe>(r#"{"ttl": "soon"}"#);
        assert!(result.is_err());
    }
}
