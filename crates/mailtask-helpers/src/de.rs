use std::time::Duration;

use serde::de::Error as _;
use serde::{Deserialize, Deserializer};

/// Either bare seconds (`30`) or a humantime string (`"30s"`, `"1m 30s"`).
#[derive(Deserialize)]
#[serde(untagged)]
enum RawDuration {
    Seconds(u64),
    Text(String),
}

impl RawDuration {
    fn into_duration(self) -> Result<Option<Duration>, humantime::DurationError> {
        match self {
            Self::Seconds(secs) => Ok(Some(Duration::from_secs(secs))),
            Self::Text(value) => {
                let value = value.trim();
                if value.is_empty() {
                    return Ok(None);
                }
                humantime::parse_duration(value).map(Some)
            }
        }
    }
}

pub fn deserialize_optional_duration<'de, D>(
    deserializer: D
) -> Result<Option<Duration>, D::Error>
where
    D: Deserializer<'de>,
{
    match Option::<RawDuration>::deserialize(deserializer)? {
        None => Ok(None),
        Some(raw) => raw.into_duration().map_err(D::Error::custom),
    }
}

/// Required duration; an empty string is rejected rather than defaulted.
pub fn deserialize_duration<'de, D>(deserializer: D) -> Result<Duration, D::Error>
where
    D: Deserializer<'de>,
{
    RawDuration::deserialize(deserializer)?
        .into_duration()
        .map_err(D::Error::custom)?
        .ok_or_else(|| D::Error::custom("duration must not be empty"))
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use serde::Deserialize;

    #[derive(Debug, Deserialize)]
    struct Sample {
        #[serde(deserialize_with = "super::deserialize_duration")]
        every: Duration,
        #[serde(default, deserialize_with = "super::deserialize_optional_duration")]
        history: Option<Duration>,
    }

    #[test]
    fn accepts_seconds_and_humantime_text() {
        let sample: Sample =
            serde_yaml::from_str("every: 5\nhistory: 7d\n").unwrap();
        assert_eq!(sample.every, Duration::from_secs(5));
        assert_eq!(sample.history, Some(Duration::from_secs(7 * 24 * 3600)));

        let sample: Sample = serde_yaml::from_str("every: 1m 30s\n").unwrap();
        assert_eq!(sample.every, Duration::from_secs(90));
        assert_eq!(sample.history, None);
    }

    #[test]
    fn empty_optional_is_none_but_empty_required_fails() {
        let sample: Sample =
            serde_yaml::from_str("every: 2s\nhistory: \"\"\n").unwrap();
        assert_eq!(sample.history, None);

        let err = serde_yaml::from_str::<Sample>("every: \"\"\n")
            .expect_err("empty required duration must fail");
        assert!(err.to_string().contains("must not be empty"));
    }

    #[test]
    fn rejects_garbage_text() {
        assert!(serde_yaml::from_str::<Sample>("every: soon\n").is_err());
    }
}
