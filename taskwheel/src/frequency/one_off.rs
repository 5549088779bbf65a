// One-off frequency: due at exactly one instant

use chrono::{DateTime, NaiveDateTime, SubsecRound, Utc};
use serde::de::{self, Deserialize, Deserializer};
use serde::ser::{Serialize, Serializer};

use crate::errors::FrequencyError;
use crate::frequency::{Frequency, SERIALIZED_TIME_FORMAT};

/// Frequency with exactly one occurrence.
///
/// Start and end coincide: the frequency is due at its instant and expired
/// as soon as that instant has passed. The instant is truncated to whole
/// seconds, matching the serialization grammar.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OneOff {
    instant: DateTime<Utc>,
}

impl OneOff {
    pub fn new(instant: DateTime<Utc>) -> Self {
        Self {
            instant: instant.trunc_subsecs(0),
        }
    }

    /// Deserialize from a JSON encoded timestamp string
    pub fn from_json(json: &str) -> Result<Self, FrequencyError> {
        serde_json::from_str(json).map_err(|e| FrequencyError::invalid(json, e))
    }

    /// Serialize to a JSON encoded timestamp string
    pub fn to_json(&self) -> String {
        // A formatted timestamp contains no characters that need escaping
        format!("\"{}\"", self.instant.format(SERIALIZED_TIME_FORMAT))
    }
}

impl Frequency for OneOff {
    fn is_due(&self, at: DateTime<Utc>) -> bool {
        !self.is_expired(at) && self.instant == at.trunc_subsecs(0)
    }

    fn next_due(&self, _at: DateTime<Utc>) -> DateTime<Utc> {
        self.instant
    }

    fn is_expired(&self, at: DateTime<Utc>) -> bool {
        self.instant < at
    }

    fn start(&self) -> Option<DateTime<Utc>> {
        Some(self.instant)
    }

    fn end(&self) -> Option<DateTime<Utc>> {
        self.start()
    }
}

impl Serialize for OneOff {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(&self.instant.format(SERIALIZED_TIME_FORMAT))
    }
}

impl<'de> Deserialize<'de> for OneOff {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        if raw.is_empty() {
            return Err(de::Error::custom("empty one-off timestamp"));
        }

        let parsed = NaiveDateTime::parse_from_str(&raw, SERIALIZED_TIME_FORMAT)
            .map_err(|e| de::Error::custom(format!("cannot parse one-off timestamp '{raw}': {e}")))?;

        Ok(Self::new(parsed.and_utc()))
    }
}
