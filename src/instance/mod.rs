//! Instance lifecycle core for jupyter-keeper.
//!
//! Tracks notebook server sessions by port in a durable registry, admits new
//! sessions under a memory budget, enforces their time-to-live, and reconciles
//! the registry against real process liveness.

use std::collections::BTreeMap;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

pub mod admission;
pub mod credentials;
pub mod gauge;
pub mod launcher;
pub mod liveness;
pub mod manager;
pub mod reconcile;
pub mod registry;

// ---------------------------------------------------------------------------
// Timer constants
// ---------------------------------------------------------------------------

/// Any expiry further out than this means the session timer is disabled.
pub const TIMER_DISABLED_HORIZON_YEARS: f64 = 50.0;

/// Disabled timers are written as `now + 100 years` so that older readers of
/// the state file, which only know about timestamps, never expire them.
pub const DISABLED_TIMER_SENTINEL_DAYS: i64 = 365 * 100;

const SECONDS_PER_YEAR: f64 = 365.25 * 24.0 * 3600.0;

/// Sentinel expiry written for a session whose timer is disabled.
pub fn disabled_timer_sentinel(now: DateTime<Utc>) -> DateTime<Utc> {
    now + Duration::days(DISABLED_TIMER_SENTINEL_DAYS)
}

/// RFC 3339 with microseconds and a `+00:00` offset, as found in state files
/// and API responses.
pub fn format_timestamp(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(chrono::SecondsFormat::Micros, false)
}

// ---------------------------------------------------------------------------
// Instance record
// ---------------------------------------------------------------------------

/// One tracked session as persisted in the state file.
///
/// Fields are optional on the wire because the external launcher may write
/// records itself and older records predate `expires_at`. Unknown keys written
/// by the launcher are carried through untouched in `extra`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstanceRecord {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pid: Option<i32>,

    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        with = "lenient_timestamp"
    )]
    pub started_at: Option<DateTime<Utc>>,

    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        with = "lenient_timestamp"
    )]
    pub expires_at: Option<DateTime<Utc>>,

    /// Display value only (the password hash for records we create).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,

    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

/// How a record's expiry should be interpreted at a given instant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Expiry {
    /// No `expires_at` at all: a record written before TTLs existed.
    Legacy,
    /// Timer disabled; the record never auto-expires.
    Disabled,
    At(DateTime<Utc>),
}

impl InstanceRecord {
    pub fn new(
        pid: i32,
        started_at: DateTime<Utc>,
        expires_at: DateTime<Utc>,
        password: String,
    ) -> Self {
        Self {
            pid: Some(pid),
            started_at: Some(started_at),
            expires_at: Some(expires_at),
            password: Some(password),
            extra: serde_json::Map::new(),
        }
    }

    /// The pid, treating `0` and negative values as absent.
    pub fn live_pid(&self) -> Option<i32> {
        self.pid.filter(|pid| *pid > 0)
    }

    pub fn expiry(&self, now: DateTime<Utc>) -> Expiry {
        match self.expires_at {
            None => Expiry::Legacy,
            Some(at) if timer_disabled(at, now) => Expiry::Disabled,
            Some(at) => Expiry::At(at),
        }
    }
}

/// `true` when `expires_at` lies more than fifty years after `now`.
pub fn timer_disabled(expires_at: DateTime<Utc>, now: DateTime<Utc>) -> bool {
    let years = (expires_at - now).num_seconds() as f64 / SECONDS_PER_YEAR;
    years > TIMER_DISABLED_HORIZON_YEARS
}

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

/// The port → record mapping. Serialized as a JSON object keyed by the port
/// number as a string.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Registry {
    instances: BTreeMap<u16, InstanceRecord>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.instances.is_empty()
    }

    pub fn len(&self) -> usize {
        self.instances.len()
    }

    pub fn get(&self, port: u16) -> Option<&InstanceRecord> {
        self.instances.get(&port)
    }

    pub fn contains(&self, port: u16) -> bool {
        self.instances.contains_key(&port)
    }

    /// Insert or wholesale-replace the record for `port`.
    pub fn insert(&mut self, port: u16, record: InstanceRecord) -> Option<InstanceRecord> {
        self.instances.insert(port, record)
    }

    pub fn remove(&mut self, port: u16) -> Option<InstanceRecord> {
        self.instances.remove(&port)
    }

    pub fn retain(&mut self, f: impl FnMut(&u16, &mut InstanceRecord) -> bool) {
        self.instances.retain(f);
    }

    pub fn iter(&self) -> impl Iterator<Item = (u16, &InstanceRecord)> {
        self.instances.iter().map(|(port, record)| (*port, record))
    }
}

impl FromIterator<(u16, InstanceRecord)> for Registry {
    fn from_iter<I: IntoIterator<Item = (u16, InstanceRecord)>>(iter: I) -> Self {
        Self {
            instances: iter.into_iter().collect(),
        }
    }
}

// ---------------------------------------------------------------------------
// Timestamp (de)serialization
// ---------------------------------------------------------------------------

/// Reads RFC 3339 timestamps, and offset-less ISO 8601 timestamps as UTC.
/// Writes RFC 3339 with microseconds and a `+00:00` offset.
mod lenient_timestamp {
    use chrono::{DateTime, NaiveDateTime, Utc};
    use serde::{Deserialize, Deserializer, Serializer, de, ser};

    pub fn serialize<S: Serializer>(
        value: &Option<DateTime<Utc>>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        match value {
            Some(ts) => {
                let text = super::format_timestamp(ts);
                // Years past 9999 format with a sign that no reader accepts.
                parse(&text).map_err(|e| {
                    <S::Error as ser::Error>::custom(format!("unreadable timestamp: {e}"))
                })?;
                serializer.serialize_str(&text)
            }
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<DateTime<Utc>>, D::Error> {
        let raw: Option<String> = Option::deserialize(deserializer)?;
        match raw.as_deref().map(str::trim) {
            None | Some("") => Ok(None),
            Some(s) => parse(s).map(Some).map_err(<D::Error as de::Error>::custom),
        }
    }

    pub(super) fn parse(s: &str) -> Result<DateTime<Utc>, String> {
        if let Ok(ts) = DateTime::parse_from_rfc3339(s) {
            return Ok(ts.with_timezone(&Utc));
        }
        NaiveDateTime::parse_from_str(s, "%Y-%m-%dT%H:%M:%S%.f")
            .map(|naive| naive.and_utc())
            .map_err(|e| format!("invalid timestamp {s:?}: {e}"))
    }
}

// ---------------------------------------------------------------------------
// Re-exports
// ---------------------------------------------------------------------------

pub use manager::{InstanceManager, ManagerSettings, StartRequest};
