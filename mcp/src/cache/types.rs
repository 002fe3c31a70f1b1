//! Cached verification result records.

use std::{fmt, str::FromStr, time::Duration};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Category of a verification run.
///
/// Results that hold regardless of context (protocol conformance) stay valid
/// far longer than results tied to one orchestration setup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TestType {
    Protocol,
    Capability,
    Functional,
    Orchestration,
    Custom,
}

impl TestType {
    pub const ALL: [TestType; 5] = [
        TestType::Protocol,
        TestType::Capability,
        TestType::Functional,
        TestType::Orchestration,
        TestType::Custom,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            TestType::Protocol => "protocol",
            TestType::Capability => "capability",
            TestType::Functional => "functional",
            TestType::Orchestration => "orchestration",
            TestType::Custom => "custom",
        }
    }

    pub fn default_ttl(&self) -> Duration {
        const HOUR: u64 = 60 * 60;
        match self {
            TestType::Protocol => Duration::from_secs(7 * 24 * HOUR),
            TestType::Capability => Duration::from_secs(24 * HOUR),
            TestType::Functional => Duration::from_secs(6 * HOUR),
            TestType::Orchestration | TestType::Custom => Duration::from_secs(HOUR),
        }
    }
}

impl fmt::Display for TestType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TestType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        TestType::ALL
            .into_iter()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| format!("unknown test type '{}'", s))
    }
}

/// Identity of one cache entry.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CacheKey {
    pub component_id: String,
    pub test_type: TestType,
}

impl CacheKey {
    pub fn new(component_id: impl Into<String>, test_type: TestType) -> Self {
        Self {
            component_id: component_id.into(),
            test_type,
        }
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.component_id, self.test_type)
    }
}

/// A verification outcome stamped with its lifetime. Re-saving replaces the
/// record; it is never updated in place.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CachedTestResult {
    pub component_id: String,
    pub test_type: TestType,
    pub payload: serde_json::Value,
    pub created_at: DateTime<Utc>,
    pub ttl_seconds: u64,
    pub expires_at: DateTime<Utc>,
}

impl CachedTestResult {
    pub fn new(
        component_id: impl Into<String>,
        test_type: TestType,
        payload: serde_json::Value,
        ttl_seconds: u64,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            component_id: component_id.into(),
            test_type,
            payload,
            created_at,
            ttl_seconds,
            expires_at: expiry(created_at, ttl_seconds),
        }
    }

    pub fn key(&self) -> CacheKey {
        CacheKey::new(&self.component_id, self.test_type)
    }

    /// Expired against the stored TTL.
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }

    /// Expired against `ttl_seconds` instead of the stored TTL.
    pub fn is_expired_with(&self, ttl_seconds: u64, now: DateTime<Utc>) -> bool {
        now >= expiry(self.created_at, ttl_seconds)
    }
}

fn expiry(created_at: DateTime<Utc>, ttl_seconds: u64) -> DateTime<Utc> {
    let ttl = i64::try_from(ttl_seconds).unwrap_or(i64::MAX);
    chrono::TimeDelta::try_seconds(ttl)
        .and_then(|delta| created_at.checked_add_signed(delta))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}
