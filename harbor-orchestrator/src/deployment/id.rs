use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};

/// Width of the encoded id: enough digits for any `u64` nanosecond count.
const WIDTH: usize = 20;

static LAST: AtomicU64 = AtomicU64::new(0);

/// Identity of a deployment: nanoseconds since the Unix epoch.
///
/// Encoded zero-padded to a fixed width so that lexical order equals chronological order,
/// which is what the manifest store relies on when listing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct DeploymentId(u64);

impl DeploymentId {
    /// A fresh id, strictly greater than any id generated before in this process.
    pub fn generate() -> Self {
        let now = Utc::now()
            .timestamp_nanos_opt()
            .and_then(|n| u64::try_from(n).ok())
            .unwrap_or(0);

        let mut last = LAST.load(Ordering::Relaxed);
        loop {
            let next = now.max(last + 1);
            match LAST.compare_exchange_weak(last, next, Ordering::Relaxed, Ordering::Relaxed) {
                Ok(_) => return Self(next),
                Err(current) => last = current,
            }
        }
    }

    pub fn from_nanos(nanos: u64) -> Self {
        Self(nanos)
    }

    pub fn as_nanos(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for DeploymentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:0width$}", self.0, width = WIDTH)
    }
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
#[error("Invalid deployment id '{0}'")]
pub struct InvalidDeploymentId(String);

impl FromStr for DeploymentId {
    type Err = InvalidDeploymentId;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.len() != WIDTH || !s.bytes().all(|b| b.is_ascii_digit()) {
            return Err(InvalidDeploymentId(s.to_string()));
        }
        s.parse::<u64>()
            .map(Self)
            .map_err(|_| InvalidDeploymentId(s.to_string()))
    }
}

impl TryFrom<String> for DeploymentId {
    type Error = InvalidDeploymentId;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<DeploymentId> for String {
    fn from(id: DeploymentId) -> Self {
        id.to_string()
    }
}
