//! Upload/download byte-rate ceilings ("valves") resolved per connection.

use std::fmt;
use std::num::{NonZeroU64, ParseIntError};
use std::str::FromStr;

/// One direction's ceiling.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Limit {
    /// Not specified: defer to the server-wide default.
    #[default]
    Inherit,
    Unlimited,
    PerSecond(NonZeroU64),
}

impl Limit {
    /// `0` means unlimited.
    pub fn from_bytes_per_sec(bytes: u64) -> Self {
        NonZeroU64::new(bytes).map_or(Limit::Unlimited, Limit::PerSecond)
    }

    /// An inherited limit takes `fallback`; any explicit value wins.
    pub fn or(self, fallback: Limit) -> Limit {
        match self {
            Limit::Inherit => fallback,
            explicit => explicit,
        }
    }

    pub fn bytes_per_sec(self) -> Option<NonZeroU64> {
        match self {
            Limit::PerSecond(rate) => Some(rate),
            Limit::Inherit | Limit::Unlimited => None,
        }
    }
}

/// Accepts `""`/`"-"` (inherit) or a byte count where `0` is unlimited.
impl FromStr for Limit {
    type Err = ParseIntError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "" | "-" => Ok(Limit::Inherit),
            n => n.parse::<u64>().map(Limit::from_bytes_per_sec),
        }
    }
}

impl fmt::Display for Limit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Limit::Inherit => f.write_str("inherit"),
            Limit::Unlimited => f.write_str("unlimited"),
            Limit::PerSecond(rate) => write!(f, "{rate} B/s"),
        }
    }
}

/// Paired upload (client to target) and download (target to client) limits.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TrafficValve {
    pub upload: Limit,
    pub download: Limit,
}

impl TrafficValve {
    pub const UNLIMITED: TrafficValve = TrafficValve {
        upload: Limit::Unlimited,
        download: Limit::Unlimited,
    };

    pub fn new(upload: Limit, download: Limit) -> Self {
        Self { upload, download }
    }

    /// Per-user valve resolved against the server default.
    pub fn merge(self, defaults: &TrafficValve) -> TrafficValve {
        TrafficValve {
            upload: self.upload.or(defaults.upload),
            download: self.download.or(defaults.download),
        }
    }

    pub fn is_active(&self) -> bool {
        self.upload.bytes_per_sec().is_some() || self.download.bytes_per_sec().is_some()
    }
}

impl fmt::Display for TrafficValve {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "up {} / down {}", self.upload, self.download)
    }
}
