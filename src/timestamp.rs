// Copyright 2022-2024 Protocol Labs
// SPDX-License-Identifier: MIT

use std::fmt;
use std::ops::{Add, Sub};
use std::time::Duration;

use chrono::{DateTime, Utc};

/// Wall-clock timestamp attached to every sample record and link snapshot.
///
/// Wraps a UTC instant rather than a bare integer so historic queries can carry
/// nanosecond precision through to the TSDB backend without a second type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Timestamp(DateTime<Utc>);

impl Timestamp {
    pub fn now() -> Self {
        Timestamp(Utc::now())
    }

    pub fn from_datetime(dt: DateTime<Utc>) -> Self {
        Timestamp(dt)
    }

    pub fn as_datetime(&self) -> DateTime<Utc> {
        self.0
    }

    /// Nanoseconds since the epoch, the precision historic TSDB queries require.
    pub fn as_nanos(&self) -> i64 {
        self.0.timestamp_nanos_opt().unwrap_or(0)
    }
}

impl Add<Duration> for Timestamp {
    type Output = Timestamp;

    fn add(self, rhs: Duration) -> Timestamp {
        Timestamp(self.0 + chrono::Duration::from_std(rhs).unwrap_or(chrono::Duration::zero()))
    }
}

impl Sub<Duration> for Timestamp {
    type Output = Timestamp;

    fn sub(self, rhs: Duration) -> Timestamp {
        Timestamp(self.0 - chrono::Duration::from_std(rhs).unwrap_or(chrono::Duration::zero()))
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.to_rfc3339())
    }
}

#[cfg(any(test, feature = "arb"))]
mod arb {
    use super::Timestamp;
    use chrono::{TimeZone, Utc};
    use quickcheck::Arbitrary;

    impl Arbitrary for Timestamp {
        fn arbitrary(g: &mut quickcheck::Gen) -> Self {
            // Keep generated instants in a plausible range instead of the full
            // i64 space, so duration arithmetic in property tests doesn't saturate.
            let secs = u32::arbitrary(g) as i64;
            Timestamp(Utc.timestamp_opt(secs, 0).single().unwrap_or_else(Utc::now))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn add_then_sub_roundtrips() {
        let t = Timestamp::now();
        let d = Duration::from_secs(42);
        assert_eq!((t + d) - d, t);
    }
}
