//! Lexicographically sortable event identifiers.
//!
//! A [`SortableUniqueId`] is a fixed-width, 30-digit decimal string: a
//! 19-digit tick count (100 ns units since `0001-01-01T00:00:00Z`) followed
//! by an 11-digit uniqueness suffix. Because every value has the same width
//! and only uses ASCII digits, ordinal string comparison equals
//! chronological order.

use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::SortableIdError;

/// Number of digits used for the tick component.
const TICK_DIGITS: usize = 19;

/// Number of digits used for the uniqueness suffix.
const SUFFIX_DIGITS: usize = 11;

/// Total length of a serialized id.
pub const SORTABLE_ID_LENGTH: usize = TICK_DIGITS + SUFFIX_DIGITS;

/// Ticks between `0001-01-01` and the Unix epoch.
const UNIX_EPOCH_TICKS: u64 = 621_355_968_000_000_000;

/// Nanoseconds per tick.
const NANOS_PER_TICK: u128 = 100;

/// `10^SUFFIX_DIGITS`, the modulus for the uniqueness suffix.
const SUFFIX_MODULUS: u128 = 100_000_000_000;

/// Last tick handed out by [`SortableUniqueId::generate_new`].
///
/// Keeps generated ids strictly increasing within the process even when
/// the wall clock stalls or steps backwards.
static LAST_TICKS: AtomicU64 = AtomicU64::new(0);

/// Monotonically sortable identifier combining a timestamp and a
/// uniqueness suffix.
///
/// # Examples
///
/// ```
/// use eventfold_dcb::SortableUniqueId;
///
/// let first = SortableUniqueId::generate_new();
/// let second = SortableUniqueId::generate_new();
/// assert!(first < second);
/// assert!(first.as_str() < second.as_str());
/// ```
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct SortableUniqueId(String);

impl SortableUniqueId {
    /// The smallest possible id (all zeros). Every generated id is greater.
    pub fn min_value() -> Self {
        Self("0".repeat(SORTABLE_ID_LENGTH))
    }

    /// Build an id from a timestamp and a uniqueness seed.
    ///
    /// The suffix is derived from the seed's 128 bits reduced modulo
    /// `10^11`, so the same `(timestamp, seed)` pair always yields the same
    /// id.
    pub fn generate(timestamp: SystemTime, seed: Uuid) -> Self {
        Self::from_parts(ticks_of(timestamp), suffix_of(seed))
    }

    /// Generate a fresh id for "now".
    ///
    /// Ids produced by this function are strictly increasing for the
    /// lifetime of the process: when two calls land on the same tick the
    /// later one is bumped forward by one tick.
    pub fn generate_new() -> Self {
        let now = ticks_of(SystemTime::now());
        let mut last = LAST_TICKS.load(Ordering::Relaxed);
        let ticks = loop {
            let next = now.max(last + 1);
            match LAST_TICKS.compare_exchange_weak(last, next, Ordering::AcqRel, Ordering::Relaxed)
            {
                Ok(_) => break next,
                Err(observed) => last = observed,
            }
        };
        Self::from_parts(ticks, suffix_of(Uuid::new_v4()))
    }

    /// The smallest id carrying the given timestamp.
    ///
    /// Every id generated at or after `timestamp` compares greater than or
    /// equal to the returned value; every id generated strictly before it
    /// compares less. Used to turn a wall-clock safe window into a
    /// threshold id.
    pub fn floor(timestamp: SystemTime) -> Self {
        Self::from_parts(ticks_of(timestamp), 0)
    }

    /// Parse and validate a serialized id.
    ///
    /// # Errors
    ///
    /// Returns [`SortableIdError`] if the value is not exactly 30 ASCII
    /// digits.
    pub fn parse(value: &str) -> Result<Self, SortableIdError> {
        if value.len() != SORTABLE_ID_LENGTH {
            return Err(SortableIdError::InvalidLength {
                expected: SORTABLE_ID_LENGTH,
                actual: value.len(),
            });
        }
        if let Some(position) = value.bytes().position(|b| !b.is_ascii_digit()) {
            return Err(SortableIdError::InvalidCharacter { position });
        }
        Ok(Self(value.to_owned()))
    }

    /// The serialized form.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The embedded tick count (100 ns units since `0001-01-01`).
    pub fn ticks(&self) -> u64 {
        // Validated on construction, so the prefix is always 19 digits.
        self.0[..TICK_DIGITS].parse().unwrap_or_default()
    }

    /// The embedded timestamp, for diagnostics.
    pub fn timestamp(&self) -> SystemTime {
        let ticks = self.ticks();
        if ticks >= UNIX_EPOCH_TICKS {
            UNIX_EPOCH + Duration::from_nanos((ticks - UNIX_EPOCH_TICKS).saturating_mul(100))
        } else {
            UNIX_EPOCH - Duration::from_nanos((UNIX_EPOCH_TICKS - ticks).saturating_mul(100))
        }
    }

    /// `true` if `self` sorts strictly before `other`.
    pub fn is_earlier_than(&self, other: &SortableUniqueId) -> bool {
        self < other
    }

    fn from_parts(ticks: u64, suffix: u64) -> Self {
        Self(format!(
            "{ticks:0tick_width$}{suffix:0suffix_width$}",
            tick_width = TICK_DIGITS,
            suffix_width = SUFFIX_DIGITS,
        ))
    }
}

fn ticks_of(timestamp: SystemTime) -> u64 {
    match timestamp.duration_since(UNIX_EPOCH) {
        Ok(after) => UNIX_EPOCH_TICKS.saturating_add((after.as_nanos() / NANOS_PER_TICK) as u64),
        Err(before) => {
            UNIX_EPOCH_TICKS.saturating_sub((before.duration().as_nanos() / NANOS_PER_TICK) as u64)
        }
    }
}

fn suffix_of(seed: Uuid) -> u64 {
    (seed.as_u128() % SUFFIX_MODULUS) as u64
}

impl fmt::Display for SortableUniqueId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for SortableUniqueId {
    type Err = SortableIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for SortableUniqueId {
    type Error = SortableIdError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<SortableUniqueId> for String {
    fn from(id: SortableUniqueId) -> Self {
        id.0
    }
}

impl AsRef<str> for SortableUniqueId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_ids_have_fixed_width() {
        let id = SortableUniqueId::generate_new();
        assert_eq!(id.as_str().len(), SORTABLE_ID_LENGTH);
        assert!(id.as_str().bytes().all(|b| b.is_ascii_digit()));
    }

    #[test]
    fn generate_new_is_strictly_increasing() {
        let ids: Vec<_> = (0..1_000).map(|_| SortableUniqueId::generate_new()).collect();
        for pair in ids.windows(2) {
            assert!(pair[0] < pair[1], "{} should sort before {}", pair[0], pair[1]);
        }
    }

    #[test]
    fn generate_is_deterministic_for_same_inputs() {
        let ts = UNIX_EPOCH + Duration::from_secs(1_700_000_000);
        let seed = Uuid::from_u128(42);
        assert_eq!(
            SortableUniqueId::generate(ts, seed),
            SortableUniqueId::generate(ts, seed)
        );
    }

    #[test]
    fn later_timestamp_sorts_after_earlier_one() {
        let early = UNIX_EPOCH + Duration::from_secs(1_000);
        let late = early + Duration::from_micros(1);
        let a = SortableUniqueId::generate(early, Uuid::from_u128(u128::MAX));
        let b = SortableUniqueId::generate(late, Uuid::from_u128(0));
        assert!(a < b);
    }

    #[test]
    fn timestamp_roundtrips_at_tick_precision() {
        let ts = UNIX_EPOCH + Duration::from_nanos(1_700_000_000_123_456_700);
        let id = SortableUniqueId::generate(ts, Uuid::new_v4());
        assert_eq!(id.timestamp(), ts);
    }

    #[test]
    fn floor_bounds_ids_generated_at_and_after_timestamp() {
        let ts = UNIX_EPOCH + Duration::from_secs(1_700_000_000);
        let floor = SortableUniqueId::floor(ts);
        let at = SortableUniqueId::generate(ts, Uuid::new_v4());
        let before = SortableUniqueId::generate(ts - Duration::from_micros(1), Uuid::from_u128(u128::MAX));
        assert!(floor <= at);
        assert!(before.is_earlier_than(&floor));
    }

    #[test]
    fn min_value_sorts_before_everything() {
        assert!(SortableUniqueId::min_value() < SortableUniqueId::generate_new());
    }

    #[test]
    fn parse_rejects_wrong_length() {
        let err = SortableUniqueId::parse("123").unwrap_err();
        assert!(matches!(
            err,
            SortableIdError::InvalidLength {
                expected: 30,
                actual: 3
            }
        ));
    }

    #[test]
    fn parse_rejects_non_digits() {
        let mut raw = SortableUniqueId::generate_new().to_string();
        raw.replace_range(5..6, "x");
        let err = SortableUniqueId::parse(&raw).unwrap_err();
        assert!(matches!(err, SortableIdError::InvalidCharacter { position: 5 }));
    }

    #[test]
    fn serde_uses_plain_string() {
        let id = SortableUniqueId::generate_new();
        let json = serde_json::to_string(&id).expect("serialize");
        assert_eq!(json, format!("\"{id}\""));
        let back: SortableUniqueId = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(back, id);
        assert!(serde_json::from_str::<SortableUniqueId>("\"nope\"").is_err());
    }
}
