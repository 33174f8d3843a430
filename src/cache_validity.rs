use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};

use crate::database::models::{CacheEntry, Upstream};

/// Describes how long a cached file is served without asking its upstream.
///
/// Built from [`Upstream::cache_validity_hours`], where `0` means forever.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum CacheValidity {
    /// File is never stale.
    #[default]
    Forever,

    /// File is stale once it was not checked for a number of hours.
    Hours { hours: u32 },
}

impl CacheValidity {
    pub fn from_hours(hours: i32) -> Self {
        match u32::try_from(hours) {
            Ok(0) | Err(_) => Self::Forever,
            Ok(hours) => Self::Hours { hours },
        }
    }

    /// Whether a file last checked at `checked_at` must be revalidated at `now`.
    pub fn is_expired(&self, checked_at: DateTime<Utc>, now: DateTime<Utc>) -> bool {
        match *self {
            Self::Forever => false,
            Self::Hours { hours } => {
                match checked_at.checked_add_signed(TimeDelta::hours(hours.into())) {
                    Some(fresh_until) => fresh_until < now,
                    None => false,
                }
            }
        }
    }
}

impl From<&Upstream> for CacheValidity {
    fn from(upstream: &Upstream) -> Self {
        Self::from_hours(upstream.cache_validity_hours)
    }
}

impl std::fmt::Display for CacheValidity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match *self {
            Self::Forever => write!(f, "cached forever"),
            Self::Hours { hours } => write!(f, "revalidated after {} hours", hours),
        }
    }
}

/// Staleness of a file checked at `checked_at`.
///
/// Files without upstream are always stale. Validity of `0` hours means never stale.
pub fn is_stale(
    checked_at: DateTime<Utc>,
    validity_hours: i32,
    has_upstream: bool,
    now: DateTime<Utc>,
) -> bool {
    if !has_upstream {
        return true;
    }
    CacheValidity::from_hours(validity_hours).is_expired(checked_at, now)
}

/// Staleness of a cache entry served through `upstream`.
pub fn is_entry_stale(entry: &CacheEntry, upstream: Option<&Upstream>, now: DateTime<Utc>) -> bool {
    match upstream {
        Some(upstream) if entry.upstream_id == Some(upstream.id) => is_stale(
            entry.upstream_checked_at,
            upstream.cache_validity_hours,
            true,
            now,
        ),
        _ => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case(59, false)]
    #[case(60, false)]
    #[case(61, true)]
    fn test_one_hour_boundary(#[case] minutes_ago: i64, #[case] stale: bool) {
        let now = Utc::now();
        let checked_at = now - TimeDelta::minutes(minutes_ago);
        assert_eq!(is_stale(checked_at, 1, true, now), stale);
    }

    #[test]
    fn test_zero_validity_never_stale() {
        let now = Utc::now();
        let ten_years_ago = now - TimeDelta::days(3653);
        assert!(!is_stale(ten_years_ago, 0, true, now));
    }

    #[test]
    fn test_orphan_always_stale() {
        let now = Utc::now();
        assert!(is_stale(now, 0, false, now));
        assert!(is_stale(now, 24, false, now));
    }

    #[rstest]
    #[case(0, CacheValidity::Forever)]
    #[case(-5, CacheValidity::Forever)]
    #[case(24, CacheValidity::Hours { hours: 24 })]
    fn test_from_hours(#[case] hours: i32, #[case] expected: CacheValidity) {
        assert_eq!(CacheValidity::from_hours(hours), expected);
    }

    #[test]
    fn test_display() {
        assert_eq!(CacheValidity::Forever.to_string(), "cached forever");
        assert_eq!(
            CacheValidity::from_hours(24).to_string(),
            "revalidated after 24 hours"
        );
    }
}
