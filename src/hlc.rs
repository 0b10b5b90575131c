use std::fmt;
use std::time::Duration;

/// Hybrid logical timestamp attached to every row: wall-clock nanoseconds
/// plus a logical tick that breaks ties within one nanosecond.
///
/// Ordering is lexicographic on `(wall_ns, logical)`, which the derived
/// `Ord` provides thanks to field order.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct HlcTimestamp {
    pub wall_ns: i64,
    pub logical: u32,
}

impl HlcTimestamp {
    pub const fn new(wall_ns: i64, logical: u32) -> Self {
        Self { wall_ns, logical }
    }

    /// A timestamp with no logical component.
    pub const fn from_wall(wall_ns: i64) -> Self {
        Self {
            wall_ns,
            logical: 0,
        }
    }

    pub const fn is_zero(&self) -> bool {
        self.wall_ns == 0 && self.logical == 0
    }

    /// Start of the wall-time bucket containing this timestamp.
    ///
    /// Only the wall portion participates: two rows on the same wall
    /// nanosecond with different logical ticks share a bucket.
    pub fn bucket_start(&self, bucket_size: Duration) -> i64 {
        let bucket_ns = bucket_size.as_nanos() as i64;
        self.wall_ns.div_euclid(bucket_ns) * bucket_ns
    }
}

impl fmt::Display for HlcTimestamp {
    /// Canonical `<wall>.<logical>` rendering, logical zero-padded to ten
    /// digits so the textual form sorts like the timestamp does.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{:010}", self.wall_ns, self.logical)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SEC: i64 = 1_000_000_000;

    #[test]
    fn orders_by_wall_then_logical() {
        let a = HlcTimestamp::new(10, 0);
        let b = HlcTimestamp::new(10, 1);
        let c = HlcTimestamp::new(11, 0);
        assert!(a < b);
        assert!(b < c);
        assert_eq!(a, HlcTimestamp::new(10, 0));
    }

    #[test]
    fn bucket_boundary_is_half_open() {
        let bucket = Duration::from_secs(1);
        // 12:00:00.999999999 and 12:00:01.000000000 land in different buckets.
        let just_before = HlcTimestamp::from_wall(43_200 * SEC + 999_999_999);
        let on_boundary = HlcTimestamp::from_wall(43_201 * SEC);
        assert_eq!(just_before.bucket_start(bucket), 43_200 * SEC);
        assert_eq!(on_boundary.bucket_start(bucket), 43_201 * SEC);
    }

    #[test]
    fn bucket_ignores_logical_component() {
        let bucket = Duration::from_secs(1);
        let a = HlcTimestamp::new(5 * SEC, 0);
        let b = HlcTimestamp::new(5 * SEC, 7);
        assert_eq!(a.bucket_start(bucket), b.bucket_start(bucket));
    }

    #[test]
    fn display_sorts_like_timestamp() {
        let a = HlcTimestamp::new(100, 2).to_string();
        let b = HlcTimestamp::new(100, 10).to_string();
        assert!(a < b);
        assert_eq!(a, "100.0000000002");
    }
}
