//! HFS timestamps: seconds since 1904-01-01, local time, no stored
//! timezone (spec §6 MDB fields; resolved ambiguity recorded in
//! DESIGN.md — treated as naive, timezone interpretation left to host).

use chrono::{NaiveDate, NaiveDateTime};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct HfsTime(pub u32);

impl HfsTime {
    fn epoch() -> NaiveDateTime {
        NaiveDate::from_ymd_opt(1904, 1, 1)
            .unwrap()
            .and_hms_opt(0, 0, 0)
            .unwrap()
    }

    pub fn from_naive(dt: NaiveDateTime) -> Self {
        let secs = (dt - Self::epoch()).num_seconds();
        Self(secs.clamp(0, u32::MAX as i64) as u32)
    }

    pub fn to_naive(self) -> NaiveDateTime {
        Self::epoch() + chrono::Duration::seconds(self.0 as i64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn epoch_round_trips_to_zero() {
        let t = HfsTime::from_naive(HfsTime::epoch());
        assert_eq!(t.0, 0);
    }

    #[test]
    fn round_trip_preserves_seconds() {
        let dt = NaiveDate::from_ymd_opt(1998, 6, 15)
            .unwrap()
            .and_hms_opt(12, 30, 0)
            .unwrap();
        let t = HfsTime::from_naive(dt);
        assert_eq!(t.to_naive(), dt);
    }
}
