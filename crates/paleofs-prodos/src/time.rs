//! ProDOS date/time: a 16-bit date (year-1900 in the high 7 bits, month in
//! the next 4, day in the low 5) followed by a 16-bit time (hour in the
//! low byte's low 5 bits, minute in the high byte's low 6 bits), per the
//! ProDOS 8 Technical Reference. Exposed as `chrono::NaiveDateTime` for
//! symmetry with `paleofs_hfs::time::HfsTime`.

use chrono::{NaiveDate, NaiveDateTime};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ProdosTime {
    pub date: u16,
    pub time: u16,
}

impl ProdosTime {
    pub fn from_bytes(bytes: &[u8; 4]) -> Self {
        Self {
            date: u16::from_le_bytes([bytes[0], bytes[1]]),
            time: u16::from_le_bytes([bytes[2], bytes[3]]),
        }
    }

    pub fn to_bytes(self) -> [u8; 4] {
        let mut out = [0u8; 4];
        out[0..2].copy_from_slice(&self.date.to_le_bytes());
        out[2..4].copy_from_slice(&self.time.to_le_bytes());
        out
    }

    pub fn is_zero(self) -> bool {
        self.date == 0 && self.time == 0
    }

    pub fn to_naive(self) -> Option<NaiveDateTime> {
        if self.is_zero() {
            return None;
        }
        let year = 1900 + ((self.date >> 9) & 0x7F) as i32;
        let month = ((self.date >> 5) & 0x0F) as u32;
        let day = (self.date & 0x1F) as u32;
        let hour = (self.time & 0x1F) as u32;
        let minute = ((self.time >> 8) & 0x3F) as u32;
        NaiveDate::from_ymd_opt(year, month, day)?.and_hms_opt(hour, minute, 0)
    }

    pub fn from_naive(dt: NaiveDateTime) -> Self {
        use chrono::{Datelike, Timelike};
        let year_field = ((dt.year() - 1900).clamp(0, 0x7F) as u16) << 9;
        let month_field = (dt.month() as u16 & 0x0F) << 5;
        let day_field = dt.day() as u16 & 0x1F;
        let date = year_field | month_field | day_field;
        let time = ((dt.minute() as u16 & 0x3F) << 8) | (dt.hour() as u16 & 0x1F);
        Self { date, time }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_date_has_no_naive_form() {
        assert!(ProdosTime::default().to_naive().is_none());
    }

    #[test]
    fn round_trip_preserves_date_and_minute_resolution() {
        let dt = NaiveDate::from_ymd_opt(1986, 3, 17)
            .unwrap()
            .and_hms_opt(14, 52, 0)
            .unwrap();
        let packed = ProdosTime::from_naive(dt);
        assert_eq!(packed.to_naive(), Some(dt));
    }

    #[test]
    fn byte_round_trip() {
        let packed = ProdosTime { date: 0x1234, time: 0x5678 };
        assert_eq!(ProdosTime::from_bytes(&packed.to_bytes()), packed);
    }
}
