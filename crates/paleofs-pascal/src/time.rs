//! UCSD Pascal packed date: a 16-bit value with month in the low 4 bits,
//! day in the next 5, and year-1900 in the high 7 bits. Exposed as
//! `chrono::NaiveDate` for symmetry with `paleofs_prodos::time::ProdosTime`.

use chrono::{Datelike, NaiveDate};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PascalDate(pub u16);

impl PascalDate {
    pub fn is_zero(self) -> bool {
        self.0 == 0
    }

    pub fn to_naive(self) -> Option<NaiveDate> {
        if self.is_zero() {
            return None;
        }
        let month = (self.0 & 0x0F) as u32;
        let day = ((self.0 >> 4) & 0x1F) as u32;
        let year = 1900 + ((self.0 >> 9) & 0x7F) as i32;
        NaiveDate::from_ymd_opt(year, month, day)
    }

    pub fn from_naive(date: NaiveDate) -> Self {
        let month = date.month() as u16 & 0x0F;
        let day = (date.day() as u16 & 0x1F) << 4;
        let year = ((date.year() - 1900).clamp(0, 0x7F) as u16) << 9;
        Self(year | day | month)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_date_has_no_naive_form() {
        assert!(PascalDate::default().to_naive().is_none());
    }

    #[test]
    fn round_trip_preserves_date() {
        let date = NaiveDate::from_ymd_opt(1984, 1, 24).unwrap();
        let packed = PascalDate::from_naive(date);
        assert_eq!(packed.to_naive(), Some(date));
    }
}
