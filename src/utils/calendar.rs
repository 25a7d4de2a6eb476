// tablearchiver/src/utils/calendar.rs
use chrono::{Datelike, NaiveDate};
use std::fmt;
use std::str::FromStr;

use crate::errors::{BackupError, Result};

/// Extension of the row extract written by the exporter.
pub const EXTRACT_EXTENSION: &str = "csv";
/// Extension of the columnar artifact uploaded to object storage.
pub const ARTIFACT_EXTENSION: &str = "parquet";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Month {
    Jan,
    Feb,
    Mar,
    Apr,
    May,
    Jun,
    Jul,
    Aug,
    Sep,
    Oct,
    Nov,
    Dec,
}

/// Mnemonic, month number and default day count for every month.
const MONTH_TABLE: [(&str, Month, u32, u32); 12] = [
    ("jan", Month::Jan, 1, 31),
    ("feb", Month::Feb, 2, 28),
    ("mar", Month::Mar, 3, 31),
    ("apr", Month::Apr, 4, 30),
    ("may", Month::May, 5, 31),
    ("jun", Month::Jun, 6, 30),
    ("jul", Month::Jul, 7, 31),
    ("aug", Month::Aug, 8, 31),
    ("sep", Month::Sep, 9, 30),
    ("oct", Month::Oct, 10, 31),
    ("nov", Month::Nov, 11, 30),
    ("dec", Month::Dec, 12, 31),
];

impl Month {
    fn entry(self) -> &'static (&'static str, Month, u32, u32) {
        &MONTH_TABLE[self as usize]
    }

    pub fn mnemonic(self) -> &'static str {
        self.entry().0
    }

    /// Calendar month number, 1 through 12.
    pub fn number(self) -> u32 {
        self.entry().2
    }

    /// Day count ignoring leap years.
    pub fn default_days(self) -> u32 {
        self.entry().3
    }

    pub fn days_in(self, year: i32) -> u32 {
        if self == Month::Feb && is_leap_year(year) {
            29
        } else {
            self.default_days()
        }
    }
}

impl FromStr for Month {
    type Err = BackupError;

    fn from_str(token: &str) -> Result<Self> {
        let token = token.trim().to_ascii_lowercase();
        MONTH_TABLE
            .iter()
            .find(|(mnemonic, ..)| *mnemonic == token)
            .map(|(_, month, ..)| *month)
            .ok_or_else(|| {
                BackupError::config(format!(
                    "Unknown month '{}'. Expected one of: {}",
                    token,
                    MONTH_TABLE.iter().map(|(m, ..)| *m).collect::<Vec<_>>().join(", ")
                ))
            })
    }
}

impl fmt::Display for Month {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.mnemonic())
    }
}

pub fn is_leap_year(year: i32) -> bool {
    year % 4 == 0 && (year % 100 != 0 || year % 400 == 0)
}

/// Number of days in the month named by `month_token` for `year`.
pub fn resolve(month_token: &str, year: i32) -> Result<u32> {
    let month: Month = month_token.parse()?;
    Ok(month.days_in(year))
}

/// One calendar day of the requested month.
///
/// The same day is used as the row filter for the export and as part of the
/// remote object key, so every name derived from it comes from here.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DayPartition {
    date: NaiveDate,
}

impl DayPartition {
    pub fn new(year: i32, month: Month, day: u32) -> Result<Self> {
        NaiveDate::from_ymd_opt(year, month.number(), day)
            .map(|date| DayPartition { date })
            .ok_or_else(|| {
                BackupError::config(format!("{}-{} has no day {}", year, month, day))
            })
    }

    pub fn date(&self) -> NaiveDate {
        self.date
    }

    pub fn year(&self) -> i32 {
        self.date.year()
    }

    /// Two-digit month number, e.g. `02`.
    pub fn month_number(&self) -> String {
        format!("{:02}", self.date.month())
    }

    /// Two-digit day number, e.g. `05`.
    pub fn day_number(&self) -> String {
        format!("{:02}", self.date.day())
    }

    /// `YYYY-MM-DD`
    pub fn partition_date(&self) -> String {
        format!(
            "{:04}-{}-{}",
            self.year(),
            self.month_number(),
            self.day_number()
        )
    }

    pub fn extract_filename(&self) -> String {
        format!("{}.{}", self.partition_date(), EXTRACT_EXTENSION)
    }

    pub fn artifact_filename(&self) -> String {
        format!("{}.{}", self.partition_date(), ARTIFACT_EXTENSION)
    }

    /// Remote key `{prefix/}{year}/{month}/{date}.parquet`.
    pub fn object_key(&self, prefix: &str) -> String {
        let prefix = prefix.trim_matches('/');
        let key = format!(
            "{:04}/{}/{}",
            self.year(),
            self.month_number(),
            self.artifact_filename()
        );
        if prefix.is_empty() {
            key
        } else {
            format!("{}/{}", prefix, key)
        }
    }
}
