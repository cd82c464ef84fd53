//! Calendar generation for `dim_date`.

use chrono::{Datelike, NaiveDate, Weekday};
use libsql::Value;
use serde::Serialize;

/// One day of the calendar dimension. Every field derives from the date.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CalendarDay {
    /// `YYYYMMDD` as an integer, e.g. `20170315`.
    pub date_key: i64,
    pub full_date: NaiveDate,
    pub year: i32,
    pub quarter: u32,
    pub month: u32,
    pub month_name: String,
    pub day_of_month: u32,
    /// ISO weekday, Monday = 1 … Sunday = 7.
    pub day_of_week: u32,
    pub day_name: String,
    /// ISO 8601 week number.
    pub week_of_year: u32,
    pub is_weekend: bool,
}

impl From<NaiveDate> for CalendarDay {
    fn from(date: NaiveDate) -> Self {
        let weekday = date.weekday();
        Self {
            date_key: date_key(date),
            full_date: date,
            year: date.year(),
            quarter: (date.month() - 1) / 3 + 1,
            month: date.month(),
            month_name: date.format("%B").to_string(),
            day_of_month: date.day(),
            day_of_week: weekday.number_from_monday(),
            day_name: date.format("%A").to_string(),
            week_of_year: date.iso_week().week(),
            is_weekend: matches!(weekday, Weekday::Sat | Weekday::Sun),
        }
    }
}

impl CalendarDay {
    /// Column order of `dim_date`.
    pub const COLUMNS: [&'static str; 11] = [
        "date_key",
        "full_date",
        "year",
        "quarter",
        "month",
        "month_name",
        "day_of_month",
        "day_of_week",
        "day_name",
        "week_of_year",
        "is_weekend",
    ];

    pub fn to_values(&self) -> Vec<Value> {
        vec![
            Value::Integer(self.date_key),
            Value::Text(self.full_date.format("%Y-%m-%d").to_string()),
            Value::Integer(self.year.into()),
            Value::Integer(self.quarter.into()),
            Value::Integer(self.month.into()),
            Value::Text(self.month_name.clone()),
            Value::Integer(self.day_of_month.into()),
            Value::Integer(self.day_of_week.into()),
            Value::Text(self.day_name.clone()),
            Value::Integer(self.week_of_year.into()),
            Value::Integer(self.is_weekend.into()),
        ]
    }
}

/// `YYYYMMDD` key for a date.
pub fn date_key(date: NaiveDate) -> i64 {
    i64::from(date.year()) * 10_000 + i64::from(date.month()) * 100 + i64::from(date.day())
}

/// Every day from `start` to `end`, both inclusive. Empty if `end < start`.
pub fn calendar_days(start: NaiveDate, end: NaiveDate) -> Vec<CalendarDay> {
    start
        .iter_days()
        .take_while(|d| *d <= end)
        .map(CalendarDay::from)
        .collect()
}
