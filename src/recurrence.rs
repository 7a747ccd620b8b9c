//! Recurrence rules and their expansion into dated occurrences.

use std::iter;

use chrono::{Days, Months, NaiveDate, Weekday};
use serde::{Deserialize, Serialize};

use crate::error::BookingError;

/// Upper bound on occurrences generated from one rule (two years of weekly play).
pub const MAX_OCCURRENCES: u32 = 104;

/// Interval between occurrences.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Frequency {
    Weekly,
    Biweekly,
    /// Same day-of-month, clamped to the month's last day.
    Monthly,
}

/// Request for a recurring series.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RecurrenceRule {
    /// Step between occurrences.
    pub frequency: Frequency,
    /// Number of occurrences, first one included.
    pub count: u32,
    /// Inclusive last date; later occurrences are dropped.
    #[serde(default)]
    pub end_date: Option<NaiveDate>,
    /// Weekdays selected when the series was requested.
    ///
    /// Carried with the series as metadata only; expansion steps from the
    /// first date and never consults it.
    #[serde(default)]
    pub weekdays: Vec<Weekday>,
}

impl RecurrenceRule {
    pub fn new(frequency: Frequency, count: u32) -> Self {
        Self {
            frequency,
            count,
            end_date: None,
            weekdays: Vec::new(),
        }
    }

    pub fn until(mut self, end_date: NaiveDate) -> Self {
        self.end_date = Some(end_date);
        self
    }

    pub fn validate(&self) -> Result<(), BookingError> {
        if self.count == 0 {
            return Err(BookingError::Validation(
                "recurrence count must be at least 1".to_string(),
            ));
        }
        if self.count > MAX_OCCURRENCES {
            return Err(BookingError::Validation(format!(
                "recurrence count {} exceeds the maximum of {MAX_OCCURRENCES}",
                self.count
            )));
        }
        Ok(())
    }
}

/// Date following `date` under `frequency`, or `None` past chrono's range.
pub fn step(date: NaiveDate, frequency: Frequency) -> Option<NaiveDate> {
    match frequency {
        Frequency::Weekly => date.checked_add_days(Days::new(7)),
        Frequency::Biweekly => date.checked_add_days(Days::new(14)),
        // chrono clamps to the last day of the target month
        Frequency::Monthly => date.checked_add_months(Months::new(1)),
    }
}

/// Expands `rule` from `first` into the ordered occurrence dates.
///
/// Monthly steps run from the previous occurrence, so a series starting on
/// Jan 31 yields Feb 28/29 and then the 28th/29th of March.
pub fn expand(first: NaiveDate, rule: &RecurrenceRule) -> Result<Vec<NaiveDate>, BookingError> {
    rule.validate()?;

    let dates: Vec<NaiveDate> = iter::successors(Some(first), |prev| step(*prev, rule.frequency))
        .take(rule.count as usize)
        .take_while(|d| rule.end_date.is_none_or(|end| *d <= end))
        .collect();

    if dates.is_empty() {
        return Err(BookingError::Validation(format!(
            "recurrence ending {} produces no occurrences from {first}",
            rule.end_date.map(|d| d.to_string()).unwrap_or_default()
        )));
    }
    Ok(dates)
}
